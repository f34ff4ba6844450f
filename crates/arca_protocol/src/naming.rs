//! Sprite naming and URL canonicalization.

use crate::defaults::SPRITE_NAME_PREFIX;

/// Canonical public URL for a pool sprite.
pub fn canonical_sprite_url(name: &str) -> String {
    format!("https://{name}-bl4yi.sprites.app")
}

/// Rewrite the historical dotted URL form (`{name}.bl4yi.sprites.app`) to
/// the canonical dashed form. Any other URL passes through unchanged.
pub fn canonicalize_sprite_url(url: &str) -> String {
    match url.split_once(".bl4yi.sprites.app") {
        Some((head, tail)) if !head.ends_with('/') => {
            format!("{head}-bl4yi.sprites.app{tail}")
        }
        _ => url.to_string(),
    }
}

/// First `arca-customer-NNN` name not present in `existing`.
///
/// Numbering continues past the highest existing suffix, so names are never
/// reused even after sprites leave the pool.
pub fn next_sprite_name<'a>(existing: impl Iterator<Item = &'a str>) -> String {
    let max = existing
        .filter_map(|name| name.strip_prefix(SPRITE_NAME_PREFIX))
        .filter_map(|suffix| suffix.parse::<u32>().ok())
        .max()
        .unwrap_or(0);
    format!("{SPRITE_NAME_PREFIX}{:03}", max + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalizes_dotted_url() {
        assert_eq!(
            canonicalize_sprite_url("https://arca-customer-001.bl4yi.sprites.app"),
            "https://arca-customer-001-bl4yi.sprites.app"
        );
    }

    #[test]
    fn canonical_url_passes_through() {
        let url = "https://arca-customer-001-bl4yi.sprites.app";
        assert_eq!(canonicalize_sprite_url(url), url);
    }

    #[test]
    fn foreign_url_untouched() {
        let url = "https://alice.arcamatrix.com";
        assert_eq!(canonicalize_sprite_url(url), url);
    }

    #[test]
    fn next_name_skips_used_numbers() {
        let names = ["arca-customer-001", "arca-customer-010", "other-sprite"];
        assert_eq!(
            next_sprite_name(names.iter().copied()),
            "arca-customer-011"
        );
    }

    #[test]
    fn next_name_starts_at_one() {
        assert_eq!(next_sprite_name(std::iter::empty()), "arca-customer-001");
    }
}
