//! Cleanup of raw exec output.
//!
//! The exec endpoint streams from a PTY and leaks ANSI/VT escape sequences
//! into text responses. Strip them before anything downstream inspects the
//! output.

/// Remove ANSI escape sequences (CSI and OSC) and stray control bytes,
/// keeping newlines and tabs.
pub fn strip_control_sequences(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '\u{1b}' {
            match chars.peek() {
                // CSI: ESC [ ... final byte in @..~
                Some('[') => {
                    chars.next();
                    for seq in chars.by_ref() {
                        if ('\u{40}'..='\u{7e}').contains(&seq) {
                            break;
                        }
                    }
                }
                // OSC: ESC ] ... terminated by BEL or ESC \
                Some(']') => {
                    chars.next();
                    while let Some(seq) = chars.next() {
                        if seq == '\u{07}' {
                            break;
                        }
                        if seq == '\u{1b}' && chars.peek() == Some(&'\\') {
                            chars.next();
                            break;
                        }
                    }
                }
                // Two-character escape
                Some(_) => {
                    chars.next();
                }
                None => {}
            }
            continue;
        }
        if ch.is_control() && ch != '\n' && ch != '\t' {
            continue;
        }
        out.push(ch);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_color_codes() {
        assert_eq!(
            strip_control_sequences("\u{1b}[32mLISTEN\u{1b}[0m 8080"),
            "LISTEN 8080"
        );
    }

    #[test]
    fn strips_osc_title_sequences() {
        assert_eq!(
            strip_control_sequences("\u{1b}]0;title\u{07}ok"),
            "ok"
        );
    }

    #[test]
    fn keeps_newlines_and_tabs() {
        assert_eq!(
            strip_control_sequences("a\tb\r\nc\u{08}"),
            "a\tb\nc"
        );
    }

    #[test]
    fn plain_text_unchanged() {
        assert_eq!(strip_control_sequences("echo ok"), "echo ok");
    }
}
