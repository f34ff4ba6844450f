//! Canonical default values shared across the agent.

/// Remote sprite control plane.
pub const DEFAULT_SPRITES_API_BASE: &str = "https://api.sprites.dev/v1";

/// Arcamatrix REST surface (router admin + task intake backup).
pub const DEFAULT_ARCAMATRIX_API_BASE: &str = "https://arcamatrix.com/api";

/// Transactional mail endpoint.
pub const DEFAULT_MAIL_API_BASE: &str = "https://api.resend.com";

/// Sprites seeded into a fresh pool file.
pub const SEED_POOL_SIZE: usize = 10;

/// Pool is considered low below this many available sprites.
pub const POOL_MIN_AVAILABLE: usize = 3;

/// Background expansion grows the pool back to this many available sprites.
pub const POOL_TARGET_AVAILABLE: usize = 5;

/// Name prefix for pool sprites (`arca-customer-001`, ...).
pub const SPRITE_NAME_PREFIX: &str = "arca-customer-";

// Fixed paths inside a sprite. The provisioning and prepare scripts are
// uploaded before execution; the remaining paths are scrubbed on recycle.
pub const PROVISION_SCRIPT_REMOTE: &str = "/home/sprite/provision_customer.sh";
pub const PREPARE_SCRIPT_REMOTE: &str = "/home/sprite/prepare_pool_sprite.sh";
pub const CUSTOM_UI_REMOTE: &str = "/home/sprite/custom-ui/index.html";
pub const PROXY_SCRIPT_REMOTE: &str = "/home/sprite/customer_ui.py";
pub const CUSTOMER_WORKSPACE_GLOB: &str = "/home/sprite/openclaw-workspace/*";

/// Remote service units managed on a sprite.
pub const PROXY_SERVICE: &str = "proxy";
pub const GATEWAY_SERVICE: &str = "gateway";

/// Local ports the customer stack binds on a sprite.
pub const PROXY_PORT: u16 = 8080;
pub const GATEWAY_PORT: u16 = 3001;

/// Patch log keeps this many most recent events.
pub const PATCH_LOG_CAPACITY: usize = 200;
