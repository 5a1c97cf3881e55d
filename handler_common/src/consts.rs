//! Workspace-wide constants for the handler drivers.
//!
//! Single source of truth for site limits and default timing.

use static_assertions::const_assert;

/// Maximum number of test sites a session can address.
///
/// Population bitmasks are carried in a `u64`.
pub const MAX_SITES: usize = 64;

/// Default pause between two population queries in strict polling mode.
pub const DEFAULT_POLLING_INTERVAL_US: u64 = 200_000;

/// Default time `wait_for_parts` waits for a device before reporting `Waiting`.
pub const DEFAULT_HEARTBEAT_TIMEOUT_US: u64 = 5_000_000;

/// Default time to wait for a single reply line.
pub const DEFAULT_REPLY_TIMEOUT_US: u64 = 5_000_000;

/// Default number of resend attempts after a mismatching bin echo.
pub const DEFAULT_VERIFY_MAX_RETRIES: u32 = 2;

/// Upper bound of stray interrupts drained by one flush.
pub const MAX_FLUSHED_INTERRUPTS: usize = 32;

/// Calls a runner makes to resume one waiting bin exchange before giving up.
pub const MAX_BIN_RESUMES: u32 = 20;

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/handler/handler.toml";

/// Canonical service name used in logs.
pub const HANDLER_SERVICE_NAME: &str = "handler";

const_assert!(MAX_SITES <= u64::BITS as usize);
const_assert!(DEFAULT_POLLING_INTERVAL_US < DEFAULT_HEARTBEAT_TIMEOUT_US);
const_assert!(MAX_BIN_RESUMES > 0);
