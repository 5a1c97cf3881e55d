//! Prelude module for common re-exports.
//!
//! ```rust
//! use handler_common::prelude::*;
//! ```

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{
    ConfigError, ConfigLoader, ConfigSource, ConfigValue, LogLevel, SharedConfig, TomlConfig,
};

// ─── Limits ─────────────────────────────────────────────────────────
pub use crate::consts::MAX_SITES;

// ─── Errors ─────────────────────────────────────────────────────────
pub use crate::error::{DriverError, DriverResult, Progress};

// ─── Transport ──────────────────────────────────────────────────────
pub use crate::transport::{Transport, TransportError};

// ─── Status ─────────────────────────────────────────────────────────
pub use crate::status::{HandlerCondition, StatusBit};
