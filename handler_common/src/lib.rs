//! Handler Common Library
//!
//! Shared types for the test handler driver workspace: numeric limits,
//! configuration loading, the transport interface consumed by the protocol
//! engine, the driver error taxonomy and decoded handler conditions.
//!
//! # Module Structure
//!
//! - [`consts`] - Limits and default timing values
//! - [`config`] - TOML loading and typed key lookup
//! - [`transport`] - `Transport` trait and `TransportError`
//! - [`error`] - `DriverError` and `Progress`
//! - [`status`] - Decoded handler condition flags
//! - [`prelude`] - Common re-exports for convenience
//!
//! # Usage
//!
//! ```rust
//! use handler_common::prelude::*;
//! ```

pub mod config;
pub mod consts;
pub mod error;
pub mod prelude;
pub mod status;
pub mod transport;
