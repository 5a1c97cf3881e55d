//! Transport implementations.
//!
//! - [`serial::SerialTransport`]: RS-232 line transport (no interrupt line)
//! - [`simulator::HandlerSimulator`]: in-process handler for dry runs
//! - [`scripted::ScriptedTransport`]: scripted replies for tests

pub mod scripted;
pub mod serial;
pub mod simulator;
