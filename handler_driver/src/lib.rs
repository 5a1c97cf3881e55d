//! # Handler Driver Library
//!
//! Protocol engine for semiconductor test handlers. One [`HandlerDriver`]
//! talks to one handler over a [`Transport`](handler_common::transport::Transport):
//! it waits for devices, sends bin results with optional echo
//! verification, reprobes, decodes the status word and runs diagnostics
//! queries. Model differences are data, not code: every supported handler
//! is a [`VendorProfile`] in the [`vendor`] tables.
//!
//! # Module Structure
//!
//! - [`vendor`] - Capability tables for every supported model
//! - [`model_registry`] - Model name to profile lookup
//! - [`session`] - Settings and per-handler state
//! - [`population`] - Site states and the device-pending set
//! - [`journal`] - Transaction journal for resumable operations
//! - [`driver`] - `HandlerDriver` facade and operation framing
//! - [`polling`] - Device detection by polling or interrupt
//! - [`binning`] - Bin composition and echo verification
//! - [`reprobe`] - Reprobe with population reconciliation
//! - [`status`] - Status word, diagnostics, pause and resume
//! - [`setup`] - Reconfiguration and first-time setup
//! - [`transport`] - Serial, simulated and scripted transports
//!
//! # Operation model
//!
//! ```text
//!   executor ──► wait_for_parts ──► Done ──► current_population
//!       ▲              │                          │
//!       │           Waiting                       ▼
//!       │       (call again, journal        bin_and_reprobe / reprobe
//!       │        replays the exchange)            │
//!       └─────────── complete_binning ◄───────────┘
//! ```
//!
//! Operations never block past the configured heartbeat: when the handler
//! has not answered yet they return [`Progress::Waiting`](handler_common::error::Progress)
//! and the next call with the same arguments resumes the exchange.

#![warn(missing_docs)]

pub mod binning;
pub mod driver;
pub mod journal;
pub mod model_registry;
pub mod polling;
pub mod population;
pub mod reprobe;
pub mod session;
pub mod setup;
pub mod status;
pub mod transport;
pub mod vendor;

// Re-export key types for convenience
pub use crate::driver::HandlerDriver;
pub use crate::model_registry::ModelRegistry;
pub use crate::population::{DevicePendingSet, SitePopulation, SiteState};
pub use crate::session::{HandlerSession, PollingMode, Settings};
pub use crate::vendor::VendorProfile;
