//! Per-handler session state.
//!
//! Holds everything the protocol engine remembers between calls: the
//! configured sites, timing, verification and reprobe settings, the
//! device-pending set, the decoded status word, identification results and
//! lot flags.

use crate::population::DevicePendingSet;
use crate::vendor::{VendorProfile, Workarounds};
use handler_common::config::ConfigSource;
use handler_common::consts::{
    DEFAULT_HEARTBEAT_TIMEOUT_US, DEFAULT_POLLING_INTERVAL_US, DEFAULT_REPLY_TIMEOUT_US,
    DEFAULT_VERIFY_MAX_RETRIES, MAX_SITES,
};
use handler_common::error::DriverError;
use handler_common::status::HandlerCondition;
use heapless::Vec as HVec;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

// ─── Configuration keys ─────────────────────────────────────────────

/// Handler model name (registry key).
pub const KEY_MODEL: &str = "model";
/// Number of configured sites.
pub const KEY_SITE_COUNT: &str = "site-count";
/// Per-site activation list.
pub const KEY_ACTIVE_SITES: &str = "active-sites";
/// `polling` or `interrupt`.
pub const KEY_POLLING_MODE: &str = "polling-mode";
/// Poll interval in microseconds.
pub const KEY_POLLING_INTERVAL: &str = "polling-interval-us";
/// Upper bound of one wait in microseconds.
pub const KEY_HEARTBEAT_TIMEOUT: &str = "heartbeat-timeout-us";
/// Reply timeout in microseconds.
pub const KEY_REPLY_TIMEOUT: &str = "reply-timeout-us";
/// Verify bins through the echo protocol.
pub const KEY_VERIFY_BINS: &str = "verify-bins";
/// Resend budget for bin verification.
pub const KEY_VERIFY_MAX_RETRIES: &str = "verify-max-retries";
/// Enable reprobe.
pub const KEY_REPROBE_MODE: &str = "reprobe-mode";
/// Bin code that requests a reprobe.
pub const KEY_REPROBE_BIN: &str = "reprobe-bin";
/// Extra firmware workarounds.
pub const KEY_WORKAROUNDS: &str = "workaround-list";

/// How the driver learns about new devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PollingMode {
    /// Periodically query the population.
    StrictPolling,
    /// Wait for interrupt bytes.
    Interrupt,
}

impl FromStr for PollingMode {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "polling" | "strict-polling" | "strict" | "poll" => Ok(Self::StrictPolling),
            "interrupt" | "srq" | "interrupt-driven" => Ok(Self::Interrupt),
            other => Err(DriverError::Config(format!(
                "{KEY_POLLING_MODE}: '{other}' is neither 'polling' nor 'interrupt'"
            ))),
        }
    }
}

impl fmt::Display for PollingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StrictPolling => f.write_str("polling"),
            Self::Interrupt => f.write_str("interrupt"),
        }
    }
}

/// Result of the identification exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandlerIdentity {
    /// Raw identification reply.
    pub raw: String,
    /// Firmware version numbers, most significant first.
    pub version: Vec<u32>,
    /// The reply names the configured model.
    pub matched: bool,
}

impl HandlerIdentity {
    /// Parse an identification reply.
    ///
    /// The version is the first whitespace- or comma-separated token that
    /// consists of dot-separated numbers, optionally prefixed with `V`.
    pub fn parse(raw: &str, expected: &str) -> Self {
        let matched = raw
            .to_ascii_uppercase()
            .contains(&expected.to_ascii_uppercase());
        let version = raw
            .split(|c: char| c.is_whitespace() || c == ',')
            .map(|tok| tok.trim_start_matches(['V', 'v']))
            .find_map(|tok| {
                let parts: Result<Vec<u32>, _> = tok.split('.').map(str::parse).collect();
                parts.ok().filter(|p| !p.is_empty())
            })
            .unwrap_or_default();
        Self {
            raw: raw.trim().to_string(),
            version,
            matched,
        }
    }
}

// ─── Settings ───────────────────────────────────────────────────────

/// Reconfigurable settings, validated against the model profile.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Device detection mode.
    pub polling_mode: PollingMode,
    /// Pause between population queries in polling mode.
    pub polling_interval: Duration,
    /// Longest a single wait may block before returning `Waiting`.
    pub heartbeat_timeout: Duration,
    /// Longest wait for one reply line.
    pub reply_timeout: Duration,
    /// Verify bin data through the echo protocol.
    pub verify_bins: bool,
    /// Resends allowed after an echo mismatch.
    pub verify_max_retries: u32,
    /// Reprobe requests are allowed.
    pub reprobe_enabled: bool,
    /// Bin code sent for reprobed sites.
    pub reprobe_bin: Option<u32>,
    /// Profile defaults plus configured workarounds.
    pub workarounds: Workarounds,
}

fn duration_us(config: &dyn ConfigSource, key: &str, default: u64) -> Result<Duration, DriverError> {
    match config.get_num(key) {
        None => Ok(Duration::from_micros(default)),
        Some(v) if v.is_finite() && v > 0.0 => Ok(Duration::from_micros(v as u64)),
        Some(v) => Err(DriverError::Config(format!("{key}: {v} must be a positive number"))),
    }
}

impl Settings {
    /// Read and validate settings.
    ///
    /// # Errors
    /// `DriverError::Config` for malformed values, for reprobe enabled without
    /// a reprobe bin, for a reprobe bin outside the model's range, for bin
    /// verification on a model without echo, and for unknown workarounds.
    pub fn from_config(config: &dyn ConfigSource, profile: &VendorProfile) -> Result<Self, DriverError> {
        let default_mode = if profile.interrupts {
            PollingMode::Interrupt
        } else {
            PollingMode::StrictPolling
        };
        let polling_mode = match config.get_str(KEY_POLLING_MODE) {
            Some(s) => s.parse()?,
            None => default_mode,
        };
        if polling_mode == PollingMode::Interrupt && !profile.interrupts {
            return Err(DriverError::Config(format!(
                "{KEY_POLLING_MODE}: model {} has no interrupt line, use 'polling'",
                profile.name
            )));
        }

        let verify_bins = config.get_bool(KEY_VERIFY_BINS).unwrap_or(false);
        if verify_bins && matches!(profile.binning.echo, crate::vendor::EchoMode::None) {
            return Err(DriverError::Config(format!(
                "{KEY_VERIFY_BINS}: model {} does not echo bin data",
                profile.name
            )));
        }
        let verify_max_retries = match config.get_num(KEY_VERIFY_MAX_RETRIES) {
            None => DEFAULT_VERIFY_MAX_RETRIES,
            Some(v) if v >= 0.0 && v.fract() == 0.0 && v <= f64::from(u32::MAX) => v as u32,
            Some(v) => {
                return Err(DriverError::Config(format!(
                    "{KEY_VERIFY_MAX_RETRIES}: {v} is not a non-negative integer"
                )));
            }
        };

        let reprobe_enabled = config.get_bool(KEY_REPROBE_MODE).unwrap_or(false);
        let reprobe_bin = match config.get_num(KEY_REPROBE_BIN) {
            None => None,
            Some(v) if v >= 0.0 && v.fract() == 0.0 && profile.bin_range.contains(v as u32) => {
                Some(v as u32)
            }
            Some(v) => {
                return Err(DriverError::Config(format!(
                    "{KEY_REPROBE_BIN}: {v} is outside the legal bin range {} of {}",
                    profile.bin_range, profile.name
                )));
            }
        };
        if reprobe_enabled && reprobe_bin.is_none() {
            return Err(DriverError::Config(format!(
                "{KEY_REPROBE_MODE} is enabled but {KEY_REPROBE_BIN} is not set"
            )));
        }

        let mut workarounds = profile.default_workarounds;
        for name in config.get_list(KEY_WORKAROUNDS).unwrap_or_default() {
            let Some(name) = name.as_str() else {
                return Err(DriverError::Config(format!(
                    "{KEY_WORKAROUNDS}: entries must be strings"
                )));
            };
            match Workarounds::from_config_name(name) {
                Some(flag) => workarounds |= flag,
                None => {
                    return Err(DriverError::Config(format!(
                        "{KEY_WORKAROUNDS}: unknown workaround '{name}'"
                    )));
                }
            }
        }

        Ok(Self {
            polling_mode,
            polling_interval: duration_us(config, KEY_POLLING_INTERVAL, DEFAULT_POLLING_INTERVAL_US)?,
            heartbeat_timeout: duration_us(config, KEY_HEARTBEAT_TIMEOUT, DEFAULT_HEARTBEAT_TIMEOUT_US)?,
            reply_timeout: duration_us(config, KEY_REPLY_TIMEOUT, DEFAULT_REPLY_TIMEOUT_US)?,
            verify_bins,
            verify_max_retries,
            reprobe_enabled,
            reprobe_bin,
            workarounds,
        })
    }
}

/// Read the immutable site layout: site count and activation list.
///
/// # Errors
/// `DriverError::Config` if `site-count` is missing or exceeds the model,
/// or if `active-sites` has the wrong length.
pub fn site_layout(
    config: &dyn ConfigSource,
    profile: &VendorProfile,
) -> Result<HVec<bool, MAX_SITES>, DriverError> {
    let count = config
        .get_num(KEY_SITE_COUNT)
        .ok_or_else(|| DriverError::Config(format!("{KEY_SITE_COUNT} is required")))?;
    if count < 1.0 || count.fract() != 0.0 {
        return Err(DriverError::Config(format!("{KEY_SITE_COUNT}: {count} is not a positive integer")));
    }
    let count = count as usize;
    if count > profile.max_sites.min(MAX_SITES) {
        return Err(DriverError::Config(format!(
            "{KEY_SITE_COUNT}: {count} exceeds the {} sites of {}",
            profile.max_sites, profile.name
        )));
    }

    match config.get_list(KEY_ACTIVE_SITES) {
        None => Ok((0..count).map(|_| true).collect()),
        Some(list) => {
            if list.len() != count {
                return Err(DriverError::Config(format!(
                    "{KEY_ACTIVE_SITES}: {} entries for {count} sites",
                    list.len()
                )));
            }
            list.iter()
                .map(|value| {
                    value.as_bool().ok_or_else(|| {
                        DriverError::Config(format!("{KEY_ACTIVE_SITES}: '{value:?}' is not a flag"))
                    })
                })
                .collect()
        }
    }
}

// ─── Session ────────────────────────────────────────────────────────

/// Mutable per-handler state.
#[derive(Debug)]
pub struct HandlerSession {
    pub(crate) profile: &'static VendorProfile,
    pub(crate) active: HVec<bool, MAX_SITES>,
    pub(crate) settings: Settings,
    pub(crate) pending: DevicePendingSet,
    /// Last population reported by the handler, deactivated sites included.
    pub(crate) reported: u64,
    /// Sites a reprobe expects back.
    pub(crate) expected: u64,
    /// Sites binned by the last successful bin operation.
    pub(crate) last_binned: u64,
    /// Bin verification attempts already made in the current binning.
    pub(crate) bin_attempts: u32,
    /// Commands of the binning `bin_attempts` counts for.
    pub(crate) bin_request: Vec<String>,
    pub(crate) status_word: u64,
    pub(crate) conditions: HandlerCondition,
    pub(crate) stopped: bool,
    pub(crate) identity: Option<HandlerIdentity>,
    pub(crate) last_interrupt: Option<u8>,
    pub(crate) lot_start: bool,
    pub(crate) lot_end: bool,
    pub(crate) setup_done: bool,
}

impl HandlerSession {
    /// New session for a validated site layout.
    pub fn new(profile: &'static VendorProfile, active: HVec<bool, MAX_SITES>, settings: Settings) -> Self {
        Self {
            profile,
            pending: DevicePendingSet::new(active.len()),
            active,
            settings,
            reported: 0,
            expected: 0,
            last_binned: 0,
            bin_attempts: 0,
            bin_request: Vec::new(),
            status_word: 0,
            conditions: HandlerCondition::empty(),
            stopped: false,
            identity: None,
            last_interrupt: None,
            lot_start: false,
            lot_end: false,
            setup_done: false,
        }
    }

    /// Model profile.
    pub fn profile(&self) -> &'static VendorProfile {
        self.profile
    }

    /// Configured site count.
    #[inline]
    pub fn site_count(&self) -> usize {
        self.active.len()
    }

    /// Per-site activation.
    pub fn active_sites(&self) -> &[bool] {
        &self.active
    }

    /// Bitmask of active sites.
    pub fn active_mask(&self) -> u64 {
        self.active
            .iter()
            .enumerate()
            .filter(|(_, on)| **on)
            .fold(0, |mask, (i, _)| mask | (1u64 << i))
    }

    /// Current settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Devices reported by the handler.
    pub fn pending(&self) -> &DevicePendingSet {
        &self.pending
    }

    /// Identification result, once identified.
    pub fn identity(&self) -> Option<&HandlerIdentity> {
        self.identity.as_ref()
    }

    /// Most recent interrupt byte.
    pub fn last_interrupt(&self) -> Option<u8> {
        self.last_interrupt
    }

    /// Active workarounds.
    #[inline]
    pub fn workarounds(&self) -> Workarounds {
        self.settings.workarounds
    }

    /// Record a raw status word and its decoded conditions.
    pub(crate) fn apply_status(&mut self, word: u64, conditions: HandlerCondition) {
        self.status_word = word;
        self.conditions = conditions;
        if let Some(bit) = self.profile.stopped_bit() {
            self.stopped = bit < 64 && word & (1u64 << bit) != 0;
        }
    }
}
