//! In-process handler simulator.
//!
//! Speaks the command set of any [`VendorProfile`]: answers identification,
//! site, population, status and interrupt-kind queries, accepts bin
//! commands in the profile's layout (legacy layout included), produces the
//! bin echo and signals devices through the profile's interrupt encoding.
//!
//! Devices arrive while the driver waits: a poll with a zero timeout (an
//! interrupt flush) never loads the next batch. The lot ends after
//! `lot_size` devices; the simulator then raises the lot-end event once and
//! reports no further devices.

use crate::binning::parse_aggregate_echo;
use crate::vendor::{
    BinLayout, EchoMode, SiteReport, SrqEvent, VendorProfile, render, strip_prefix_ignore_case,
};
use handler_common::transport::{Transport, TransportError};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Pause taken by an idle interrupt poll so an idle caller does not spin.
const IDLE_PACE: Duration = Duration::from_millis(1);

/// Counters reported by the simulator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SimulatorStats {
    /// Devices loaded from the input, reprobes not counted.
    pub delivered: u32,
    /// Devices sorted per bin.
    pub bins: BTreeMap<u32, u32>,
    /// Devices sent back to their socket.
    pub reprobed: u32,
    /// Bin data rejected by the driver after an echo mismatch.
    pub rejected: u32,
}

struct SimState {
    profile: &'static VendorProfile,
    site_count: usize,
    lot_size: u32,
    reprobe_bin: Option<u32>,
    loaded: u64,
    returned: u64,
    staged: Vec<(usize, u32)>,
    echo: Option<String>,
    corrupt_echo: bool,
    replies: VecDeque<String>,
    interrupts: VecDeque<u8>,
    last_event: u8,
    lot_started: bool,
    lot_end_sent: bool,
    stopped: bool,
    stats: SimulatorStats,
}

/// Simulated handler behind the [`Transport`] interface.
pub struct HandlerSimulator {
    state: Arc<Mutex<SimState>>,
}

/// Shared view of a [`HandlerSimulator`].
#[derive(Clone)]
pub struct SimulatorHandle {
    state: Arc<Mutex<SimState>>,
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn site_mask(count: usize) -> u64 {
    if count >= 64 { u64::MAX } else { (1u64 << count) - 1 }
}

/// Join an echo keyword and the echoed text the way handlers print them.
fn echo_line(prefix: &str, body: &str) -> String {
    if prefix.is_empty() || prefix.ends_with([':', ' ']) {
        format!("{prefix}{body}")
    } else {
        format!("{prefix} {body}")
    }
}

impl HandlerSimulator {
    /// Simulate `profile` with `site_count` sites and a lot of `lot_size`
    /// devices.
    pub fn new(profile: &'static VendorProfile, site_count: usize, lot_size: u32) -> Self {
        let state = SimState {
            profile,
            site_count: site_count.min(profile.max_sites).max(1),
            lot_size,
            reprobe_bin: None,
            loaded: 0,
            returned: 0,
            staged: Vec::new(),
            echo: None,
            corrupt_echo: false,
            replies: VecDeque::new(),
            interrupts: VecDeque::new(),
            last_event: 0,
            lot_started: false,
            lot_end_sent: false,
            stopped: false,
            stats: SimulatorStats::default(),
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Devices binned to `bin` go back into their socket.
    pub fn with_reprobe_bin(self, bin: u32) -> Self {
        lock(&self.state).reprobe_bin = Some(bin);
        self
    }

    /// Handle for inspection and fault injection.
    pub fn handle(&self) -> SimulatorHandle {
        SimulatorHandle {
            state: Arc::clone(&self.state),
        }
    }
}

impl SimulatorHandle {
    /// Counters so far.
    pub fn stats(&self) -> SimulatorStats {
        lock(&self.state).stats.clone()
    }

    /// Sites currently holding a device.
    pub fn loaded(&self) -> u64 {
        lock(&self.state).loaded
    }

    /// Raise an exceptional event. Returns `false` if the model cannot
    /// signal it.
    pub fn inject(&self, event: SrqEvent) -> bool {
        lock(&self.state).raise(event)
    }

    /// Garble the next bin echo.
    pub fn corrupt_next_echo(&self) {
        lock(&self.state).corrupt_echo = true;
    }

    /// True while the handler is stopped.
    pub fn stopped(&self) -> bool {
        lock(&self.state).stopped
    }
}

impl SimState {
    fn raise(&mut self, event: SrqEvent) -> bool {
        match self.profile.srq.encode_event(event) {
            Some(code) => {
                self.last_event = code;
                self.interrupts.push_back(code);
                true
            }
            None => false,
        }
    }

    /// Load the next batch if the sockets are empty.
    fn refill(&mut self) -> bool {
        if self.loaded != 0 || self.stopped || self.stats.delivered >= self.lot_size {
            return false;
        }
        if !self.lot_started {
            self.lot_started = true;
            self.raise(SrqEvent::LOT_START);
        }
        let remaining = self.lot_size - self.stats.delivered;
        let batch = remaining.min(self.site_count as u32);
        self.loaded = site_mask(batch as usize);
        self.stats.delivered += batch;
        debug!(loaded = format_args!("{:#x}", self.loaded), "Simulator loaded devices");
        true
    }

    fn signal_ready(&mut self) {
        let code = self.profile.srq.encode_ready(self.loaded, self.site_count);
        self.interrupts.push_back(code);
    }

    fn lot_finished(&self) -> bool {
        self.loaded == 0 && self.stats.delivered >= self.lot_size
    }

    fn status_word(&self) -> u64 {
        match self.profile.stopped_bit() {
            Some(bit) if self.stopped && bit < 64 => 1u64 << bit,
            _ => 0,
        }
    }

    fn reply(&mut self, line: String) {
        trace!(reply = %line, "Simulator reply");
        self.replies.push_back(line);
    }

    fn echo(&mut self, text: String) -> String {
        if std::mem::take(&mut self.corrupt_echo) {
            format!("{text}#")
        } else {
            text
        }
    }

    fn handle(&mut self, line: &str) {
        let profile = self.profile;
        let is = |command: &str| line.eq_ignore_ascii_case(command);

        if let Some(identify) = profile.identify.filter(|id| is(id.command)) {
            self.reply(format!("{} {} V1.00", profile.vendor, identify.expected));
        } else if let Some(sites) = profile.sites.filter(|s| is(s.query.command)) {
            let value = match sites.report {
                SiteReport::Count => self.site_count as u64,
                SiteReport::Mask => site_mask(self.site_count),
            };
            self.reply(sites.query.reply.format(value, 0));
        } else if is(profile.population.command) {
            self.refill();
            let line = profile.population.reply.format(self.loaded, 0);
            self.reply(line);
        } else if let Some(status) = profile.status.filter(|s| is(s.query.command)) {
            let line = status.query.reply.format(self.status_word(), 0);
            self.reply(line);
        } else if profile.srq.kind_query.is_some_and(is) {
            let code = self.last_event;
            self.reply(code.to_string());
        } else if profile.srq.ack.is_some_and(is) {
            self.last_event = 0;
        } else if profile.setup.iter().any(|command| is(command)) {
            trace!(command = line, "Simulator setup command");
        } else if profile.pause.is_some_and(is) {
            self.stopped = true;
        } else if profile.resume.is_some_and(is) {
            self.stopped = false;
        } else if matches!(profile.binning.echo, EchoMode::Query { command, .. } if is(command)) {
            let echo = self.echo.clone().unwrap_or_default();
            let echo = self.echo(echo);
            self.reply(echo);
        } else if profile.binning.echo_ok.is_some_and(is) {
            self.apply_staged();
        } else if profile.binning.echo_ng.is_some_and(is) {
            self.stats.rejected += 1;
            self.staged.clear();
        } else if !self.bin_command(line) && !self.diagnostics(line) {
            warn!(command = line, "Simulator ignored unknown command");
        }
    }

    fn bin_command(&mut self, line: &str) -> bool {
        let binning = self.profile.binning;
        let layouts = [Some(binning.layout), binning.legacy];
        let Some(parsed) = layouts.iter().flatten().find_map(|layout| parse_bins(layout, line)) else {
            return false;
        };

        let range = self.profile.bin_range;
        let body = match binning.layout {
            BinLayout::Aggregate { template, .. } => {
                let head = template.split("{bins}").next().unwrap_or_default();
                strip_prefix_ignore_case(line, head).unwrap_or(line).to_string()
            }
            BinLayout::PerSite { .. } => line.to_string(),
        };
        let per_site = matches!(binning.layout, BinLayout::PerSite { .. });
        if !per_site {
            self.staged.clear();
        }
        for (site, bin) in parsed {
            if site < self.site_count && range.contains(bin) {
                self.staged.push((site, bin));
            }
        }

        match binning.echo {
            EchoMode::Automatic { prefix } => {
                let echo = self.echo(echo_line(prefix, &body));
                self.reply(echo);
            }
            EchoMode::Query { prefix, .. } => self.echo = Some(echo_line(prefix, &body)),
            EchoMode::None => {}
        }
        if binning.echo_ok.is_none() {
            self.apply_staged();
        }
        true
    }

    fn apply_staged(&mut self) {
        for (site, bin) in std::mem::take(&mut self.staged) {
            let bit = 1u64 << site;
            if self.loaded & bit == 0 {
                continue;
            }
            if self.reprobe_bin == Some(bin) {
                self.stats.reprobed += 1;
                self.returned |= bit;
            } else {
                *self.stats.bins.entry(bin).or_default() += 1;
                self.loaded &= !bit;
            }
        }
    }

    fn diagnostics(&mut self, line: &str) -> bool {
        let known = self.profile.diagnostics.iter().any(|(_, template)| {
            let head = render(template, &[("{param}", "")]);
            strip_prefix_ignore_case(line, head.trim()).is_some()
        });
        if known {
            self.reply("0".to_string());
        }
        known
    }

    fn next_interrupt(&mut self, timeout: Duration) -> Option<u8> {
        if self.interrupts.is_empty() && !timeout.is_zero() {
            if self.returned != 0 {
                self.returned = 0;
                self.signal_ready();
            } else if self.refill() {
                self.signal_ready();
            } else if self.lot_finished() && !self.lot_end_sent {
                self.lot_end_sent = true;
                self.raise(SrqEvent::LOT_END);
            }
        }
        self.interrupts.pop_front()
    }
}

/// Parse a bin command into `(site index, bin)` pairs.
fn parse_bins(layout: &BinLayout, line: &str) -> Option<Vec<(usize, u32)>> {
    match *layout {
        BinLayout::Aggregate {
            template,
            field,
            separator,
            reverse,
            ..
        } => {
            let head = template.split("{bins}").next().unwrap_or_default();
            strip_prefix_ignore_case(line, head)?;
            let codes = parse_aggregate_echo(line, head, &field, separator, reverse)?;
            Some(
                codes
                    .into_iter()
                    .enumerate()
                    .filter_map(|(i, code)| code.map(|bin| (i, bin)))
                    .collect(),
            )
        }
        BinLayout::PerSite { template } => {
            let (head, rest) = template.split_once("{site}")?;
            let (mid, _) = rest.split_once("{bin}")?;
            let body = strip_prefix_ignore_case(line, head)?;
            let (site, bin) = body.split_once(mid)?;
            let site: usize = site.trim().parse().ok()?;
            let bin: u32 = bin.trim().parse().ok()?;
            Some(vec![(site.checked_sub(1)?, bin)])
        }
    }
}

impl Transport for HandlerSimulator {
    fn name(&self) -> &'static str {
        "simulator"
    }

    fn send(&mut self, command: &str) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        let line = command.trim();
        trace!(command = line, "Simulator command");
        state.handle(line);
        Ok(())
    }

    fn receive(&mut self, _timeout: Duration) -> Result<String, TransportError> {
        lock(&self.state).replies.pop_front().ok_or(TransportError::Timeout)
    }

    fn poll_interrupt(&mut self, timeout: Duration) -> Result<Option<u8>, TransportError> {
        if !lock(&self.state).profile.interrupts {
            return Ok(None);
        }
        let code = lock(&self.state).next_interrupt(timeout);
        if code.is_none() && !timeout.is_zero() {
            std::thread::sleep(timeout.min(IDLE_PACE));
        }
        Ok(code)
    }
}
