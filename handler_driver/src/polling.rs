//! Device detection.
//!
//! Two modes, selected by configuration:
//!
//! - **Strict polling**: query the population every polling interval until
//!   a device appears or the heartbeat timeout expires.
//! - **Interrupt**: wait for one interrupt byte and decode it. Population
//!   bits are used directly when every configured site fits into the byte;
//!   otherwise the population is queried. Exceptional signals (lot start,
//!   lot end, alarm, notification) are drained and reported as `Waiting`.
//!
//! ```text
//! Idle ──interrupt──▶ Interpreting ──devices──▶ DevicesFound
//!   │                     │    └──event──▶ Draining ──▶ Waiting
//!   └──timeout──▶ Waiting ◀──nothing──┘
//! ```

use crate::driver::HandlerDriver;
use crate::session::PollingMode;
use crate::vendor::{SrqEvent, Workarounds};
use handler_common::error::{DriverResult, Progress};
use std::thread;
use std::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Phase of one device wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollPhase {
    /// Waiting for the first signal.
    Idle,
    /// Decoding a signal.
    Interpreting,
    /// At least one device is pending.
    DevicesFound,
    /// Nothing to report yet.
    Waiting,
    /// Handling an exceptional signal.
    Draining,
}

fn enter(phase: &mut PollPhase, next: PollPhase) {
    trace!(from = ?*phase, to = ?next, "Poll phase");
    *phase = next;
}

/// Result of one population query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollOutcome {
    /// Reply parsed; the pending set is updated.
    Parsed,
    /// No reply within the reply timeout; the query stays in the journal.
    NoReply,
    /// Reply did not parse; the query and reply were removed from the journal.
    Malformed,
}

impl HandlerDriver {
    /// Wait for devices to be inserted.
    ///
    /// Returns `Done` once at least one active site holds a device (see
    /// [`HandlerDriver::current_population`]) and `Waiting` otherwise.
    ///
    /// # Errors
    /// Transport failures and `Aborted`.
    pub fn wait_for_parts(&mut self) -> DriverResult {
        self.begin("wait_for_parts")?;
        let result = self.wait_for_parts_step();
        self.finish_progress(result)
    }

    /// Query the population once.
    ///
    /// `Done` means the reply was understood, even if no site is loaded.
    /// A malformed reply yields `Waiting` and the query is sent again on the
    /// next call.
    ///
    /// # Errors
    /// Transport failures and `Aborted`.
    pub fn poll_parts(&mut self) -> DriverResult {
        self.begin("poll_parts")?;
        let result = self.poll_population().map(|outcome| match outcome {
            PollOutcome::Parsed => Progress::Done,
            PollOutcome::NoReply | PollOutcome::Malformed => Progress::Waiting,
        });
        self.finish_progress(result)
    }

    pub(crate) fn wait_for_parts_step(&mut self) -> DriverResult {
        match self.session.settings.polling_mode {
            PollingMode::StrictPolling => self.wait_by_polling(),
            PollingMode::Interrupt => self.wait_by_interrupt(),
        }
    }

    fn wait_by_polling(&mut self) -> DriverResult {
        let settings = &self.session.settings;
        let deadline = Instant::now() + settings.heartbeat_timeout;
        let interval = settings.polling_interval;
        let mut phase = PollPhase::Idle;

        loop {
            self.journal.mark();
            match self.poll_population()? {
                PollOutcome::NoReply => {
                    enter(&mut phase, PollPhase::Waiting);
                    return Ok(Progress::Waiting);
                }
                PollOutcome::Parsed if self.session.pending.any() => {
                    // interrupts raised while polling belong to this arrival
                    self.flush_interrupts()?;
                    enter(&mut phase, PollPhase::DevicesFound);
                    return Ok(Progress::Done);
                }
                PollOutcome::Parsed | PollOutcome::Malformed => self.journal.remove_to_mark(),
            }

            let now = Instant::now();
            if now >= deadline {
                // no device arrived; stray signals must not leak into the next wait
                self.flush_interrupts()?;
                enter(&mut phase, PollPhase::Waiting);
                return Ok(Progress::Waiting);
            }
            thread::sleep(interval.min(deadline - now));
        }
    }

    fn wait_by_interrupt(&mut self) -> DriverResult {
        let mut phase = PollPhase::Idle;
        self.journal.mark();

        let timeout = self.session.settings.heartbeat_timeout;
        let Some(code) = self.journal.poll_interrupt(timeout)? else {
            enter(&mut phase, PollPhase::Waiting);
            return Ok(Progress::Waiting);
        };
        enter(&mut phase, PollPhase::Interpreting);
        self.session.last_interrupt = Some(code);

        let layout = self.session.profile.srq;
        let signal = layout.decode(code);
        debug!(code = format_args!("0x{code:02X}"), ?signal, "Interrupt decoded");

        if !signal.events.is_empty() {
            enter(&mut phase, PollPhase::Draining);
            if !self.drain_exceptional(code, signal.events)? {
                return Ok(Progress::Waiting);
            }
            self.journal.remove_to_mark();
            enter(&mut phase, PollPhase::Waiting);
            return Ok(Progress::Waiting);
        }

        let fits = self.session.site_count() <= usize::from(layout.site_bits);
        let confirm = self.session.workarounds().contains(Workarounds::POLL_AFTER_SRQ);
        let direct = signal.sites.filter(|_| fits && !confirm);

        if let Some(mask) = direct {
            self.apply_population(mask);
            let missing = self.session.expected & self.session.active_mask() & !self.session.pending.mask();
            if missing != 0 {
                info!(
                    missing = format_args!("{missing:#x}"),
                    "Interrupt lacks devices expected back, polling population"
                );
                if !self.poll_after_interrupt()? {
                    return Ok(Progress::Waiting);
                }
            }
        } else if signal.device_ready || signal.sites.is_some() {
            if !self.poll_after_interrupt()? {
                return Ok(Progress::Waiting);
            }
        } else {
            warn!(code = format_args!("0x{code:02X}"), "Interrupt carries neither devices nor events");
        }

        if self.session.pending.any() {
            enter(&mut phase, PollPhase::DevicesFound);
            Ok(Progress::Done)
        } else {
            self.journal.remove_to_mark();
            enter(&mut phase, PollPhase::Waiting);
            Ok(Progress::Waiting)
        }
    }

    /// Query the population after an interrupt. `false` means the caller
    /// must return `Waiting` with the interrupt kept in the journal.
    fn poll_after_interrupt(&mut self) -> DriverResult<bool> {
        match self.poll_population()? {
            PollOutcome::Parsed => {
                self.flush_interrupts()?;
                Ok(true)
            }
            PollOutcome::NoReply | PollOutcome::Malformed => Ok(false),
        }
    }

    /// Drain an exceptional interrupt. `false` means the kind query got no
    /// reply yet.
    fn drain_exceptional(&mut self, code: u8, events: SrqEvent) -> DriverResult<bool> {
        let layout = self.session.profile.srq;
        if let Some(kind_query) = layout.kind_query {
            let Some(kind) = self.query(kind_query)? else {
                return Ok(false);
            };
            debug!(kind = %kind, "Interrupt kind");
        }
        if let Some(ack) = layout.ack {
            self.send_command(ack)?;
        }

        if events.contains(SrqEvent::LOT_START) {
            info!("Handler signalled lot start");
            self.session.lot_start = true;
        }
        if events.contains(SrqEvent::LOT_END) {
            info!("Handler signalled lot end");
            self.session.lot_end = true;
        }
        if events.contains(SrqEvent::ALARM) {
            warn!(code = format_args!("0x{code:02X}"), "Handler signalled an alarm");
        }
        if events.contains(SrqEvent::NOTIFY) {
            info!(code = format_args!("0x{code:02X}"), "Handler interface notification");
        }
        Ok(true)
    }

    /// Send the population query and update the pending set.
    pub(crate) fn poll_population(&mut self) -> DriverResult<PollOutcome> {
        let population = self.session.profile.population;
        let Some(reply) = self.query(population.command)? else {
            return Ok(PollOutcome::NoReply);
        };
        match population.reply.parse(&reply) {
            Some(mask) => {
                self.apply_population(mask);
                Ok(PollOutcome::Parsed)
            }
            None => {
                warn!(query = population.command, reply = %reply, "Unexpected population reply, resending");
                self.journal.remove_step();
                self.journal.remove_step();
                Ok(PollOutcome::Malformed)
            }
        }
    }

    /// Replace the pending set from a handler population mask.
    pub(crate) fn apply_population(&mut self, mask: u64) {
        let site_count = self.session.site_count();
        let (beyond, within) = if site_count >= 64 {
            (0, mask)
        } else {
            (mask >> site_count, mask & ((1u64 << site_count) - 1))
        };
        if beyond != 0 {
            warn!(
                mask = format_args!("{mask:#x}"),
                sites = site_count,
                "Handler reports devices beyond the configured sites"
            );
        }
        for (i, &active) in self.session.active.iter().enumerate() {
            if !active && mask & (1u64 << i) != 0 {
                error!(site = i + 1, "Handler reports a device at a deactivated site");
            }
        }
        self.session.reported = within;
        self.session.pending.assign(within, &self.session.active);
        debug!(pending = format_args!("{:#x}", self.session.pending.mask()), "Population updated");
    }
}
