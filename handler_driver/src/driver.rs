//! Handler driver facade.
//!
//! [`HandlerDriver`] owns the session, the journal wrapping the transport,
//! and the abort flag. Every public operation is framed by `begin` and
//! `finish`:
//!
//! - `begin` checks the abort flag (discarding the journal and returning
//!   `Aborted` if it is set) and rewinds the journal for replay.
//! - `finish` keeps the journal when the operation returned `Waiting` so
//!   the next call resumes where this one stopped, and clears it otherwise.
//!
//! The operations themselves live in `polling`, `binning`, `reprobe`,
//! `status` and `setup`.

use crate::journal::{Journal, JournalStats};
use crate::model_registry::ModelRegistry;
use crate::population::SitePopulation;
use crate::session::{self, HandlerSession, Settings, KEY_MODEL};
use crate::vendor::VendorProfile;
use handler_common::config::ConfigSource;
use handler_common::consts::MAX_FLUSHED_INTERRUPTS;
use handler_common::error::{DriverError, DriverResult, Progress};
use handler_common::transport::{Transport, TransportError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Protocol engine for one handler.
pub struct HandlerDriver {
    pub(crate) session: HandlerSession,
    pub(crate) journal: Journal,
    abort: Arc<AtomicBool>,
}

impl HandlerDriver {
    /// Create a driver for `profile` with a validated session.
    pub fn new(session: HandlerSession, transport: Box<dyn Transport>) -> Self {
        Self {
            session,
            journal: Journal::new(transport),
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Create a driver from configuration.
    ///
    /// Resolves `model` through the registry, reads the site layout and the
    /// reconfigurable settings. No handler I/O happens here; call
    /// [`HandlerDriver::reconfigure`] before the first cycle.
    ///
    /// # Errors
    /// `DriverError::Config` for an unknown model or invalid settings.
    pub fn from_config(
        registry: &ModelRegistry,
        config: &dyn ConfigSource,
        transport: Box<dyn Transport>,
    ) -> DriverResult<Self> {
        let model = config
            .get_str(KEY_MODEL)
            .ok_or_else(|| DriverError::Config(format!("{KEY_MODEL} is required")))?;
        let profile = registry.lookup(&model)?;
        let active = session::site_layout(config, profile)?;
        let settings = Settings::from_config(config, profile)?;
        info!(
            model = profile.name,
            vendor = %profile.vendor,
            sites = active.len(),
            mode = %settings.polling_mode,
            transport = transport.name(),
            "Handler driver created"
        );
        Ok(Self::new(HandlerSession::new(profile, active, settings), transport))
    }

    /// Session state.
    pub fn session(&self) -> &HandlerSession {
        &self.session
    }

    /// Model profile.
    pub fn profile(&self) -> &'static VendorProfile {
        self.session.profile
    }

    /// Shared abort flag. Setting it makes the next top-level operation
    /// return `Aborted` before sending anything.
    pub fn abort_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    /// Request an abort.
    pub fn abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    /// Clear a previous abort request.
    pub fn clear_abort(&self) {
        self.abort.store(false, Ordering::SeqCst);
    }

    /// Journal counters.
    pub fn journal_stats(&self) -> JournalStats {
        self.journal.stats()
    }

    /// True if a `Waiting` operation left steps to replay.
    pub fn has_pending_operation(&self) -> bool {
        !self.journal.is_empty()
    }

    /// Population for the executor after `wait_for_parts` returned `Done`:
    /// every active site the handler reported is populated.
    pub fn current_population(&self) -> SitePopulation {
        let mut population = SitePopulation::new(self.session.active_sites());
        population.load_from(&self.session.pending);
        population
    }

    /// Sites binned by the last successful bin operation.
    pub fn last_binned(&self) -> u64 {
        self.session.last_binned
    }

    /// Take the lot-start flag raised by an interrupt.
    pub fn take_lot_start(&mut self) -> bool {
        std::mem::take(&mut self.session.lot_start)
    }

    /// Take the lot-end flag raised by an interrupt.
    pub fn take_lot_end(&mut self) -> bool {
        std::mem::take(&mut self.session.lot_end)
    }

    // ─── Operation framing ──────────────────────────────────────────

    pub(crate) fn begin(&mut self, operation: &'static str) -> DriverResult<()> {
        if self.abort.load(Ordering::SeqCst) {
            warn!(operation, "Operation aborted");
            self.journal.discard();
            return Err(DriverError::Aborted);
        }
        debug!(operation, "Begin");
        self.journal.start();
        Ok(())
    }

    pub(crate) fn finish<T>(&mut self, result: DriverResult<T>, waiting: impl FnOnce(&T) -> bool) -> DriverResult<T> {
        match &result {
            Ok(value) if waiting(value) => {}
            _ => self.journal.stop(),
        }
        result
    }

    pub(crate) fn finish_progress(&mut self, result: DriverResult) -> DriverResult {
        self.finish(result, |p| *p == Progress::Waiting)
    }

    // ─── Journaled I/O ──────────────────────────────────────────────

    /// Send one command; the model's line terminator is appended.
    pub(crate) fn send_command(&mut self, command: &str) -> DriverResult<()> {
        let line = format!("{command}{}", self.session.profile.eol);
        self.journal.send(&line)?;
        Ok(())
    }

    /// Receive one reply. A timeout yields `None` so the caller can report
    /// `Waiting`.
    pub(crate) fn receive_reply(&mut self) -> DriverResult<Option<String>> {
        match self.journal.receive(self.session.settings.reply_timeout) {
            Ok(reply) => Ok(Some(reply.trim().to_string())),
            Err(TransportError::Timeout) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Send a query and receive its reply.
    pub(crate) fn query(&mut self, command: &str) -> DriverResult<Option<String>> {
        self.send_command(command)?;
        self.receive_reply()
    }

    /// Discard interrupts accumulated while devices were found some other way.
    pub(crate) fn flush_interrupts(&mut self) -> DriverResult<()> {
        let flushed = self.journal.flush_interrupts(MAX_FLUSHED_INTERRUPTS)?;
        if flushed > 0 {
            debug!(flushed, "Flushed stale interrupts");
        }
        Ok(())
    }
}
