//! Reprobe: send selected devices back to their sockets and wait for them.
//!
//! The handler's report after a reprobe is filtered through a fixed
//! compatibility table keyed by the site's state before the reprobe,
//! whether it was reprobed, whether it was re-binned, and whether the
//! handler reports a device there now. Devices the executor does not expect
//! are not surfaced this cycle.

use crate::driver::HandlerDriver;
use crate::population::SitePopulation;
use crate::population::SiteState::{self, *};
use handler_common::error::{DriverError, DriverResult, Progress};
use tracing::{Level, debug, error, info, warn};

struct ReprobeRule {
    before: SiteState,
    reprobe: bool,
    /// `None` = either.
    rebinned: Option<bool>,
    /// `None` = either.
    after: Option<bool>,
    reported: SiteState,
    level: Level,
    note: &'static str,
}

const fn rule(
    before: SiteState,
    reprobe: bool,
    rebinned: Option<bool>,
    after: Option<bool>,
    reported: SiteState,
    level: Level,
    note: &'static str,
) -> ReprobeRule {
    ReprobeRule {
        before,
        reprobe,
        rebinned,
        after,
        reported,
        level,
        note,
    }
}

#[rustfmt::skip]
const REPROBE_MATRIX: &[ReprobeRule] = &[
    rule(Populated, true, None, Some(true), Populated, Level::DEBUG, "reprobed device returned"),
    rule(Populated, true, None, Some(false), Empty, Level::WARN, "reprobed device not returned"),
    rule(Populated, false, Some(false), Some(true), Populated, Level::DEBUG, "device stayed in the socket"),
    rule(Populated, false, Some(true), Some(true), Empty, Level::WARN, "binned site reported loaded again, delayed to next cycle"),
    rule(Populated, false, Some(true), Some(false), Empty, Level::DEBUG, "device binned"),
    rule(Populated, false, Some(false), Some(false), Empty, Level::ERROR, "device kept in the socket is no longer reported"),
    rule(PopulatedDeactivated, true, None, Some(true), PopulatedDeactivated, Level::DEBUG, "reprobed device returned to deactivated site"),
    rule(PopulatedDeactivated, true, None, Some(false), Deactivated, Level::WARN, "reprobed device not returned to deactivated site"),
    rule(PopulatedDeactivated, false, Some(true), None, Deactivated, Level::DEBUG, "deactivated site binned"),
    rule(PopulatedDeactivated, false, Some(false), None, PopulatedDeactivated, Level::DEBUG, "device stays in deactivated site"),
    rule(Empty, false, None, Some(true), Empty, Level::WARN, "unexpected device, delayed to next cycle"),
    rule(Empty, false, None, Some(false), Empty, Level::DEBUG, "site stays empty"),
    rule(Deactivated, false, None, None, Deactivated, Level::DEBUG, "site stays deactivated"),
];

/// Reported state and log level for one site after a reprobe.
pub fn reprobe_outcome(
    before: SiteState,
    reprobe: bool,
    rebinned: bool,
    after: bool,
) -> (SiteState, Level, &'static str) {
    REPROBE_MATRIX
        .iter()
        .find(|r| {
            r.before == before
                && r.reprobe == reprobe
                && r.rebinned.is_none_or(|v| v == rebinned)
                && r.after.is_none_or(|v| v == after)
        })
        .map(|r| (r.reported, r.level, r.note))
        .unwrap_or((Empty, Level::ERROR, "inconsistent reprobe state"))
}

fn log_outcome(level: Level, site: usize, before: SiteState, reported: SiteState, note: &str) {
    if level == Level::ERROR {
        error!(site, ?before, ?reported, "{note}");
    } else if level == Level::WARN {
        warn!(site, ?before, ?reported, "{note}");
    } else if level == Level::INFO {
        info!(site, ?before, ?reported, "{note}");
    } else {
        debug!(site, ?before, ?reported, "{note}");
    }
}

impl HandlerDriver {
    /// Reprobe the sites flagged in `reprobe_sites`, bin the rest, then wait
    /// for the returned devices.
    ///
    /// On `Done`, `population` holds the filtered post-reprobe state. On
    /// `Waiting` it is untouched; call again with the same arguments.
    ///
    /// # Errors
    /// - `Binning` if reprobe mode is disabled or the bin request is invalid
    /// - everything [`HandlerDriver::bin_and_reprobe`] and
    ///   [`HandlerDriver::wait_for_parts`] can return
    pub fn reprobe(
        &mut self,
        population: &mut SitePopulation,
        reprobe_sites: &[bool],
        bins: &[u32],
    ) -> DriverResult {
        self.begin("reprobe")?;
        let result = self.reprobe_step(population, reprobe_sites, bins);
        if result != Ok(Progress::Waiting) {
            self.session.expected = 0;
        }
        self.finish_progress(result)
    }

    fn reprobe_step(
        &mut self,
        population: &mut SitePopulation,
        reprobe_sites: &[bool],
        bins: &[u32],
    ) -> DriverResult {
        if !self.session.settings.reprobe_enabled {
            error!("Reprobe requested but reprobe mode is disabled");
            return Err(DriverError::Binning("reprobe mode is not enabled".to_string()));
        }

        let before = population.clone();
        if self.bin_step(&before, Some(reprobe_sites), bins)? == Progress::Waiting {
            return Ok(Progress::Waiting);
        }
        let rebinned = self.session.last_binned;

        self.session.expected = reprobe_sites
            .iter()
            .enumerate()
            .filter(|(i, flag)| **flag && before.get(*i).is_some_and(SiteState::holds_device))
            .fold(0, |mask, (i, _)| mask | (1u64 << i));
        if self.wait_for_parts_step()? == Progress::Waiting {
            return Ok(Progress::Waiting);
        }

        let reported_mask = self.session.reported;
        for (i, state) in before.states().iter().enumerate() {
            let (reported, level, note) = reprobe_outcome(
                *state,
                reprobe_sites.get(i).copied().unwrap_or(false),
                rebinned & (1u64 << i) != 0,
                reported_mask & (1u64 << i) != 0,
            );
            log_outcome(level, i + 1, *state, reported, note);
            population.set(i, reported);
        }

        let surfaced = population.device_mask();
        self.session.pending.assign(surfaced, &self.session.active);
        info!(population = format_args!("{surfaced:#x}"), "Reprobe complete");
        Ok(Progress::Done)
    }
}
