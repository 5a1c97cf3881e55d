//! Binning and reprobe command composition with echo verification.
//!
//! A bin request is validated completely before anything is sent: wrong
//! map sizes, bins outside the model's range and reprobe requests without
//! a reprobe bin fail with a `Binning` error and no traffic. The commands
//! are then sent, and when verification is enabled the handler's echo is
//! compared with what was sent. A mismatch rolls the journal back to before
//! the bin commands and resends them, at most `verify-max-retries` times.

use crate::driver::HandlerDriver;
use crate::population::SitePopulation;
use crate::vendor::{BinLayout, EchoMode, FieldFormat, Workarounds, render, strip_prefix_ignore_case};
use handler_common::consts::MAX_SITES;
use handler_common::error::{DriverError, DriverResult, Progress};
use heapless::Vec as HVec;
use tracing::{debug, error, info, warn};

/// Validated bin request.
#[derive(Debug)]
struct BinPlan {
    commands: Vec<String>,
    codes: HVec<Option<u32>, MAX_SITES>,
    mask: u64,
}

#[derive(Debug, PartialEq, Eq)]
enum EchoCheck {
    /// Echo read and equal to what was sent.
    Match,
    /// No echo is read for this model or setting.
    Skipped,
    /// Echo differs.
    Mismatch(String),
    /// Echo did not arrive in time.
    NoReply,
}

/// Compose bin commands for per-site codes (`None` = not binned).
pub fn compose(layout: &BinLayout, codes: &[Option<u32>]) -> Vec<String> {
    match layout {
        BinLayout::Aggregate {
            template,
            field,
            separator,
            idle,
            reverse,
        } => {
            let mut fields: Vec<String> = codes
                .iter()
                .map(|code| match code {
                    Some(bin) => field.radix.format(u64::from(*bin), field.width),
                    None => idle.to_string(),
                })
                .collect();
            if *reverse {
                fields.reverse();
            }
            vec![render(template, &[("{bins}", &fields.join(separator))])]
        }
        BinLayout::PerSite { template } => codes
            .iter()
            .enumerate()
            .filter_map(|(i, code)| {
                code.map(|bin| {
                    render(
                        template,
                        &[("{site}", &(i + 1).to_string()), ("{bin}", &bin.to_string())],
                    )
                })
            })
            .collect(),
    }
}

/// Parse an aggregated echo into per-site codes, site 1 first.
/// Fields that do not parse (idle markers) are `None`.
pub fn parse_aggregate_echo(
    reply: &str,
    prefix: &str,
    field: &FieldFormat,
    separator: &str,
    reverse: bool,
) -> Option<Vec<Option<u32>>> {
    let body = strip_prefix_ignore_case(reply.trim(), prefix)?;
    let body = body.trim_start_matches([':', ' ']).trim_end_matches([';', ' ']);
    let mut fields: Vec<&str> = if separator.is_empty() {
        if !body.is_ascii() {
            return None;
        }
        let width = field.width.max(1);
        (0..body.len())
            .step_by(width)
            .map(|i| &body[i..(i + width).min(body.len())])
            .collect()
    } else if separator.trim().is_empty() {
        body.split_whitespace().collect()
    } else {
        body.split(separator).map(str::trim).collect()
    };
    if reverse {
        fields.reverse();
    }
    Some(
        fields
            .iter()
            .map(|f| field.radix.parse(f).and_then(|v| u32::try_from(v).ok()))
            .collect(),
    )
}

fn echo_matches_command(reply: &str, prefix: &str, command: &str) -> bool {
    strip_prefix_ignore_case(reply.trim(), prefix)
        .map(str::trim)
        .is_some_and(|echo| echo.eq_ignore_ascii_case(command.trim()))
}

impl HandlerDriver {
    /// Bin every populated site, sending the reprobe bin for sites marked in
    /// `reprobe`.
    ///
    /// `population` is the executor's view before binning; sites that hold
    /// a device (including deactivated ones) are binned. `bins` holds one
    /// bin code per configured site. On `Done`, [`HandlerDriver::last_binned`]
    /// reports which sites gave up their device.
    ///
    /// # Errors
    /// - `Binning` for an invalid request (nothing is sent), or when the
    ///   echo still differs after `verify-max-retries + 1` attempts
    /// - transport failures and `Aborted`
    pub fn bin_and_reprobe(
        &mut self,
        population: &SitePopulation,
        reprobe: Option<&[bool]>,
        bins: &[u32],
    ) -> DriverResult {
        self.begin("bin_and_reprobe")?;
        let result = self.bin_step(population, reprobe, bins);
        self.finish_progress(result)
    }

    /// Apply the last successful binning to the executor's population:
    /// binned sites become empty (or deactivated-empty).
    pub fn complete_binning(&self, population: &mut SitePopulation) {
        population.complete_binning(self.session.last_binned);
    }

    pub(crate) fn bin_step(
        &mut self,
        population: &SitePopulation,
        reprobe: Option<&[bool]>,
        bins: &[u32],
    ) -> DriverResult {
        let result = self.bin_and_verify(population, reprobe, bins);
        if result.is_err() {
            self.session.bin_attempts = 0;
        }
        result
    }

    fn bin_and_verify(
        &mut self,
        population: &SitePopulation,
        reprobe: Option<&[bool]>,
        bins: &[u32],
    ) -> DriverResult {
        let resumed = self.journal.replaying();
        self.flush_interrupts()?;
        let plan = self.plan_binning(population, reprobe, bins).inspect_err(|e| {
            error!(error = %e, "Bin request rejected");
        })?;
        // the retry budget belongs to one request; a new request starts over
        if !resumed || self.session.bin_request != plan.commands {
            if self.session.bin_attempts > 0 {
                debug!(attempts = self.session.bin_attempts, "New bin request, retry count reset");
            }
            self.session.bin_attempts = 0;
            self.session.bin_request.clone_from(&plan.commands);
        }
        if plan.mask == 0 {
            debug!("No site holds a device, nothing to bin");
            self.session.last_binned = 0;
            return Ok(Progress::Done);
        }

        let verify = self.session.settings.verify_bins;
        let max_retries = self.session.settings.verify_max_retries;
        let binning = self.session.profile.binning;

        loop {
            self.journal.mark();
            match self.send_bins(&plan, verify)? {
                EchoCheck::NoReply => return Ok(Progress::Waiting),
                // the release command is due whenever the data was not rejected
                EchoCheck::Match | EchoCheck::Skipped => {
                    if let Some(ok) = binning.echo_ok {
                        self.send_command(ok)?;
                    }
                }
                EchoCheck::Mismatch(detail) => {
                    self.session.bin_attempts += 1;
                    let attempts = self.session.bin_attempts;
                    warn!(attempt = attempts, detail = %detail, "Bin echo mismatch");
                    if let Some(ng) = binning.echo_ng {
                        self.send_command(ng)?;
                    }
                    if attempts > max_retries {
                        error!(attempts, "Bin data still wrong, giving up");
                        return Err(DriverError::Binning(format!(
                            "echo mismatch after {attempts} attempts: {detail}"
                        )));
                    }
                    info!(attempt = attempts + 1, of = max_retries + 1, "Resending bin data");
                    self.journal.remove_to_mark();
                    continue;
                }
            }
            self.bins_accepted(plan.mask);
            return Ok(Progress::Done);
        }
    }

    fn plan_binning(
        &self,
        population: &SitePopulation,
        reprobe: Option<&[bool]>,
        bins: &[u32],
    ) -> DriverResult<BinPlan> {
        let site_count = self.session.site_count();
        if population.len() != site_count {
            return Err(DriverError::Binning(format!(
                "population has {} sites, {site_count} configured",
                population.len()
            )));
        }
        if bins.len() < site_count {
            return Err(DriverError::Binning(format!(
                "bin map has {} entries for {site_count} sites",
                bins.len()
            )));
        }
        if let Some(flags) = reprobe {
            if flags.len() < site_count {
                return Err(DriverError::Binning(format!(
                    "reprobe map has {} entries for {site_count} sites",
                    flags.len()
                )));
            }
        }

        let profile = self.session.profile;
        let settings = &self.session.settings;
        let wants_reprobe = |i: usize| reprobe.is_some_and(|flags| flags[i]);
        let reprobing = population
            .states()
            .iter()
            .enumerate()
            .any(|(i, s)| s.holds_device() && wants_reprobe(i));
        let keep_others = reprobing && settings.workarounds.contains(Workarounds::NO_REBIN_ON_REPROBE);

        let codes = population
            .states()
            .iter()
            .enumerate()
            .map(|(i, state)| {
                if !state.holds_device() {
                    Ok(None)
                } else if wants_reprobe(i) {
                    settings.reprobe_bin.map(Some).ok_or_else(|| {
                        DriverError::Binning(format!(
                            "reprobe requested for site {} but no reprobe bin is configured",
                            i + 1
                        ))
                    })
                } else if keep_others {
                    debug!(site = i + 1, "Device stays in the socket during reprobe");
                    Ok(None)
                } else if profile.bin_range.contains(bins[i]) {
                    Ok(Some(bins[i]))
                } else {
                    Err(DriverError::Binning(format!(
                        "site {}: bin {} outside the legal range {} of {}",
                        i + 1,
                        bins[i],
                        profile.bin_range,
                        profile.name
                    )))
                }
            })
            .collect::<DriverResult<HVec<Option<u32>, MAX_SITES>>>()?;
        let mask = codes
            .iter()
            .enumerate()
            .filter(|(_, code)| code.is_some())
            .fold(0u64, |mask, (i, _)| mask | (1u64 << i));

        let commands = compose(profile.bin_layout(settings.workarounds), &codes);
        Ok(BinPlan { commands, codes, mask })
    }

    fn send_bins(&mut self, plan: &BinPlan, verify: bool) -> DriverResult<EchoCheck> {
        let profile = self.session.profile;
        let layout = *profile.bin_layout(self.session.workarounds());
        let echo = profile.binning.echo;

        match layout {
            BinLayout::PerSite { .. } => {
                let mut mismatches = Vec::new();
                for command in &plan.commands {
                    self.send_command(command)?;
                    if let EchoMode::Automatic { prefix } = echo {
                        let Some(reply) = self.receive_reply()? else {
                            return Ok(EchoCheck::NoReply);
                        };
                        if verify && !echo_matches_command(&reply, prefix, command) {
                            mismatches.push(format!("sent '{command}', echoed '{reply}'"));
                        }
                    }
                }
                Ok(match (mismatches.is_empty(), echo) {
                    (false, _) => EchoCheck::Mismatch(mismatches.join("; ")),
                    (true, EchoMode::Automatic { .. }) => EchoCheck::Match,
                    (true, _) => EchoCheck::Skipped,
                })
            }
            BinLayout::Aggregate {
                field,
                separator,
                reverse,
                ..
            } => {
                for command in &plan.commands {
                    self.send_command(command)?;
                }
                let (reply, prefix) = match echo {
                    EchoMode::None => return Ok(EchoCheck::Skipped),
                    EchoMode::Query { .. } if !verify => return Ok(EchoCheck::Skipped),
                    EchoMode::Automatic { prefix } => (self.receive_reply()?, prefix),
                    EchoMode::Query { command, prefix } => (self.query(command)?, prefix),
                };
                let Some(reply) = reply else {
                    return Ok(EchoCheck::NoReply);
                };
                if !verify {
                    return Ok(EchoCheck::Match);
                }
                let Some(echoed) = parse_aggregate_echo(&reply, prefix, &field, separator, reverse) else {
                    return Ok(EchoCheck::Mismatch(format!("unreadable echo '{reply}'")));
                };
                let wrong: Vec<String> = plan
                    .codes
                    .iter()
                    .enumerate()
                    .filter_map(|(i, code)| {
                        let code = (*code)?;
                        let got = echoed.get(i).copied().flatten();
                        (got != Some(code)).then(|| format!("site {} sent {code} echoed {got:?}", i + 1))
                    })
                    .collect();
                Ok(if wrong.is_empty() {
                    EchoCheck::Match
                } else {
                    EchoCheck::Mismatch(wrong.join(", "))
                })
            }
        }
    }

    fn bins_accepted(&mut self, mask: u64) {
        self.session.last_binned = mask;
        self.session.bin_attempts = 0;
        for i in 0..self.session.site_count() {
            if mask & (1u64 << i) != 0 {
                self.session.pending.set(i, false);
            }
        }
        debug!(sites = format_args!("{mask:#x}"), "Bin data accepted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::tests::scripted;
    use crate::population::SiteState::{self, *};
    use crate::vendor::{Radix, seiko, tesec};

    const NS: &str = "model = \"seiko-ns6040\"\nsite-count = 4";

    fn pop(states: &[SiteState]) -> SitePopulation {
        SitePopulation::from_states(states)
    }

    #[test]
    fn aggregate_composition_marks_idle_sites() {
        let cmds = compose(&seiko::SEIKO_NS6040.binning.layout, &[Some(1), None, Some(3), Some(42)]);
        assert_eq!(cmds, vec!["BINON: 01,--,03,42;"]);
    }

    #[test]
    fn packed_reverse_composition_and_parse() {
        let layout = tesec::TESEC_3270.binning.layout;
        let cmds = compose(&layout, &[Some(1), Some(2), None]);
        assert_eq!(cmds, vec!["SORT:F21"]);
        let field = FieldFormat {
            radix: Radix::Hex,
            width: 1,
        };
        let echoed = parse_aggregate_echo("SORT:F21", "SORT:", &field, "", true).unwrap();
        assert_eq!(echoed, vec![Some(1), Some(2), Some(15)]);
    }

    #[test]
    fn illegal_bin_sends_nothing() {
        let (mut d, h) = scripted(NS);
        let population = pop(&[Populated, Populated, Empty, Empty]);
        let err = d.bin_and_reprobe(&population, None, &[1, 100, 0, 0]).unwrap_err();
        assert!(matches!(err, DriverError::Binning(ref m) if m.contains("100")));
        assert!(h.sent().is_empty());
        assert!(!d.has_pending_operation());
    }

    #[test]
    fn short_bin_map_is_rejected() {
        let (mut d, h) = scripted(NS);
        let population = pop(&[Populated, Empty, Empty, Empty]);
        assert!(matches!(
            d.bin_and_reprobe(&population, None, &[1]),
            Err(DriverError::Binning(_))
        ));
        assert!(h.sent().is_empty());
    }

    #[test]
    fn unverified_automatic_echo_is_consumed_and_confirmed() {
        let (mut d, h) = scripted(NS);
        h.respond("BINON", "ECHO: 01,--,--,--;");
        let population = pop(&[Populated, Empty, Empty, Empty]);
        assert_eq!(d.bin_and_reprobe(&population, None, &[1, 0, 0, 0]), Ok(Progress::Done));
        assert_eq!(h.commands(), vec!["BINON: 01,--,--,--;", "ECHOOK"]);
        assert_eq!(d.last_binned(), 0b0001);
    }

    #[test]
    fn verified_echo_mismatch_exhausts_retry_budget() {
        let (mut d, h) = scripted(&format!("{NS}\nverify-bins = true\nverify-max-retries = 2"));
        h.respond("BINON", "ECHO: 07,--,--,--;");
        let population = pop(&[Populated, Empty, Empty, Empty]);
        let err = d.bin_and_reprobe(&population, None, &[1, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, DriverError::Binning(ref m) if m.contains("after 3 attempts")));
        assert_eq!(h.count("BINON"), 3);
        assert_eq!(h.count("ECHONG"), 3);
        assert_eq!(h.count("ECHOOK"), 0);
        assert!(!d.has_pending_operation());
        assert_eq!(d.session().bin_attempts, 0);
    }

    #[test]
    fn zero_retries_means_single_attempt() {
        let (mut d, h) = scripted(&format!("{NS}\nverify-bins = true\nverify-max-retries = 0"));
        h.respond("BINON", "ECHO: 07,--,--,--;");
        let population = pop(&[Populated, Empty, Empty, Empty]);
        assert!(d.bin_and_reprobe(&population, None, &[1, 0, 0, 0]).is_err());
        assert_eq!(h.count("BINON"), 1);
    }

    #[test]
    fn mismatch_then_match_resends_once() {
        let (mut d, h) = scripted(&format!("{NS}\nverify-bins = true"));
        h.respond("BINON", "ECHO: 01,--,03,--;");
        h.respond_once("BINON", "ECHO: 01,--,08,--;");
        let population = pop(&[Populated, Empty, Populated, Empty]);
        assert_eq!(d.bin_and_reprobe(&population, None, &[1, 0, 3, 0]), Ok(Progress::Done));
        assert_eq!(
            h.commands(),
            vec!["BINON: 01,--,03,--;", "ECHONG", "BINON: 01,--,03,--;", "ECHOOK"]
        );
        assert_eq!(d.last_binned(), 0b0101);
    }

    #[test]
    fn new_request_after_waiting_gets_full_retry_budget() {
        let (mut d, h) = scripted(&format!("{NS}\nverify-bins = true\nverify-max-retries = 1"));
        let population = pop(&[Populated, Empty, Empty, Empty]);

        // first request: one mismatch, then no echo
        h.respond_once("BINON", "ECHO: 07,--,--,--;");
        assert_eq!(d.bin_and_reprobe(&population, None, &[1, 0, 0, 0]), Ok(Progress::Waiting));
        assert_eq!(d.session().bin_attempts, 1);

        // different bins: the earlier mismatch must not count against it
        h.respond("BINON", "ECHO: 02,--,--,--;");
        h.respond_once("BINON", "ECHO: 07,--,--,--;");
        assert_eq!(d.bin_and_reprobe(&population, None, &[2, 0, 0, 0]), Ok(Progress::Done));
        assert_eq!(h.count("BINON: 02"), 2);
        assert_eq!(h.count("ECHOOK"), 1);
        assert_eq!(d.session().bin_attempts, 0);
    }

    #[test]
    fn resumed_request_keeps_retry_count() {
        let (mut d, h) = scripted(&format!("{NS}\nverify-bins = true\nverify-max-retries = 1"));
        let population = pop(&[Populated, Empty, Empty, Empty]);

        h.respond_once("BINON", "ECHO: 07,--,--,--;");
        assert_eq!(d.bin_and_reprobe(&population, None, &[1, 0, 0, 0]), Ok(Progress::Waiting));
        h.push_reply("ECHO: 07,--,--,--;");
        let err = d.bin_and_reprobe(&population, None, &[1, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, DriverError::Binning(ref m) if m.contains("after 2 attempts")));
        assert_eq!(h.count("BINON"), 2);
    }

    #[test]
    fn missing_echo_resumes_without_resending() {
        let (mut d, h) = scripted(&format!("{NS}\nverify-bins = true"));
        let population = pop(&[Populated, Empty, Empty, Empty]);
        assert_eq!(d.bin_and_reprobe(&population, None, &[2, 0, 0, 0]), Ok(Progress::Waiting));
        assert!(d.has_pending_operation());

        h.push_reply("ECHO: 02,--,--,--;");
        assert_eq!(d.bin_and_reprobe(&population, None, &[2, 0, 0, 0]), Ok(Progress::Done));
        assert_eq!(h.count("BINON"), 1);
        assert_eq!(h.count("ECHOOK"), 1);
        assert!(!d.has_pending_operation());
    }

    #[test]
    fn deactivated_site_with_device_is_binned() {
        let (mut d, h) = scripted(&format!("{NS}\nactive-sites = [true, false, true, true]"));
        h.respond("BINON", "ECHO: --,05,--,--;");
        let population = pop(&[Empty, PopulatedDeactivated, Deactivated, Empty]);
        assert_eq!(d.bin_and_reprobe(&population, None, &[0, 5, 0, 0]), Ok(Progress::Done));
        assert_eq!(h.commands()[0], "BINON: --,05,--,--;");
    }

    #[test]
    fn per_site_commands_with_echo() {
        let (mut d, h) = scripted("model = \"rasco-so1000\"\nsite-count = 3\nverify-bins = true");
        h.respond("BIN 1", "BIN 1 5");
        h.respond("BIN 3", "BIN 3 100");
        let population = pop(&[Populated, Empty, Populated]);
        assert_eq!(d.bin_and_reprobe(&population, None, &[5, 0, 100]), Ok(Progress::Done));
        assert_eq!(h.commands(), vec!["BIN 1 5", "BIN 3 100"]);
    }

    #[test]
    fn per_site_echo_mismatch_is_retried() {
        let (mut d, h) = scripted("model = \"rasco-so1000\"\nsite-count = 1\nverify-bins = true");
        h.respond("BIN 1", "BIN 1 6");
        h.respond_once("BIN 1", "BIN 1 9");
        let population = pop(&[Populated]);
        assert_eq!(d.bin_and_reprobe(&population, None, &[6]), Ok(Progress::Done));
        assert_eq!(h.count("BIN 1 6"), 2);
    }

    #[test]
    fn legacy_command_workaround() {
        let (mut d, h) = scripted("model = \"delta-rfs\"\nsite-count = 2\nworkaround-list = \"legacy-bin-command\"");
        h.respond("SORT", "SORT 2,3");
        let population = pop(&[Empty, Populated]);
        assert_eq!(d.bin_and_reprobe(&population, None, &[0, 3]), Ok(Progress::Done));
        assert_eq!(h.commands(), vec!["SORT 2,3"]);
    }

    #[test]
    fn query_echo_with_packed_fields() {
        let (mut d, h) = scripted("model = \"tesec-3270\"\nsite-count = 3\nverify-bins = true");
        h.respond("SORT?", "SORT:F21");
        let population = pop(&[Populated, Populated, Empty]);
        assert_eq!(d.bin_and_reprobe(&population, None, &[1, 2, 0]), Ok(Progress::Done));
        assert_eq!(h.commands(), vec!["SORT:F21", "SORT?"]);
    }

    #[test]
    fn binned_sites_leave_pending_set() {
        let (mut d, h) = scripted("model = \"delta-castle\"\nsite-count = 4");
        h.push_interrupt(0x43);
        assert_eq!(d.wait_for_parts(), Ok(Progress::Done));
        let population = d.current_population();
        h.respond("BINON", "ECHO:01,02,--,--;");
        assert_eq!(d.bin_and_reprobe(&population, None, &[1, 2, 0, 0]), Ok(Progress::Done));
        assert!(!d.session().pending().any());

        let mut population = population;
        d.complete_binning(&mut population);
        assert_eq!(population.states(), &[Empty, Empty, Empty, Empty]);
    }

    #[test]
    fn reprobe_bin_required() {
        let (mut d, h) = scripted("model = \"delta-castle\"\nsite-count = 2");
        let population = pop(&[Populated, Populated]);
        let err = d
            .bin_and_reprobe(&population, Some(&[true, false]), &[1, 2])
            .unwrap_err();
        assert!(matches!(err, DriverError::Binning(ref m) if m.contains("reprobe")));
        assert!(h.sent().is_empty());
    }

    #[test]
    fn reprobe_bin_and_no_rebin_workaround() {
        let (mut d, h) = scripted("model = \"delta-summit\"\nsite-count = 3\nreprobe-mode = true\nreprobe-bin = 99");
        h.respond("BINON", "ECHO:99,--,--;");
        let population = pop(&[Populated, Populated, Empty]);
        assert_eq!(
            d.bin_and_reprobe(&population, Some(&[true, false, false]), &[1, 2, 3]),
            Ok(Progress::Done)
        );
        assert_eq!(h.commands()[0], "BINON:99,--,--;");
        assert_eq!(d.last_binned(), 0b001);
    }
}
