//! End-to-end driver scenarios.
//!
//! Scripted scenarios pin exact wire traffic for the core behaviours
//! (direct interrupt population, polling timeout, bin validation, echo
//! retry). Simulator runs drive complete lots through every built-in model.

use handler_common::config::{ConfigSource, TomlConfig};
use handler_common::error::{DriverError, Progress};
use handler_driver::binning::compose;
use handler_driver::driver::HandlerDriver;
use handler_driver::model_registry::ModelRegistry;
use handler_driver::population::{SitePopulation, SiteState};
use handler_driver::transport::scripted::{ScriptHandle, ScriptedTransport};
use handler_driver::transport::simulator::{HandlerSimulator, SimulatorHandle};
use handler_driver::vendor::{EchoMode, SrqEvent, Workarounds, builtin_profiles};

/// Driver over a scripted transport.
fn scripted(config: &str) -> (HandlerDriver, ScriptHandle) {
    let transport = ScriptedTransport::new();
    let handle = transport.handle();
    let config = TomlConfig::from_toml_str(config).unwrap();
    let driver = HandlerDriver::from_config(&ModelRegistry::builtin(), &config, Box::new(transport)).unwrap();
    (driver, handle)
}

/// Driver over a simulator serving a lot of `lot` devices, already set up.
fn simulated(config: &str, lot: u32) -> (HandlerDriver, SimulatorHandle) {
    let config = TomlConfig::from_toml_str(config).unwrap();
    let registry = ModelRegistry::builtin();
    let profile = registry.lookup(&config.get_str("model").unwrap()).unwrap();
    let sites = config.get_num("site-count").unwrap() as usize;
    let mut sim = HandlerSimulator::new(profile, sites, lot);
    if let Some(bin) = config.get_num("reprobe-bin") {
        sim = sim.with_reprobe_bin(bin as u32);
    }
    let handle = sim.handle();
    let mut driver = HandlerDriver::from_config(&registry, &config, Box::new(sim)).unwrap();
    driver.reconfigure(&config).unwrap();
    (driver, handle)
}

/// Wait for devices and bin every one to its site number. Returns `false`
/// if the wait reported nothing.
fn test_cycle(driver: &mut HandlerDriver) -> bool {
    if driver.wait_for_parts().unwrap() == Progress::Waiting {
        return false;
    }
    let mut population = driver.current_population();
    let bins: Vec<u32> = (1..=population.len() as u32).collect();
    while driver.bin_and_reprobe(&population, None, &bins).unwrap() == Progress::Waiting {}
    driver.complete_binning(&mut population);
    assert!(population.states().iter().all(|s| !s.holds_device()));
    true
}

// ─── Scripted scenarios ─────────────────────────────────────────────

#[test]
fn interrupt_population_used_directly() {
    let (mut d, h) = scripted("model = \"delta-castle\"\nsite-count = 4\npolling-mode = \"interrupt\"");
    h.push_interrupt(0x0F);
    assert_eq!(d.wait_for_parts(), Ok(Progress::Done));
    assert_eq!(d.session().pending().as_slice(), &[true, true, true, true]);
    assert!(d.session().pending().any());
    assert!(h.sent().is_empty());
}

#[test]
fn strict_polling_without_devices_times_out() {
    let (mut d, h) = scripted(
        "model = \"delta-castle\"\nsite-count = 4\npolling-mode = \"polling\"\n\
         polling-interval-us = 2000\nheartbeat-timeout-us = 20000",
    );
    h.respond("TESTPARTSREADY?", "0");
    assert_eq!(d.wait_for_parts(), Ok(Progress::Waiting));
    assert!(!d.session().pending().any());
    assert!(h.count("TESTPARTSREADY?") >= 2);
    assert!(!d.has_pending_operation());
}

#[test]
fn out_of_range_bin_aborts_before_sending() {
    let (mut d, h) = scripted("model = \"rasco-so1000\"\nsite-count = 4");
    let population = SitePopulation::from_states(&[SiteState::Populated; 4]);
    let err = d.bin_and_reprobe(&population, None, &[1, 999, 3, 4]).unwrap_err();
    assert!(matches!(err, DriverError::Binning(_)));
    assert!(h.sent().is_empty());
}

#[test]
fn bin_range_enforced_for_every_model() {
    for profile in builtin_profiles() {
        let (mut d, h) = scripted(&format!("model = \"{}\"\nsite-count = 1", profile.name));
        let population = SitePopulation::from_states(&[SiteState::Populated]);
        let max = profile.bin_range.max;

        let err = d.bin_and_reprobe(&population, None, &[max + 1]).unwrap_err();
        assert!(matches!(err, DriverError::Binning(_)), "{}", profile.name);
        assert!(h.sent().is_empty(), "{}", profile.name);

        let commands = compose(profile.bin_layout(Workarounds::empty()), &[Some(max)]);
        assert!(!commands.is_empty() && commands.iter().all(|c| !c.is_empty()), "{}", profile.name);
        assert!(d.bin_and_reprobe(&population, None, &[max]).is_ok(), "{}", profile.name);
        assert!(!h.sent().is_empty(), "{}", profile.name);
    }
}

#[test]
fn echo_verified_on_second_attempt() {
    let (mut d, h) = scripted(
        "model = \"seiko-ns6040\"\nsite-count = 4\nverify-bins = true\nverify-max-retries = 1",
    );
    h.respond("BINON", "ECHO: 01,02,03,04;");
    h.respond_once("BINON", "ECHO: 01,02,03,05;");
    let population = SitePopulation::from_states(&[SiteState::Populated; 4]);
    assert_eq!(d.bin_and_reprobe(&population, None, &[1, 2, 3, 4]), Ok(Progress::Done));
    assert_eq!(h.count("BINON"), 2);
    assert_eq!(h.count("ECHONG"), 1);
    assert_eq!(h.count("ECHOOK"), 1);
}

#[test]
fn abort_stops_next_operation() {
    let (mut d, h) = scripted("model = \"delta-castle\"\nsite-count = 2");
    let flag = d.abort_flag();
    flag.store(true, std::sync::atomic::Ordering::SeqCst);
    let population = SitePopulation::from_states(&[SiteState::Populated; 2]);
    assert_eq!(d.bin_and_reprobe(&population, None, &[1, 2]), Err(DriverError::Aborted));
    assert!(h.sent().is_empty());
}

// ─── Simulated lots ─────────────────────────────────────────────────

#[test]
fn castle_lot_runs_to_lot_end() {
    let (mut d, sim) = simulated("model = \"delta-castle\"\nsite-count = 4", 10);
    let mut cycles = 0;
    for _ in 0..20 {
        if test_cycle(&mut d) {
            cycles += 1;
        } else if d.take_lot_end() {
            break;
        }
    }
    assert_eq!(cycles, 3);
    let stats = sim.stats();
    assert_eq!(stats.delivered, 10);
    assert_eq!(stats.bins.values().sum::<u32>(), 10);
    assert_eq!(stats.bins.get(&1), Some(&3));
    assert_eq!(stats.bins.get(&4), Some(&2));
    assert!(d.session().identity().unwrap().matched);
}

#[test]
fn lot_start_is_reported_once() {
    let (mut d, _sim) = simulated("model = \"seiko-ns6040\"\nsite-count = 2", 4);
    assert_eq!(d.wait_for_parts(), Ok(Progress::Waiting));
    assert!(d.take_lot_start());
    assert_eq!(d.wait_for_parts(), Ok(Progress::Done));
    assert!(!d.take_lot_start());
}

#[test]
fn corrupted_echo_is_retried_against_simulator() {
    let (mut d, sim) = simulated("model = \"delta-castle\"\nsite-count = 2\nverify-bins = true", 2);
    while d.wait_for_parts().unwrap() == Progress::Waiting {}
    let population = d.current_population();
    sim.corrupt_next_echo();
    assert_eq!(d.bin_and_reprobe(&population, None, &[3, 4]), Ok(Progress::Done));
    let stats = sim.stats();
    assert_eq!(stats.rejected, 1);
    assert_eq!(stats.bins.values().sum::<u32>(), 2);
}

#[test]
fn reprobe_against_simulator() {
    let (mut d, sim) = simulated(
        "model = \"delta-castle\"\nsite-count = 2\nreprobe-mode = true\nreprobe-bin = 15",
        2,
    );
    while d.wait_for_parts().unwrap() == Progress::Waiting {}
    let mut population = d.current_population();
    assert_eq!(population.device_mask(), 0b11);

    while d.reprobe(&mut population, &[true, false], &[0, 3]).unwrap() == Progress::Waiting {}
    assert_eq!(population.states(), &[SiteState::Populated, SiteState::Empty]);
    assert_eq!(sim.stats().reprobed, 1);

    assert_eq!(d.bin_and_reprobe(&population, None, &[2, 0]), Ok(Progress::Done));
    d.complete_binning(&mut population);
    assert_eq!(population.device_mask(), 0);
    assert_eq!(sim.loaded(), 0);
}

#[test]
fn injected_alarm_is_drained() {
    let (mut d, sim) = simulated("model = \"advantest-m48\"\nsite-count = 2", 2);
    assert!(sim.inject(SrqEvent::ALARM));
    assert_eq!(d.wait_for_parts(), Ok(Progress::Waiting));
    assert_eq!(d.session().last_interrupt(), Some(0x48));
    assert!(!d.take_lot_end());
}

#[test]
fn pause_shows_in_status() {
    let (mut d, _sim) = simulated("model = \"techwing-tw3xx\"\nsite-count = 2", 2);
    d.pause().unwrap();
    assert_eq!(d.query_status(false), Ok(Progress::Done));
    assert!(d.stopped());
    assert!(!d.handler_ready());
    d.resume().unwrap();
    d.query_status(false).unwrap();
    assert!(!d.stopped());
}

#[test]
fn every_builtin_model_completes_a_lot() {
    for profile in builtin_profiles() {
        let sites = profile.max_sites.min(4);
        let verify = !matches!(profile.binning.echo, EchoMode::None);
        let config = format!(
            "model = \"{}\"\nsite-count = {sites}\nverify-bins = {verify}\n\
             polling-interval-us = 1000\nheartbeat-timeout-us = 100000",
            profile.name
        );
        let lot = 2 * sites as u32;
        let (mut d, sim) = simulated(&config, lot);

        let mut cycles = 0;
        for _ in 0..10 {
            if cycles == 2 {
                break;
            }
            if test_cycle(&mut d) {
                cycles += 1;
            }
        }
        assert_eq!(cycles, 2, "{}", profile.name);
        let stats = sim.stats();
        assert_eq!(stats.delivered, lot, "{}", profile.name);
        assert_eq!(stats.bins.values().sum::<u32>(), lot, "{}", profile.name);
        assert_eq!(stats.rejected, 0, "{}", profile.name);

        if profile.interrupts {
            let mut lot_end = false;
            for _ in 0..3 {
                assert_eq!(d.wait_for_parts(), Ok(Progress::Waiting), "{}", profile.name);
                if d.take_lot_end() {
                    lot_end = true;
                    break;
                }
            }
            assert!(lot_end, "{}", profile.name);
        }
        if profile.status.is_some() {
            assert_eq!(d.query_status(false), Ok(Progress::Done), "{}", profile.name);
            assert!(d.handler_ready(), "{}", profile.name);
        }
    }
}
