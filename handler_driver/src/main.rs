//! # Handler Driver Binary
//!
//! Runs a bounded series of test cycles against one handler: wait for
//! devices, bin them with generated results, release them, repeat until
//! the cycle limit or the end of the lot. Prints a JSON summary on exit.
//!
//! # Usage
//!
//! ```bash
//! # Dry run against the built-in simulator
//! handler_driver --model delta-castle --simulate --cycles 20
//!
//! # Serial handler
//! handler_driver --config /etc/handler/handler.toml --device /dev/ttyS0 --baud 9600
//!
//! # Verbose JSON logs
//! handler_driver -c handler.toml -s -v --json
//! ```

use clap::Parser;
use handler_common::config::{ConfigError, ConfigLoader, ConfigSource, LogLevel, SharedConfig, TomlConfig};
use handler_common::consts::{DEFAULT_CONFIG_PATH, MAX_BIN_RESUMES};
use handler_common::error::{DriverError, Progress};
use handler_common::transport::{Transport, TransportError};
use handler_driver::driver::HandlerDriver;
use handler_driver::journal::JournalStats;
use handler_driver::model_registry::ModelRegistry;
use handler_driver::population::SitePopulation;
use handler_driver::session::{KEY_MODEL, KEY_REPROBE_BIN, KEY_SITE_COUNT};
use handler_driver::transport::serial::SerialTransport;
use handler_driver::transport::simulator::{HandlerSimulator, SimulatorHandle, SimulatorStats};
use handler_driver::vendor::VendorProfile;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Test handler driver - runs test cycles against one handler
#[derive(Parser, Debug)]
#[command(name = "handler_driver")]
#[command(version)]
#[command(about = "Test handler protocol engine: device detection, binning and reprobe")]
#[command(long_about = None)]
struct Args {
    /// Configuration file with `[shared]` and `[handler]` tables
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Handler model, overrides the configured one
    #[arg(short, long)]
    model: Option<String>,

    /// Run against the built-in handler simulator
    #[arg(short = 's', long)]
    simulate: bool,

    /// Serial device of the handler
    #[arg(short, long, value_name = "PATH")]
    device: Option<PathBuf>,

    /// Serial baud rate
    #[arg(long, default_value_t = 9600)]
    baud: u32,

    /// Number of test cycles (0 = until the lot ends)
    #[arg(long, default_value_t = 10)]
    cycles: u32,

    /// Devices in the simulated lot
    #[arg(long, default_value_t = 100)]
    lot_size: u32,

    /// List the supported models and exit
    #[arg(long)]
    list_models: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format
    #[arg(long)]
    json: bool,
}

/// Configuration file layout; `[handler]` is read through [`TomlConfig`].
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    #[serde(default)]
    shared: SharedConfig,
}

/// Printed on exit.
#[derive(Debug, Serialize)]
struct RunSummary {
    service: String,
    model: &'static str,
    transport: &'static str,
    cycles: u32,
    devices: u32,
    lot_end: bool,
    bins: BTreeMap<u32, u32>,
    journal: JournalStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    simulator: Option<SimulatorStats>,
}

fn main() {
    if let Err(e) = run() {
        error!("Handler driver failed: {}", e);
        eprintln!("handler_driver: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let registry = ModelRegistry::builtin();

    if args.list_models {
        for name in registry.list_models() {
            println!("{name}");
        }
        return Ok(());
    }

    let (shared, mut config) = load_config(&args)?;
    shared.validate()?;
    setup_tracing(&args, shared.log_level);
    info!("Handler driver v{} starting...", env!("CARGO_PKG_VERSION"));

    if let Some(model) = &args.model {
        config.set(KEY_MODEL, toml::Value::String(model.clone()));
    }
    let model = config
        .get_str(KEY_MODEL)
        .ok_or_else(|| DriverError::Config(format!("{KEY_MODEL} is required (use --model)")))?;
    let profile = registry.lookup(&model)?;
    if config.get_num(KEY_SITE_COUNT).is_none() {
        let sites = profile.max_sites.min(4);
        warn!(sites, "site-count not configured, using default");
        config.set(KEY_SITE_COUNT, toml::Value::Integer(sites as i64));
    }

    let (transport, simulator) = open_transport(&args, &config, profile)?;
    let mut driver = HandlerDriver::from_config(&registry, &config, transport)?;

    let abort = driver.abort_flag();
    ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        abort.store(true, std::sync::atomic::Ordering::SeqCst);
    })?;

    driver.reconfigure(&config)?;

    let mut summary = RunSummary {
        service: shared.service_name.clone(),
        model: profile.name,
        transport: if simulator.is_some() { "simulator" } else { "serial" },
        cycles: 0,
        devices: 0,
        lot_end: false,
        bins: BTreeMap::new(),
        journal: JournalStats::default(),
        simulator: None,
    };

    match run_cycles(&mut driver, args.cycles, &mut summary) {
        Ok(()) | Err(DriverError::Aborted) => {}
        Err(e) => error!("Test cycle failed: {}", e),
    }

    driver.clear_abort();
    match driver.query_status(false) {
        Ok(_) | Err(DriverError::Unsupported(_)) => {}
        Err(e) => warn!("Final status query failed: {}", e),
    }

    summary.journal = driver.journal_stats();
    summary.simulator = simulator.map(|h| h.stats());
    println!("{}", serde_json::to_string_pretty(&summary)?);
    info!("Handler driver shutdown complete");
    Ok(())
}

/// Read the configuration file. A missing file is tolerated in simulation
/// mode, where everything can come from the command line.
fn load_config(args: &Args) -> Result<(SharedConfig, TomlConfig), ConfigError> {
    match (FileConfig::load(&args.config), TomlConfig::load(&args.config)) {
        (Ok(file), Ok(config)) => Ok((file.shared, config)),
        (Err(ConfigError::FileNotFound), _) if args.simulate => {
            Ok((SharedConfig::default(), TomlConfig::default()))
        }
        (Err(e), _) | (_, Err(e)) => Err(e),
    }
}

fn open_transport(
    args: &Args,
    config: &TomlConfig,
    profile: &'static VendorProfile,
) -> Result<(Box<dyn Transport>, Option<SimulatorHandle>), Box<dyn std::error::Error>> {
    if args.simulate {
        let sites = config.get_num(KEY_SITE_COUNT).unwrap_or(1.0) as usize;
        let mut sim = HandlerSimulator::new(profile, sites, args.lot_size);
        if let Some(bin) = config.get_num(KEY_REPROBE_BIN) {
            sim = sim.with_reprobe_bin(bin as u32);
        }
        let handle = sim.handle();
        info!(model = profile.name, sites, lot = args.lot_size, "Simulation mode enabled");
        return Ok((Box::new(sim), Some(handle)));
    }
    match &args.device {
        Some(device) => Ok((Box::new(SerialTransport::open(device, args.baud)?), None)),
        None => Err("no transport: pass --device for a serial handler or --simulate".into()),
    }
}

/// Bin codes for one cycle: a rotating pattern inside the model's range
/// that never hits the reprobe bin.
fn cycle_bins(driver: &HandlerDriver, cycle: u32) -> Vec<u32> {
    let range = driver.profile().bin_range;
    let reprobe = driver.session().settings().reprobe_bin;
    let span = (range.max - range.min + 1).min(8);
    (0..driver.session().site_count() as u32)
        .map(|site| {
            let bin = range.min + (cycle + site) % span;
            if Some(bin) == reprobe {
                if bin == range.max { range.min } else { bin + 1 }
            } else {
                bin
            }
        })
        .collect()
}

fn run_cycles(driver: &mut HandlerDriver, cycles: u32, summary: &mut RunSummary) -> Result<(), DriverError> {
    while cycles == 0 || summary.cycles < cycles {
        if driver.wait_for_parts()? == Progress::Waiting {
            if driver.take_lot_start() {
                info!("Lot started");
            }
            if driver.take_lot_end() {
                info!(cycles = summary.cycles, devices = summary.devices, "Lot finished");
                summary.lot_end = true;
                return Ok(());
            }
            continue;
        }

        let mut population = driver.current_population();
        let bins = cycle_bins(driver, summary.cycles);
        bin_until_done(driver, &population, &bins)?;

        let binned = driver.last_binned();
        driver.complete_binning(&mut population);
        for (site, bin) in bins.iter().enumerate() {
            if binned & (1u64 << site) != 0 {
                *summary.bins.entry(*bin).or_default() += 1;
                summary.devices += 1;
            }
        }
        summary.cycles += 1;
        info!(cycle = summary.cycles, binned = format_args!("{binned:#x}"), "Test cycle complete");
    }
    Ok(())
}

/// Resume a waiting bin exchange until it completes. A handler that stays
/// silent for `MAX_BIN_RESUMES` calls fails the cycle.
fn bin_until_done(driver: &mut HandlerDriver, population: &SitePopulation, bins: &[u32]) -> Result<(), DriverError> {
    for _ in 0..MAX_BIN_RESUMES {
        if driver.bin_and_reprobe(population, None, bins)? == Progress::Done {
            return Ok(());
        }
    }
    error!(resumes = MAX_BIN_RESUMES, "Handler never completed the bin exchange");
    Err(DriverError::Transport(TransportError::Timeout))
}

/// Setup tracing subscriber based on CLI arguments and the configured level.
fn setup_tracing(args: &Args, level: LogLevel) {
    let level = if args.verbose { LogLevel::Debug } else { level };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_directive()));

    if args.json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use handler_driver::population::SiteState;
    use handler_driver::transport::scripted::{ScriptHandle, ScriptedTransport};

    fn castle(extra: &str) -> (HandlerDriver, ScriptHandle) {
        let transport = ScriptedTransport::new();
        let handle = transport.handle();
        let config = TomlConfig::from_toml_str(&format!("model = \"delta-castle\"\nsite-count = 2\n{extra}")).unwrap();
        let driver = HandlerDriver::from_config(&ModelRegistry::builtin(), &config, Box::new(transport)).unwrap();
        (driver, handle)
    }

    #[test]
    fn silent_handler_bounds_bin_resumes() {
        let (mut driver, h) = castle("");
        let population = SitePopulation::from_states(&[SiteState::Populated; 2]);
        let err = bin_until_done(&mut driver, &population, &[1, 2]).unwrap_err();
        assert_eq!(err, DriverError::Transport(TransportError::Timeout));
        assert_eq!(h.count("BINON"), 1);
    }

    #[test]
    fn late_echo_completes_binning() {
        let (mut driver, h) = castle("");
        let population = SitePopulation::from_states(&[SiteState::Populated; 2]);
        assert_eq!(driver.bin_and_reprobe(&population, None, &[1, 2]), Ok(Progress::Waiting));
        h.push_reply("ECHO:01,02;");
        assert_eq!(bin_until_done(&mut driver, &population, &[1, 2]), Ok(()));
        assert_eq!(driver.last_binned(), 0b11);
    }

    #[test]
    fn cycle_bins_avoid_reprobe_bin() {
        let (driver, _h) = castle("reprobe-bin = 1");
        assert_eq!(cycle_bins(&driver, 0), vec![0, 2]);
        assert_eq!(cycle_bins(&driver, 7), vec![7, 0]);
    }
}
