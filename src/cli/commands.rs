use clap::ArgMatches;
use log::{error, info, warn};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

use super::DEFAULT_CONFIG_FILE;
use crate::calibration::events::{EngineEvent, EngineState};
use crate::calibration::model::{Channel, ChannelId, SensorType};
use crate::calibration::CalibrationEngine;
use crate::config::Config;
use crate::devices::scanner::{scan_ports, DetectedDevice};
use crate::devices::{
    Furnace, FurnaceSimulator, ModbusFurnace, ScpiThermometer, Thermometer, ThermometerSimulator,
};
use crate::output::{formatter_for, ConsoleFormatter, ConsoleSender, DataFormatter, DataSender, FileSender};
use crate::utils::error::CalibrationError;

const SIMULATOR_AMBIENT_C: f64 = 25.0;
const SIMULATOR_TIME_CONSTANT_S: f64 = 30.0;
const SCAN_TIMEOUT: Duration = Duration::from_millis(500);

/// Runs the selected subcommand. `Ok(false)` means it ran but did not succeed.
pub async fn handle_subcommands(matches: &ArgMatches) -> Result<bool, CalibrationError> {
    match matches.subcommand() {
        Some(("run", sub)) => {
            let config = load_config(sub)?;
            run_session(config, sub).await
        }
        Some(("check", sub)) => {
            let config = load_config(sub)?;
            print_plan(&config);
            Ok(true)
        }
        Some(("init-config", sub)) => {
            let path = config_path(sub).unwrap_or(DEFAULT_CONFIG_FILE);
            init_config(path, sub.get_flag("force"))
        }
        Some(("scan-ports", sub)) => scan(sub).await,
        _ => Ok(false),
    }
}

fn config_path(matches: &ArgMatches) -> Option<&str> {
    matches.get_one::<String>("config").map(String::as_str)
}

/// File (explicit, or `furnace_cal.toml` when present) then CLI overrides.
pub fn load_config(matches: &ArgMatches) -> Result<Config, CalibrationError> {
    let mut config = match config_path(matches) {
        Some(path) => Config::from_file(path)?,
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => Config::from_file(DEFAULT_CONFIG_FILE)?,
        None => {
            info!("📄 No configuration file, using defaults");
            Config::default()
        }
    };
    config.apply_matches(matches)?;
    config.validate()?;
    Ok(config)
}

/// Real serial devices, or a simulated furnace with a thermometer tracking it.
pub fn build_devices(config: &Config) -> (Arc<dyn Thermometer>, Arc<dyn Furnace>) {
    let channels = config.ordered_channels();
    let reference = channels
        .iter()
        .find(|c| c.id.is_reference())
        .cloned()
        .unwrap_or_else(|| Channel::new(ChannelId::reference(), SensorType::Pt100, None));

    if config.use_simulators {
        info!("🧪 Using simulated furnace and thermometer");
        let furnace = Arc::new(FurnaceSimulator::new(SIMULATOR_AMBIENT_C, SIMULATOR_TIME_CONSTANT_S));
        let mut simulator = ThermometerSimulator::tracking(furnace.clone(), reference);
        for (i, channel) in channels.iter().filter(|c| !c.id.is_reference()).enumerate() {
            simulator = simulator.with_offset(channel.id.clone(), 0.02 * (i as f64 + 1.0));
        }
        let thermometer: Arc<dyn Thermometer> = Arc::new(simulator);
        let furnace: Arc<dyn Furnace> = furnace;
        return (thermometer, furnace);
    }

    let thermometer: Arc<dyn Thermometer> = Arc::new(ScpiThermometer::new(
        &config.thermometer,
        reference,
        Arc::new(config.thermometer.serial.clone()),
    ));
    let furnace: Arc<dyn Furnace> =
        Arc::new(ModbusFurnace::new(&config.furnace, Arc::new(config.furnace.serial.clone())));
    (thermometer, furnace)
}

async fn run_session(config: Config, matches: &ArgMatches) -> Result<bool, CalibrationError> {
    let format = matches.get_one::<String>("format").map(String::as_str).unwrap_or("console");
    let formatter = formatter_for(format)
        .ok_or_else(|| CalibrationError::Configuration(format!("unknown output format '{}'", format)))?;
    info!("🎨 Using {} formatter", format);

    let mut senders: Vec<Box<dyn DataSender>> = vec![Box::new(ConsoleSender)];
    if let Some(output_file) = matches.get_one::<String>("output-file") {
        info!("📝 Adding file output: {}", output_file);
        senders.push(Box::new(FileSender::new(output_file, false)));
    }

    let (thermometer, furnace) = build_devices(&config);
    let engine = CalibrationEngine::new(thermometer, furnace);
    let mut events = engine.subscribe();
    let handle = engine.start(config)?;

    let progress = ConsoleFormatter;
    info!("{}", progress.format_header().trim_end());
    info!("🛑 Press Ctrl+C to abort, twice for an emergency stop");

    let mut interrupts = 0u32;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(EngineEvent::SessionFinished(_)) | Err(RecvError::Closed) => break,
                Ok(event) => {
                    if let Some(line) = progress.format_event(&event) {
                        info!("{}", line);
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!("⚠️ Skipped {} progress events", skipped),
            },
            Ok(()) = tokio::signal::ctrl_c() => {
                interrupts += 1;
                if interrupts == 1 {
                    warn!("🛑 Aborting calibration session...");
                    handle.abort();
                } else {
                    warn!("🛑 Emergency stop: switching furnace heating off");
                    handle.emergency_stop();
                }
            }
        }
    }

    let session = handle.wait().await?;
    let report = formatter.format_session(&session)?;
    for sender in &senders {
        if let Err(e) = sender.send(&report).await {
            error!("❌ {} output to {} failed: {}", sender.sender_type(), sender.destination(), e);
        }
    }

    Ok(session.state() == EngineState::SessionComplete)
}

fn print_plan(config: &Config) {
    println!("✅ Configuration is valid: {}", config.session_name);
    println!(
        "   🔌 Thermometer {} @ {} baud, furnace {} @ {} baud (slave {})",
        config.thermometer.serial.port,
        config.thermometer.serial.baud_rate,
        config.furnace.serial.port,
        config.furnace.serial.baud_rate,
        config.furnace.slave_id
    );
    if config.use_simulators {
        println!("   🧪 Simulators enabled");
    }
    for channel in config.ordered_channels() {
        let class = channel.declared_class.map_or("-".to_string(), |c| c.to_string());
        println!("   📡 {} {} (declared class {})", channel.id, channel.sensor, class);
    }
    for point in config.calibration_points() {
        println!(
            "   🌡️ Point {}: {:.2} °C ±{:.2}, dwell {:.0} s",
            point.index, point.target_c, point.tolerance_c, point.dwell_s
        );
    }
    println!(
        "   📊 {} repetitions every {} ms, stability band {} °C over {} readings",
        config.sampling.repetitions,
        config.sampling.inter_sample_delay_ms,
        config.stability.band_c,
        config.stability.window_size
    );
}

pub fn init_config(path: &str, force: bool) -> Result<bool, CalibrationError> {
    if Path::new(path).exists() && !force {
        return Err(CalibrationError::Configuration(format!(
            "{} already exists, use --force to overwrite",
            path
        )));
    }
    Config::default().save_to_file(path)?;
    println!("✅ Default configuration written to {}", path);
    Ok(true)
}

async fn scan(matches: &ArgMatches) -> Result<bool, CalibrationError> {
    let parse = |name: &str| -> Result<String, CalibrationError> {
        matches
            .get_one::<String>(name)
            .cloned()
            .ok_or_else(|| CalibrationError::Configuration(format!("missing --{}", name)))
    };
    let baud = parse("baud")?;
    let baud: u32 = baud
        .parse()
        .map_err(|_| CalibrationError::Configuration(format!("invalid baud rate '{}'", baud)))?;
    let slave = parse("slave")?;
    let slave: u8 = slave
        .parse()
        .map_err(|_| CalibrationError::Configuration(format!("invalid slave id '{}'", slave)))?;

    let probes = scan_ports(baud, SCAN_TIMEOUT, slave).await?;
    if probes.is_empty() {
        println!("❌ No serial ports found");
        return Ok(false);
    }
    for probe in &probes {
        match &probe.device {
            Some(DetectedDevice::Thermometer { identity }) => println!("🌡️ {}: thermometer ({})", probe.port, identity),
            Some(DetectedDevice::Furnace { slave_id }) => println!("🔥 {}: furnace (slave {})", probe.port, slave_id),
            None => println!("📵 {}: no response", probe.port),
        }
    }
    Ok(probes.iter().any(|p| p.device.is_some()))
}
