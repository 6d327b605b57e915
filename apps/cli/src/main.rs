use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use fx3kit_core::driver::{Driver, DriverConfig};
use fx3kit_core::image::{ImageFormat, inspect};
use fx3kit_core::inventory::{Discovery, Inventory};
use fx3kit_core::options::{ConfigKey, ConfigValue, config_get, config_list, config_set};
use fx3kit_core::{ConnFilter, SUPPORTED_PROFILES};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "FX2/FX3 logic analyzer bring-up tool", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Driver configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Extra firmware directory, searched first (repeatable)
    #[arg(long = "firmware-dir", global = true)]
    firmware_dirs: Vec<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Find devices and upload firmware where needed
    Scan {
        /// Only this device: BUS.ADDRESS or VID.PID
        #[arg(long)]
        conn: Option<ConnFilter>,
    },
    /// Scan, then open a device and show its settings
    Open {
        #[arg(long)]
        conn: Option<ConnFilter>,

        /// Which scanned device to open
        #[arg(long, default_value_t = 0)]
        index: usize,

        /// Samplerate to select after opening, in Hz
        #[arg(long)]
        samplerate: Option<u64>,
    },
    /// Show the section table of a firmware image
    Inspect {
        file: PathBuf,

        /// Treat the file as a raw FX2 image
        #[arg(long)]
        fx2: bool,
    },
    /// Print supported models and config keys
    Info,
    /// Write the effective configuration to a TOML file
    SaveConfig { path: PathBuf },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    let mut config = match &args.config {
        Some(path) => DriverConfig::load_from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => DriverConfig::default(),
    };
    // Command line directories take precedence over the file.
    let mut firmware_dirs = args.firmware_dirs.clone();
    firmware_dirs.append(&mut config.firmware_dirs);
    config.firmware_dirs = firmware_dirs;

    if let Err(e) = run(args.command, config) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
    Ok(())
}

fn run(command: Command, config: DriverConfig) -> Result<()> {
    match command {
        Command::Scan { conn } => scan(config, conn),
        Command::Open {
            conn,
            index,
            samplerate,
        } => open(config, conn, index, samplerate),
        Command::Inspect { file, fx2 } => inspect_file(&file, fx2),
        Command::Info => {
            print_info();
            Ok(())
        }
        Command::SaveConfig { path } => {
            config.save_to_file(&path)?;
            info!("Wrote {}", path.display());
            Ok(())
        }
    }
}

fn scan(config: DriverConfig, conn: Option<ConnFilter>) -> Result<()> {
    let driver = Driver::new(config);
    let outcomes = driver.scan(conn);
    if outcomes.is_empty() {
        warn!("No supported devices found");
    }

    for outcome in &outcomes {
        match outcome {
            Discovery::Ready(r) => println!("{} {} on {}: ready", r.vendor, r.model, r.connection_id),
            Discovery::Uploaded(r) => println!(
                "{} {} on {}: firmware uploaded, renumerating",
                r.vendor, r.model, r.connection_id
            ),
            Discovery::UploadFailed { record, error } => println!(
                "{} {} on {}: upload failed: {}",
                record.vendor, record.model, record.connection_id, error
            ),
            Discovery::Skipped { candidate, reason } => {
                println!("{}: skipped ({})", candidate, reason)
            }
        }
    }
    Ok(())
}

fn open(
    config: DriverConfig,
    conn: Option<ConnFilter>,
    index: usize,
    samplerate: Option<u64>,
) -> Result<()> {
    let driver = Driver::new(config);
    let mut inventory = Inventory::new();
    inventory.absorb(driver.scan(conn));

    let found = inventory.len();
    let record = inventory
        .get_mut(index)
        .ok_or_else(|| anyhow!("no device #{} ({} found)", index, found))?;

    let device = driver.open(record)?;
    if let Some(rate) = samplerate {
        config_set(ConfigKey::Samplerate, &ConfigValue::U64(rate), record)?;
    }

    println!("{} {} ({})", record.vendor, record.model, record.status);
    for key in [
        ConfigKey::Conn,
        ConfigKey::Samplerate,
        ConfigKey::LimitSamples,
        ConfigKey::CaptureRatio,
    ] {
        match config_get(key, record) {
            Ok(value) => println!("  {:<14} {}", key, value),
            Err(e) => println!("  {:<14} <{}>", key, e),
        }
    }
    if let Ok(rates) = config_list(ConfigKey::Samplerate, Some(&*record)) {
        println!("  {:<14} {}", "samplerates", rates);
    }
    println!("  {:<14} {}", "channels", record.channels.len());

    driver.close(record, device)?;
    Ok(())
}

fn inspect_file(file: &Path, fx2: bool) -> Result<()> {
    let format = if fx2 {
        ImageFormat::Simple
    } else {
        ImageFormat::Segmented
    };
    let data = std::fs::read(file).with_context(|| format!("failed to read {}", file.display()))?;
    if data.len() > format.max_size() {
        warn!(
            "Image is {} bytes, the boot loader accepts at most {}",
            data.len(),
            format.max_size()
        );
    }

    let summary = inspect(&data, format)?;
    println!("{} ({} bytes)", file.display(), summary.len);
    for (i, (address, len)) in summary.segments.iter().enumerate() {
        println!("  [{:2}] 0x{:08X} {:>7} bytes", i, address, len);
    }
    println!("  payload: {} bytes", summary.payload_bytes());
    if let Some(stored) = summary.stored_checksum {
        let verdict = if summary.checksum_matches() == Some(true) { "ok" } else { "MISMATCH" };
        println!(
            "  checksum: stored 0x{:08X}, computed 0x{:08X} ({})",
            stored, summary.computed_checksum, verdict
        );
    }
    Ok(())
}

fn print_info() {
    println!("Supported models:");
    for profile in SUPPORTED_PROFILES {
        println!(
            "  {:04x}:{:04x} {:<28} firmware {}",
            profile.vendor_id,
            profile.product_id,
            profile.to_string(),
            profile.firmware
        );
    }
    for key in [ConfigKey::ScanOptions, ConfigKey::DeviceOptions, ConfigKey::TriggerMatch] {
        if let Ok(value) = config_list(key, None) {
            println!("{}: {}", key, value);
        }
    }
}
