use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use rollcall_hw::{Camera, CaptureSettings};
use rollcall_ledger::Ledger;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

mod config;
mod display;
mod engine;
mod helper;

use config::Config;
use display::ConsoleSink;
use engine::{AttendanceEngine, EnrollRequest, LoopSummary};
use helper::HelperProcess;

#[derive(Parser)]
#[command(name = "rollcall", about = "Face-recognition attendance register")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List V4L2 capture devices
    Devices,
    #[command(flatten)]
    Ledger(LedgerCommand),
}

/// Commands that need the configuration and an open ledger.
#[derive(Subcommand)]
enum LedgerCommand {
    /// Enroll a new identity from a reference photo
    Enroll {
        #[arg(long)]
        id: String,
        /// Display name shown in reports
        #[arg(long)]
        name: String,
        /// Extra attribute, repeatable (e.g. --meta course=CS101)
        #[arg(long = "meta", value_parser = parse_meta)]
        meta: Vec<(String, String)>,
        #[arg(long)]
        image: PathBuf,
    },
    /// Replace the reference photo of an enrolled identity
    Reenroll {
        #[arg(long)]
        id: String,
        #[arg(long)]
        image: PathBuf,
    },
    /// List enrolled identities
    List,
    /// Show who was present on a date (default: today)
    Report {
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Show the attendance history of one identity
    History {
        #[arg(long)]
        id: String,
    },
    /// Mark an identity present by hand
    Mark {
        #[arg(long)]
        id: String,
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Run live recognition until interrupted
    Run,
}

fn parse_meta(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got {s:?}"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in {s:?}"));
    }
    Ok((key.to_string(), value.trim().to_string()))
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}

fn spawn_helper(config: &Config) -> Result<HelperProcess> {
    let command = config
        .extractor_command
        .as_deref()
        .context("extractor_command is not configured (set ROLLCALL_EXTRACTOR_COMMAND)")?;
    HelperProcess::spawn(command).context("failed to start extractor helper")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Devices => list_devices(),
        Commands::Ledger(command) => {
            let config = Config::load().context("failed to load configuration")?;
            let ledger = Arc::new(
                Ledger::open(&config.db_path)
                    .with_context(|| format!("failed to open ledger {}", config.db_path.display()))?,
            );
            execute(command, config, ledger).await?;
        }
    }

    Ok(())
}

fn list_devices() {
    let devices = Camera::list_devices();
    if devices.is_empty() {
        println!("No capture devices found");
    }
    for dev in devices {
        println!("{}\t{} ({}, {})", dev.path, dev.name, dev.driver, dev.bus);
    }
}

async fn execute(command: LedgerCommand, config: Config, ledger: Arc<Ledger>) -> Result<()> {
    match command {
        LedgerCommand::Enroll {
            id,
            name,
            meta,
            image,
        } => {
            let engine = AttendanceEngine::new(ledger, &config);
            let mut helper = spawn_helper(&config)?;
            engine.bootstrap(&mut helper)?;
            let request = EnrollRequest {
                id,
                display_name: name,
                metadata: meta.into_iter().collect::<BTreeMap<_, _>>(),
                reference_image: image,
            };
            let identity = engine.enroll(request, &mut helper)?;
            println!(
                "Enrolled {} ({}), reference image {}",
                identity.id,
                identity.display_name,
                identity.reference_image.display()
            );
        }
        LedgerCommand::Reenroll { id, image } => {
            let engine = AttendanceEngine::new(ledger, &config);
            let mut helper = spawn_helper(&config)?;
            engine.bootstrap(&mut helper)?;
            let identity = engine.reenroll(&id, &image, &mut helper)?;
            println!(
                "Re-enrolled {}, reference image {}",
                identity.id,
                identity.reference_image.display()
            );
        }
        LedgerCommand::List => {
            let identities = ledger.list_identities()?;
            if identities.is_empty() {
                println!("No identities enrolled");
            }
            for identity in identities {
                let meta: Vec<String> = identity
                    .metadata
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect();
                println!(
                    "{}\t{}\t{}\t{}",
                    identity.id,
                    identity.display_name,
                    identity.enrolled_at,
                    meta.join(",")
                );
            }
        }
        LedgerCommand::Report { date } => {
            let date = date.unwrap_or_else(today);
            let names: BTreeMap<String, String> = ledger
                .list_identities()?
                .into_iter()
                .map(|i| (i.id, i.display_name))
                .collect();
            let events = ledger.attendance_on(date)?;
            println!("Attendance for {date}: {} present", events.len());
            for event in events {
                let name = names.get(&event.identity_id).map_or("", String::as_str);
                println!(
                    "{}\t{}\t{}\t{}",
                    event.identity_id,
                    name,
                    event.status.as_str(),
                    event.recorded_at
                );
            }
        }
        LedgerCommand::History { id } => {
            if !ledger.contains(&id)? {
                anyhow::bail!("unknown identity: {id}");
            }
            let events = ledger.attendance_for(&id)?;
            println!("{id}: present on {} day(s)", events.len());
            for event in events {
                println!("{}\t{}", event.date, event.recorded_at);
            }
        }
        LedgerCommand::Mark { id, date } => {
            let date = date.unwrap_or_else(today);
            let outcome = ledger.record_presence(&id, date)?;
            if outcome.recorded {
                println!("{id} marked present on {date}");
            } else {
                println!("{id} already present on {date}");
            }
        }
        LedgerCommand::Run => {
            let summary = run(config, ledger).await?;
            println!(
                "Processed {} frame(s), {} face(s), {} new attendance record(s)",
                summary.frames, summary.faces, summary.recorded
            );
        }
    }

    Ok(())
}

/// Run the recognition loop on a blocking thread until Ctrl-C or the
/// camera stops delivering frames.
async fn run(config: Config, ledger: Arc<Ledger>) -> Result<LoopSummary> {
    let mut helper = spawn_helper(&config)?;
    let engine = AttendanceEngine::new(ledger, &config);
    let device = config.camera_device.clone();
    let settings = CaptureSettings {
        width: config.capture_width,
        height: config.capture_height,
        ..CaptureSettings::default()
    };
    let (stop_tx, stop_rx) = watch::channel(false);

    tracing::info!(device = %device, threshold = config.match_threshold, "rollcall starting");

    let mut worker = tokio::task::spawn_blocking(move || -> Result<LoopSummary> {
        engine.bootstrap(&mut helper)?;
        let camera = Camera::open_with(&device, settings)?;
        let mut stream = camera.stream()?;
        let mut sink = ConsoleSink;
        let summary = engine.run(&mut stream, &mut helper, &mut sink, &stop_rx)?;
        Ok(summary)
    });

    tokio::select! {
        joined = &mut worker => joined?,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("rollcall shutting down");
            let _ = stop_tx.send(true);
            worker.await?
        }
    }
}
