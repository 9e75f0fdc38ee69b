//! Parkgate - license plate recognition and parking slot allocation
//!
//! Camera workers detect and read plates, registered plates are allocated
//! to slots by a single allocator task, and the gate actuator is driven
//! over a serial link. An operator display shows the cameras and slots.
//!
//! Module structure:
//! - `domain/` - Core types (Plate, ParkingSlot, MatchEvent)
//! - `io/` - External interfaces (slot store, registry, vision, video, serial, display)
//! - `services/` - Pipeline (camera workers, allocator, gate, display scheduler)
//! - `infra/` - Infrastructure (Config, Metrics)

use anyhow::Context;
use clap::{Parser, Subcommand};
use parkgate::domain::types::CameraId;
use parkgate::infra::{Config, Metrics};
use parkgate::io::serial_gate::{open_gate_port, RESET_SETTLE};
use parkgate::io::terminal::{KeyboardInput, TerminalRenderer};
use parkgate::io::{HttpVision, ImageSequenceSource, JsonRegistry, JsonSlotStore, User, VideoSource};
use parkgate::services::{
    allocator_channel, create_gate_worker, DisplayScheduler, HeadlessRenderer, RecognitionSupervisor,
    ShutdownInput, SlotAllocator, WorkerContext,
};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

/// Log file used by the terminal display when none is configured
const DEFAULT_TUI_LOG_FILE: &str = "parkgate.log";

/// Parkgate - plate recognition parking gate
#[derive(Parser, Debug)]
#[command(name = "parkgate", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run recognition, allocation, and the operator display (default)
    Run {
        /// Log slot changes instead of drawing the terminal display
        #[arg(long)]
        headless: bool,
    },
    /// Add a vehicle owner to the registry
    Register {
        #[arg(long)]
        first_name: String,
        #[arg(long)]
        last_name: String,
        #[arg(long)]
        age: Option<u32>,
        #[arg(long)]
        plate: String,
    },
    /// List registered users
    Users,
    /// Print the slot table
    Slots,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let command = args.command.unwrap_or(Command::Run { headless: false });
    let config_path = args.config.unwrap_or_else(|| Config::default_config_path());
    let loaded = Config::from_file(&config_path);

    let tui = matches!(command, Command::Run { headless: false });
    let log_file = match &loaded {
        Ok(config) => config.log_file().map(PathBuf::from),
        Err(_) => None,
    };
    let log_file = log_file.or_else(|| tui.then(|| PathBuf::from(DEFAULT_TUI_LOG_FILE)));
    init_logging(log_file.as_ref())?;

    let config = loaded.unwrap_or_else(|e| {
        warn!(error = %format!("{e:#}"), "config_load_failed_using_defaults");
        Config::default()
    });

    match command {
        Command::Run { headless } => run(config, headless).await,
        Command::Register { first_name, last_name, age, plate } => {
            let registry = JsonRegistry::new(config.registry_file());
            let user = registry
                .register(User { first_name, last_name, age, plate_number: plate })
                .with_context(|| format!("Failed to register in {}", registry.path().display()))?;
            println!("registered {} {} ({})", user.first_name, user.last_name, user.plate_number);
            Ok(())
        }
        Command::Users => {
            let registry = JsonRegistry::new(config.registry_file());
            let users = registry
                .users()
                .with_context(|| format!("Failed to read {}", registry.path().display()))?;
            for user in &users {
                let age = user.age.map(|a| a.to_string()).unwrap_or_else(|| "-".to_string());
                println!("{:<12} {:<16} {:<16} {:>3}", user.plate_number, user.first_name, user.last_name, age);
            }
            println!("{} users", users.len());
            Ok(())
        }
        Command::Slots => {
            let slots = JsonSlotStore::read_table(config.slot_file())
                .with_context(|| format!("Failed to read {}", config.slot_file().display()))?;
            for slot in &slots {
                let plate = slot.plate().map(|p| p.as_str()).unwrap_or("-");
                println!("{:>4}  {:<9} {}", slot.slot_number, slot.status().as_str(), plate);
            }
            Ok(())
        }
    }
}

/// Structured logging, level via RUST_LOG (default INFO).
/// Logs go to `log_file` when set, otherwise stderr.
fn init_logging(log_file: Option<&PathBuf>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (writer, ansi) = match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            (BoxMakeWriter::new(Mutex::new(file)), false)
        }
        None => (BoxMakeWriter::new(std::io::stderr), true),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .with_ansi(ansi)
        .with_writer(writer)
        .init();
    Ok(())
}

/// Open one frame source per configured camera; unreadable ones are skipped
fn open_sources(config: &Config) -> Vec<(CameraId, Box<dyn VideoSource>)> {
    let mut sources: Vec<(CameraId, Box<dyn VideoSource>)> = Vec::new();
    for camera in config.cameras() {
        let id = CameraId(camera.id);
        match ImageSequenceSource::open(id, &camera.source) {
            Ok(source) => sources.push((id, Box::new(source))),
            Err(e) => error!(camera_id = %id, source = %camera.source, error = %e, "camera_open_failed"),
        }
    }
    sources
}

async fn run(config: Config, headless: bool) -> anyhow::Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        git_hash = env!("GIT_HASH"),
        config_file = %config.config_file(),
        site = %config.site_id(),
        max_slots = %config.max_slots(),
        cameras = ?config.camera_ids(),
        gate_device = %config.gate_device(),
        prometheus_port = %config.prometheus_port(),
        "parkgate_starting"
    );

    let metrics = Arc::new(Metrics::new());
    let shutdown = CancellationToken::new();

    // Slot table and gate link
    let store = JsonSlotStore::open(config.slot_file(), config.max_slots())
        .with_context(|| format!("Failed to open slot table {}", config.slot_file().display()))?;
    let link = match open_gate_port(config.gate_device(), config.gate_baud(), RESET_SETTLE).await {
        Ok(port) => Some(port),
        Err(e) => {
            warn!(device = %config.gate_device(), error = %e, "gate_disabled");
            None
        }
    };
    let (gate, gate_worker) = create_gate_worker(link, metrics.clone(), config.gate_queue_size());
    let gate_task = tokio::spawn(gate_worker.run());

    // Allocator actor
    let (allocator_handle, allocator_rx) = allocator_channel();
    let allocator = SlotAllocator::new(store, gate, config.max_slots(), metrics.clone());
    let table_rx = allocator.subscribe();
    let allocator_task = tokio::spawn(allocator.run(allocator_rx));

    // Camera workers
    let vision = Arc::new(HttpVision::new(&config).context("Failed to build vision client")?);
    let ctx = WorkerContext {
        detector: vision.clone(),
        reader: vision,
        registry: Arc::new(JsonRegistry::new(config.registry_file())),
        events: allocator_handle.event_sender(),
        metrics: metrics.clone(),
        min_score: config.min_score(),
    };
    let mut supervisor = RecognitionSupervisor::new();
    let sessions = supervisor.start(open_sources(&config), &ctx)?;
    drop(ctx);

    // Ctrl+C
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        signal_shutdown.cancel();
    });

    // Metrics reporter
    let reporter_metrics = metrics.clone();
    let reporter_shutdown = shutdown.clone();
    let metrics_interval = config.metrics_interval_secs();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => reporter_metrics.report().log(),
                _ = reporter_shutdown.cancelled() => break,
            }
        }
    });

    // Prometheus metrics HTTP server (if port > 0)
    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let prom_metrics = metrics.clone();
        let prom_site = config.site_id().to_string();
        let prom_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = parkgate::io::prometheus::start_metrics_server(
                prometheus_port,
                prom_metrics,
                prom_site,
                prom_shutdown,
            )
            .await
            {
                error!(error = %e, "prometheus_metrics_server_error");
            }
        });
    }

    // Display runs until every camera session is inactive
    let tick = Duration::from_millis(config.tick_ms());
    let refresh = Duration::from_secs(config.refresh_secs().max(1));
    if headless {
        let input = ShutdownInput::new(shutdown.clone());
        let renderer = match config.snapshot_dir() {
            Some(dir) => {
                info!(dir = %dir.display(), "frame_snapshots_enabled");
                HeadlessRenderer::with_snapshot_dir(dir)
            }
            None => HeadlessRenderer::default(),
        };
        let scheduler = DisplayScheduler::new(sessions, renderer, input, allocator_handle.clone(), table_rx);
        let renderer = scheduler.run(tick, refresh).await;
        info!(frames_seen = %renderer.frames_seen(), "headless_display_finished");
    } else {
        let renderer = TerminalRenderer::enter(config.site_id(), &config.camera_ids())
            .context("Failed to initialize terminal")?;
        let scheduler = DisplayScheduler::new(
            sessions,
            renderer,
            KeyboardInput::new(config.max_slots()),
            allocator_handle.clone(),
            table_rx,
        );
        drop(scheduler.run(tick, refresh).await);
    }

    // Teardown: workers, then allocator (drains queued events), then gate
    let exits = supervisor.stop().await;
    info!(cameras = %exits.len(), "camera_workers_joined");
    shutdown.cancel();
    drop(allocator_handle);
    if let Err(e) = allocator_task.await {
        error!(error = %e, "allocator_task_failed");
    }
    if let Err(e) = gate_task.await {
        error!(error = %e, "gate_worker_task_failed");
    }

    metrics.report().log();
    info!("parkgate shutdown complete");
    Ok(())
}
