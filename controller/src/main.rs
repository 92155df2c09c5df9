//! Auto-Tester controller daemon
//!
//! Drives an external wet-chemistry analyzer over a single-master I2C bus:
//! periodic measurements on calendar recurrence rules, pump and parameter
//! calibrations, and flush operations, with every physical interaction
//! serialized through a persistent single-worker task queue. State lives in
//! a local SQLite store and the control surface is a small REST API.

// Use jemalloc as the global allocator for better performance
#[cfg(not(target_os = "windows"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

mod activity;
mod api;
mod bus;
mod config;
mod database;
mod device;
mod executor;
mod queue;
mod reconfigure;
mod recurrence;
#[cfg(test)]
mod tests;

use config::ControllerSettings;

/// Command-line arguments for the controller
#[derive(Parser, Debug)]
#[command(name = "controller")]
#[command(about = "Auto-tester controller that drives the analyzer and serves the REST API", long_about = None)]
struct CliArgs {
    /// Path to the controller settings file (controller.toml)
    #[arg(value_name = "CONFIG_FILE")]
    config_file: PathBuf,

    /// Override the listen address from the settings file
    #[arg(long = "listen-address", value_name = "ADDRESS")]
    listen_address: Option<String>,

    /// Override the data directory from the settings file
    #[arg(long = "data-dir", value_name = "DIR")]
    data_dir: Option<String>,

    /// Override the I2C device path from the settings file
    #[arg(long = "bus-device", value_name = "PATH")]
    bus_device: Option<String>,

    /// Drive an in-process simulated analyzer instead of the hardware bus
    #[arg(long = "simulate")]
    simulate: bool,
}

/// The main application structure for the controller daemon.
pub struct Controller {
    settings: ControllerSettings,
    /// The address the HTTP server listens on
    listen_address: SocketAddr,
    /// Store handle, kept for graceful close
    database: Option<Arc<Mutex<database::ControllerDatabase>>>,
    /// Schedule supervisor, cancelled on shutdown
    supervisor: Option<reconfigure::ScheduleSupervisor>,
    /// Handle to the queue worker task
    worker_handle: Option<JoinHandle<()>>,
    /// Handle to the WAL checkpoint task
    wal_checkpoint_task_handle: Option<JoinHandle<()>>,
    /// Shutdown signal sender for background tasks
    shutdown_tx: Option<tokio::sync::broadcast::Sender<()>>,
}

impl Controller {
    pub fn new(settings: ControllerSettings) -> Result<Self> {
        let listen_address = settings.socket_addr()?;
        Ok(Self {
            settings,
            listen_address,
            database: None,
            supervisor: None,
            worker_handle: None,
            wal_checkpoint_task_handle: None,
            shutdown_tx: None,
        })
    }

    /// Open the bus backend chosen by the settings.
    fn open_bus(&self) -> Result<bus::SharedBus> {
        if self.settings.simulate {
            info!("Simulate mode: driving the in-process analyzer");
            return Ok(bus::shared(bus::SimulatedAnalyzer::new()));
        }
        self.open_hardware_bus()
    }

    #[cfg(target_os = "linux")]
    fn open_hardware_bus(&self) -> Result<bus::SharedBus> {
        let hardware = bus::LinuxI2cBus::open(
            &self.settings.bus_device,
            shared::defaults::default_bus_addr(),
        )
        .with_context(|| format!("Failed to open bus device {}", self.settings.bus_device))?;
        info!("Opened bus device {}", self.settings.bus_device);
        Ok(bus::shared(hardware))
    }

    #[cfg(not(target_os = "linux"))]
    fn open_hardware_bus(&self) -> Result<bus::SharedBus> {
        anyhow::bail!("hardware bus access requires Linux; run with --simulate")
    }

    /// Starts the controller and runs until shutdown.
    pub async fn run(&mut self) -> Result<()> {
        info!("Starting auto-tester controller");

        // Initialize the store and load (or create) the analyzer config.
        let mut database = database::ControllerDatabase::new(
            &self.settings.data_dir,
            self.settings.database_busy_timeout_seconds,
        )
        .context("Failed to create store manager")?;
        database
            .initialize()
            .await
            .context("Failed to initialize store")?;
        let analyzer_config = database
            .load_config()
            .await
            .context("Failed to load analyzer configuration")?;

        let database = Arc::new(Mutex::new(database));
        self.database = Some(Arc::clone(&database));

        let bus = self.open_bus()?;
        let device = device::Device::new(
            bus,
            Duration::from_millis(self.settings.poll_interval_ms),
            Duration::from_secs(self.settings.poll_timeout_seconds),
        );
        let activity = activity::ActivityLog::new(self.settings.activity_log_capacity);
        let accounting = Arc::new(Mutex::new(()));
        let task_queue = queue::TaskQueue::new(Arc::clone(&database));
        let executor = executor::TaskExecutor::new(
            Arc::clone(&database),
            device.clone(),
            activity.clone(),
            Arc::clone(&accounting),
            Duration::from_millis(self.settings.settle_delay_ms),
        );

        // The single queue worker: every bus transaction for queued work
        // happens on this task. Tasks persisted before a restart are picked
        // up by the worker's first scan.
        let worker_queue = task_queue.clone();
        let worker = tokio::spawn(async move {
            worker_queue
                .run(move |task| {
                    let executor = executor.clone();
                    async move {
                        if let Err(e) = executor.execute(&task).await {
                            warn!(param = %task.param, "Task aborted: {:#}", e);
                        }
                    }
                })
                .await;
        });
        self.worker_handle = Some(worker);

        // Start the schedules the stored configuration asks for.
        let supervisor = reconfigure::ScheduleSupervisor::new(
            task_queue.clone(),
            Arc::clone(&database),
            activity.clone(),
        );
        supervisor.reconcile(&analyzer_config).await;
        self.supervisor = Some(supervisor.clone());

        // Create shutdown broadcast channel
        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx.clone());

        // Periodic WAL checkpoint keeps the journal bounded.
        let wal_interval = self.settings.wal_checkpoint_interval_seconds;
        let db_for_wal = Arc::clone(&database);
        let mut wal_shutdown_rx = shutdown_tx.subscribe();
        let wal_checkpoint_task = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(wal_interval));
            // The first tick fires immediately; skip it.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let mut db = db_for_wal.lock().await;
                        match db.checkpoint_wal().await {
                            Ok(frames) => {
                                info!("WAL checkpoint completed: {} frames checkpointed", frames);
                            }
                            Err(e) => {
                                warn!("WAL checkpoint failed: {}", e);
                            }
                        }
                    }
                    _ = wal_shutdown_rx.recv() => {
                        info!("WAL checkpoint task received shutdown signal");
                        break;
                    }
                }
            }
        });
        self.wal_checkpoint_task_handle = Some(wal_checkpoint_task);

        // Create application state with all dependencies
        let app_state = api::AppState {
            database: Arc::clone(&database),
            queue: task_queue,
            device,
            activity,
            supervisor,
            accounting,
        };
        let app = api::create_router(app_state);

        info!("Starting HTTP server on {}", self.listen_address);
        let listener = tokio::net::TcpListener::bind(self.listen_address)
            .await
            .with_context(|| {
                format!(
                    "Failed to bind TCP listener to {}. \
                     Check if port is already in use (EADDRINUSE) or requires elevated permissions (EACCES).",
                    self.listen_address
                )
            })?;

        // Start the axum server with graceful shutdown support
        let shutdown_signal = {
            let mut rx = shutdown_tx.subscribe();
            async move {
                let _ = rx.recv().await;
                info!("HTTP server received shutdown signal");
            }
        };
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

        Ok(())
    }

    /// Performs a graceful shutdown of the controller.
    ///
    /// Shutdown sequence:
    /// 1. Broadcast the shutdown signal to background tasks
    /// 2. Cancel every recurrence schedule
    /// 3. Stop the queue worker
    /// 4. Wait out the WAL checkpoint task (bounded)
    /// 5. Close the store
    pub async fn shutdown(&mut self) {
        info!("Shutting down auto-tester controller gracefully");

        if let Some(shutdown_tx) = &self.shutdown_tx {
            if let Err(e) = shutdown_tx.send(()) {
                warn!("Failed to send shutdown signal: {}", e);
            }
        }

        if let Some(supervisor) = self.supervisor.take() {
            supervisor.shutdown().await;
            info!("Schedules stopped");
        }

        // The worker loop has no exit of its own; it stops with the process.
        if let Some(handle) = self.worker_handle.take() {
            handle.abort();
            info!("Queue worker stopped");
        }

        if let Some(handle) = self.wal_checkpoint_task_handle.take() {
            let timeout = self.settings.graceful_shutdown_timeout_seconds;
            match tokio::time::timeout(std::time::Duration::from_secs(timeout), handle).await {
                Ok(Ok(())) => info!("WAL checkpoint task completed"),
                Ok(Err(e)) => warn!("WAL checkpoint task panicked: {}", e),
                Err(_) => warn!("WAL checkpoint task shutdown timeout reached, aborting"),
            }
        }

        if let Some(database) = &self.database {
            let mut db = database.lock().await;
            db.close().await;
            info!("Store closed");
        }

        info!("Controller shutdown complete");
    }
}

/// Sets up signal handlers for graceful shutdown.
/// Returns a future that completes when a shutdown signal is received.
async fn setup_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let sigterm = signal(SignalKind::terminate());
        let sigint = signal(SignalKind::interrupt());

        match (sigterm, sigint) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = sigint.recv() => info!("Received SIGINT"),
                }
            }
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to register signal handlers: {}", e);
                error!("Falling back to Ctrl+C only");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Failed to wait for Ctrl+C: {}", e);
                } else {
                    info!("Received Ctrl+C");
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to receive Ctrl+C signal: {}", e);
        } else {
            info!("Received Ctrl+C");
        }
    }
}

/// Controller entry point
///
/// Initializes logging, loads settings, creates the controller, and runs
/// until a shutdown signal is received.
#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging.
    let file_appender = tracing_appender::rolling::daily("./logs", "controller.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("controller=info,shared=info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .with_current_span(false)
        .with_span_list(false)
        .with_writer(non_blocking)
        .init();

    // Parse command-line arguments
    let cli_args = CliArgs::parse();

    info!("Auto-tester controller starting up");
    info!("Settings file: {}", cli_args.config_file.display());

    let mut settings = match ControllerSettings::load(&cli_args.config_file) {
        Ok(settings) => settings,
        Err(e) => {
            error!("Failed to load settings: {:#}", e);
            std::process::exit(1);
        }
    };

    // Apply command-line overrides if provided
    if let Some(listen_address) = cli_args.listen_address {
        info!("Listen address override provided via command line");
        settings.listen_address = listen_address;
    }
    if let Some(data_dir) = cli_args.data_dir {
        info!("Data directory override provided via command line");
        settings.data_dir = data_dir;
    }
    if let Some(bus_device) = cli_args.bus_device {
        info!("Bus device override provided via command line");
        settings.bus_device = bus_device;
    }
    if cli_args.simulate {
        info!("Simulate mode enabled via command line");
        settings.simulate = true;
    }
    if let Err(e) = settings.validate() {
        error!("Invalid settings after overrides: {:#}", e);
        std::process::exit(1);
    }

    // Create and run the controller. Exit if initialization fails.
    let mut controller = match Controller::new(settings) {
        Ok(controller) => controller,
        Err(e) => {
            error!("Failed to initialize controller: {:#}", e);
            std::process::exit(1);
        }
    };

    // Run the controller and the shutdown signal handler concurrently.
    tokio::select! {
        result = controller.run() => {
            if let Err(e) = result {
                error!("Controller error: {:#}", e);
                std::process::exit(1);
            }
        }
        _ = setup_shutdown_signal() => {
            info!("Shutdown signal received, initiating graceful shutdown");
        }
    }

    // Perform graceful shutdown.
    controller.shutdown().await;
    info!("Controller shutdown complete");
    Ok(())
}
