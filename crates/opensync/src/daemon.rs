//! Daemon wiring.
//!
//! Sequencer → status channel → coordinator → pipeline drain → heartbeat
//! release. Everything shares one [`GpioBank`]; nothing here is global.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{error, info, warn};

use crate::config::{Config, GpioBackend};
use crate::coordinator::{CoordinatorPhase, ReleaseReport, ShutdownCoordinator};
use crate::error::{Error, Result};
use crate::gpio::{open_sysfs, GpioBank, GpioFacility, SimulatedGpio};
use crate::power::{probe_ups, Heartbeat, PowerLines, PowerSequencer, PowerStatus, UpsProbe};
use crate::status::StatusReport;
use crate::storage::Storage;
use crate::sync::{FileSyncPipeline, LogNamePattern, SpoolUplink, TransferGate};

/// How often the status file is rewritten when nothing changes.
const STATUS_REFRESH: Duration = Duration::from_secs(5);

/// How long a stopping sync pipeline may take to finish its current poll.
const PIPELINE_STOP: Duration = Duration::from_secs(2);

/// Exit code telling the service manager to power the host off.
pub const POWER_OFF_EXIT_CODE: u8 = 255;

/// How the daemon ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Stopped by a signal or because the power status feed ended.
    Stopped,
    /// The heartbeat was released.
    Released {
        /// What happened during the drain.
        report: ReleaseReport,
        /// Whether the host should power off now.
        power_off: bool,
    },
}

impl Disposition {
    /// Process exit code for this disposition.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Released {
                power_off: true, ..
            } => POWER_OFF_EXIT_CODE,
            _ => 0,
        }
    }
}

/// Open the configured GPIO facility.
///
/// Returns the simulator handle alongside when the simulated backend is in
/// use, so power events can be injected.
///
/// # Errors
///
/// Returns [`Error::GpioConfig`] if sysfs is requested but unavailable.
pub fn open_facility(
    config: &Config,
    simulate: bool,
) -> Result<(Arc<dyn GpioFacility>, Option<Arc<SimulatedGpio>>)> {
    if simulate || config.gpio.backend == GpioBackend::Simulated {
        let sim = Arc::new(SimulatedGpio::new());
        let facility: Arc<dyn GpioFacility> = sim.clone();
        return Ok((facility, Some(sim)));
    }
    Ok((open_sysfs(&config.gpio.sysfs_root)?, None))
}

/// Export and configure the lines on the blocking pool; sysfs export can
/// sleep while the kernel creates the pin directory.
async fn setup_lines(bank: Arc<GpioBank>, lines: PowerLines) -> Result<()> {
    tokio::task::spawn_blocking(move || lines.setup(&bank))
        .await
        .map_err(|e| Error::internal(format!("line setup task failed: {e}")))?
}

/// Open the ledger and outbox and build the sync pipeline.
///
/// # Errors
///
/// Returns an error for an invalid file pattern, or if the ledger or
/// outbox cannot be opened.
pub fn open_pipeline(config: &Config) -> Result<FileSyncPipeline> {
    let pattern = LogNamePattern::new(&config.sync.file_pattern)?;
    let ledger = Storage::open(config.database_path())?;
    let uplink = Arc::new(SpoolUplink::new(config.outbox_dir())?);
    Ok(
        FileSyncPipeline::new(config.watch_dir(), pattern, ledger, uplink)
            .with_poll_period(config.sync_poll_period())
            .with_force(config.sync.force),
    )
}

/// Let a closed pipeline finish its current poll, or abort it.
///
/// After an undrained release the transfer still in flight is aborted at
/// once so nothing writes to local storage while the UPS cuts power.
async fn stop_pipeline(mut task: JoinHandle<()>, drained: bool) {
    if !drained {
        task.abort();
        warn!("sync pipeline aborted with a transfer in flight");
        return;
    }
    if tokio::time::timeout(PIPELINE_STOP, &mut task).await.is_err() {
        task.abort();
        let e = Error::Timeout {
            operation: "sync pipeline stop".to_string(),
        };
        warn!(error = %e, "sync pipeline aborted");
    }
}

/// Result of `opensync probe`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeReport {
    /// GPIO backend used.
    pub backend: String,
    /// Sampled power-fault level.
    pub power_fault: bool,
    /// Sampled UPS-online level.
    pub ups_online: bool,
    /// Status computed from the two levels.
    pub status: PowerStatus,
    /// UPS battery probe, if enabled.
    pub ups: Option<UpsProbe>,
}

/// Configure the lines, sample them once and run the UPS probe.
///
/// # Errors
///
/// Returns an error if the lines cannot be configured or read.
pub async fn probe(config: &Config, simulate: bool) -> Result<ProbeReport> {
    let (facility, _sim) = open_facility(config, simulate)?;
    let bank = Arc::new(GpioBank::new(facility));
    let lines = PowerLines::from_config(&config.gpio);
    setup_lines(bank.clone(), lines).await?;

    let power_fault = bank.read(&lines.power_fault)?;
    let ups_online = bank.read(&lines.ups_online)?;
    let ups = match config.ups_probe_window() {
        Some(window) => Some(probe_ups(&bank, &lines, window).await?),
        None => None,
    };

    Ok(ProbeReport {
        backend: bank.backend().to_string(),
        power_fault,
        ups_online,
        status: PowerStatus::from_inputs(power_fault, ups_online),
        ups,
    })
}

/// Idempotent boot-time line configuration.
///
/// # Errors
///
/// Returns an error if the facility is unavailable or a line cannot be configured.
pub fn setup(config: &Config, simulate: bool) -> Result<()> {
    let (facility, _sim) = open_facility(config, simulate)?;
    let bank = GpioBank::new(facility);
    PowerLines::from_config(&config.gpio).setup(&bank)
}

/// The opensync daemon.
#[derive(Debug)]
pub struct Daemon {
    config: Config,
    bank: Arc<GpioBank>,
    simulator: Option<Arc<SimulatedGpio>>,
}

impl Daemon {
    /// Create a daemon on the configured backend.
    ///
    /// Simulated lines are used only when asked for, through `simulate` or
    /// `gpio.backend = "simulated"`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::GpioConfig`] if the sysfs facility is unavailable;
    /// the daemon never runs with unknown power state.
    pub fn new(config: Config, simulate: bool) -> Result<Self> {
        let (facility, simulator) = open_facility(&config, simulate)?;
        Ok(Self {
            bank: Arc::new(GpioBank::new(facility)),
            config,
            simulator,
        })
    }

    /// Create a daemon on an existing simulator.
    #[must_use]
    pub fn with_simulator(config: Config, sim: Arc<SimulatedGpio>) -> Self {
        Self {
            bank: Arc::new(GpioBank::new(sim.clone())),
            config,
            simulator: Some(sim),
        }
    }

    /// The simulator, if the daemon runs on simulated lines.
    #[must_use]
    pub fn simulator(&self) -> Option<&Arc<SimulatedGpio>> {
        self.simulator.as_ref()
    }

    /// Run until the heartbeat is released or SIGINT/SIGTERM arrives.
    ///
    /// # Errors
    ///
    /// See [`Daemon::run_until`].
    pub async fn run(self) -> Result<Disposition> {
        self.run_until(shutdown_signal()).await
    }

    /// Run until the heartbeat is released or `shutdown` resolves.
    ///
    /// # Errors
    ///
    /// Returns configuration errors from line setup, ledger or outbox
    /// errors, and fatal GPIO errors from the sequencer.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> Result<Disposition> {
        let config = &self.config;
        let lines = PowerLines::from_config(&config.gpio);
        setup_lines(self.bank.clone(), lines).await?;

        let ups = match config.ups_probe_window() {
            Some(window) => Some(probe_ups(&self.bank, &lines, window).await?),
            None => None,
        };

        let heartbeat = Heartbeat::new(self.bank.clone(), lines.host_alive);
        let (wake_tx, wake_rx) = mpsc::channel(8);
        let sequencer = PowerSequencer::new(
            self.bank.clone(),
            lines,
            heartbeat.clone(),
            config.poll_interval(),
            config.power.debounce_samples,
        )?
        .with_wakeups(wake_rx);
        let power = sequencer.subscribe();
        let sequencer_handle = sequencer.handle();
        let mut sequencer_task = tokio::spawn(sequencer.run());

        let (gate, pipeline_task) = if config.sync.enabled {
            let pipeline = open_pipeline(config)?;
            let gate = pipeline.gate();
            let task = tokio::spawn(async move {
                if let Err(e) = pipeline.run().await {
                    error!(error = %e, "sync pipeline failed");
                }
            });
            (gate, Some(task))
        } else {
            info!("sync pipeline disabled");
            (Arc::new(TransferGate::new()), None)
        };

        let coordinator = ShutdownCoordinator::new(
            gate.clone(),
            heartbeat.clone(),
            config.drain_deadline(),
            config.poll_interval(),
        );
        let phase = coordinator.subscribe();
        let mut coordinator_task = tokio::spawn(coordinator.run(power.clone()));

        let injector = self
            .simulator
            .clone()
            .map(|sim| tokio::spawn(inject_power_events(sim, lines, wake_tx)));

        let snapshot = StatusSnapshot {
            backend: self.bank.backend().to_string(),
            power,
            phase,
            heartbeat,
            gate: gate.clone(),
            ups,
        };
        let status_path = config.status_path();
        let status_task = tokio::spawn(publish_status(status_path.clone(), snapshot.clone()));

        info!(backend = self.bank.backend(), "opensync running");

        tokio::pin!(shutdown);
        let outcome = tokio::select! {
            joined = &mut coordinator_task => match joined {
                Ok(result) => result,
                Err(e) => Err(Error::internal(format!("shutdown coordinator task failed: {e}"))),
            },
            joined = &mut sequencer_task => match joined {
                Ok(Err(e)) => Err(e),
                Ok(Ok(())) => Err(Error::internal("power sequencer stopped unexpectedly")),
                Err(e) => Err(Error::internal(format!("power sequencer task failed: {e}"))),
            },
            () = &mut shutdown => {
                info!("shutdown requested");
                Ok(None)
            }
        };

        sequencer_handle.stop();
        status_task.abort();
        coordinator_task.abort();
        if let Some(injector) = injector {
            injector.abort();
        }
        gate.close();
        if let Some(task) = pipeline_task {
            let drained = match &outcome {
                Ok(Some(report)) => report.outcome.is_completed(),
                Ok(None) => true,
                Err(_) => false,
            };
            stop_pipeline(task, drained).await;
        }

        let release = outcome?;
        if let Err(e) = snapshot.capture(release.clone()).write(&status_path) {
            warn!(path = %status_path.display(), error = %e, "failed to write final status");
        }

        Ok(match release {
            Some(report) => Disposition::Released {
                report,
                power_off: config.daemon.enable_shutdown,
            },
            None => Disposition::Stopped,
        })
    }
}

/// Everything needed to produce a [`StatusReport`].
#[derive(Debug, Clone)]
struct StatusSnapshot {
    backend: String,
    power: watch::Receiver<PowerStatus>,
    phase: watch::Receiver<CoordinatorPhase>,
    heartbeat: Heartbeat,
    gate: Arc<TransferGate>,
    ups: Option<UpsProbe>,
}

impl StatusSnapshot {
    fn capture(&self, release: Option<ReleaseReport>) -> StatusReport {
        let phase = if release.is_some() {
            CoordinatorPhase::Released
        } else {
            *self.phase.borrow()
        };
        StatusReport {
            pid: std::process::id(),
            backend: self.backend.clone(),
            power: *self.power.borrow(),
            phase,
            heartbeat: self.heartbeat.output(),
            heartbeat_owner: self.heartbeat.owner(),
            ups: self.ups,
            in_flight: self.gate.in_flight(),
            release,
            updated_at: chrono::Utc::now(),
        }
    }
}

async fn publish_status(path: PathBuf, mut snapshot: StatusSnapshot) {
    let mut refresh = interval(STATUS_REFRESH);
    loop {
        tokio::select! {
            _ = refresh.tick() => {}
            changed = snapshot.power.changed() => if changed.is_err() { break },
            changed = snapshot.phase.changed() => if changed.is_err() { break },
        }
        if let Err(e) = snapshot.capture(None).write(&path) {
            warn!(path = %path.display(), error = %e, "failed to write status file");
        }
    }
}

#[cfg(unix)]
async fn inject_power_events(
    sim: Arc<SimulatedGpio>,
    lines: PowerLines,
    wake: mpsc::Sender<()>,
) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut usr1 = signal(SignalKind::user_defined1())?;
    let mut usr2 = signal(SignalKind::user_defined2())?;
    info!("simulated power events: SIGUSR1 toggles power-fault, SIGUSR2 toggles ups-online");

    loop {
        let line = tokio::select! {
            Some(()) = usr1.recv() => lines.power_fault,
            Some(()) = usr2.recv() => lines.ups_online,
            else => break,
        };
        let level = sim.toggle_input(line.pin);
        info!(line = line.name, level, "simulated input toggled");
        // A full channel already has a wake-up queued.
        let _ = wake.try_send(());
    }
    Ok(())
}

#[cfg(not(unix))]
async fn inject_power_events(
    _sim: Arc<SimulatedGpio>,
    _lines: PowerLines,
    _wake: mpsc::Sender<()>,
) -> Result<()> {
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
