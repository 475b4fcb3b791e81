//! Controller runtime
//!
//! Wires the components together: opens the link, walks the PMC boot
//! sequence, binds the IPC socket, drops privileges, and supervises the
//! long-lived tasks. Owns the one shutdown path everything funnels into:
//! signals, thermal escalation, and IPC requests.

use crate::config::{Config, HookSpec};
use crate::events::{BayState, Event, EventRouter};
use crate::ipc::{IpcContext, IpcServer};
use crate::notify::{self, NotificationDispatcher};
use crate::pmc::{registers, PmcClient};
use crate::serial;
use crate::thermal::{FanGovernor, ShutdownRequest, TemperatureReader, ThermalStatus};
use anyhow::{Context as _, Result};
use nix::unistd::{Group, Uid, User};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::{self, Duration, Instant};
use tracing::{debug, error, info, warn};

/// Fan duty written on the way out, when nothing is left to govern it.
const SAFE_EXIT_FAN_DUTY: u8 = 30;

const BANNER_LINE1: &str = "WD NAS hardware";
const BOOT_LINE2: &str = "starting up";
const OFFLINE_LINE2: &str = "offline";

/// System poweroff, invoked on thermal or IPC-requested shutdown.
const POWEROFF_COMMAND: &str = "/sbin/shutdown";
const POWEROFF_ARGS: [&str; 2] = ["-P", "now"];

/// A task may be restarted this many times inside the window; one more
/// failure is terminal.
const MAX_RESTARTS: usize = 3;
const RESTART_WINDOW: Duration = Duration::from_secs(60);

static VERSION_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^WD (PMC|BBC) v\d+").expect("valid version regex"));

type TaskFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
type TaskFactory = Box<dyn Fn() -> TaskFuture + Send>;

struct Supervised {
    name: &'static str,
    /// Persistent failure of a vital task takes the daemon down.
    vital: bool,
    factory: TaskFactory,
    restarts: VecDeque<Instant>,
}

/// Run the daemon to completion. Returns the process exit code; errors are
/// fatal startup failures.
pub async fn run(config: Config) -> Result<i32> {
    let config = Arc::new(config);

    let (link_reader, link_writer) = serial::open(&config.pmc_port)
        .await
        .with_context(|| format!("failed to open PMC port {}", config.pmc_port.display()))?;
    let client = PmcClient::spawn(link_reader, link_writer);

    // PMC boot sequence. The version read is tolerant; everything else is
    // load-bearing and fatal.
    let version = match client.get_text(&registers::VER).await {
        Ok(version) => {
            if !VERSION_PATTERN.is_match(&version) {
                warn!("unexpected PMC version string: {:?}", version);
            }
            info!("PMC firmware: {}", version);
            Some(version)
        }
        Err(e) => {
            warn!("PMC version read failed: {}", e);
            None
        }
    };
    client
        .set_u8(&registers::IMR, 0xff)
        .await
        .context("failed to unmask PMC interrupts")?;
    let cfg = client
        .get_u8(&registers::CFG)
        .await
        .context("failed to read PMC config register")?;
    let sta = client
        .get_u8(&registers::STA)
        .await
        .context("failed to read power-up status")?;
    let dp0 = client
        .get_u8(&registers::DP0)
        .await
        .context("failed to read drive presence")?;
    let de0 = client
        .get_u8(&registers::DE0)
        .await
        .context("failed to read drive enable state")?;
    let backlight = client
        .get_u8(&registers::BKL)
        .await
        .context("failed to read LCD backlight")?;
    // Alert blink state survives daemon restarts on the PMC side; pick it
    // up rather than assuming LEDs are dark.
    let dlb = match client.get_u8(&registers::DLB).await {
        Ok(dlb) => dlb,
        Err(e) => {
            warn!("DLB read failed, assuming no blinking alert LEDs: {}", e);
            0
        }
    };
    debug!(
        "CFG=0x{:02x} STA=0x{:02x} DP0=0x{:02x} DE0=0x{:02x} DLB=0x{:02x} BKL={}%",
        cfg, sta, dp0, de0, dlb, backlight
    );

    for (reg, text) in [(&registers::LN1, BANNER_LINE1), (&registers::LN2, BOOT_LINE2)] {
        if let Err(e) = client.set_text(reg, text).await {
            warn!("boot banner write failed: {}", e);
        }
    }

    let bays = Arc::new(RwLock::new(BayState::from_registers(dp0, de0, dlb, sta)));
    let thermal = Arc::new(RwLock::new(ThermalStatus::default()));
    let chassis_bays = bays.read().await.chassis_bays;

    // Reconcile the firmware's auto-bay-power flag with configuration.
    // Only bit 0 of CFG is ours; the other bits are undocumented and are
    // written back exactly as read.
    let auto_power = config.auto_drive_power;
    if (cfg & 0x01 != 0) != auto_power {
        let updated = if auto_power { cfg | 0x01 } else { cfg & !0x01 };
        match client.set_u8(&registers::CFG, updated).await {
            Ok(()) => info!("CFG auto-bay-power set to {}", auto_power),
            Err(e) => warn!("CFG update failed: {}", e),
        }
    }
    info!(
        "{}-bay chassis, auto bay power {}",
        chassis_bays,
        if auto_power { "enabled" } else { "disabled" }
    );

    let mut devices: Vec<String> = (0..chassis_bays)
        .map(|bay| format!("/dev/sd{}", (b'a' + bay as u8) as char))
        .collect();
    devices.extend(config.additional_drives.iter().cloned());

    let (event_tx, event_rx) = mpsc::channel::<Event>(64);
    let event_rx = Arc::new(Mutex::new(event_rx));
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<ShutdownRequest>(16);
    let (lcd_tx, lcd_rx) = mpsc::channel::<()>(4);

    let ipc_ctx = Arc::new(IpcContext {
        client: client.clone(),
        thermal: Arc::clone(&thermal),
        bays: Arc::clone(&bays),
        shutdown_tx: shutdown_tx.clone(),
        shutdown_grace: config.shutdown_grace,
        version,
    });
    let ipc = IpcServer::bind(&config.socket_path, config.socket_max_clients, ipc_ctx)?;

    let pid_file = write_pid_file();
    drop_privileges(&config)?;

    let registry = Arc::new(config.hooks.clone());
    if event_tx.send(Event::SystemUp).await.is_err() {
        warn!("event channel closed at startup");
    }

    tokio::spawn(lcd_dimmer(
        client.clone(),
        lcd_rx,
        config.lcd_intensity_normal,
        config.lcd_intensity_dimmed,
        config.lcd_dim_timeout,
    ));

    // Supervised task set. Factories rebuild a task from shared handles so
    // a crashed task can be restarted with fresh state.
    let mut tasks: Vec<Supervised> = Vec::new();

    {
        let client = client.clone();
        let config = Arc::clone(&config);
        let thermal = Arc::clone(&thermal);
        let shutdown_tx = shutdown_tx.clone();
        let event_tx = event_tx.clone();
        tasks.push(Supervised {
            name: "temperature-reader",
            vital: true,
            restarts: VecDeque::new(),
            factory: Box::new(move || {
                let governor = FanGovernor::new(
                    client.clone(),
                    &config,
                    shutdown_tx.clone(),
                    event_tx.clone(),
                );
                let reader = TemperatureReader::new(
                    client.clone(),
                    governor,
                    Arc::clone(&thermal),
                    config.disk_temp_command.clone(),
                    devices.clone(),
                    config.poll_interval,
                    config.subprocess_timeout,
                );
                Box::pin(reader.run())
            }),
        });
    }

    {
        let client = client.clone();
        let event_tx = event_tx.clone();
        let lcd_tx = lcd_tx.clone();
        let bays = Arc::clone(&bays);
        let long_press = config.long_press_threshold;
        tasks.push(Supervised {
            name: "event-router",
            vital: true,
            restarts: VecDeque::new(),
            factory: Box::new(move || {
                let router = EventRouter::new(
                    client.clone(),
                    client.subscribe(),
                    event_tx.clone(),
                    lcd_tx.clone(),
                    Arc::clone(&bays),
                    long_press,
                    auto_power,
                );
                Box::pin(router.run())
            }),
        });
    }

    {
        let registry = Arc::clone(&registry);
        let event_rx = Arc::clone(&event_rx);
        let subprocess_timeout = config.subprocess_timeout;
        tasks.push(Supervised {
            name: "notification-dispatcher",
            vital: false,
            restarts: VecDeque::new(),
            factory: Box::new(move || {
                let dispatcher = NotificationDispatcher::new(
                    Arc::clone(&registry),
                    Arc::clone(&event_rx),
                    subprocess_timeout,
                );
                Box::pin(dispatcher.run())
            }),
        });
    }

    {
        let ipc = ipc.clone();
        tasks.push(Supervised {
            name: "ipc-server",
            vital: true,
            restarts: VecDeque::new(),
            factory: Box::new(move || Box::pin(ipc.clone().run())),
        });
    }

    let (death_tx, mut death_rx) = mpsc::channel::<(usize, Result<()>)>(8);
    for (idx, task) in tasks.iter().enumerate() {
        spawn_supervised(idx, (task.factory)(), death_tx.clone());
        info!("started {}", task.name);
    }

    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;

    // (deadline, cancellable)
    let mut pending_shutdown: Option<(Instant, bool)> = None;

    let exit_code = loop {
        let shutdown_at = pending_shutdown.map(|(at, _)| at);
        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received");
                break 0;
            }
            _ = sigint.recv() => {
                info!("SIGINT received");
                break 0;
            }
            Some(request) = shutdown_rx.recv() => {
                pending_shutdown = apply_shutdown_request(pending_shutdown, request);
            }
            Some((idx, result)) = death_rx.recv() => {
                if let Some(code) = handle_task_exit(&mut tasks, idx, result, &death_tx) {
                    break code;
                }
            }
            _ = maybe_sleep_until(shutdown_at) => {
                warn!("shutdown grace elapsed, powering the system off");
                power_off_system().await;
                break 0;
            }
        }
    };

    orderly_shutdown(&client, &registry, config.subprocess_timeout).await;
    cleanup_runtime_files(&config, pid_file.as_deref());
    Ok(exit_code)
}

/// Fold one escalation request into the pending-shutdown state.
fn apply_shutdown_request(
    pending: Option<(Instant, bool)>,
    request: ShutdownRequest,
) -> Option<(Instant, bool)> {
    match request {
        ShutdownRequest::Deferred { grace } => match pending {
            // An armed shutdown stays armed.
            Some(existing) => Some(existing),
            None => {
                warn!(
                    "shutdown armed with {} s grace",
                    grace.as_secs()
                );
                Some((Instant::now() + grace, true))
            }
        },
        ShutdownRequest::Cancel => match pending {
            Some((_, true)) => {
                info!("pending shutdown cancelled");
                None
            }
            other => other,
        },
        ShutdownRequest::Immediate => match pending {
            Some((_, false)) => pending,
            _ => {
                error!("immediate shutdown requested");
                Some((Instant::now(), false))
            }
        },
    }
}

async fn maybe_sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn spawn_supervised(idx: usize, fut: TaskFuture, death_tx: mpsc::Sender<(usize, Result<()>)>) {
    tokio::spawn(async move {
        let result = fut.await;
        let _ = death_tx.send((idx, result)).await;
    });
}

/// Restart a dead task inside its budget; `Some(code)` means give up.
fn handle_task_exit(
    tasks: &mut [Supervised],
    idx: usize,
    result: Result<()>,
    death_tx: &mpsc::Sender<(usize, Result<()>)>,
) -> Option<i32> {
    let task = &mut tasks[idx];
    match &result {
        Ok(()) => warn!("{} exited", task.name),
        Err(e) => error!("{} failed: {:#}", task.name, e),
    }

    let now = Instant::now();
    prune_restart_window(&mut task.restarts, now);
    if task.restarts.len() < MAX_RESTARTS {
        task.restarts.push_back(now);
        warn!(
            "restarting {} ({}/{} within {:?})",
            task.name,
            task.restarts.len(),
            MAX_RESTARTS,
            RESTART_WINDOW
        );
        spawn_supervised(idx, (task.factory)(), death_tx.clone());
        None
    } else if task.vital {
        error!("{} keeps failing, shutting down", task.name);
        Some(2)
    } else {
        error!("{} keeps failing, leaving it stopped", task.name);
        None
    }
}

fn prune_restart_window(restarts: &mut VecDeque<Instant>, now: Instant) {
    while restarts
        .front()
        .is_some_and(|at| now.duration_since(*at) > RESTART_WINDOW)
    {
        restarts.pop_front();
    }
}

/// Restore the backlight on button activity, dim it again after idling.
async fn lcd_dimmer(
    client: PmcClient,
    mut activity: mpsc::Receiver<()>,
    normal: u8,
    dimmed: u8,
    idle_timeout: Duration,
) {
    if idle_timeout.is_zero() {
        // Dimming disabled; keep the channel drained.
        while activity.recv().await.is_some() {}
        return;
    }

    loop {
        match time::timeout(idle_timeout, activity.recv()).await {
            Ok(Some(())) => {
                if let Err(e) = client.set_u8(&registers::BKL, normal).await {
                    warn!("backlight restore failed: {}", e);
                }
            }
            Ok(None) => return,
            Err(_) => {
                debug!("LCD idle, dimming backlight to {}%", dimmed);
                if let Err(e) = client.set_u8(&registers::BKL, dimmed).await {
                    warn!("backlight dim failed: {}", e);
                }
                // Stay dimmed until the next button press.
                match activity.recv().await {
                    Some(()) => {
                        if let Err(e) = client.set_u8(&registers::BKL, normal).await {
                            warn!("backlight restore failed: {}", e);
                        }
                    }
                    None => return,
                }
            }
        }
    }
}

async fn power_off_system() {
    match tokio::process::Command::new(POWEROFF_COMMAND)
        .args(POWEROFF_ARGS)
        .status()
        .await
    {
        Ok(status) if status.success() => info!("system shutdown initiated"),
        Ok(status) => error!("{} exited with {}", POWEROFF_COMMAND, status),
        Err(e) => error!("failed to run {}: {}", POWEROFF_COMMAND, e),
    }
}

/// Final writes to the PMC before the process exits: notify, offline
/// banner, safe fan duty. All best-effort.
async fn orderly_shutdown(
    client: &PmcClient,
    registry: &HashMap<String, HookSpec>,
    hook_timeout: Duration,
) {
    info!("shutting down");
    notify::dispatch_direct(registry, &Event::SystemDown, hook_timeout).await;

    for (reg, text) in [(&registers::LN1, BANNER_LINE1), (&registers::LN2, OFFLINE_LINE2)] {
        if let Err(e) = client.set_text(reg, text).await {
            warn!("offline banner write failed: {}", e);
        }
    }
    if let Err(e) = client.set_u8(&registers::FAN, SAFE_EXIT_FAN_DUTY).await {
        warn!("safe fan duty write failed: {}", e);
    }
}

/// Drop to the configured user and group. A daemon started unprivileged
/// carries on as-is; the UART and socket were opened earlier.
fn drop_privileges(config: &Config) -> Result<()> {
    if !Uid::effective().is_root() {
        debug!("not running as root, skipping privilege drop");
        return Ok(());
    }

    let user = User::from_name(&config.user)
        .context("user lookup failed")?
        .with_context(|| format!("user {:?} does not exist", config.user))?;
    let group = Group::from_name(&config.group)
        .context("group lookup failed")?
        .with_context(|| format!("group {:?} does not exist", config.group))?;

    nix::unistd::chown(&config.socket_path, Some(user.uid), Some(group.gid))
        .context("failed to chown IPC socket")?;

    nix::unistd::setgroups(&[group.gid]).context("failed to drop supplementary groups")?;
    nix::unistd::setgid(group.gid).context("failed to drop group privileges")?;
    nix::unistd::setuid(user.uid).context("failed to drop user privileges")?;

    info!("dropped privileges to {}:{}", config.user, config.group);
    Ok(())
}

/// PID file under the service manager's runtime directory, best-effort.
fn write_pid_file() -> Option<PathBuf> {
    let dir = Config::runtime_directory()?;
    let path = dir.join("wdhwd.pid");
    match std::fs::write(&path, format!("{}\n", std::process::id())) {
        Ok(()) => {
            debug!("wrote PID file {}", path.display());
            Some(path)
        }
        Err(e) => {
            warn!("failed to write PID file {}: {}", path.display(), e);
            None
        }
    }
}

fn cleanup_runtime_files(config: &Config, pid_file: Option<&Path>) {
    if let Some(path) = pid_file {
        let _ = std::fs::remove_file(path);
    }
    let _ = std::fs::remove_file(&config.socket_path);
}
