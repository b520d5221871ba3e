//! INDI server supervision
//!
//! [`IndiServer`] owns the `indiserver` process and the set of drivers it
//! was told to run. Drivers are started and stopped by writing commands to
//! the server's control FIFO; the server never acknowledges them, so the
//! running set records what was requested, not what the OS reports.

use crate::config::ServerConfig;
use crate::driver::DriverDescriptor;
use crate::error::{ServerError, ServerResult};
use crate::fifo::{CommandSink, FifoChannel};
use crate::procscan::{self, ProcFsTable, ProcessTable};
use crate::runner::ProcessRunner;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// How long `stop` waits for killed servers to leave the process table
const KILL_SETTLE_TIMEOUT: Duration = Duration::from_secs(2);
const KILL_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Lifecycle of the supervised server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Ways of getting rid of a server, tried in order until one succeeds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KillAttempt {
    /// Process table scan for `-p <port>`, then SIGKILL
    ByPort,
    /// `pkill -9 <binary>`, every server on the host
    ByName,
}

const KILL_ATTEMPTS: [KillAttempt; 2] = [KillAttempt::ByPort, KillAttempt::ByName];

/// Supervisor of one `indiserver` process and its drivers
#[derive(Clone)]
pub struct IndiServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    config: ServerConfig,
    sink: Arc<dyn CommandSink>,
    table: Arc<dyn ProcessTable>,
    runner: Mutex<Option<Arc<ProcessRunner>>>,
    running: Mutex<BTreeMap<String, DriverDescriptor>>,
    port: Mutex<Option<u16>>,
    state: Mutex<ServerState>,
    /// Drivers queued for the start worker and not yet processed
    pending: watch::Sender<usize>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl IndiServer {
    /// Supervisor using the configured FIFO and the host's `/proc`
    pub fn new(config: ServerConfig) -> Self {
        let sink = Arc::new(FifoChannel::new(
            config.fifo_path.clone(),
            config.fifo_open_timeout(),
        ));
        Self::with_components(config, sink, Arc::new(ProcFsTable::default()))
    }

    /// Supervisor with explicit command sink and process table
    pub fn with_components(
        config: ServerConfig,
        sink: Arc<dyn CommandSink>,
        table: Arc<dyn ProcessTable>,
    ) -> Self {
        let (pending, _) = watch::channel(0);
        Self {
            inner: Arc::new(ServerInner {
                config,
                sink,
                table,
                runner: Mutex::new(None),
                running: Mutex::new(BTreeMap::new()),
                port: Mutex::new(None),
                state: Mutex::new(ServerState::Stopped),
                pending,
                worker: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ServerState {
        *lock(&self.inner.state)
    }

    /// Port of the most recent `start`
    pub fn port(&self) -> Option<u16> {
        *lock(&self.inner.port)
    }

    /// Start the server on `port`, then queue `drivers` for the start worker.
    ///
    /// A server already running on `port` or on the previous port is stopped
    /// first. Returns once the process is spawned; drivers start in the
    /// background, in order (see [`wait_for_drivers_started`](Self::wait_for_drivers_started)).
    pub async fn start(&self, port: u16, drivers: Vec<DriverDescriptor>) -> ServerResult<()> {
        let previous = self.port();
        for candidate in [previous, Some(port)].into_iter().flatten() {
            if self.is_running(Some(candidate)).await {
                tracing::info!("INDI server running on port {}, stopping it first", candidate);
                self.stop(Some(candidate)).await;
            }
        }

        self.set_state(ServerState::Starting);

        if let Err(e) = self.inner.sink.recreate().await {
            tracing::error!("Failed to recreate control FIFO: {}", e);
        }

        let command = self.inner.config.command_line(port);
        tracing::info!("{}", command);
        let runner = Arc::new(ProcessRunner::shell(command.clone()));
        let spawned = runner.start();
        *lock(&self.inner.runner) = Some(Arc::clone(&runner));
        *lock(&self.inner.port) = Some(port);
        self.abort_worker();
        lock(&self.inner.running).clear();

        if !spawned {
            self.set_state(ServerState::Stopped);
            return Err(ServerError::SpawnFailed {
                command,
                reason: runner.error().unwrap_or_default(),
            });
        }
        self.set_state(ServerState::Running);

        if drivers.is_empty() {
            tracing::info!("No drivers specified to start");
            return Ok(());
        }
        self.spawn_worker(drivers);
        Ok(())
    }

    /// Stop the server on `port` (default: last started port, else the configured one)
    ///
    /// Never fails; each failed step is logged and the next one still runs.
    pub async fn stop(&self, port: Option<u16>) {
        let port = self.resolve_port(port);
        self.set_state(ServerState::Stopping);
        self.abort_worker();

        for attempt in KILL_ATTEMPTS {
            match self.kill(attempt, port).await {
                Ok(()) => break,
                Err(e) => tracing::warn!("Kill attempt {:?} failed: {}", attempt, e),
            }
        }

        let runner = lock(&self.inner.runner).take();
        if let Some(runner) = runner {
            runner.terminate();
            if !runner.join(self.inner.config.shutdown_join_timeout()).await {
                tracing::warn!("INDI server output readers did not finish in time");
            }
        }

        lock(&self.inner.running).clear();
        self.set_state(ServerState::Stopped);
    }

    /// Whether a server is running on `port` (default: last started port).
    ///
    /// The process started by this supervisor counts, as does any server
    /// found in the process table.
    pub async fn is_running(&self, port: Option<u16>) -> bool {
        let runner_alive = lock(&self.inner.runner)
            .as_ref()
            .map_or(false, |runner| runner.is_running());
        if runner_alive {
            return true;
        }

        let port = self.resolve_port(port);
        match self
            .inner
            .table
            .find_server(&self.inner.config.server_binary, port)
        {
            Ok(pids) => !pids.is_empty(),
            Err(e) => {
                tracing::warn!("Cannot check for INDI server processes: {}", e);
                false
            }
        }
    }

    /// Issue a `start` command for one driver; returns whether it was recorded as running
    pub async fn start_driver(&self, driver: &DriverDescriptor) -> bool {
        start_driver(&self.inner, driver).await
    }

    /// Issue a `stop` command for one driver.
    ///
    /// `device_label` names the device on the wire instead of the driver label,
    /// for drivers serving several devices. The driver's own label is what
    /// leaves the running set.
    pub async fn stop_driver(&self, driver: &DriverDescriptor, device_label: Option<&str>) -> bool {
        stop_driver(&self.inner, driver, device_label).await
    }

    /// Wait until the start worker has processed every queued driver.
    ///
    /// Returns true immediately when nothing is queued, false on timeout.
    pub async fn wait_for_drivers_started(&self, timeout: Duration) -> bool {
        let mut pending = self.inner.pending.subscribe();
        let started = match tokio::time::timeout(timeout, pending.wait_for(|n| *n == 0)).await {
            Ok(Ok(_)) => true,
            Ok(Err(_)) => false,
            Err(_) => {
                tracing::warn!(
                    "Timed out waiting for drivers, {} still queued",
                    *self.inner.pending.borrow()
                );
                false
            }
        };
        started
    }

    /// Snapshot of running drivers by label
    pub fn get_running_drivers(&self) -> BTreeMap<String, DriverDescriptor> {
        lock(&self.inner.running).clone()
    }

    /// Output captured from the current server process
    pub fn server_output(&self) -> Vec<String> {
        lock(&self.inner.runner)
            .as_ref()
            .map(|runner| runner.output())
            .unwrap_or_default()
    }

    fn resolve_port(&self, port: Option<u16>) -> u16 {
        port.or_else(|| self.port()).unwrap_or(self.inner.config.port)
    }

    fn set_state(&self, state: ServerState) {
        let mut current = lock(&self.inner.state);
        if *current != state {
            tracing::debug!("INDI server state {:?} -> {:?}", *current, state);
            *current = state;
        }
    }

    fn spawn_worker(&self, drivers: Vec<DriverDescriptor>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let count = drivers.len();
        for driver in drivers {
            let _ = tx.send(driver);
        }
        drop(tx);
        self.inner.pending.send_replace(count);

        tracing::info!("Starting background worker for {} driver(s)", count);
        let inner = Arc::clone(&self.inner);
        let worker = tokio::spawn(async move {
            while let Some(driver) = rx.recv().await {
                tracing::info!("Worker starting driver: {}", driver.label);
                if start_driver(&inner, &driver).await {
                    tracing::info!("Worker finished starting driver: {}", driver.label);
                } else {
                    tracing::error!("Worker failed to start driver: {}", driver.label);
                }
                inner.pending.send_modify(|n| *n = n.saturating_sub(1));
            }
            tracing::info!("Driver starter worker finished");
        });
        *lock(&self.inner.worker) = Some(worker);
    }

    fn abort_worker(&self) {
        if let Some(worker) = lock(&self.inner.worker).take() {
            worker.abort();
        }
        self.inner.pending.send_replace(0);
    }

    async fn kill(&self, attempt: KillAttempt, port: u16) -> ServerResult<()> {
        let binary = &self.inner.config.server_binary;
        match attempt {
            KillAttempt::ByPort => {
                let pids = self.inner.table.find_server(binary, port)?;
                for pid in &pids {
                    tracing::info!("Killing {} process {} running on port {}", binary, pid, port);
                    self.inner.table.kill(*pid)?;
                }
                if !pids.is_empty() {
                    self.wait_for_exit(binary, port).await;
                    tracing::info!("{} on port {} terminated", binary, port);
                }
                Ok(())
            }
            KillAttempt::ByName => {
                let mut pkill = pkill_command(binary);
                tracing::info!("{:?}", pkill.as_std());
                let status = pkill.status().await?;
                // 1 means nothing matched
                match status.code() {
                    Some(0) | Some(1) => Ok(()),
                    _ => Err(ServerError::ProcessTableUnavailable(format!(
                        "pkill exited with {}",
                        status
                    ))),
                }
            }
        }
    }

    async fn wait_for_exit(&self, binary: &str, port: u16) {
        let deadline = tokio::time::Instant::now() + KILL_SETTLE_TIMEOUT;
        while tokio::time::Instant::now() < deadline {
            match self.inner.table.find_server(binary, port) {
                Ok(pids) if pids.is_empty() => return,
                Ok(_) => tokio::time::sleep(KILL_POLL_INTERVAL).await,
                Err(_) => return,
            }
        }
        tracing::warn!("{} on port {} still listed after kill", binary, port);
    }
}

async fn start_driver(inner: &ServerInner, driver: &DriverDescriptor) -> bool {
    tracing::info!("Starting driver: {}", driver.label);
    let command = match start_command(driver) {
        Ok(command) => command,
        Err(e) => {
            tracing::error!("{}. Is it installed? Please reinstall the driver", e);
            return false;
        }
    };

    if let Some(rule) = &driver.rule {
        delay("Pre Delay", rule.pre_delay).await;
        if let Err(e) = run_rule_script("Pre Script", rule.pre_script.as_deref()).await {
            tracing::warn!("{}. Aborting start of {}", e, driver.label);
            return false;
        }
    }

    if let Err(e) = inner.sink.send(&command).await {
        tracing::error!("Failed to send start command for {}: {}", driver.label, e);
    }

    if let Some(rule) = &driver.rule {
        delay("Post Delay", rule.post_delay).await;
        if let Err(e) = run_rule_script("Post Script", rule.post_script.as_deref()).await {
            tracing::warn!("{}. Aborting start of {}", e, driver.label);
            return false;
        }
    }

    lock(&inner.running).insert(driver.label.clone(), driver.clone());
    true
}

async fn stop_driver(
    inner: &ServerInner,
    driver: &DriverDescriptor,
    device_label: Option<&str>,
) -> bool {
    let label = device_label.unwrap_or(&driver.label);
    let command = match stop_command(driver, label) {
        Ok(command) => command,
        Err(e) => {
            tracing::error!("{}. Is it installed? Please reinstall the driver", e);
            return false;
        }
    };

    let rule = driver.rule.as_ref();
    if let Some(rule) = rule {
        if let Err(e) = run_rule_script("Stopping Script", rule.stopping_script.as_deref()).await {
            tracing::warn!("{}. Aborting stop of {}", e, driver.label);
            return false;
        }
        delay("Stopping Delay", rule.stopping_delay).await;
    }

    tracing::info!("Stopping driver: {}", label);
    if let Err(e) = inner.sink.send(&command).await {
        tracing::error!("Failed to send stop command for {}: {}", label, e);
    }

    if let Some(rule) = rule {
        delay("Stopped Delay", rule.stopped_delay).await;
        if let Err(e) = run_rule_script("Stopped Script", rule.stopped_script.as_deref()).await {
            tracing::warn!("{}. Aborting stop of {}", e, driver.label);
            return false;
        }
    }

    lock(&inner.running).remove(&driver.label);
    true
}

/// `start <binary> [-s "<skeleton>"] [-n "<label>"]`
fn start_command(driver: &DriverDescriptor) -> ServerResult<String> {
    let binary = binary_of(driver)?;
    let mut command = format!("start {}", binary);
    if let Some(skeleton) = &driver.skeleton {
        command.push_str(&format!(" -s {}", quoted(&skeleton.to_string_lossy())));
    }
    if names_device(driver) {
        command.push_str(&format!(" -n {}", quoted(&driver.label)));
    }
    Ok(command)
}

/// `stop <binary> [-n "<label>"]`
fn stop_command(driver: &DriverDescriptor, label: &str) -> ServerResult<String> {
    let binary = binary_of(driver)?;
    let mut command = format!("stop {}", binary);
    if names_device(driver) {
        command.push_str(&format!(" -n {}", quoted(label)));
    }
    Ok(command)
}

fn binary_of(driver: &DriverDescriptor) -> ServerResult<&str> {
    driver
        .binary
        .as_deref()
        .filter(|b| !b.is_empty())
        .ok_or_else(|| ServerError::MissingBinary(driver.label.clone()))
}

/// Remote and multi-device drivers name their devices themselves
/// `pkill -9` by process name; a configured path would never match
fn pkill_command(binary: &str) -> Command {
    let mut command = Command::new("pkill");
    command.arg("-9").arg(procscan::program_name(binary));
    command
}

fn names_device(driver: &DriverDescriptor) -> bool {
    !driver.is_remote() && !driver.mdpd
}

fn quoted(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\\\""))
}

async fn delay(what: &str, seconds: f64) {
    if seconds > 0.0 && seconds.is_finite() {
        tracing::info!("{}: waiting {} second(s)", what, seconds);
        tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
    }
}

/// Run a lifecycle script, if set, and log its output
async fn run_rule_script(what: &str, script: Option<&str>) -> ServerResult<()> {
    let script = match script.filter(|s| !s.trim().is_empty()) {
        Some(script) => script,
        None => return Ok(()),
    };
    tracing::info!("Running {} {}", what, script);

    let output = Command::new(script)
        .output()
        .await
        .map_err(|e| ServerError::ScriptFailed {
            script: script.to_string(),
            reason: e.to_string(),
        })?;
    if !output.status.success() {
        return Err(ServerError::ScriptFailed {
            script: script.to_string(),
            reason: output.status.to_string(),
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !stdout.trim().is_empty() {
        tracing::info!("{} output: {}", what, stdout.trim_end());
    }
    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}
