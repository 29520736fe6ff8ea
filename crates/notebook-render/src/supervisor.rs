//! Supervision of a single render tool process.
//!
//! A `ProcessSupervisor` is created for exactly one run: it spawns the tool
//! bound to an artifact path and port, polls the port from a background task
//! until the tool answers HTTP (or the wait budget runs out), and reports the
//! outcome once through the callback registered at `start`. `stop` cancels
//! the polling task and tears down the whole process tree.
//!
//! States: `NotStarted -> Launching -> Polling -> Ready | TimedOut`, or
//! `Launching -> LaunchFailed`. `Stopped` is reachable from any launched state.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{RenderError, Result};
use crate::launch::{tool_args, LaunchOptions, ToolCommand};
use crate::process_tree::{self, TeardownReport};

/// Identity of one supervisor instance.
pub type SupervisorId = Uuid;

/// Lifecycle of one supervised run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    NotStarted,
    Launching,
    Polling,
    Ready,
    TimedOut,
    LaunchFailed,
    Stopped,
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorState::NotStarted => write!(f, "not_started"),
            SupervisorState::Launching => write!(f, "launching"),
            SupervisorState::Polling => write!(f, "polling"),
            SupervisorState::Ready => write!(f, "ready"),
            SupervisorState::TimedOut => write!(f, "timed_out"),
            SupervisorState::LaunchFailed => write!(f, "launch_failed"),
            SupervisorState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Terminal outcome of a run, delivered through the report callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorStatus {
    /// The tool answered HTTP on `port`.
    Ready { port: u16 },
    /// No answer within the wait budget. The process is left running.
    /// `waited` is the time actually spent polling.
    TimedOut { waited: Duration },
    /// The process could not be created, or exited before it served anything.
    LaunchFailed { reason: String },
}

impl SupervisorStatus {
    pub fn into_error(self) -> Option<RenderError> {
        match self {
            SupervisorStatus::Ready { .. } => None,
            SupervisorStatus::TimedOut { waited } => Some(RenderError::ReadinessTimeout(waited)),
            SupervisorStatus::LaunchFailed { reason } => Some(RenderError::LaunchFailed(reason)),
        }
    }
}

/// A status tagged with the supervisor that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorReport {
    pub id: SupervisorId,
    pub status: SupervisorStatus,
}

/// Fire-once receiver for a supervisor's outcome.
pub type ReportCallback = Box<dyn FnOnce(SupervisorReport) + Send + 'static>;

/// What counts as "the server is up".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessPolicy {
    /// Any HTTP response, whatever its status code.
    #[default]
    AnyResponse,
    /// Any response that is not a 5xx.
    SuccessOnly,
}

/// Per-run settings for the supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub tool: ToolCommand,
    pub options: LaunchOptions,
    /// Total readiness budget.
    pub max_wait: Duration,
    /// Sleep between probes.
    pub poll_interval: Duration,
    /// Per-request timeout for a single probe.
    pub probe_timeout: Duration,
    pub readiness: ReadinessPolicy,
    /// SIGTERM-to-SIGKILL window during stop.
    pub stop_grace: Duration,
    /// Upper bound on how long stop blocks.
    pub stop_timeout: Duration,
    pub working_dir: Option<PathBuf>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            tool: ToolCommand::default(),
            options: LaunchOptions::default(),
            max_wait: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
            probe_timeout: Duration::from_secs(2),
            readiness: ReadinessPolicy::AnyResponse,
            stop_grace: Duration::from_secs(2),
            stop_timeout: Duration::from_secs(5),
            working_dir: None,
        }
    }
}

type SharedState = Arc<StdMutex<SupervisorState>>;

fn set_state(state: &SharedState, next: SupervisorState) {
    *state.lock().unwrap_or_else(|e| e.into_inner()) = next;
}

/// Owns one render tool process for the duration of one run.
pub struct ProcessSupervisor {
    id: SupervisorId,
    config: SupervisorConfig,
    state: SharedState,
    port: Option<u16>,
    /// Pid of the direct child, present until the tree is torn down.
    pid: Option<u32>,
    /// Process group ID for cleanup (Unix only)
    #[cfg(unix)]
    process_group_id: Option<i32>,
    child: Arc<Mutex<Option<Child>>>,
    /// Set once the direct child has been reaped; its pid may be reused after that.
    root_reaped: Arc<AtomicBool>,
    stop_tx: watch::Sender<bool>,
    poll_task: Option<JoinHandle<()>>,
    output_tasks: Vec<JoinHandle<()>>,
}

/// How to tear down a run, given what is known about the direct child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TeardownPlan {
    /// The child is alive or an unreaped zombie: walk and signal its tree.
    Tree { root: u32, group: Option<i32> },
    /// The child was reaped: only the group it led can still be signalled.
    #[cfg(unix)]
    Group(i32),
    /// The child was reaped and led no group.
    Nothing,
}

fn teardown_plan(pid: u32, group: Option<i32>, root_reaped: bool) -> TeardownPlan {
    match (root_reaped, group) {
        (false, group) => TeardownPlan::Tree { root: pid, group },
        #[cfg(unix)]
        (true, Some(pgid)) => TeardownPlan::Group(pgid),
        (true, _) => TeardownPlan::Nothing,
    }
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        let (stop_tx, _stop_rx) = watch::channel(false);
        Self {
            id: Uuid::new_v4(),
            config,
            state: Arc::new(StdMutex::new(SupervisorState::NotStarted)),
            port: None,
            pid: None,
            #[cfg(unix)]
            process_group_id: None,
            child: Arc::new(Mutex::new(None)),
            root_reaped: Arc::new(AtomicBool::new(false)),
            stop_tx,
            poll_task: None,
            output_tasks: Vec::new(),
        }
    }

    pub fn id(&self) -> SupervisorId {
        self.id
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Pid of the direct child, while it is supervised and not yet reaped.
    pub fn pid(&self) -> Option<u32> {
        self.pid.filter(|_| !self.root_reaped.load(Ordering::SeqCst))
    }

    /// The endpoint URL, only once the tool has answered.
    pub fn url(&self) -> Option<String> {
        match (self.state(), self.port) {
            (SupervisorState::Ready, Some(port)) => Some(format!("http://localhost:{}", port)),
            _ => None,
        }
    }

    /// Launch the tool for `artifact` on `port` and start polling for readiness.
    ///
    /// `on_report` is called at most once. A spawn failure reports
    /// `LaunchFailed` before this returns; every other outcome is reported
    /// from the polling task. Nothing is reported once `stop` has been called.
    pub fn start(&mut self, artifact: &Path, port: u16, on_report: ReportCallback) {
        if self.state() != SupervisorState::NotStarted {
            warn!(
                "[supervisor] {} already used (state {}), refusing second start",
                self.id,
                self.state()
            );
            on_report(SupervisorReport {
                id: self.id,
                status: SupervisorStatus::LaunchFailed {
                    reason: "supervisor was already started".to_string(),
                },
            });
            return;
        }

        set_state(&self.state, SupervisorState::Launching);
        self.port = Some(port);

        let tool = &self.config.tool;
        let mut cmd = tokio::process::Command::new(&tool.program);
        cmd.args(&tool.prefix_args);
        cmd.args(tool_args(artifact, port, &self.config.options));
        if let Some(ref dir) = self.config.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        #[cfg(unix)]
        cmd.process_group(0);

        info!(
            "[supervisor] Launching {} for {} on port {}",
            tool.program.display(),
            artifact.display(),
            port
        );

        let mut child = match cmd.kill_on_drop(true).spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(
                    "[supervisor] Failed to launch {}: {}",
                    tool.program.display(),
                    e
                );
                set_state(&self.state, SupervisorState::LaunchFailed);
                on_report(SupervisorReport {
                    id: self.id,
                    status: SupervisorStatus::LaunchFailed {
                        reason: format!("{}: {}", tool.program.display(), e),
                    },
                });
                return;
            }
        };

        self.pid = child.id();
        #[cfg(unix)]
        {
            self.process_group_id = child.id().map(|pid| pid as i32);
        }

        if let Some(stdout) = child.stdout.take() {
            self.output_tasks.push(forward_output(stdout, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            self.output_tasks.push(forward_output(stderr, "stderr"));
        }

        self.child = Arc::new(Mutex::new(Some(child)));

        set_state(&self.state, SupervisorState::Polling);

        let poller = Poller {
            id: self.id,
            port,
            max_wait: self.config.max_wait,
            poll_interval: self.config.poll_interval,
            probe_timeout: self.config.probe_timeout,
            readiness: self.config.readiness,
            state: self.state.clone(),
            child: self.child.clone(),
            root_reaped: self.root_reaped.clone(),
            stop_rx: self.stop_tx.subscribe(),
        };
        self.poll_task = Some(tokio::spawn(poller.run(on_report)));
    }

    /// Stop the run and tear down the process tree.
    ///
    /// Idempotent, and a no-op if no process was launched. Blocks until the
    /// tree has exited or `stop_timeout` has passed. Survivors are reported as
    /// `StopFailed`.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(pid) = self.pid.take() else {
            return Ok(());
        };

        let previous = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *state, SupervisorState::Stopped)
        };
        info!(
            "[supervisor] Stopping {} (pid {}, was {})",
            self.id, pid, previous
        );

        let _ = self.stop_tx.send(true);
        if let Some(mut task) = self.poll_task.take() {
            let budget = self.config.poll_interval + self.config.probe_timeout;
            if tokio::time::timeout(budget, &mut task).await.is_err() {
                warn!("[supervisor] Polling task did not exit within {:?}", budget);
                task.abort();
            }
        }

        #[cfg(unix)]
        let group = self.process_group_id.take();
        #[cfg(not(unix))]
        let group = None;

        let reaped = self.root_reaped.load(Ordering::SeqCst) || self.reap_exited_root().await;
        let (grace, timeout) = (self.config.stop_grace, self.config.stop_timeout);
        let report = match teardown_plan(pid, group, reaped) {
            TeardownPlan::Tree { root, group } => {
                process_tree::terminate_tree(root, group, grace, timeout).await
            }
            #[cfg(unix)]
            TeardownPlan::Group(pgid) => {
                debug!(
                    "[supervisor] Render tool {} already reaped, signalling group {} only",
                    pid, pgid
                );
                process_tree::terminate_group(pgid, grace, timeout).await
            }
            TeardownPlan::Nothing => TeardownReport::default(),
        };

        if let Some(mut child) = self.child.lock().await.take() {
            match tokio::time::timeout(Duration::from_millis(500), child.wait()).await {
                Ok(Ok(status)) => debug!("[supervisor] Render tool exited with {}", status),
                Ok(Err(e)) => warn!("[supervisor] Failed to reap render tool: {}", e),
                Err(_) => warn!("[supervisor] Render tool not reaped within 500ms"),
            }
        }

        for task in self.output_tasks.drain(..) {
            task.abort();
        }

        if report.is_clean() {
            info!("[supervisor] Stopped {}", self.id);
            Ok(())
        } else {
            error!(
                "[supervisor] {} process(es) survived stop: {:?}",
                report.survivors.len(),
                report.survivors
            );
            Err(RenderError::StopFailed {
                remaining: report.survivors.len(),
            })
        }
    }

    /// Reap the direct child if it has already exited. Returns whether it was reaped.
    async fn reap_exited_root(&self) -> bool {
        let mut slot = self.child.lock().await;
        let Some(child) = slot.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!("[supervisor] Render tool had already exited with {}", status);
                self.root_reaped.store(true, Ordering::SeqCst);
                true
            }
            _ => false,
        }
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(true);
        if let Some(task) = self.poll_task.take() {
            task.abort();
        }
        for task in self.output_tasks.drain(..) {
            task.abort();
        }

        if let Some(pid) = self.pid.take() {
            warn!(
                "[supervisor] {} dropped without stop, killing tree at {}",
                self.id, pid
            );

            #[cfg(unix)]
            {
                use nix::sys::signal::{kill, killpg, Signal};
                use nix::unistd::Pid;

                // A reaped pid may already belong to someone else
                if !self.root_reaped.load(Ordering::SeqCst) {
                    for descendant in process_tree::descendants(pid) {
                        let _ = kill(Pid::from_raw(descendant as i32), Signal::SIGKILL);
                    }
                }
                if let Some(pgid) = self.process_group_id.take() {
                    let _ = killpg(Pid::from_raw(pgid), Signal::SIGKILL);
                }
            }
        }
    }
}

fn forward_output<R>(stream: R, label: &'static str) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!("[render-tool] {}: {}", label, line);
        }
    })
}

/// State moved into the background polling task.
struct Poller {
    id: SupervisorId,
    port: u16,
    max_wait: Duration,
    poll_interval: Duration,
    probe_timeout: Duration,
    readiness: ReadinessPolicy,
    state: SharedState,
    child: Arc<Mutex<Option<Child>>>,
    root_reaped: Arc<AtomicBool>,
    stop_rx: watch::Receiver<bool>,
}

impl Poller {
    async fn run(mut self, on_report: ReportCallback) {
        let Some(status) = self.poll().await else {
            debug!("[supervisor] {} polling cancelled", self.id);
            return;
        };

        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state == SupervisorState::Stopped || *self.stop_rx.borrow() {
                debug!(
                    "[supervisor] {} stopped, dropping {:?}",
                    self.id, status
                );
                return;
            }
            *state = match status {
                SupervisorStatus::Ready { .. } => SupervisorState::Ready,
                SupervisorStatus::TimedOut { .. } => SupervisorState::TimedOut,
                SupervisorStatus::LaunchFailed { .. } => SupervisorState::LaunchFailed,
            };
        }

        on_report(SupervisorReport {
            id: self.id,
            status,
        });
    }

    /// Returns `None` when cancelled by `stop`.
    async fn poll(&mut self) -> Option<SupervisorStatus> {
        let client = match reqwest::Client::builder()
            .no_proxy()
            .timeout(self.probe_timeout)
            .build()
        {
            Ok(client) => client,
            Err(e) => {
                return Some(SupervisorStatus::LaunchFailed {
                    reason: format!("could not build readiness probe: {}", e),
                })
            }
        };

        let url = format!("http://localhost:{}/", self.port);
        let started = tokio::time::Instant::now();
        let deadline = started + self.max_wait;
        let mut attempts: u32 = 0;

        loop {
            if *self.stop_rx.borrow() {
                return None;
            }

            if let Some(reason) = self.exited_early().await {
                warn!("[supervisor] {} {}", self.id, reason);
                return Some(SupervisorStatus::LaunchFailed { reason });
            }

            attempts += 1;
            let ready = tokio::select! {
                biased;
                _ = self.stop_rx.changed() => return None,
                ready = probe(&client, &url, self.readiness) => ready,
                // A stalled probe must not stretch the wait budget
                _ = tokio::time::sleep_until(deadline) => false,
            };
            if ready {
                info!(
                    "[supervisor] {} ready on port {} after {:?} ({} probe(s))",
                    self.id,
                    self.port,
                    started.elapsed(),
                    attempts
                );
                return Some(SupervisorStatus::Ready { port: self.port });
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                let waited = started.elapsed();
                warn!(
                    "[supervisor] {} no response on port {} within {:?} (waited {:?})",
                    self.id, self.port, self.max_wait, waited
                );
                return Some(SupervisorStatus::TimedOut { waited });
            }

            let nap = self.poll_interval.min(deadline - now);
            tokio::select! {
                biased;
                _ = self.stop_rx.changed() => return None,
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }

    async fn exited_early(&self) -> Option<String> {
        let mut slot = self.child.lock().await;
        let child = slot.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => {
                self.root_reaped.store(true, Ordering::SeqCst);
                Some(format!("render tool exited with {} before serving", status))
            }
            Ok(None) => None,
            Err(e) => {
                debug!("[supervisor] try_wait failed: {}", e);
                None
            }
        }
    }
}

/// One readiness probe. Connection failures mean "not yet".
async fn probe(client: &reqwest::Client, url: &str, policy: ReadinessPolicy) -> bool {
    match client.get(url).send().await {
        Ok(response) => match policy {
            ReadinessPolicy::AnyResponse => true,
            ReadinessPolicy::SuccessOnly => {
                let ok = !response.status().is_server_error();
                if !ok {
                    debug!("[supervisor] Probe got {}, still waiting", response.status());
                }
                ok
            }
        },
        Err(e) if e.is_connect() || e.is_timeout() => {
            debug!("[supervisor] Probe {} not answering yet", url);
            false
        }
        Err(e) => {
            // Something answered, just not with well-formed HTTP
            debug!("[supervisor] Probe {} failed: {}", url, e);
            policy == ReadinessPolicy::AnyResponse
        }
    }
}
