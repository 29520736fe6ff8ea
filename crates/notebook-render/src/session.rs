//! The render session: the only object a caller talks to.
//!
//! A session owns the notebook document, the artifact location, and at most
//! one `ProcessSupervisor`. `run` always stops the previous supervisor before
//! starting the next one, and reports from a supervisor are only honoured
//! while it is still the active one (checked by its id). Status changes are
//! published on a broadcast channel so the caller never has to block on
//! process startup.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::document::{Cell, CellKind, Import, NotebookDocument};
use crate::error::{FailureKind, RenderError, Result};
use crate::port::{PortAllocator, PortRange, DEFAULT_MAX_ATTEMPTS};
use crate::supervisor::{
    ProcessSupervisor, SupervisorConfig, SupervisorId, SupervisorReport, SupervisorStatus,
};

/// File name of the internally managed artifact inside the work directory.
pub const MANAGED_ARTIFACT_NAME: &str = "temp_notebook.ipynb";

/// Capacity of the session event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Fully resolved session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub supervisor: SupervisorConfig,
    pub port_range: PortRange,
    pub port_max_attempts: u32,
    /// Directory for the managed artifact. A temporary directory is created
    /// (and removed with the session) when unset.
    pub work_dir: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            supervisor: SupervisorConfig::default(),
            port_range: PortRange::default(),
            port_max_attempts: DEFAULT_MAX_ATTEMPTS,
            work_dir: None,
        }
    }
}

/// Session lifecycle as seen by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Starting,
    Ready,
    Failed,
    Stopped,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Starting => write!(f, "starting"),
            SessionState::Ready => write!(f, "ready"),
            SessionState::Failed => write!(f, "failed"),
            SessionState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Notifications published to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A run was launched and is waiting for the tool to answer.
    Starting,
    /// The rendered notebook is being served at `url`.
    Ready { url: String },
    /// The run failed; the caller may `run` again.
    Failed { kind: FailureKind, message: String },
    /// The artifact was rewritten; reload `url`.
    Reload { url: String },
    /// The active run was stopped.
    Stopped,
    /// The session was closed and is idle again.
    Closed,
}

/// State touched by both the caller and supervisor report callbacks.
struct Shared {
    state: SessionState,
    active: Option<SupervisorId>,
    url: Option<String>,
}

type SharedHandle = Arc<StdMutex<Shared>>;

fn lock(shared: &SharedHandle) -> std::sync::MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|e| e.into_inner())
}

/// Handle a supervisor report, ignoring anything from a superseded run.
fn apply_report(
    shared: &SharedHandle,
    events: &broadcast::Sender<SessionEvent>,
    report: SupervisorReport,
) {
    let event = {
        let mut guard = lock(shared);
        if guard.active != Some(report.id) {
            debug!(
                "[session] Ignoring {:?} from inactive supervisor {}",
                report.status, report.id
            );
            return;
        }

        match report.status {
            SupervisorStatus::Ready { port } => {
                let url = format!("http://localhost:{}", port);
                info!("[session] Ready at {}", url);
                guard.state = SessionState::Ready;
                guard.url = Some(url.clone());
                SessionEvent::Ready { url }
            }
            status => {
                guard.state = SessionState::Failed;
                guard.url = None;
                match status.into_error() {
                    Some(err) => {
                        warn!("[session] Run failed: {}", err);
                        SessionEvent::Failed {
                            kind: err.kind(),
                            message: err.to_string(),
                        }
                    }
                    None => return,
                }
            }
        }
    };
    let _ = events.send(event);
}

/// Drives render runs for one notebook document.
pub struct RenderSession {
    config: SessionConfig,
    document: NotebookDocument,
    work_dir: PathBuf,
    /// Keeps the temporary work directory alive for the session's lifetime.
    _temp_dir: Option<tempfile::TempDir>,
    /// Caller-supplied notebook used instead of the managed artifact.
    external: Option<PathBuf>,
    allocator: PortAllocator,
    supervisor: Option<ProcessSupervisor>,
    shared: SharedHandle,
    events: broadcast::Sender<SessionEvent>,
}

impl RenderSession {
    pub fn new(config: SessionConfig) -> Result<Self> {
        let (work_dir, temp_dir) = match config.work_dir {
            Some(ref dir) => {
                std::fs::create_dir_all(dir)?;
                (dir.clone(), None)
            }
            None => {
                let temp = tempfile::Builder::new()
                    .prefix("notebook-render-")
                    .tempdir()?;
                (temp.path().to_path_buf(), Some(temp))
            }
        };
        debug!("[session] Work directory {}", work_dir.display());

        let allocator = PortAllocator::new(config.port_range, config.port_max_attempts);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            config,
            document: NotebookDocument::new(),
            work_dir,
            _temp_dir: temp_dir,
            external: None,
            allocator,
            supervisor: None,
            shared: Arc::new(StdMutex::new(Shared {
                state: SessionState::Idle,
                active: None,
                url: None,
            })),
            events,
        })
    }

    /// Receive session events from this point on.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> SessionState {
        lock(&self.shared).state
    }

    /// The served URL, present only while the session is `Ready`.
    pub fn url(&self) -> Option<String> {
        lock(&self.shared).url.clone()
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn document(&self) -> &NotebookDocument {
        &self.document
    }

    pub fn document_mut(&mut self) -> &mut NotebookDocument {
        &mut self.document
    }

    /// Pid of the running render tool, if any.
    pub fn tool_pid(&self) -> Option<u32> {
        self.supervisor.as_ref().and_then(ProcessSupervisor::pid)
    }

    pub fn append_cell(&mut self, kind: CellKind, source: &str, imports: &[Import]) -> &Cell {
        self.document.append_cell(kind, source, imports)
    }

    pub fn clear(&mut self) {
        self.document.clear();
    }

    /// Path of the artifact the next run will hand to the render tool.
    pub fn artifact_path(&self) -> PathBuf {
        match self.external {
            Some(ref path) => path.clone(),
            None => self.work_dir.join(MANAGED_ARTIFACT_NAME),
        }
    }

    pub fn is_external(&self) -> bool {
        self.external.is_some()
    }

    /// Render a caller-supplied notebook instead of the managed document.
    ///
    /// Relative paths are resolved against the work directory. Takes effect
    /// on the next `run`.
    pub fn load_external_document(&mut self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        let resolved = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.work_dir.join(path)
        };
        info!("[session] Using external notebook {}", resolved.display());
        self.external = Some(resolved);
    }

    /// Go back to rendering the managed document.
    pub fn use_managed_document(&mut self) {
        self.external = None;
    }

    /// Write the current document to `path`.
    pub fn save_document_to(&self, path: impl AsRef<Path>) -> Result<()> {
        self.document.serialize(path.as_ref())
    }

    /// Start a fresh render run.
    ///
    /// Any previous run is stopped first. The document is written, a port is
    /// allocated, and the render tool is launched; readiness is reported
    /// later through [`SessionEvent`]s. Errors that happen before launch
    /// (artifact I/O, port exhaustion) are both returned and published.
    pub async fn run(&mut self) -> Result<()> {
        if self.stop_current().await {
            let _ = self.events.send(SessionEvent::Stopped);
        }

        lock(&self.shared).state = SessionState::Starting;
        let _ = self.events.send(SessionEvent::Starting);

        let artifact = self.artifact_path();
        if self.external.is_none() {
            if let Err(e) = self.document.serialize(&artifact) {
                return Err(self.fail(e));
            }
        } else if !artifact.exists() {
            return Err(self.fail(RenderError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("external notebook {} not found", artifact.display()),
            ))));
        }

        let port = match self.allocator.allocate().await {
            Ok(port) => port,
            Err(e) => return Err(self.fail(e)),
        };

        let mut supervisor = ProcessSupervisor::new(self.config.supervisor.clone());
        {
            let mut guard = lock(&self.shared);
            guard.active = Some(supervisor.id());
            guard.url = None;
        }

        let shared = self.shared.clone();
        let events = self.events.clone();
        supervisor.start(
            &artifact,
            port,
            Box::new(move |report| apply_report(&shared, &events, report)),
        );
        self.supervisor = Some(supervisor);
        Ok(())
    }

    /// Rewrite the managed artifact and ask the caller to reload.
    ///
    /// The running tool keeps its process and port.
    pub fn refresh(&mut self) -> Result<()> {
        if self.external.is_some() {
            return Err(RenderError::ExternalDocument);
        }
        let url = {
            let guard = lock(&self.shared);
            match (guard.state, guard.url.clone()) {
                (SessionState::Ready, Some(url)) => url,
                _ => return Err(RenderError::NotReady),
            }
        };

        self.document.serialize(&self.artifact_path())?;
        info!("[session] Refreshed {}", url);
        let _ = self.events.send(SessionEvent::Reload { url });
        Ok(())
    }

    /// Stop the active run. A no-op when nothing was ever run.
    pub async fn stop(&mut self) {
        let stopped = self.stop_current().await;
        let mut guard = lock(&self.shared);
        if guard.state == SessionState::Idle && !stopped {
            return;
        }
        guard.state = SessionState::Stopped;
        drop(guard);
        let _ = self.events.send(SessionEvent::Stopped);
    }

    /// Stop the active run and return to `Idle`.
    pub async fn close(&mut self) {
        self.stop_current().await;
        lock(&self.shared).state = SessionState::Idle;
        let _ = self.events.send(SessionEvent::Closed);
        info!("[session] Closed");
    }

    /// Detach and stop the current supervisor. Returns whether there was one.
    async fn stop_current(&mut self) -> bool {
        let Some(mut supervisor) = self.supervisor.take() else {
            return false;
        };

        // Deactivate first so a report racing with stop is ignored
        {
            let mut guard = lock(&self.shared);
            guard.active = None;
            guard.url = None;
        }

        if let Err(e) = supervisor.stop().await {
            warn!("[session] {}", e);
        }
        true
    }

    fn fail(&self, err: RenderError) -> RenderError {
        warn!("[session] Run failed before launch: {}", err);
        {
            let mut guard = lock(&self.shared);
            guard.state = SessionState::Failed;
            guard.url = None;
        }
        let _ = self.events.send(SessionEvent::Failed {
            kind: err.kind(),
            message: err.to_string(),
        });
        err
    }
}
