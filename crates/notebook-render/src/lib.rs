//! notebook-render - Supervised notebook rendering through an external HTTP tool.
//!
//! A [`RenderSession`] turns an in-memory list of code and markdown cells into
//! an nbformat v4 artifact, picks a free local port, and launches the render
//! tool (voila by default) on it. Readiness is polled in the background and
//! reported as [`SessionEvent`]s; stopping a run tears down the tool's whole
//! process tree. At most one render tool runs per session.

pub mod document;
pub mod error;
pub mod launch;
pub mod port;
pub mod process_tree;
pub mod session;
pub mod settings;
pub mod supervisor;

pub use document::{Cell, CellKind, Import, NotebookDocument};
pub use error::{FailureKind, RenderError, Result};
pub use launch::{LaunchOptions, ToolCommand};
pub use port::{PortAllocator, PortRange};
pub use session::{RenderSession, SessionConfig, SessionEvent, SessionState};
pub use settings::{load_settings, save_settings, RenderSettings};
pub use supervisor::{
    ProcessSupervisor, ReadinessPolicy, SupervisorConfig, SupervisorId, SupervisorReport,
    SupervisorState, SupervisorStatus,
};
