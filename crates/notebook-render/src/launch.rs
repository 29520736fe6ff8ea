//! Command line assembly for the external render tool.
//!
//! The tool is started as
//! `<program> <prefix...> --no-browser --port <port> --strip-sources=<bool> [--show-tracebacks=true] <artifact>`
//! where `<program> <prefix...>` defaults to `python3 -m voila`.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Module run with `-m` when no explicit program is configured.
pub const DEFAULT_TOOL_MODULE: &str = "voila";

/// Interpreter used when none is pinned.
#[cfg(not(windows))]
pub const DEFAULT_PYTHON: &str = "python3";
#[cfg(windows)]
pub const DEFAULT_PYTHON: &str = "python";

/// The program and leading arguments that invoke the render tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCommand {
    pub program: PathBuf,
    pub prefix_args: Vec<OsString>,
}

impl ToolCommand {
    /// `<python> -m <module>`.
    pub fn python_module(python: Option<&Path>, module: &str) -> Self {
        Self {
            program: python
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_PYTHON)),
            prefix_args: vec!["-m".into(), module.into()],
        }
    }

    /// An arbitrary program with leading arguments.
    pub fn program<I, S>(program: impl Into<PathBuf>, prefix_args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            program: program.into(),
            prefix_args: prefix_args.into_iter().map(Into::into).collect(),
        }
    }
}

impl Default for ToolCommand {
    fn default() -> Self {
        Self::python_module(None, DEFAULT_TOOL_MODULE)
    }
}

/// Rendering flags passed through to the tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchOptions {
    /// Hide cell sources in the rendered page.
    pub strip_sources: bool,
    /// Show Python tracebacks for failing cells.
    pub show_tracebacks: bool,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            strip_sources: true,
            show_tracebacks: false,
        }
    }
}

fn python_bool(value: bool) -> &'static str {
    if value {
        "True"
    } else {
        "False"
    }
}

/// Arguments following the tool prefix for one run.
pub fn tool_args(artifact: &Path, port: u16, options: &LaunchOptions) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "--no-browser".into(),
        "--port".into(),
        port.to_string().into(),
        format!("--strip-sources={}", python_bool(options.strip_sources)).into(),
    ];
    if options.show_tracebacks {
        args.push("--show-tracebacks=true".into());
    }
    args.push(artifact.as_os_str().to_os_string());
    args
}
