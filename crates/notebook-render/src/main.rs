//! notebook-render CLI entry point.
//!
//! Renders either an existing notebook or cells given on the command line,
//! prints the served URL once the render tool answers, and tears everything
//! down on Ctrl-C.

use std::path::PathBuf;

use anyhow::Context;
use clap::{ArgMatches, Args, CommandFactory, FromArgMatches, Parser, Subcommand};
use log::{info, warn};
use notebook_render::settings::load_settings;
use notebook_render::{
    CellKind, Import, RenderSession, RenderSettings, SessionConfig, SessionEvent,
};
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser, Debug)]
#[command(name = "notebook-render")]
#[command(about = "Render notebooks through a supervised voila process")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve an existing .ipynb file
    Serve {
        /// Notebook to render
        path: PathBuf,

        #[command(flatten)]
        overrides: Overrides,
    },

    /// Build a notebook from the given cells and serve it
    Render {
        /// Code cell source (repeatable)
        #[arg(long = "code", value_name = "SOURCE")]
        code: Vec<String>,

        /// Markdown cell source (repeatable)
        #[arg(long = "markdown", value_name = "SOURCE")]
        markdown: Vec<String>,

        /// Import for the first code cell, as MODULE or MODULE:SYM,SYM (repeatable)
        #[arg(long = "import", value_name = "IMPORT")]
        imports: Vec<Import>,

        /// Also save the generated notebook to this path
        #[arg(long)]
        save: Option<PathBuf>,

        #[command(flatten)]
        overrides: Overrides,
    },
}

/// Per-invocation overrides on top of the saved settings.
#[derive(Args, Debug, Default)]
struct Overrides {
    /// Python interpreter that runs the render tool
    #[arg(long)]
    python: Option<PathBuf>,

    /// Module run with `python -m` (default: voila)
    #[arg(long)]
    module: Option<String>,

    /// Seconds to wait for the render tool to answer
    #[arg(long, value_name = "SECS")]
    max_wait: Option<u64>,

    /// Show cell sources in the rendered page
    #[arg(long)]
    no_strip_sources: bool,

    /// Show Python tracebacks for failing cells
    #[arg(long)]
    show_tracebacks: bool,

    /// Directory for the generated notebook (default: a temporary directory)
    #[arg(long)]
    work_dir: Option<PathBuf>,
}

impl Overrides {
    fn apply(self, mut settings: RenderSettings) -> RenderSettings {
        if let Some(python) = self.python {
            settings.python_path = Some(python);
        }
        if let Some(module) = self.module {
            settings.tool_module = module;
        }
        if let Some(secs) = self.max_wait {
            settings.max_wait_secs = secs;
        }
        if self.no_strip_sources {
            settings.strip_sources = false;
        }
        if self.show_tracebacks {
            settings.show_tracebacks = true;
        }
        if let Some(dir) = self.work_dir {
            settings.work_dir = Some(dir);
        }
        settings
    }
}

/// Code and markdown cells in the order they appeared on the command line.
fn ordered_cells(
    matches: &ArgMatches,
    code: Vec<String>,
    markdown: Vec<String>,
) -> Vec<(CellKind, String)> {
    let Some(("render", render)) = matches.subcommand() else {
        return Vec::new();
    };
    let code_idx = render.indices_of("code").into_iter().flatten();
    let markdown_idx = render.indices_of("markdown").into_iter().flatten();

    let mut cells: Vec<(usize, CellKind, String)> = code_idx
        .zip(code)
        .map(|(i, src)| (i, CellKind::Code, src))
        .chain(
            markdown_idx
                .zip(markdown)
                .map(|(i, src)| (i, CellKind::Markdown, src)),
        )
        .collect();
    cells.sort_by_key(|(i, _, _)| *i);
    cells.into_iter().map(|(_, kind, src)| (kind, src)).collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = Cli::command().get_matches();
    let cli = Cli::from_arg_matches(&matches)?;

    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    match cli.command {
        Commands::Serve { path, overrides } => {
            let path = std::fs::canonicalize(&path)
                .with_context(|| format!("Notebook not found: {}", path.display()))?;
            let settings = overrides.apply(load_settings());
            let mut session = RenderSession::new(SessionConfig::from(&settings))?;
            session.load_external_document(&path);
            serve(session).await
        }
        Commands::Render {
            code,
            markdown,
            imports,
            save,
            overrides,
        } => {
            let settings = overrides.apply(load_settings());
            let mut session = RenderSession::new(SessionConfig::from(&settings))?;

            let mut pending_imports = imports.as_slice();
            for (kind, source) in ordered_cells(&matches, code, markdown) {
                session.append_cell(kind, &source, pending_imports);
                if kind == CellKind::Code {
                    pending_imports = &[];
                }
            }
            if !pending_imports.is_empty() {
                warn!("Imports were given without any code cell; ignoring them");
            }

            if let Some(path) = save {
                session
                    .save_document_to(&path)
                    .with_context(|| format!("Failed to save {}", path.display()))?;
                info!("Saved notebook to {}", path.display());
            }
            serve(session).await
        }
    }
}

/// Run the session, print the URL when ready, and close on Ctrl-C.
async fn serve(mut session: RenderSession) -> anyhow::Result<()> {
    let mut events = session.subscribe();
    session.run().await?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let outcome = loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(SessionEvent::Ready { url }) => {
                    println!("{}", url);
                    info!("Serving at {} (Ctrl-C to stop)", url);
                }
                Ok(SessionEvent::Failed { kind, message }) => {
                    break Err(anyhow::anyhow!("Render failed ({}): {}", kind, message));
                }
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => warn!("Missed {} session events", n),
                Err(RecvError::Closed) => break Ok(()),
            },
            _ = &mut ctrl_c => {
                info!("Interrupted, shutting down");
                break Ok(());
            }
        }
    };

    session.close().await;
    outcome
}
