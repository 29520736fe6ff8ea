//! In-memory notebook document and its on-disk artifact.
//!
//! The document is an ordered list of code and markdown cells. It is written
//! as an nbformat v4 notebook, which is what the render tool reads. Writes go
//! through a temporary file in the target directory that is synced and then
//! renamed over the destination, so the render tool never sees a partial file.

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;

use log::{debug, info, warn};
use nbformat::v4::{Cell as NbCell, CellId, CellMetadata, Metadata, Notebook};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{RenderError, Result};

/// Cell type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellKind {
    Code,
    Markdown,
}

impl std::fmt::Display for CellKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CellKind::Code => write!(f, "code"),
            CellKind::Markdown => write!(f, "markdown"),
        }
    }
}

impl std::str::FromStr for CellKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "code" => Ok(CellKind::Code),
            "markdown" | "md" => Ok(CellKind::Markdown),
            _ => Err(format!("Unknown cell kind: {}", s)),
        }
    }
}

/// A single cell. Content is fixed once created; replace the cell to change it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    kind: CellKind,
    source: String,
}

impl Cell {
    pub fn code(source: impl Into<String>) -> Self {
        Self {
            kind: CellKind::Code,
            source: source.into(),
        }
    }

    pub fn markdown(source: impl Into<String>) -> Self {
        Self {
            kind: CellKind::Markdown,
            source: source.into(),
        }
    }

    pub fn kind(&self) -> CellKind {
        self.kind
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

/// A module import to prepend to a code cell.
///
/// With no symbols this renders as `import module`, otherwise as
/// `from module import a, b`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Import {
    pub module: String,
    #[serde(default)]
    pub symbols: Vec<String>,
}

impl Import {
    pub fn module(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            symbols: Vec::new(),
        }
    }

    pub fn symbols<I, S>(module: impl Into<String>, symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            module: module.into(),
            symbols: symbols.into_iter().map(Into::into).collect(),
        }
    }

    fn statement(&self) -> String {
        if self.symbols.is_empty() {
            format!("import {}\n", self.module)
        } else {
            format!("from {} import {}\n", self.module, self.symbols.join(", "))
        }
    }
}

impl std::str::FromStr for Import {
    type Err = String;

    /// Parse `module` or `module:sym1,sym2`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (module, symbols) = match s.split_once(':') {
            Some((module, symbols)) => (module.trim(), symbols),
            None => (s.trim(), ""),
        };
        if module.is_empty() {
            return Err(format!("Missing module name in import: {:?}", s));
        }
        Ok(Import::symbols(
            module,
            symbols
                .split(',')
                .map(str::trim)
                .filter(|sym| !sym.is_empty()),
        ))
    }
}

/// Render the import block for `imports`, in the order given.
pub fn import_block(imports: &[Import]) -> String {
    imports.iter().map(Import::statement).collect()
}

/// Ordered collection of cells handed to the render tool.
#[derive(Debug, Clone, Default)]
pub struct NotebookDocument {
    cells: Vec<Cell>,
}

impl NotebookDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Append a cell. For code cells, `imports` are rendered as import
    /// statements ahead of `source`; they are ignored for markdown cells.
    pub fn append_cell(&mut self, kind: CellKind, source: &str, imports: &[Import]) -> &Cell {
        let cell = match kind {
            CellKind::Code => Cell::code(format!("{}{}", import_block(imports), source)),
            CellKind::Markdown => {
                if !imports.is_empty() {
                    debug!(
                        "[document] Ignoring {} import(s) on markdown cell",
                        imports.len()
                    );
                }
                Cell::markdown(source)
            }
        };
        self.cells.push(cell);
        &self.cells[self.cells.len() - 1]
    }

    pub fn push(&mut self, cell: Cell) {
        self.cells.push(cell);
    }

    /// Drop every cell. The artifact on disk is untouched until the next write.
    pub fn clear(&mut self) {
        self.cells.clear();
    }

    /// Build the nbformat v4 notebook for the current cell sequence.
    pub fn to_notebook(&self) -> Notebook {
        Notebook {
            metadata: Metadata {
                kernelspec: None,
                language_info: None,
                authors: None,
                additional: HashMap::new(),
            },
            nbformat: 4,
            nbformat_minor: 5,
            cells: self.cells.iter().map(cell_to_nbformat).collect(),
        }
    }

    /// Serialize to the nbformat JSON text.
    pub fn to_json(&self) -> Result<String> {
        let nb = nbformat::Notebook::V4(self.to_notebook());
        nbformat::serialize_notebook(&nb).map_err(|e| RenderError::Serialize(e.to_string()))
    }

    /// Write the artifact to `path`, replacing whatever was there.
    ///
    /// Returns only after the file is fully written and synced.
    pub fn serialize(&self, path: &Path) -> Result<()> {
        let content = self.to_json()?;
        write_atomic(path, content.as_bytes())?;
        info!(
            "[document] Wrote {} cell(s) to {}",
            self.cells.len(),
            path.display()
        );
        Ok(())
    }

    /// Read an existing notebook, upgrading v3 and older v4 minors.
    ///
    /// Raw cells have no counterpart here and are skipped.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let notebook = match nbformat::parse_notebook(&content)
            .map_err(|e| RenderError::Serialize(e.to_string()))?
        {
            nbformat::Notebook::V4(nb) => nb,
            nbformat::Notebook::Legacy(legacy) => nbformat::upgrade_legacy_notebook(legacy)
                .map_err(|e| RenderError::Serialize(e.to_string()))?,
            nbformat::Notebook::V3(v3) => nbformat::upgrade_v3_notebook(v3)
                .map_err(|e| RenderError::Serialize(e.to_string()))?,
        };

        let mut document = NotebookDocument::new();
        for cell in &notebook.cells {
            match cell {
                NbCell::Code { source, .. } => document.push(Cell::code(source.join(""))),
                NbCell::Markdown { source, .. } => document.push(Cell::markdown(source.join(""))),
                NbCell::Raw { id, .. } => {
                    warn!("[document] Skipping raw cell {} from {}", id, path.display());
                }
            }
        }
        Ok(document)
    }
}

fn cell_to_nbformat(cell: &Cell) -> NbCell {
    let id = CellId::from(Uuid::new_v4());
    let source = source_to_lines(cell.source());
    match cell.kind() {
        CellKind::Code => NbCell::Code {
            id,
            metadata: empty_cell_metadata(),
            execution_count: None,
            source,
            outputs: Vec::new(),
        },
        CellKind::Markdown => NbCell::Markdown {
            id,
            metadata: empty_cell_metadata(),
            source,
            attachments: None,
        },
    }
}

/// Split source into nbformat's line list, keeping the newlines.
fn source_to_lines(source: &str) -> Vec<String> {
    if source.is_empty() {
        return Vec::new();
    }
    source.split_inclusive('\n').map(|s| s.to_string()).collect()
}

fn empty_cell_metadata() -> CellMetadata {
    CellMetadata {
        id: None,
        collapsed: None,
        scrolled: None,
        deletable: None,
        editable: None,
        format: None,
        name: None,
        tags: None,
        jupyter: None,
        execution: None,
        additional: HashMap::new(),
    }
}

/// Write `bytes` to `path` via a synced temp file in the same directory.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir()?,
    };
    std::fs::create_dir_all(&dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_json(path: &Path) -> serde_json::Value {
        serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
    }

    #[test]
    fn test_import_injection_preserves_order() {
        let mut doc = NotebookDocument::new();
        let imports = vec![
            Import::symbols("alpha", ["x", "y"]),
            Import::module("beta"),
        ];

        let cell = doc.append_cell(CellKind::Code, "x + y", &imports);

        assert_eq!(cell.source(), "from alpha import x, y\nimport beta\nx + y");
    }

    #[test]
    fn test_import_injection_skipped_for_markdown() {
        let mut doc = NotebookDocument::new();
        let cell = doc.append_cell(CellKind::Markdown, "# Title", &[Import::module("os")]);
        assert_eq!(cell.source(), "# Title");
        assert_eq!(cell.kind(), CellKind::Markdown);
    }

    #[test]
    fn test_append_without_imports_keeps_source() {
        let mut doc = NotebookDocument::new();
        let cell = doc.append_cell(CellKind::Code, "print(1)", &[]);
        assert_eq!(cell.source(), "print(1)");
    }

    #[test]
    fn test_import_from_str() {
        let plain: Import = "numpy".parse().unwrap();
        assert_eq!(plain, Import::module("numpy"));

        let with_symbols: Import = "matplotlib: pyplot , cm".parse().unwrap();
        assert_eq!(with_symbols, Import::symbols("matplotlib", ["pyplot", "cm"]));

        assert!(":pyplot".parse::<Import>().is_err());
    }

    #[test]
    fn test_cell_kind_from_str() {
        assert_eq!("code".parse::<CellKind>().unwrap(), CellKind::Code);
        assert_eq!("Markdown".parse::<CellKind>().unwrap(), CellKind::Markdown);
        assert!("raw".parse::<CellKind>().is_err());
    }

    #[test]
    fn test_serialize_preserves_order_and_types() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("doc.ipynb");
        let mut doc = NotebookDocument::new();
        doc.append_cell(CellKind::Markdown, "# Report", &[]);
        doc.append_cell(CellKind::Code, "plot()\nshow()", &[Import::module("pylab")]);

        doc.serialize(&path).unwrap();

        let json = read_json(&path);
        assert_eq!(json["nbformat"], 4);
        let cells = json["cells"].as_array().unwrap();
        assert_eq!(cells.len(), 2);
        assert_eq!(cells[0]["cell_type"], "markdown");
        assert_eq!(cells[1]["cell_type"], "code");

        let source: String = cells[1]["source"]
            .as_array()
            .unwrap()
            .iter()
            .map(|line| line.as_str().unwrap())
            .collect();
        assert_eq!(source, "import pylab\nplot()\nshow()");
    }

    #[test]
    fn test_clear_then_serialize_writes_zero_cells() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("doc.ipynb");
        let mut doc = NotebookDocument::new();
        doc.append_cell(CellKind::Code, "a = 1", &[]);
        doc.serialize(&path).unwrap();

        doc.clear();
        assert!(doc.is_empty());
        doc.serialize(&path).unwrap();

        let json = read_json(&path);
        assert!(json["cells"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_serialize_overwrites_previous_artifact() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("doc.ipynb");
        std::fs::write(&path, "x".repeat(64 * 1024)).unwrap();

        let doc = NotebookDocument::new();
        doc.serialize(&path).unwrap();

        let json = read_json(&path);
        assert!(json["cells"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_serialize_creates_parent_dirs() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("deeper").join("doc.ipynb");

        NotebookDocument::new().serialize(&path).unwrap();

        assert!(path.exists());
    }

    #[test]
    fn test_load_from_reads_back_cells() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("doc.ipynb");
        let mut doc = NotebookDocument::new();
        doc.append_cell(CellKind::Code, "x = 1\ny = 2\n", &[]);
        doc.append_cell(CellKind::Markdown, "*note*", &[]);
        doc.serialize(&path).unwrap();

        let loaded = NotebookDocument::load_from(&path).unwrap();

        assert_eq!(loaded.cells(), doc.cells());
    }

    #[test]
    fn test_load_from_upgrades_v3_notebook() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("old.ipynb");
        let v3 = serde_json::json!({
            "nbformat": 3,
            "nbformat_minor": 0,
            "metadata": {},
            "worksheets": [{
                "metadata": {},
                "cells": [
                    {"cell_type": "heading", "level": 1, "metadata": {}, "source": ["Title"]},
                    {"cell_type": "code", "metadata": {}, "input": ["x = 1"], "outputs": []},
                    {"cell_type": "raw", "metadata": {}, "source": ["raw text"]}
                ]
            }]
        });
        std::fs::write(&path, v3.to_string()).unwrap();

        let loaded = NotebookDocument::load_from(&path).unwrap();

        assert_eq!(
            loaded.cells(),
            &[Cell::markdown("# Title"), Cell::code("x = 1")]
        );
    }

    #[test]
    fn test_load_from_rejects_garbage() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("bad.ipynb");
        std::fs::write(&path, "not a notebook").unwrap();

        assert!(matches!(
            NotebookDocument::load_from(&path),
            Err(RenderError::Serialize(_))
        ));
    }

    #[test]
    fn test_source_to_lines_preserves_trailing_newline() {
        let lines = source_to_lines("line1\nline2\n");
        assert_eq!(lines, vec!["line1\n", "line2\n"]);
        assert!(source_to_lines("").is_empty());
    }
}
