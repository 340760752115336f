//! Hierarchical JSONL writer.
//!
//! Maps `(area, resource type)` to a deterministic file path under the
//! output root, creates directories on demand, and appends one compact JSON
//! document per LF-terminated line. Append mode means a resumed crawl
//! extends files and never truncates them.

use std::fs::OpenOptions;
use std::io::{BufWriter, Write as _};
use std::path::{Path, PathBuf};

use chrono::Utc;
use log::trace;
use serde_json::{Value, json};

use crate::config::{FileNaming, OutputConfig};
use crate::error::{CrawlError, Result};
use crate::models::Area;

/// Sanitize one path component: forbidden characters and whitespace become
/// `_`, trailing dots are stripped, and the result is lowercased.
pub fn sanitize_component(component: &str) -> String {
    let replaced: String = component
        .chars()
        .map(|c| {
            if matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*') || c.is_whitespace()
            {
                '_'
            } else {
                c
            }
        })
        .collect();
    replaced.trim_end_matches('.').to_lowercase()
}

/// Normalize a resource type into a file stem.
///
/// Word boundaries are camelCase humps and `_`/`-`/space separators, so
/// `jobArtifacts` becomes `job_artifacts`, `job-artifacts`, or
/// `jobartifacts` depending on the configured style.
pub fn file_stem(resource_type: &str, naming: FileNaming) -> String {
    let mut words: Vec<String> = Vec::new();
    let mut current = String::new();
    for c in resource_type.chars() {
        if matches!(c, '_' | '-' | ' ') {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
        } else if c.is_uppercase() {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            current.extend(c.to_lowercase());
        } else {
            current.push(c);
        }
    }
    if !current.is_empty() {
        words.push(current);
    }
    let separator = match naming {
        FileNaming::Lowercase => "",
        FileNaming::KebabCase => "-",
        FileNaming::SnakeCase => "_",
    };
    words.join(separator)
}

/// Appends records to the JSONL tree rooted at `output.rootDir`.
pub struct HierarchicalWriter {
    root: PathBuf,
    hierarchical: bool,
    naming: FileNaming,
    write_index: bool,
    pretty_index: bool,
}

impl HierarchicalWriter {
    pub fn new(config: &OutputConfig) -> Self {
        Self {
            root: config.root_dir.clone(),
            hierarchical: config.hierarchical,
            naming: config.file_naming,
            write_index: config.write_index,
            pretty_index: config.pretty_print,
        }
    }

    fn area_dir(&self, area: Option<&Area>) -> PathBuf {
        let mut dir = self.root.clone();
        if self.hierarchical
            && let Some(area) = area
        {
            for component in area.full_path.split('/') {
                dir.push(sanitize_component(component));
            }
        }
        dir
    }

    /// Path for a plain resource-type file, e.g. `<area>/issues.jsonl`.
    pub fn resource_path(&self, area: Option<&Area>, resource_type: &str) -> PathBuf {
        let mut path = self.area_dir(area);
        path.push(format!("{}.jsonl", file_stem(resource_type, self.naming)));
        path
    }

    /// Path for a file nested under logical directories, e.g.
    /// `<area>/repository/branches/<branch>/commits.jsonl`. Directory
    /// components are sanitized; the stem is taken literally.
    pub fn nested_path(&self, area: Option<&Area>, dirs: &[&str], stem: &str) -> PathBuf {
        let mut path = self.area_dir(area);
        for dir in dirs {
            path.push(sanitize_component(dir));
        }
        path.push(format!("{stem}.jsonl"));
        path
    }

    /// Stem for a resource type under the configured naming style.
    pub fn stem(&self, resource_type: &str) -> String {
        file_stem(resource_type, self.naming)
    }

    /// Append records to `path`, one compact JSON document per line.
    ///
    /// Records are always compact regardless of `prettyPrint`: a
    /// multi-line document would no longer be JSONL.
    pub fn append_records(&self, path: &Path, records: &[Value]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let write_err = |source: std::io::Error| CrawlError::Write {
            path: path.to_owned(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(write_err)?;
        let mut out = BufWriter::new(file);
        for record in records {
            let line = serde_json::to_string(record)?;
            out.write_all(line.as_bytes()).map_err(write_err)?;
            out.write_all(b"\n").map_err(write_err)?;
        }
        out.flush().map_err(write_err)?;
        trace!("appended {} records to {}", records.len(), path.display());
        Ok(())
    }

    /// Write the optional per-area `index.json`.
    pub fn write_area_index(&self, area: &Area, metadata: Value) -> Result<()> {
        if !self.write_index {
            return Ok(());
        }
        let dir = self.area_dir(Some(area));
        let path = dir.join("index.json");
        let write_err = |source: std::io::Error| CrawlError::Write {
            path: path.clone(),
            source,
        };
        std::fs::create_dir_all(&dir).map_err(write_err)?;
        let index = json!({
            "area": area,
            "metadata": metadata,
            "createdAt": Utc::now(),
        });
        let body = if self.pretty_index {
            serde_json::to_vec_pretty(&index)?
        } else {
            serde_json::to_vec(&index)?
        };
        std::fs::write(&path, body).map_err(write_err)?;
        Ok(())
    }
}
