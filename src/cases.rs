//! Case discovery
//!
//! A run is given capture files, directories of captures and case lists.
//! Everything is flattened into one ordered list of trace paths.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{Error, Result};

pub const TRACE_EXTENSION: &str = "snoop";
pub const CASE_LIST_EXTENSION: &str = "cl";
pub const CASE_CONFIG_EXTENSION: &str = "toml";

/// Per trace overrides of the run numbers, read from `<trace stem>.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaseConfig {
    pub called_prefix: Option<String>,
    pub called: Option<String>,
    pub calling: Option<String>,
    pub redirect: Option<String>,
    pub reason: Option<String>,
}

impl CaseConfig {
    pub fn sidecar_path(trace: &Path) -> PathBuf {
        trace.with_extension(CASE_CONFIG_EXTENSION)
    }

    /// Missing sidecar means no overrides.
    pub fn load_for(trace: &Path) -> Result<Self> {
        let path = Self::sidecar_path(trace);
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(&path)?;
        toml::from_str(&contents)
            .map_err(|e| Error::parse(format!("Invalid case config {}: {}", path.display(), e)))
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Expands every input into trace files, keeping first-seen order.
pub fn resolve_cases<P: AsRef<Path>>(inputs: &[P]) -> Result<Vec<PathBuf>> {
    let mut resolver = Resolver::default();
    for input in inputs {
        resolver.visit(input.as_ref())?;
    }
    debug!("Resolved {} case(s)", resolver.cases.len());
    Ok(resolver.cases)
}

#[derive(Default)]
struct Resolver {
    cases: Vec<PathBuf>,
    seen: HashSet<PathBuf>,
    open_lists: Vec<PathBuf>,
}

impl Resolver {
    fn visit(&mut self, path: &Path) -> Result<()> {
        if path.is_dir() {
            return self.visit_dir(path);
        }
        if !path.exists() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("case {} does not exist", path.display()),
            )));
        }

        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case(CASE_LIST_EXTENSION) => self.visit_list(path),
            Some(ext) if ext.eq_ignore_ascii_case(TRACE_EXTENSION) => {
                self.push(path);
                Ok(())
            }
            _ => {
                warn!("{} is neither a trace nor a case list, skipped", path.display());
                Ok(())
            }
        }
    }

    fn visit_dir(&mut self, dir: &Path) -> Result<()> {
        let mut entries: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .collect();
        entries.sort();

        for entry in entries {
            if entry.is_dir() {
                self.visit_dir(&entry)?;
            } else if is_trace(&entry) {
                self.push(&entry);
            }
        }
        Ok(())
    }

    fn visit_list(&mut self, list: &Path) -> Result<()> {
        let canonical = fs::canonicalize(list)?;
        if self.open_lists.contains(&canonical) {
            return Err(Error::parse(format!(
                "case list {} includes itself",
                list.display()
            )));
        }

        let contents = fs::read_to_string(list)?;
        let base = list.parent().unwrap_or_else(|| Path::new("."));
        self.open_lists.push(canonical);
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let entry = Path::new(line);
            let entry = if entry.is_absolute() {
                entry.to_path_buf()
            } else {
                base.join(entry)
            };
            self.visit(&entry)?;
        }
        self.open_lists.pop();
        Ok(())
    }

    fn push(&mut self, trace: &Path) {
        let key = fs::canonicalize(trace).unwrap_or_else(|_| trace.to_path_buf());
        if self.seen.insert(key) {
            self.cases.push(trace.to_path_buf());
        }
    }
}

fn is_trace(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map_or(false, |ext| ext.eq_ignore_ascii_case(TRACE_EXTENSION))
}
