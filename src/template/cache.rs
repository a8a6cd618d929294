//! On-disk cache of parsed traces
//!
//! Every trace gets two artifacts next to each other under the cache
//! directory: `<name>.cif` holding [`CaseInformation`] and `<name>.dpl`
//! holding the dialogs. Both are JSON.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use crc::{Crc, CRC_32_ISO_HDLC};
use tracing::{debug, info};

use super::model::{CaseInformation, CaseTemplate, Dialog, FileStamp};
use super::segmenter::segment;
use crate::capture::SnoopReader;
use crate::config::ReplayConfig;
use crate::{Error, Result};

/// Bumped whenever the cached layout changes
pub const CIF_VERSION: u32 = 3;

pub const INFO_EXTENSION: &str = "cif";
pub const DIALOGS_EXTENSION: &str = "dpl";

const DIALOGS_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Anything that can hand out parsed templates by trace path.
pub trait TemplateSource: Send + Sync {
    fn load(&self, trace: &Path) -> Result<CaseTemplate>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePaths {
    pub info: PathBuf,
    pub dialogs: PathBuf,
}

/// Outcome of [`CaseCache::prepare`]
#[derive(Debug, Clone)]
pub struct PreparedCase {
    pub trace: PathBuf,
    pub info: CaseInformation,
    pub reused: bool,
}

#[derive(Debug, Clone)]
pub struct CaseCache {
    case_dir: PathBuf,
    cache_dir: PathBuf,
    signaling_ports: Vec<u16>,
}

impl CaseCache {
    pub fn new<P: Into<PathBuf>, Q: Into<PathBuf>>(case_dir: P, cache_dir: Q, signaling_ports: Vec<u16>) -> Self {
        Self {
            case_dir: case_dir.into(),
            cache_dir: cache_dir.into(),
            signaling_ports,
        }
    }

    pub fn from_config(config: &ReplayConfig) -> Self {
        Self::new(
            config.paths.case_dir.clone(),
            config.paths.cache_dir.clone(),
            config.sip.capture_ports.clone(),
        )
    }

    /// Maps `case/dir/x.snoop` to `cache/dir/x.{cif,dpl}`.
    pub fn paths_for(&self, trace: &Path) -> CachePaths {
        let relative = trace
            .strip_prefix(&self.case_dir)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| {
                trace
                    .components()
                    .filter(|c| matches!(c, Component::Normal(_)))
                    .collect()
            });
        let base = self.cache_dir.join(relative);
        CachePaths {
            info: base.with_extension(INFO_EXTENSION),
            dialogs: base.with_extension(DIALOGS_EXTENSION),
        }
    }

    /// Makes sure a current cache exists for `trace`, parsing it when needed.
    pub fn prepare(&self, trace: &Path, force: bool) -> Result<PreparedCase> {
        let paths = self.paths_for(trace);

        if !force {
            match self.cached_info_if_fresh(trace, &paths) {
                Ok(Some(info)) => {
                    debug!("Reusing cache for {}", trace.display());
                    return Ok(PreparedCase {
                        trace: trace.to_path_buf(),
                        info,
                        reused: true,
                    });
                }
                Ok(None) => debug!("Cache for {} is stale", trace.display()),
                Err(e) => debug!("Cache for {} unusable: {}", trace.display(), e),
            }
        }

        info!("Parsing {}", trace.display());
        let template = self.parse_trace(trace)?;
        let info = self.store(&paths, &template.dialogs, template.info)?;
        Ok(PreparedCase {
            trace: trace.to_path_buf(),
            info,
            reused: false,
        })
    }

    /// Parses the trace without touching the cache.
    pub fn parse_trace(&self, trace: &Path) -> Result<CaseTemplate> {
        let metadata = fs::metadata(trace)?;
        let datagrams = SnoopReader::open(trace)?.read_datagrams(&self.signaling_ports)?;
        let trace_name = trace.display().to_string();
        let dialogs = segment(trace_name, &datagrams)?;

        let info = CaseInformation {
            format_version: CIF_VERSION,
            trace: trace.to_path_buf(),
            trace_modified: FileStamp::from(metadata.modified()?),
            trace_size: metadata.len(),
            created: FileStamp::from(SystemTime::now()),
            dialog_numbers: dialogs.iter().map(|d| d.numbers.clone()).collect(),
            dialogs_crc: 0,
        };
        Ok(CaseTemplate { info, dialogs })
    }

    fn store(&self, paths: &CachePaths, dialogs: &[Dialog], mut info: CaseInformation) -> Result<CaseInformation> {
        if let Some(parent) = paths.dialogs.parent() {
            fs::create_dir_all(parent)?;
        }

        let blob = serde_json::to_vec(dialogs)?;
        info.dialogs_crc = DIALOGS_CRC.checksum(&blob);

        // Dialogs first: a half written pair then fails the CRC check
        fs::write(&paths.dialogs, &blob)?;
        fs::write(&paths.info, serde_json::to_vec_pretty(&info)?)?;
        Ok(info)
    }

    fn cached_info_if_fresh(&self, trace: &Path, paths: &CachePaths) -> Result<Option<CaseInformation>> {
        if !paths.info.exists() || !paths.dialogs.exists() {
            return Ok(None);
        }
        let info = read_info(&paths.info)?;
        let metadata = fs::metadata(trace)?;

        let fresh = info.format_version == CIF_VERSION
            && info.trace_modified == FileStamp::from(metadata.modified()?)
            && info.trace_size == metadata.len()
            && DIALOGS_CRC.checksum(&fs::read(&paths.dialogs)?) == info.dialogs_crc;
        Ok(fresh.then_some(info))
    }
}

impl TemplateSource for CaseCache {
    fn load(&self, trace: &Path) -> Result<CaseTemplate> {
        let paths = self.paths_for(trace);
        let info = read_info(&paths.info)?;
        let blob = fs::read(&paths.dialogs)?;
        if DIALOGS_CRC.checksum(&blob) != info.dialogs_crc {
            return Err(Error::format(format!(
                "cached dialogs of {} fail their checksum",
                trace.display()
            )));
        }
        let dialogs: Vec<Dialog> = serde_json::from_slice(&blob)?;
        Ok(CaseTemplate { info, dialogs })
    }
}

fn read_info(path: &Path) -> Result<CaseInformation> {
    let text = fs::read(path)?;
    Ok(serde_json::from_slice(&text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::CallTrace;
    use tempfile::TempDir;

    fn setup() -> (TempDir, CaseCache, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let case_dir = dir.path().join("case");
        fs::create_dir_all(case_dir.join("menu")).unwrap();
        let trace = case_dir.join("menu").join("welcome.snoop");
        fs::write(&trace, CallTrace::new().build()).unwrap();
        let cache = CaseCache::new(&case_dir, dir.path().join("cache"), vec![5060, 5061]);
        (dir, cache, trace)
    }

    fn edit_info(cache: &CaseCache, trace: &Path, edit: impl FnOnce(&mut CaseInformation)) {
        let paths = cache.paths_for(trace);
        let mut info = read_info(&paths.info).unwrap();
        edit(&mut info);
        fs::write(&paths.info, serde_json::to_vec(&info).unwrap()).unwrap();
    }

    #[test]
    fn test_paths_mirror_case_directory() {
        let cache = CaseCache::new("case", "cache", vec![5060]);
        let paths = cache.paths_for(Path::new("case/menu/welcome.snoop"));
        assert_eq!(paths.info, PathBuf::from("cache/menu/welcome.cif"));
        assert_eq!(paths.dialogs, PathBuf::from("cache/menu/welcome.dpl"));

        let outside = cache.paths_for(Path::new("/traces/a.snoop"));
        assert_eq!(outside.info, PathBuf::from("cache/traces/a.cif"));
    }

    #[test]
    fn test_cache_round_trip_is_lossless() {
        let (_dir, cache, trace) = setup();
        let direct = cache.parse_trace(&trace).unwrap();
        let prepared = cache.prepare(&trace, false).unwrap();
        assert!(!prepared.reused);

        let loaded = cache.load(&trace).unwrap();
        assert_eq!(loaded.dialogs, direct.dialogs);
        assert_eq!(loaded.info.dialog_numbers, direct.info.dialog_numbers);
        assert_eq!(loaded.info.trace_size, direct.info.trace_size);
    }

    #[test]
    fn test_unchanged_trace_reuses_cache() {
        let (_dir, cache, trace) = setup();
        assert!(!cache.prepare(&trace, false).unwrap().reused);
        assert!(cache.prepare(&trace, false).unwrap().reused);
        assert!(!cache.prepare(&trace, true).unwrap().reused);
    }

    #[test]
    fn test_any_mismatch_forces_reparse() {
        let (_dir, cache, trace) = setup();
        cache.prepare(&trace, false).unwrap();

        edit_info(&cache, &trace, |info| info.format_version = CIF_VERSION - 1);
        assert!(!cache.prepare(&trace, false).unwrap().reused);

        edit_info(&cache, &trace, |info| info.trace_modified.secs += 1);
        assert!(!cache.prepare(&trace, false).unwrap().reused);

        edit_info(&cache, &trace, |info| info.trace_size += 1);
        assert!(!cache.prepare(&trace, false).unwrap().reused);

        // Rewritten each time, so the last one is current again
        assert!(cache.prepare(&trace, false).unwrap().reused);
    }

    #[test]
    fn test_corrupted_dialogs_are_detected() {
        let (_dir, cache, trace) = setup();
        cache.prepare(&trace, false).unwrap();
        let paths = cache.paths_for(&trace);
        let mut blob = fs::read(&paths.dialogs).unwrap();
        blob.push(b' ');
        fs::write(&paths.dialogs, blob).unwrap();

        assert!(matches!(cache.load(&trace), Err(Error::Format(_))));
        assert!(!cache.prepare(&trace, false).unwrap().reused);
        assert!(cache.load(&trace).is_ok());
    }

    #[test]
    fn test_bad_trace_is_format_error() {
        let (dir, cache, _trace) = setup();
        let bad = dir.path().join("case").join("bad.snoop");
        fs::write(&bad, b"not a capture at all").unwrap();
        let err = cache.prepare(&bad, false).unwrap_err();
        assert!(err.is_fatal_for_trace());
    }
}
