//! Durable stage-completion ledger.
//!
//! One zero-byte marker file per completed stage, named by the stage
//! identifier, under a fixed directory. A missing directory means no stage
//! has completed yet.
//!
//! Markers are created by writing a hidden temporary file, syncing it, and
//! renaming it into place, so a crash mid-write can never leave something
//! that reads as a completed stage.

use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
#[cfg(test)]
use mockall::automock;
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// Prefix for in-flight marker files; never interpreted as a completed stage
const TEMP_PREFIX: &str = ".";

/// A completed stage and when it completed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StageMarker {
    /// Stage identifier
    pub stage: String,
    /// When the marker was written
    pub completed_at: DateTime<Utc>,
}

/// Idempotency ledger consulted before every stage.
#[cfg_attr(test, automock)]
pub trait StateStore: Send + Sync {
    /// Whether `stage` has a completion marker
    fn is_complete(&self, stage: &str) -> bool;

    /// Durably record `stage` as complete.
    ///
    /// Failure is fatal to the pipeline: the stage cannot be considered
    /// complete if its marker did not reach disk.
    fn mark_complete(&self, stage: &str) -> Result<()>;

    /// All completion markers, in no particular order
    fn completed(&self) -> Result<Vec<StageMarker>>;

    /// Remove every marker. Only used for testing and rebuilds.
    fn reset(&self) -> Result<()>;
}

/// [`StateStore`] backed by marker files in a directory.
#[derive(Clone, Debug)]
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    /// Create a store rooted at `dir`. The directory is created lazily.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the markers
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn marker_path(&self, stage: &str) -> PathBuf {
        self.dir.join(stage)
    }

    fn write_marker(&self, stage: &str) -> std::io::Result<()> {
        fs::create_dir_all(&self.dir)?;

        let tmp = self
            .dir
            .join(format!("{TEMP_PREFIX}{stage}.tmp-{}", std::process::id()));
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        file.sync_all()?;
        drop(file);

        if let Err(e) = fs::rename(&tmp, self.marker_path(stage)) {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }

        // Persist the rename itself
        File::open(&self.dir)?.sync_all()
    }
}

/// Stage names double as file names, so keep them boring.
fn validate_stage_name(stage: &str) -> Result<()> {
    let valid = !stage.is_empty()
        && !stage.starts_with(TEMP_PREFIX)
        && stage
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(Error::configuration(format!(
            "invalid stage identifier {stage:?}: use [A-Za-z0-9._-] and no leading dot"
        )))
    }
}

impl StateStore for FileStateStore {
    fn is_complete(&self, stage: &str) -> bool {
        if validate_stage_name(stage).is_err() {
            return false;
        }
        match fs::metadata(self.marker_path(stage)) {
            Ok(meta) => meta.is_file(),
            Err(e) if e.kind() == IoErrorKind::NotFound => false,
            Err(e) => {
                warn!(stage = %stage, error = %e, "Unable to read stage marker, treating as incomplete");
                false
            }
        }
    }

    fn mark_complete(&self, stage: &str) -> Result<()> {
        validate_stage_name(stage)?;
        self.write_marker(stage).map_err(|source| Error::StateStore {
            stage: stage.to_string(),
            source,
        })?;
        debug!(stage = %stage, dir = %self.dir.display(), "Stage marker written");
        Ok(())
    }

    fn completed(&self) -> Result<Vec<StageMarker>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(Error::fatal(
                    "state_store",
                    format!("failed to read {}: {e}", self.dir.display()),
                ))
            }
        };

        let mut markers = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(TEMP_PREFIX) {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            if !meta.is_file() {
                continue;
            }
            let completed_at = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            markers.push(StageMarker {
                stage: name,
                completed_at,
            });
        }
        Ok(markers)
    }

    fn reset(&self) -> Result<()> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => {
                info!(dir = %self.dir.display(), "State store reset");
                Ok(())
            }
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::fatal(
                "state_store",
                format!("failed to reset {}: {e}", self.dir.display()),
            )),
        }
    }
}
