//! Fingerprint-scoped checkpoint log.
//!
//! `<state>/checkpoints.jsonl` holds one JSON object per completed stage.
//! Records are only appended; [`CheckpointStore::invalidate_from`] is the
//! single path that removes any, by rewriting the log atomically.

use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::config::Fingerprint;
use crate::fsutil::{now_utc_compact, write_atomic};
use crate::pipeline::Stage;

pub const CHECKPOINT_FILENAME: &str = "checkpoints.jsonl";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub stage: Stage,
    pub fingerprint: Fingerprint,
    pub completed_at: String,
    /// Output the stage produced, for stages skipped on resume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<PathBuf>,
}

#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    entries: Vec<Checkpoint>,
}

impl CheckpointStore {
    pub fn path_in(state_root: &Path) -> PathBuf {
        state_root.join(CHECKPOINT_FILENAME)
    }

    /// Load the log. An absent or empty file means nothing has completed.
    pub fn open(path: &Path) -> Result<Self> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("reading checkpoint log '{}'", path.display()))
            }
        };

        let lines: Vec<&str> = raw.lines().filter(|l| !l.trim().is_empty()).collect();
        let mut entries = Vec::with_capacity(lines.len());
        let mut torn = false;
        for (idx, line) in lines.iter().enumerate() {
            match serde_json::from_str::<Checkpoint>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) if idx + 1 == lines.len() => {
                    log::warn!(
                        "[checkpoint] ignoring incomplete trailing record in '{}': {e}",
                        path.display()
                    );
                    torn = true;
                }
                Err(e) => bail!(
                    "checkpoint log '{}' is corrupt at record {}: {e}",
                    path.display(),
                    idx + 1
                ),
            }
        }

        let store = Self {
            path: path.to_path_buf(),
            entries,
        };
        if torn {
            store.rewrite()?;
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append and fsync a record for `stage`.
    pub fn record(
        &mut self,
        stage: Stage,
        fingerprint: &Fingerprint,
        artifact: Option<&Path>,
    ) -> Result<Checkpoint> {
        let entry = Checkpoint {
            stage,
            fingerprint: fingerprint.clone(),
            completed_at: now_utc_compact(),
            artifact: artifact.map(Path::to_path_buf),
        };
        let mut line = serde_json::to_string(&entry).context("serializing checkpoint")?;
        line.push('\n');

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating '{}'", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening checkpoint log '{}'", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("appending to '{}'", self.path.display()))?;
        file.sync_data()
            .with_context(|| format!("syncing '{}'", self.path.display()))?;

        self.entries.push(entry.clone());
        Ok(entry)
    }

    pub fn has(&self, stage: Stage, fingerprint: &Fingerprint) -> bool {
        self.get(stage, fingerprint).is_some()
    }

    /// Most recent record for `stage` under `fingerprint`.
    pub fn get(&self, stage: Stage, fingerprint: &Fingerprint) -> Option<&Checkpoint> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.stage == stage && &e.fingerprint == fingerprint)
    }

    /// Stages completed under `fingerprint`, in pipeline order.
    pub fn completed(&self, fingerprint: &Fingerprint) -> Vec<Stage> {
        self.entries
            .iter()
            .filter(|e| &e.fingerprint == fingerprint)
            .map(|e| e.stage)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn fingerprints(&self) -> BTreeSet<&Fingerprint> {
        self.entries.iter().map(|e| &e.fingerprint).collect()
    }

    /// Drop every record for `fingerprint`. Returns how many were removed.
    pub fn invalidate(&mut self, fingerprint: &Fingerprint) -> Result<usize> {
        self.invalidate_from(fingerprint, Stage::Fetch)
    }

    /// Drop the checkpoints of `from` and every later stage for `fingerprint`.
    pub fn invalidate_from(&mut self, fingerprint: &Fingerprint, from: Stage) -> Result<usize> {
        let before = self.entries.len();
        self.entries
            .retain(|e| &e.fingerprint != fingerprint || e.stage < from);
        let removed = before - self.entries.len();
        if removed > 0 {
            self.rewrite()?;
        }
        Ok(removed)
    }

    fn rewrite(&self) -> Result<()> {
        let mut payload = String::new();
        for entry in &self.entries {
            payload.push_str(&serde_json::to_string(entry).context("serializing checkpoint")?);
            payload.push('\n');
        }
        write_atomic(&self.path, payload.as_bytes())
            .with_context(|| format!("rewriting checkpoint log '{}'", self.path.display()))
    }
}
