//! Advisory run manifests under `<state>/runs/<fingerprint>/`.
//!
//! Manifests record the outcome of the latest invocation per configuration
//! for `status`. Resume decisions never read them; checkpoints are the
//! source of truth.

use std::cmp::Reverse;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::config::{BuildConfiguration, Fingerprint};
use crate::fsutil::{now_utc_compact, write_json_atomic};
use crate::pipeline::Stage;

const RUN_MANIFEST_FILENAME: &str = "run-manifest.json";

/// Manifests kept by [`prune_old_runs`] after a successful run.
pub const RUN_RETENTION_COUNT: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Building,
    Success,
    Failed,
    Interrupted,
}

impl RunStatus {
    pub fn slug(self) -> &'static str {
        match self {
            RunStatus::Building => "building",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Interrupted => "interrupted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunManifest {
    pub fingerprint: Fingerprint,
    pub status: RunStatus,
    pub created_at_utc: String,
    pub finished_at_utc: Option<String>,
    pub preset: String,
    pub components: Vec<String>,
    pub last_completed: Option<Stage>,
    pub failed_stage: Option<Stage>,
    pub message: Option<String>,
    pub final_artifact: Option<PathBuf>,
    /// Directory holding this manifest; never taken from the file content.
    #[serde(skip)]
    pub run_dir: PathBuf,
}

pub fn runs_root(state_root: &Path) -> PathBuf {
    state_root.join("runs")
}

pub fn manifest_path(run_dir: &Path) -> PathBuf {
    run_dir.join(RUN_MANIFEST_FILENAME)
}

/// Writes the manifest for one invocation as it progresses.
#[derive(Debug)]
pub struct RunRecorder {
    path: PathBuf,
    manifest: RunManifest,
}

impl RunRecorder {
    /// Write a `building` manifest for `config`.
    pub fn begin(state_root: &Path, config: &BuildConfiguration) -> Result<Self> {
        let fingerprint = config.fingerprint();
        let run_dir = runs_root(state_root).join(fingerprint.as_str());
        let manifest = RunManifest {
            fingerprint,
            status: RunStatus::Building,
            created_at_utc: now_utc_compact(),
            finished_at_utc: None,
            preset: config.preset.slug().to_string(),
            components: config
                .components
                .enabled()
                .map(|c| c.slug().to_string())
                .collect(),
            last_completed: None,
            failed_stage: None,
            message: None,
            final_artifact: None,
            run_dir: run_dir.clone(),
        };
        let recorder = Self {
            path: manifest_path(&run_dir),
            manifest,
        };
        recorder.write()?;
        Ok(recorder)
    }

    pub fn manifest(&self) -> &RunManifest {
        &self.manifest
    }

    pub fn finish_success(
        &mut self,
        last_completed: Option<Stage>,
        final_artifact: Option<&Path>,
    ) -> Result<()> {
        self.manifest.status = RunStatus::Success;
        self.manifest.last_completed = last_completed;
        self.manifest.final_artifact = final_artifact.map(Path::to_path_buf);
        self.finish()
    }

    pub fn finish_failure(
        &mut self,
        status: RunStatus,
        last_completed: Option<Stage>,
        failed_stage: Option<Stage>,
        message: &str,
    ) -> Result<()> {
        self.manifest.status = status;
        self.manifest.last_completed = last_completed;
        self.manifest.failed_stage = failed_stage;
        self.manifest.message = Some(message.to_string());
        self.finish()
    }

    fn finish(&mut self) -> Result<()> {
        self.manifest.finished_at_utc = Some(now_utc_compact());
        self.write()
    }

    fn write(&self) -> Result<()> {
        write_json_atomic(&self.path, &self.manifest)
            .with_context(|| format!("writing run manifest '{}'", self.path.display()))
    }
}

/// Every readable manifest, newest first.
pub fn load_runs(runs_root: &Path) -> Result<Vec<RunManifest>> {
    if !runs_root.is_dir() {
        return Ok(Vec::new());
    }
    let mut runs = Vec::new();
    for entry in fs::read_dir(runs_root)
        .with_context(|| format!("reading runs directory '{}'", runs_root.display()))?
    {
        let entry = entry
            .with_context(|| format!("iterating runs directory '{}'", runs_root.display()))?;
        let run_dir = entry.path();
        if !run_dir.is_dir() {
            continue;
        }
        let Some(run_name) = run_dir.file_name().and_then(|part| part.to_str()) else {
            continue;
        };
        if run_name.starts_with('.') {
            continue;
        }
        let path = manifest_path(&run_dir);
        if !path.is_file() {
            continue;
        }
        let bytes =
            fs::read(&path).with_context(|| format!("reading run manifest '{}'", path.display()))?;
        match serde_json::from_slice::<RunManifest>(&bytes) {
            Ok(mut parsed) => {
                parsed.run_dir = run_dir;
                runs.push(parsed);
            }
            Err(e) => log::warn!("[runs] skipping unreadable manifest '{}': {e}", path.display()),
        }
    }
    runs.sort_by_key(|run| Reverse(run_sort_key(run)));
    Ok(runs)
}

/// Keep the `keep` newest manifests and delete the rest.
pub fn prune_old_runs(runs_root: &Path, keep: usize) -> Result<()> {
    for run in load_runs(runs_root)?.into_iter().skip(keep) {
        fs::remove_dir_all(&run.run_dir).with_context(|| {
            format!("removing expired run directory '{}'", run.run_dir.display())
        })?;
    }
    Ok(())
}

fn run_sort_key(run: &RunManifest) -> String {
    run.finished_at_utc
        .clone()
        .unwrap_or_else(|| run.created_at_utc.clone())
}
