//! Checkpointed stage pipeline.
//!
//! Stages run strictly in ordinal order. A stage is checkpointed only after
//! its collaborator reports success, so an interrupted or failed invocation
//! resumes at the first stage that has no checkpoint for the current
//! fingerprint.

pub mod layout;
pub mod stage;
pub mod toolchain;

use std::fmt;
use std::path::{Path, PathBuf};

pub use stage::{Idempotency, Stage};

use crate::artifact::{self, Compressor, FinalArtifact};
use crate::checkpoint::CheckpointStore;
use crate::config::{BuildConfiguration, Fingerprint, RestartMode};
use crate::error::{FetchError, PipelineError, StageError};
use crate::fsutil::write_atomic;
use crate::interrupt::Interrupt;
use crate::kconfig::EffectiveConfig;
use crate::resources::ResourceProfile;

use self::layout::WorkLayout;
use self::toolchain::{StageContext, Toolchain};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Pending,
    Running,
    Completed,
    /// Satisfied by a checkpoint from an earlier invocation.
    Skipped,
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StageState::Pending => "pending",
            StageState::Running => "running",
            StageState::Completed => "completed",
            StageState::Skipped => "skipped",
        })
    }
}

/// Which stages an invocation asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageSelection {
    /// Every stage without a checkpoint.
    All,
    /// Re-run one stage once its prerequisites are checkpointed.
    Only(Stage),
}

#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub fingerprint: Fingerprint,
    pub states: Vec<(Stage, StageState)>,
    pub final_artifact: Option<FinalArtifact>,
}

impl PipelineReport {
    pub fn state(&self, stage: Stage) -> StageState {
        self.states
            .iter()
            .find(|(s, _)| *s == stage)
            .map(|(_, state)| *state)
            .unwrap_or(StageState::Pending)
    }

    /// Stages that actually ran in this invocation.
    pub fn executed(&self) -> Vec<Stage> {
        self.states
            .iter()
            .filter(|(_, state)| *state == StageState::Completed)
            .map(|(stage, _)| *stage)
            .collect()
    }

    pub fn last_completed(&self) -> Option<Stage> {
        self.states
            .iter()
            .filter(|(_, state)| matches!(state, StageState::Completed | StageState::Skipped))
            .map(|(stage, _)| *stage)
            .max()
    }
}

/// One invocation's view of the build.
pub struct Pipeline<'a> {
    config: &'a BuildConfiguration,
    fingerprint: Fingerprint,
    effective: &'a EffectiveConfig,
    resources: &'a ResourceProfile,
    layout: &'a WorkLayout,
    store: &'a mut CheckpointStore,
    toolchain: &'a mut dyn Toolchain,
    compressor: &'a dyn Compressor,
    interrupt: Interrupt,
    restart: RestartMode,
    states: Vec<(Stage, StageState)>,
    raw_artifact: Option<PathBuf>,
    final_artifact: Option<FinalArtifact>,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        config: &'a BuildConfiguration,
        effective: &'a EffectiveConfig,
        resources: &'a ResourceProfile,
        layout: &'a WorkLayout,
        store: &'a mut CheckpointStore,
        toolchain: &'a mut dyn Toolchain,
        compressor: &'a dyn Compressor,
    ) -> Self {
        Self {
            config,
            fingerprint: config.fingerprint(),
            effective,
            resources,
            layout,
            store,
            toolchain,
            compressor,
            interrupt: Interrupt::new(),
            restart: RestartMode::Resume,
            states: Stage::ALL
                .into_iter()
                .map(|stage| (stage, StageState::Pending))
                .collect(),
            raw_artifact: None,
            final_artifact: None,
        }
    }

    pub fn interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn restart(mut self, restart: RestartMode) -> Self {
        self.restart = restart;
        self
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn run(&mut self, selection: StageSelection) -> Result<PipelineReport, PipelineError> {
        let targets: Vec<Stage> = match selection {
            StageSelection::All => Stage::ALL.to_vec(),
            StageSelection::Only(stage) => {
                for prerequisite in stage.prerequisites() {
                    if !self.store.has(prerequisite, &self.fingerprint) {
                        return Err(PipelineError::PrerequisiteMissing {
                            stage,
                            missing: prerequisite,
                        });
                    }
                    self.set_state(prerequisite, StageState::Skipped);
                }
                vec![stage]
            }
        };

        if self.restart == RestartMode::Clean {
            // A single-stage clean restart keeps the checkpoints it depends on.
            let from = match selection {
                StageSelection::All => Stage::Fetch,
                StageSelection::Only(stage) => stage,
            };
            let removed = self
                .store
                .invalidate_from(&self.fingerprint, from)
                .map_err(PipelineError::Store)?;
            log::info!(
                "[pipeline] clean restart: dropped {removed} checkpoint(s) from {from} on for {}",
                self.fingerprint.short()
            );
        }

        for stage in targets {
            if selection == StageSelection::All && self.store.has(stage, &self.fingerprint) {
                log::info!(
                    "[stage:{stage}] checkpointed for {}, skipping",
                    self.fingerprint.short()
                );
                self.set_state(stage, StageState::Skipped);
                continue;
            }
            if self.interrupt.is_set() {
                return Err(PipelineError::Interrupted { stage });
            }

            self.set_state(stage, StageState::Running);
            log::info!("[stage:{stage}] starting ({}/{})", stage.ordinal(), Stage::ALL.len());
            match self.attempt(stage) {
                Ok(_) if self.interrupt.is_set() => {
                    self.set_state(stage, StageState::Pending);
                    return Err(PipelineError::Interrupted { stage });
                }
                Ok(artifact) => {
                    self.store
                        .record(stage, &self.fingerprint, artifact.as_deref())
                        .map_err(PipelineError::Store)?;
                    self.set_state(stage, StageState::Completed);
                    log::info!("[stage:{stage}] completed");
                }
                Err(source) => {
                    self.set_state(stage, StageState::Pending);
                    if self.interrupt.is_set() {
                        return Err(PipelineError::Interrupted { stage });
                    }
                    return Err(PipelineError::StageFailed {
                        stage,
                        last_completed: stage.previous(),
                        source,
                    });
                }
            }
        }

        Ok(PipelineReport {
            fingerprint: self.fingerprint.clone(),
            states: self.states.clone(),
            final_artifact: self.final_artifact.clone(),
        })
    }

    fn set_state(&mut self, stage: Stage, state: StageState) {
        if let Some(entry) = self.states.iter_mut().find(|(s, _)| *s == stage) {
            entry.1 = state;
        }
    }

    /// Run `stage` with its retry policy.
    fn attempt(&mut self, stage: Stage) -> Result<Option<PathBuf>, StageError> {
        let attempts = match stage.idempotency() {
            Idempotency::SafeToRerun => 2,
            Idempotency::RequiresCleanup => 1,
        };
        let mut attempt = 1;
        loop {
            match self.execute(stage) {
                Ok(artifact) => return Ok(artifact),
                Err(e) if attempt < attempts && !self.interrupt.is_set() => {
                    log::warn!("[stage:{stage}] {e}; retrying once");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One collaborator call. Returns the path the stage produced.
    fn execute(&mut self, stage: Stage) -> Result<Option<PathBuf>, StageError> {
        let ctx = StageContext {
            config: self.config,
            fingerprint: &self.fingerprint,
            effective: self.effective,
            resources: self.resources,
            layout: self.layout,
            interrupt: &self.interrupt,
        };

        if stage.idempotency() == Idempotency::RequiresCleanup {
            self.toolchain.cleanup(stage, &ctx)?;
        }

        match stage {
            Stage::Fetch => {
                let sources = self
                    .toolchain
                    .fetch(&ctx)
                    .and_then(|path| {
                        if path.exists() {
                            Ok(path)
                        } else {
                            Err(FetchError::MissingArtifact { path })
                        }
                    })
                    .map_err(|e| StageError::new(stage, e.to_string()))?;
                Ok(Some(sources))
            }
            Stage::Install => {
                let target = self.layout.rootfs_dir();
                self.toolchain.install(&ctx, &target)?;
                Ok(Some(target))
            }
            Stage::Configure => {
                let path = self.layout.effective_config();
                write_atomic(&path, self.effective.render().as_bytes())
                    .map_err(|e| StageError::new(stage, format!("{e:#}")))?;
                for report in &self.effective.reports {
                    log::debug!("[stage:{stage}] {report}");
                }
                self.toolchain.configure(&ctx, &path)?;
                Ok(Some(path))
            }
            Stage::Compile => {
                let raw = self.toolchain.compile(&ctx)?;
                if !raw.is_file() {
                    return Err(StageError::new(
                        stage,
                        format!("compile reported success but '{}' is missing", raw.display()),
                    ));
                }
                self.raw_artifact = Some(raw.clone());
                Ok(Some(raw))
            }
            Stage::Finalize => {
                let raw = self.raw_input();
                let output = self.layout.final_artifact();
                let result = artifact::finalize(
                    &raw,
                    &output,
                    &self.config.compression,
                    self.compressor,
                )
                .map_err(|e| StageError::new(stage, e.to_string()))?;
                log::info!(
                    "[stage:{stage}] {} ({} bytes, sha256 {})",
                    result.path.display(),
                    result.size,
                    result.sha256
                );
                let path = result.path.clone();
                self.final_artifact = Some(result);
                Ok(Some(path))
            }
        }
    }

    /// Raw image from this run, else the compile checkpoint, else the layout default.
    fn raw_input(&self) -> PathBuf {
        if let Some(raw) = &self.raw_artifact {
            return raw.clone();
        }
        self.store
            .get(Stage::Compile, &self.fingerprint)
            .and_then(|checkpoint| checkpoint.artifact.clone())
            .filter(|path| path.is_file())
            .unwrap_or_else(|| self.layout.raw_artifact())
    }
}

/// Describe which stages an invocation would run, without running any.
pub fn planned_stages(
    store: &CheckpointStore,
    fingerprint: &Fingerprint,
    selection: StageSelection,
    restart: RestartMode,
) -> Vec<(Stage, StageState)> {
    Stage::ALL
        .into_iter()
        .map(|stage| {
            let kept = match selection {
                StageSelection::All => restart == RestartMode::Resume,
                StageSelection::Only(only) => restart == RestartMode::Resume || stage < only,
            };
            let checkpointed = kept && store.has(stage, fingerprint);
            let state = match selection {
                StageSelection::All if checkpointed => StageState::Skipped,
                StageSelection::All => StageState::Pending,
                StageSelection::Only(only) if stage == only => StageState::Pending,
                StageSelection::Only(only) if stage < only && checkpointed => StageState::Skipped,
                StageSelection::Only(_) => StageState::Pending,
            };
            (stage, state)
        })
        .collect()
}

/// Convenience for callers that only hold a state root.
pub fn open_store(state_root: &Path) -> anyhow::Result<CheckpointStore> {
    CheckpointStore::open(&CheckpointStore::path_in(state_root))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{resolve, CompressionTool};
    use crate::error::FinalizeError;
    use crate::kconfig::{merge, ConfigDocument, ConfigOverlay, OverlaySource};
    use crate::resources::{plan, ExecutionContext, ResourceSnapshot};
    use std::collections::BTreeMap;
    use std::fs;
    use tempfile::TempDir;

    /// Records calls and fails on demand.
    #[derive(Default)]
    struct FakeToolchain {
        calls: Vec<String>,
        failures: BTreeMap<Stage, usize>,
        interrupt_during: Option<Stage>,
        /// Raise the flag but still report success, like a hook that traps SIGINT.
        interrupt_after: Option<Stage>,
    }

    impl FakeToolchain {
        fn failing(stage: Stage, times: usize) -> Self {
            let mut toolchain = Self::default();
            toolchain.failures.insert(stage, times);
            toolchain
        }

        fn step(&mut self, stage: Stage, ctx: &StageContext<'_>) -> Result<(), StageError> {
            self.calls.push(stage.name().to_string());
            if self.interrupt_during == Some(stage) {
                ctx.interrupt.trigger();
                return Err(StageError::new(stage, "killed"));
            }
            if self.interrupt_after == Some(stage) {
                ctx.interrupt.trigger();
            }
            if let Some(left) = self.failures.get_mut(&stage) {
                if *left > 0 {
                    *left -= 1;
                    return Err(StageError::new(stage, "collaborator exited with status 1"));
                }
            }
            Ok(())
        }
    }

    impl Toolchain for FakeToolchain {
        fn fetch(&mut self, ctx: &StageContext<'_>) -> Result<PathBuf, FetchError> {
            self.step(Stage::Fetch, ctx)
                .map_err(|e| FetchError::Exhausted(e.to_string()))?;
            Ok(ctx.layout.sources_dir())
        }

        fn install(&mut self, ctx: &StageContext<'_>, target: &Path) -> Result<(), StageError> {
            self.step(Stage::Install, ctx)?;
            fs::write(target.join("marker"), b"installed").unwrap();
            Ok(())
        }

        fn configure(&mut self, ctx: &StageContext<'_>, effective: &Path) -> Result<(), StageError> {
            assert!(effective.is_file());
            self.step(Stage::Configure, ctx)
        }

        fn compile(&mut self, ctx: &StageContext<'_>) -> Result<PathBuf, StageError> {
            self.step(Stage::Compile, ctx)?;
            let raw = ctx.layout.raw_artifact();
            fs::write(&raw, b"MZ raw rescue image").unwrap();
            Ok(raw)
        }

        fn cleanup(&mut self, stage: Stage, _ctx: &StageContext<'_>) -> Result<(), StageError> {
            self.calls.push(format!("cleanup {stage}"));
            Ok(())
        }
    }

    struct NoCompressor;

    impl Compressor for NoCompressor {
        fn available(&self, _tool: CompressionTool) -> bool {
            false
        }

        fn compress(
            &self,
            tool: CompressionTool,
            _input: &Path,
            _output: &Path,
        ) -> Result<(), FinalizeError> {
            Err(FinalizeError::ToolMissing { tool })
        }

        fn verify(&self, tool: CompressionTool, _output: &Path) -> Result<(), FinalizeError> {
            Err(FinalizeError::ToolMissing { tool })
        }
    }

    /// Raises the flag mid-compression, then fails the way a killed `upx` would.
    struct KilledCompressor {
        interrupt: Interrupt,
    }

    impl Compressor for KilledCompressor {
        fn available(&self, _tool: CompressionTool) -> bool {
            true
        }

        fn compress(
            &self,
            tool: CompressionTool,
            _input: &Path,
            _output: &Path,
        ) -> Result<(), FinalizeError> {
            self.interrupt.trigger();
            Err(FinalizeError::Compression {
                tool,
                message: "terminated by signal 2".to_string(),
            })
        }

        fn verify(&self, _tool: CompressionTool, _output: &Path) -> Result<(), FinalizeError> {
            Ok(())
        }
    }

    struct Fixture {
        _dir: TempDir,
        state: PathBuf,
        effective: EffectiveConfig,
        resources: ResourceProfile,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let state = dir.path().join("state");
            let overlay = ConfigOverlay::new("zfs", OverlaySource::Custom).set("CONFIG_ZFS", "m");
            let effective = merge(&ConfigDocument::default(), &[overlay]).unwrap();
            let resources = plan(
                &ResourceSnapshot {
                    context: ExecutionContext::Workstation,
                    available_memory: 32 * 1024 * 1024 * 1024,
                    core_count: 8,
                    privileged: false,
                },
                None,
                false,
            );
            Self {
                _dir: dir,
                state,
                effective,
                resources,
            }
        }

        fn store(&self) -> CheckpointStore {
            open_store(&self.state).unwrap()
        }

        fn run(
            &self,
            args: &[&str],
            toolchain: &mut FakeToolchain,
            selection: StageSelection,
            interrupt: Interrupt,
        ) -> Result<PipelineReport, PipelineError> {
            self.run_with(args, toolchain, selection, interrupt, &NoCompressor)
        }

        fn run_with(
            &self,
            args: &[&str],
            toolchain: &mut FakeToolchain,
            selection: StageSelection,
            interrupt: Interrupt,
            compressor: &dyn Compressor,
        ) -> Result<PipelineReport, PipelineError> {
            let resolved = resolve(args, None).unwrap();
            let config = resolved.config;
            let layout = WorkLayout::new(&self.state, &config.fingerprint(), &config);
            layout.create().unwrap();
            let mut store = self.store();
            let mut pipeline = Pipeline::new(
                &config,
                &self.effective,
                &self.resources,
                &layout,
                &mut store,
                toolchain,
                compressor,
            )
            .interrupt(interrupt)
            .restart(resolved.restart);
            pipeline.run(selection)
        }
    }

    fn fingerprint_of(args: &[&str]) -> Fingerprint {
        resolve(args, None).unwrap().config.fingerprint()
    }

    #[test]
    fn full_run_executes_every_stage_in_order() {
        let fx = Fixture::new();
        let mut toolchain = FakeToolchain::default();
        let report = fx
            .run(&["minimal"], &mut toolchain, StageSelection::All, Interrupt::new())
            .unwrap();

        assert_eq!(
            toolchain.calls,
            ["fetch", "cleanup install", "install", "configure", "compile"]
        );
        assert_eq!(report.executed(), Stage::ALL);
        assert_eq!(report.last_completed(), Some(Stage::Finalize));
        assert_eq!(fx.store().completed(&fingerprint_of(&["minimal"])), Stage::ALL);

        let artifact = report.final_artifact.unwrap();
        assert_eq!(fs::read(&artifact.path).unwrap(), b"MZ raw rescue image");
        assert_eq!(artifact.warnings.len(), 1);

        let config = resolve(&["minimal"], None).unwrap().config;
        let layout = WorkLayout::new(&fx.state, &config.fingerprint(), &config);
        assert_eq!(
            fs::read_to_string(layout.effective_config()).unwrap(),
            "CONFIG_ZFS=m\n"
        );
    }

    #[test]
    fn resume_after_failure_runs_only_the_failed_stage_onward() {
        let fx = Fixture::new();
        let mut broken = FakeToolchain::failing(Stage::Compile, 2);
        let err = fx
            .run(&["standard"], &mut broken, StageSelection::All, Interrupt::new())
            .unwrap_err();
        match err {
            PipelineError::StageFailed {
                stage,
                last_completed,
                ..
            } => {
                assert_eq!(stage, Stage::Compile);
                assert_eq!(last_completed, Some(Stage::Configure));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(broken.calls.iter().filter(|c| *c == "compile").count(), 2);
        let fp = fingerprint_of(&["standard"]);
        assert_eq!(
            fx.store().completed(&fp),
            [Stage::Fetch, Stage::Install, Stage::Configure]
        );

        let mut fixed = FakeToolchain::default();
        let report = fx
            .run(&["standard"], &mut fixed, StageSelection::All, Interrupt::new())
            .unwrap();
        assert_eq!(fixed.calls, ["compile"]);
        assert_eq!(report.state(Stage::Install), StageState::Skipped);
        assert_eq!(report.executed(), [Stage::Compile, Stage::Finalize]);
    }

    #[test]
    fn checkpoints_do_not_leak_across_fingerprints() {
        let fx = Fixture::new();
        let mut first = FakeToolchain::default();
        fx.run(&["minimal"], &mut first, StageSelection::All, Interrupt::new())
            .unwrap();

        let mut second = FakeToolchain::default();
        let report = fx
            .run(
                &["minimal", "--with-network-tools"],
                &mut second,
                StageSelection::All,
                Interrupt::new(),
            )
            .unwrap();
        assert_eq!(report.executed(), Stage::ALL);
        assert_eq!(second.calls.len(), 5);
    }

    #[test]
    fn safe_stage_is_retried_once() {
        let fx = Fixture::new();
        let mut toolchain = FakeToolchain::failing(Stage::Fetch, 1);
        fx.run(&["minimal"], &mut toolchain, StageSelection::All, Interrupt::new())
            .unwrap();
        assert_eq!(toolchain.calls[..2], ["fetch", "fetch"]);
    }

    #[test]
    fn cleanup_stage_fails_without_retry() {
        let fx = Fixture::new();
        let mut toolchain = FakeToolchain::failing(Stage::Install, 1);
        let err = fx
            .run(&["minimal"], &mut toolchain, StageSelection::All, Interrupt::new())
            .unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Install));
        assert_eq!(toolchain.calls, ["fetch", "cleanup install", "install"]);
        assert_eq!(
            fx.store().completed(&fingerprint_of(&["minimal"])),
            [Stage::Fetch]
        );
    }

    #[test]
    fn clean_restart_discards_checkpoints() {
        let fx = Fixture::new();
        let mut first = FakeToolchain::default();
        fx.run(&["minimal"], &mut first, StageSelection::All, Interrupt::new())
            .unwrap();

        let mut again = FakeToolchain::default();
        let report = fx
            .run(
                &["minimal", "--clean"],
                &mut again,
                StageSelection::All,
                Interrupt::new(),
            )
            .unwrap();
        assert_eq!(report.executed(), Stage::ALL);
    }

    #[test]
    fn single_stage_needs_checkpointed_prerequisites() {
        let fx = Fixture::new();
        let mut toolchain = FakeToolchain::default();
        let err = fx
            .run(
                &["minimal"],
                &mut toolchain,
                StageSelection::Only(Stage::Compile),
                Interrupt::new(),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::PrerequisiteMissing {
                stage: Stage::Compile,
                missing: Stage::Fetch
            }
        ));
        assert!(toolchain.calls.is_empty());

        fx.run(&["minimal"], &mut toolchain, StageSelection::All, Interrupt::new())
            .unwrap();
        let mut rerun = FakeToolchain::default();
        let report = fx
            .run(
                &["minimal"],
                &mut rerun,
                StageSelection::Only(Stage::Configure),
                Interrupt::new(),
            )
            .unwrap();
        assert_eq!(rerun.calls, ["configure"]);
        assert_eq!(report.executed(), [Stage::Configure]);
    }

    #[test]
    fn finalize_alone_uses_checkpointed_raw_image() {
        let fx = Fixture::new();
        let mut toolchain = FakeToolchain::default();
        fx.run(
            &["minimal", "--no-compress"],
            &mut toolchain,
            StageSelection::All,
            Interrupt::new(),
        )
        .unwrap();

        let mut rerun = FakeToolchain::default();
        let report = fx
            .run(
                &["minimal", "--no-compress"],
                &mut rerun,
                StageSelection::Only(Stage::Finalize),
                Interrupt::new(),
            )
            .unwrap();
        assert!(rerun.calls.is_empty());
        assert_eq!(report.state(Stage::Compile), StageState::Skipped);
        let artifact = report.final_artifact.unwrap();
        assert!(artifact.warnings.is_empty());
        assert_eq!(fs::read(&artifact.path).unwrap(), b"MZ raw rescue image");
    }

    #[test]
    fn interrupt_before_first_stage_runs_nothing() {
        let fx = Fixture::new();
        let interrupt = Interrupt::new();
        interrupt.trigger();
        let mut toolchain = FakeToolchain::default();
        let err = fx
            .run(&["minimal"], &mut toolchain, StageSelection::All, interrupt)
            .unwrap_err();
        assert!(matches!(err, PipelineError::Interrupted { stage: Stage::Fetch }));
        assert!(toolchain.calls.is_empty());
        assert!(fx.store().completed(&fingerprint_of(&["minimal"])).is_empty());
    }

    #[test]
    fn interrupt_during_stage_is_not_retried_or_checkpointed() {
        let fx = Fixture::new();
        let mut toolchain = FakeToolchain {
            interrupt_during: Some(Stage::Configure),
            ..Default::default()
        };
        let err = fx
            .run(&["minimal"], &mut toolchain, StageSelection::All, Interrupt::new())
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Interrupted {
                stage: Stage::Configure
            }
        ));
        assert_eq!(toolchain.calls.iter().filter(|c| *c == "configure").count(), 1);
        assert_eq!(
            fx.store().completed(&fingerprint_of(&["minimal"])),
            [Stage::Fetch, Stage::Install]
        );
    }

    #[test]
    fn planned_stages_reflect_checkpoints() {
        let fx = Fixture::new();
        let fp = fingerprint_of(&["minimal"]);
        let mut store = fx.store();
        store.record(Stage::Fetch, &fp, None).unwrap();
        let planned = planned_stages(&store, &fp, StageSelection::All, RestartMode::Resume);
        assert_eq!(planned[0], (Stage::Fetch, StageState::Skipped));
        assert_eq!(planned[1], (Stage::Install, StageState::Pending));
        let clean = planned_stages(&store, &fp, StageSelection::All, RestartMode::Clean);
        assert!(clean.iter().all(|(_, s)| *s == StageState::Pending));
    }

    #[test]
    fn stage_that_succeeds_after_interrupt_is_not_checkpointed() {
        let fx = Fixture::new();
        let mut toolchain = FakeToolchain {
            interrupt_after: Some(Stage::Install),
            ..Default::default()
        };
        let err = fx
            .run(&["minimal"], &mut toolchain, StageSelection::All, Interrupt::new())
            .unwrap_err();
        assert!(matches!(err, PipelineError::Interrupted { stage: Stage::Install }));
        assert_eq!(toolchain.calls, ["fetch", "cleanup install", "install"]);
        assert_eq!(
            fx.store().completed(&fingerprint_of(&["minimal"])),
            [Stage::Fetch]
        );
    }

    #[test]
    fn interrupted_compression_does_not_finish_the_build() {
        let fx = Fixture::new();
        let interrupt = Interrupt::new();
        let compressor = KilledCompressor {
            interrupt: interrupt.clone(),
        };
        let mut toolchain = FakeToolchain::default();
        let err = fx
            .run_with(
                &["minimal"],
                &mut toolchain,
                StageSelection::All,
                interrupt,
                &compressor,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Interrupted {
                stage: Stage::Finalize
            }
        ));
        let fp = fingerprint_of(&["minimal"]);
        assert!(!fx.store().has(Stage::Finalize, &fp));
        assert!(fx.store().has(Stage::Compile, &fp));

        let mut resumed = FakeToolchain::default();
        let report = fx
            .run(&["minimal"], &mut resumed, StageSelection::All, Interrupt::new())
            .unwrap();
        assert!(resumed.calls.is_empty());
        assert_eq!(report.executed(), [Stage::Finalize]);
    }

    #[test]
    fn clean_single_stage_keeps_its_prerequisites() {
        let fx = Fixture::new();
        let mut first = FakeToolchain::default();
        fx.run(&["minimal"], &mut first, StageSelection::All, Interrupt::new())
            .unwrap();

        let mut rerun = FakeToolchain::default();
        let report = fx
            .run(
                &["minimal", "--clean"],
                &mut rerun,
                StageSelection::Only(Stage::Compile),
                Interrupt::new(),
            )
            .unwrap();
        assert_eq!(rerun.calls, ["compile"]);
        assert_eq!(report.executed(), [Stage::Compile]);
        assert_eq!(
            fx.store().completed(&fingerprint_of(&["minimal"])),
            [Stage::Fetch, Stage::Install, Stage::Configure, Stage::Compile]
        );
    }

    #[test]
    fn clean_single_stage_without_prerequisites_drops_nothing() {
        let fx = Fixture::new();
        let fp = fingerprint_of(&["minimal"]);
        let mut store = fx.store();
        store.record(Stage::Fetch, &fp, None).unwrap();
        drop(store);

        let mut toolchain = FakeToolchain::default();
        let err = fx
            .run(
                &["minimal", "--clean"],
                &mut toolchain,
                StageSelection::Only(Stage::Compile),
                Interrupt::new(),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::PrerequisiteMissing {
                stage: Stage::Compile,
                missing: Stage::Install
            }
        ));
        assert!(toolchain.calls.is_empty());
        assert_eq!(fx.store().completed(&fp), [Stage::Fetch]);
    }

    #[test]
    fn planned_clean_single_stage_keeps_prerequisites() {
        let fx = Fixture::new();
        let fp = fingerprint_of(&["minimal"]);
        let mut store = fx.store();
        for stage in Stage::ALL {
            store.record(stage, &fp, None).unwrap();
        }
        let planned = planned_stages(
            &store,
            &fp,
            StageSelection::Only(Stage::Compile),
            RestartMode::Clean,
        );
        assert_eq!(planned[2], (Stage::Configure, StageState::Skipped));
        assert_eq!(planned[3], (Stage::Compile, StageState::Pending));
        assert_eq!(planned[4], (Stage::Finalize, StageState::Pending));
    }
}
