use anyhow::{Context, Result};
use rescue_builder::artifact::HostCompressor;
use rescue_builder::fsutil::format_bytes;
use rescue_builder::interrupt::Interrupt;
use rescue_builder::kconfig::load_effective;
use rescue_builder::lock::RunLock;
use rescue_builder::pipeline::layout::WorkLayout;
use rescue_builder::pipeline::toolchain::HookToolchain;
use rescue_builder::pipeline::{open_store, planned_stages, Pipeline, StageSelection, StageState};
use rescue_builder::resources::{self, SwapOutcome, SwapProvisioner};
use rescue_builder::stage_runs::{
    prune_old_runs, runs_root, RunRecorder, RunStatus, RUN_RETENTION_COUNT,
};
use rescue_builder::{preflight, PipelineError, Stage};

use crate::workflows::Invocation;

pub(crate) fn run_build(invocation: &Invocation, selection: StageSelection) -> Result<()> {
    let config = &invocation.resolved.config;
    let restart = invocation.resolved.restart;
    let fingerprint = config.fingerprint();
    let slug = fingerprint.short();

    let interrupt = Interrupt::install()?;
    let _lock = RunLock::acquire(&invocation.state_root)?;
    let mut store = open_store(&invocation.state_root)?;

    let pending: Vec<Stage> = planned_stages(&store, &fingerprint, selection, restart)
        .into_iter()
        .filter(|(stage, state)| {
            *state == StageState::Pending
                && match selection {
                    StageSelection::All => true,
                    StageSelection::Only(only) => *stage == only,
                }
        })
        .map(|(stage, _)| stage)
        .collect();
    preflight::check_stage_hooks(&invocation.project, &pending)?;
    if let Some(note) = preflight::compression_advisory(config) {
        log::warn!("[preflight] {note}");
    }

    let effective = load_effective(&invocation.project, config)?;

    let layout = WorkLayout::new(&invocation.state_root, &fingerprint, config);
    layout.create()?;

    let snapshot = resources::probe();
    let mut profile = resources::plan(&snapshot, config.jobs, config.allow_swap);
    // Held until the end of this function; dropping it deactivates swap.
    let swap = if pending.contains(&Stage::Compile) {
        SwapProvisioner::new(&layout.swap_file()).provision(&profile)
    } else {
        SwapOutcome::NotRequested
    };
    if let SwapOutcome::Declined { reason } = &swap {
        log::warn!("[resources] swap declined ({reason}); continuing with one worker");
    }
    profile = swap.adjust(profile);
    log::info!(
        "[resources] {} context, {} available, {} worker(s), {} compiler profile",
        profile.context,
        format_bytes(profile.available_memory),
        profile.safe_workers,
        profile.compiler.slug()
    );

    let mut recorder = RunRecorder::begin(&invocation.state_root, config)?;
    println!(
        "[build:{slug}] {} preset, {} stage(s) to run",
        config.preset,
        pending.len()
    );

    let mut toolchain = HookToolchain::new(&invocation.project);
    let compressor = HostCompressor::new().interruptible(&interrupt);
    let result = {
        let mut pipeline = Pipeline::new(
            config,
            &effective,
            &profile,
            &layout,
            &mut store,
            &mut toolchain,
            &compressor,
        )
        .interrupt(interrupt)
        .restart(restart);
        pipeline.run(selection)
    };

    match result {
        Ok(report) => {
            let artifact = report.final_artifact.as_ref();
            recorder.finish_success(
                report.last_completed(),
                artifact.map(|a| a.path.as_path()),
            )?;
            prune_old_runs(&runs_root(&invocation.state_root), RUN_RETENTION_COUNT)?;
            for (stage, state) in &report.states {
                log::debug!("[build:{slug}] {stage}: {state}");
            }
            match artifact {
                Some(artifact) => {
                    for warning in &artifact.warnings {
                        println!("[build:{slug}] warning: {warning}");
                    }
                    println!(
                        "[build:{slug}] image ready: {} ({}, sha256 {})",
                        artifact.path.display(),
                        format_bytes(artifact.size),
                        artifact.sha256
                    );
                }
                None => println!(
                    "[build:{slug}] done; last completed stage: {}",
                    report
                        .last_completed()
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "none".to_string())
                ),
            }
            Ok(())
        }
        Err(e) => {
            let status = match e {
                PipelineError::Interrupted { .. } => RunStatus::Interrupted,
                _ => RunStatus::Failed,
            };
            let last_completed = store.completed(&fingerprint).last().copied();
            recorder
                .finish_failure(status, last_completed, e.stage(), &e.to_string())
                .context("recording failed run")?;
            Err(e.into())
        }
    }
}
