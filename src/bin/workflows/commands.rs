use std::fs;

use anyhow::{Context, Result};
use rescue_builder::config::defaults::{defaults_path, save_defaults};
use rescue_builder::fsutil::{dir_size, format_bytes};
use rescue_builder::kconfig::select_overlays;
use rescue_builder::lock::RunLock;
use rescue_builder::pipeline::layout::WorkLayout;
use rescue_builder::pipeline::{open_store, planned_stages, StageSelection};
use rescue_builder::resources;
use rescue_builder::stage_runs::{load_runs, runs_root};

use crate::workflows::Invocation;

/// Print the resolved configuration without running anything.
pub(crate) fn show_config(invocation: &Invocation) -> Result<()> {
    let config = &invocation.resolved.config;
    let fingerprint = config.fingerprint();

    println!("project:      {}", invocation.project.root().display());
    println!("state:        {}", invocation.state_root.display());
    println!("fingerprint:  {fingerprint}");
    print!("{config}");

    println!("kernel overlays (in application order):");
    for overlay in select_overlays(&invocation.project, config)? {
        let presence = if overlay.path.is_file() {
            "present"
        } else if overlay.required {
            "MISSING"
        } else {
            "absent, skipped"
        };
        println!(
            "  {:<24} {} ({presence})",
            overlay.name,
            overlay.path.display()
        );
    }

    let profile = resources::plan(&resources::probe(), config.jobs, config.allow_swap);
    println!("resources:");
    for line in profile.to_string().lines() {
        println!("  {line}");
    }

    let store = open_store(&invocation.state_root)?;
    println!("stages:");
    for (stage, state) in planned_stages(
        &store,
        &fingerprint,
        StageSelection::All,
        invocation.resolved.restart,
    ) {
        println!("  {}. {:<10} {state}", stage.ordinal(), stage.name());
    }
    Ok(())
}

pub(crate) fn save_config(invocation: &Invocation) -> Result<()> {
    let path = defaults_path(&invocation.state_root);
    let saved = save_defaults(&path, &invocation.resolved.config)?;
    if saved.password_dropped {
        log::warn!("[config] explicit passwords are not saved; defaults use a random password");
    }
    println!("[config] saved defaults to {}", saved.path.display());
    Ok(())
}

/// Checkpoints for the current configuration, then recorded runs.
pub(crate) fn status(invocation: &Invocation) -> Result<()> {
    let config = &invocation.resolved.config;
    let fingerprint = config.fingerprint();
    let store = open_store(&invocation.state_root)?;

    println!("fingerprint:  {fingerprint}");
    for stage in rescue_builder::Stage::ALL {
        match store.get(stage, &fingerprint) {
            Some(checkpoint) => println!(
                "  {:<10} completed {}",
                stage.name(),
                checkpoint.completed_at
            ),
            None => println!("  {:<10} pending", stage.name()),
        }
    }
    let others = store
        .fingerprints()
        .into_iter()
        .filter(|fp| **fp != fingerprint)
        .count();
    if others > 0 {
        println!("({others} other configuration(s) have checkpoints)");
    }

    let runs = load_runs(&runs_root(&invocation.state_root))?;
    if runs.is_empty() {
        println!("no recorded runs");
        return Ok(());
    }
    println!("runs (newest first):");
    for run in runs {
        let finished = run.finished_at_utc.as_deref().unwrap_or("-");
        let detail = match (run.failed_stage, run.final_artifact) {
            (Some(stage), _) => format!("failed at {stage}"),
            (None, Some(path)) => path.display().to_string(),
            (None, None) => String::new(),
        };
        println!(
            "  {} {:<11} {:<9} {} {}",
            run.fingerprint.short(),
            run.status.slug(),
            run.preset,
            finished,
            detail
        );
    }
    Ok(())
}

/// Drop checkpoints and work directories for the current configuration.
pub(crate) fn clean(invocation: &Invocation) -> Result<()> {
    let config = &invocation.resolved.config;
    let fingerprint = config.fingerprint();
    let _lock = RunLock::acquire(&invocation.state_root)?;

    let mut store = open_store(&invocation.state_root)?;
    let removed = store.invalidate(&fingerprint)?;

    let layout = WorkLayout::new(&invocation.state_root, &fingerprint, config);
    let mut reclaimed = 0;
    for dir in [layout.work_dir(), layout.out_dir()] {
        if dir.exists() {
            reclaimed += dir_size(dir);
            fs::remove_dir_all(dir)
                .with_context(|| format!("removing '{}'", dir.display()))?;
        }
    }
    println!(
        "[clean:{}] removed {removed} checkpoint(s), reclaimed {}",
        fingerprint.short(),
        format_bytes(reclaimed)
    );
    Ok(())
}
