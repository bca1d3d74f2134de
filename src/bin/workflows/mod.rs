mod build;
mod commands;

use std::path::PathBuf;

use anyhow::{Context, Result};
use rescue_builder::config::defaults::{defaults_path, load_defaults};
use rescue_builder::config::{resolve, Resolved};
use rescue_builder::pipeline::layout::{resolve_state_root, ProjectLayout};
use rescue_builder::{ConfigError, MergeError, PipelineError, Stage, StageSelection};

use crate::Cli;

/// What the first positional token asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Target {
    Build(StageSelection),
    ShowConfig,
    SaveConfig,
    Status,
    Clean,
}

/// Resolved inputs shared by every target.
#[derive(Debug)]
pub(crate) struct Invocation {
    pub(crate) project: ProjectLayout,
    pub(crate) state_root: PathBuf,
    pub(crate) resolved: Resolved,
}

/// Split `args` into a target and the remaining build flags.
///
/// A first token that names no target is treated as a flag of `all`.
pub(crate) fn parse_target(args: &[String]) -> (Target, &[String]) {
    let Some(first) = args.first() else {
        return (Target::Build(StageSelection::All), args);
    };
    let target = match first.as_str() {
        "all" => Target::Build(StageSelection::All),
        "show-config" => Target::ShowConfig,
        "save-config" => Target::SaveConfig,
        "status" => Target::Status,
        "clean" => Target::Clean,
        name => match Stage::from_name(name) {
            Some(stage) => Target::Build(StageSelection::Only(stage)),
            None => return (Target::Build(StageSelection::All), args),
        },
    };
    (target, &args[1..])
}

pub(crate) fn run(cli: &Cli) -> Result<()> {
    let (target, flags) = parse_target(&cli.args);
    let invocation = prepare(cli, flags)?;
    match target {
        Target::Build(selection) => build::run_build(&invocation, selection),
        Target::ShowConfig => commands::show_config(&invocation),
        Target::SaveConfig => commands::save_config(&invocation),
        Target::Status => commands::status(&invocation),
        Target::Clean => commands::clean(&invocation),
    }
}

fn prepare(cli: &Cli, flags: &[String]) -> Result<Invocation> {
    let cwd = std::env::current_dir().context("resolving current directory")?;
    let project_root = match &cli.project_dir {
        Some(dir) if dir.is_absolute() => dir.clone(),
        Some(dir) => cwd.join(dir),
        None => cwd,
    };
    let project = ProjectLayout::new(&project_root);
    let state_root = resolve_state_root(&project, cli.state_dir.as_deref());

    let baseline = load_defaults(&defaults_path(&state_root))?;
    if baseline.is_some() {
        log::debug!(
            "[config] using saved defaults from {}",
            defaults_path(&state_root).display()
        );
    }
    let resolved = resolve(flags, baseline)?;
    for warning in &resolved.warnings {
        log::warn!("[config] {warning}");
    }

    Ok(Invocation {
        project,
        state_root,
        resolved,
    })
}

/// 2 for configuration errors, 3 for kernel config errors, 130 when
/// interrupted, 1 otherwise.
pub(crate) fn exit_code_for(error: &anyhow::Error) -> u8 {
    for cause in error.chain() {
        if cause.downcast_ref::<ConfigError>().is_some() {
            return 2;
        }
        if cause.downcast_ref::<MergeError>().is_some() {
            return 3;
        }
        if let Some(PipelineError::Interrupted { .. }) = cause.downcast_ref::<PipelineError>() {
            return 130;
        }
    }
    1
}
