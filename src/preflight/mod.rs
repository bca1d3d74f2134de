//! Preflight checks before any stage runs.
//!
//! Validates that the host can run the project's hooks so a build does not
//! fail halfway through on something that was knowable up front.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::path::Path;
//! use rescue_builder::pipeline::{layout::ProjectLayout, Stage};
//! use rescue_builder::preflight::check_stage_hooks;
//!
//! let project = ProjectLayout::new(Path::new("."));
//! if let Err(e) = check_stage_hooks(&project, &Stage::ALL) {
//!     eprintln!("{e}");
//! }
//! ```

use anyhow::{bail, Result};

use crate::config::{BuildConfiguration, CompressionTool};
use crate::pipeline::layout::ProjectLayout;
use crate::pipeline::Stage;

/// Whether `cmd` resolves on PATH.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Host tools every build needs.
///
/// Each tuple is (command_name, package_name).
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[("sh", "a POSIX shell")];

/// Check that specific tools are available.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<_> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .collect();

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }

    Ok(())
}

/// Check the shell and a hook script for every stage in `stages`.
///
/// `finalize` is handled in-process and needs no hook.
pub fn check_stage_hooks(project: &ProjectLayout, stages: &[Stage]) -> Result<()> {
    check_required_tools(REQUIRED_TOOLS)?;

    let missing: Vec<_> = stages
        .iter()
        .filter(|stage| **stage != Stage::Finalize)
        .map(|stage| project.hook(*stage))
        .filter(|hook| !hook.is_file())
        .collect();

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|hook| format!("  {}", hook.display()))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing stage hooks in '{}':\n{}", project.root().display(), msg);
    }

    Ok(())
}

/// Advisory note when the configured compressor is not installed.
///
/// Never fatal: finalize falls back to the uncompressed image.
pub fn compression_advisory(config: &BuildConfiguration) -> Option<String> {
    if !config.compression.enabled {
        return None;
    }
    let binary = match config.compression.tool {
        CompressionTool::Upx => "upx",
        CompressionTool::Xz => "xz",
        CompressionTool::Zstd => return None,
    };
    if command_exists(binary) {
        None
    } else {
        Some(format!(
            "{binary} not found on PATH; the final image will be left uncompressed"
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_command_exists() {
        assert!(command_exists("sh"));
        assert!(!command_exists("definitely_not_a_real_command_12345"));
    }

    #[test]
    fn test_check_required_tools_failure() {
        let tools = &[("nonexistent_command_xyz", "fake-package")];
        let err = check_required_tools(tools).unwrap_err();
        assert!(err.to_string().contains("fake-package"));
    }

    #[test]
    fn missing_hooks_are_listed() {
        let dir = TempDir::new().unwrap();
        let project = ProjectLayout::new(dir.path());
        fs::create_dir_all(dir.path().join("hooks")).unwrap();
        fs::write(project.hook(Stage::Fetch), "true\n").unwrap();

        let err = check_stage_hooks(&project, &Stage::ALL).unwrap_err().to_string();
        assert!(err.contains("install.sh"));
        assert!(err.contains("compile.sh"));
        assert!(!err.contains("fetch.sh"));
        assert!(!err.contains("finalize.sh"));

        assert!(check_stage_hooks(&project, &[Stage::Fetch, Stage::Finalize]).is_ok());
    }

    #[test]
    fn zstd_never_needs_a_host_binary() {
        let mut config = BuildConfiguration::default();
        config.compression.tool = CompressionTool::Zstd;
        assert!(compression_advisory(&config).is_none());
        config.compression.enabled = false;
        config.compression.tool = CompressionTool::Upx;
        assert!(compression_advisory(&config).is_none());
    }
}
