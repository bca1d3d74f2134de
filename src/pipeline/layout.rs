//! Filesystem layout of a project checkout and of the state root.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::config::{BuildConfiguration, CachePolicy, Component, Fingerprint};
use crate::pipeline::Stage;

pub const STATE_DIR_ENV: &str = "RESCUE_BUILDER_STATE_DIR";
pub const DEFAULT_STATE_DIR: &str = ".artifacts";
pub const IMAGE_NAME: &str = "rescue.efi";

/// Inputs checked into the project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectLayout {
    root: PathBuf,
}

impl ProjectLayout {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn base_config(&self) -> PathBuf {
        self.root.join("kernel/base.config")
    }

    pub fn component_overlay(&self, component: Component) -> PathBuf {
        self.root
            .join("kernel/overlays")
            .join(format!("{}.config", component.slug()))
    }

    pub fn custom_overlay_dir(&self) -> PathBuf {
        self.root.join("kernel/custom")
    }

    pub fn hook(&self, stage: Stage) -> PathBuf {
        self.root.join("hooks").join(format!("{}.sh", stage.name()))
    }

    pub fn cleanup_hook(&self, stage: Stage) -> PathBuf {
        self.root
            .join("hooks")
            .join(format!("{}-cleanup.sh", stage.name()))
    }

    /// Relative paths are taken from the project root.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

/// State root: `--state-dir`, then the environment, then `<project>/.artifacts`.
pub fn resolve_state_root(project: &ProjectLayout, explicit: Option<&Path>) -> PathBuf {
    if let Some(dir) = explicit {
        return project.resolve(dir);
    }
    match std::env::var_os(STATE_DIR_ENV) {
        Some(dir) if !dir.is_empty() => project.resolve(Path::new(&dir)),
        _ => project.root().join(DEFAULT_STATE_DIR),
    }
}

/// Per-fingerprint working and output directories below the state root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkLayout {
    state_root: PathBuf,
    work_dir: PathBuf,
    out_dir: PathBuf,
    cache_dir: Option<PathBuf>,
}

impl WorkLayout {
    pub fn new(state_root: &Path, fingerprint: &Fingerprint, config: &BuildConfiguration) -> Self {
        let cache_dir = match &config.cache {
            CachePolicy::Enabled { dir: Some(dir) } => Some(dir.clone()),
            CachePolicy::Enabled { dir: None } => Some(state_root.join("cache")),
            CachePolicy::Disabled => None,
        };
        Self {
            state_root: state_root.to_path_buf(),
            work_dir: state_root.join("work").join(fingerprint.short()),
            out_dir: state_root.join("out").join(fingerprint.short()),
            cache_dir,
        }
    }

    pub fn state_root(&self) -> &Path {
        &self.state_root
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn sources_dir(&self) -> PathBuf {
        self.work_dir.join("sources")
    }

    /// Isolated install root.
    pub fn rootfs_dir(&self) -> PathBuf {
        self.work_dir.join("rootfs")
    }

    pub fn kernel_build_dir(&self) -> PathBuf {
        self.work_dir.join("kernel-build")
    }

    pub fn effective_config(&self) -> PathBuf {
        self.work_dir.join("effective.config")
    }

    /// Where the compile stage leaves the uncompressed image.
    pub fn raw_artifact(&self) -> PathBuf {
        self.work_dir.join("build").join(IMAGE_NAME)
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    pub fn final_artifact(&self) -> PathBuf {
        self.out_dir.join(IMAGE_NAME)
    }

    pub fn cache_dir(&self) -> Option<&Path> {
        self.cache_dir.as_deref()
    }

    pub fn swap_file(&self) -> PathBuf {
        self.state_root.join("swapfile")
    }

    /// Create every directory the stages write into.
    pub fn create(&self) -> Result<()> {
        let mut dirs = vec![
            self.sources_dir(),
            self.rootfs_dir(),
            self.kernel_build_dir(),
            self.work_dir.join("build"),
            self.out_dir.clone(),
        ];
        dirs.extend(self.cache_dir.clone());
        for dir in dirs {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("creating work directory '{}'", dir.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_layout_is_fingerprint_scoped() {
        let config = BuildConfiguration::default();
        let fp = config.fingerprint();
        let layout = WorkLayout::new(Path::new("/state"), &fp, &config);
        assert_eq!(
            layout.raw_artifact(),
            Path::new("/state/work").join(fp.short()).join("build/rescue.efi")
        );
        assert_eq!(layout.cache_dir(), Some(Path::new("/state/cache")));

        let no_cache = BuildConfiguration {
            cache: CachePolicy::Disabled,
            ..config
        };
        assert!(WorkLayout::new(Path::new("/state"), &fp, &no_cache)
            .cache_dir()
            .is_none());
    }

    #[test]
    fn explicit_state_dir_is_relative_to_project() {
        let project = ProjectLayout::new(Path::new("/src/rescue"));
        assert_eq!(
            resolve_state_root(&project, Some(Path::new("state"))),
            PathBuf::from("/src/rescue/state")
        );
        assert_eq!(
            project.hook(Stage::Compile),
            PathBuf::from("/src/rescue/hooks/compile.sh")
        );
    }
}
