//! Collaborator seam for the stages.
//!
//! The pipeline never looks inside a collaborator beyond success, failure
//! and an optional message. [`HookToolchain`] is the default implementation:
//! every stage runs `sh hooks/<stage>.sh` from the project with a fixed
//! environment.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use crate::config::{BuildConfiguration, Component, Fingerprint, PasswordPolicy};
use crate::error::{FetchError, StageError};
use crate::interrupt::Interrupt;
use crate::kconfig::EffectiveConfig;
use crate::pipeline::layout::{ProjectLayout, WorkLayout};
use crate::pipeline::Stage;
use crate::process::Cmd;
use crate::resources::ResourceProfile;

/// Read-only inputs handed to every collaborator call.
#[derive(Debug, Clone, Copy)]
pub struct StageContext<'a> {
    pub config: &'a BuildConfiguration,
    pub fingerprint: &'a Fingerprint,
    pub effective: &'a EffectiveConfig,
    pub resources: &'a ResourceProfile,
    pub layout: &'a WorkLayout,
    pub interrupt: &'a Interrupt,
}

/// External work behind each stage.
pub trait Toolchain {
    /// Obtain sources. Mirror fallback is the collaborator's concern.
    fn fetch(&mut self, ctx: &StageContext<'_>) -> Result<PathBuf, FetchError>;

    /// Populate the isolated root at `target_root`.
    fn install(&mut self, ctx: &StageContext<'_>, target_root: &Path) -> Result<(), StageError>;

    /// Prepare the kernel tree from the rendered effective configuration.
    fn configure(
        &mut self,
        ctx: &StageContext<'_>,
        effective_config: &Path,
    ) -> Result<(), StageError>;

    /// Build the uncompressed image and return its path.
    fn compile(&mut self, ctx: &StageContext<'_>) -> Result<PathBuf, StageError>;

    /// Undo partial work of `stage` before it is attempted again.
    fn cleanup(&mut self, stage: Stage, ctx: &StageContext<'_>) -> Result<(), StageError>;
}

/// Runs project hook scripts with `sh`.
#[derive(Debug, Clone)]
pub struct HookToolchain {
    project: ProjectLayout,
}

impl HookToolchain {
    pub fn new(project: &ProjectLayout) -> Self {
        Self {
            project: project.clone(),
        }
    }

    fn run_hook(
        &self,
        stage: Stage,
        script: &Path,
        ctx: &StageContext<'_>,
        extra: Vec<(String, String)>,
    ) -> Result<(), StageError> {
        if !script.is_file() {
            return Err(StageError::new(
                stage,
                format!("hook script '{}' does not exist", script.display()),
            ));
        }
        log::info!("[stage:{stage}] running {}", script.display());
        Cmd::new("sh")
            .arg_path(script)
            .current_dir(self.project.root())
            .envs(hook_environment(stage, &self.project, ctx))
            .envs(extra)
            .interruptible(ctx.interrupt)
            .error_msg(format!("hook '{}' failed", script.display()))
            .run_interactive()
            .map(|_| ())
            .map_err(|e| StageError::new(stage, format!("{e:#}")))
    }
}

impl Toolchain for HookToolchain {
    fn fetch(&mut self, ctx: &StageContext<'_>) -> Result<PathBuf, FetchError> {
        let sources = ctx.layout.sources_dir();
        self.run_hook(Stage::Fetch, &self.project.hook(Stage::Fetch), ctx, Vec::new())
            .map_err(|e| FetchError::Exhausted(e.message.unwrap_or_default()))?;
        Ok(sources)
    }

    fn install(&mut self, ctx: &StageContext<'_>, target_root: &Path) -> Result<(), StageError> {
        let stage = Stage::Install;
        let mut extra = vec![(
            "TARGET_ROOT".to_string(),
            target_root.display().to_string(),
        )];
        // Kept alive until the hook exits; removed on drop.
        let _password_file = match &ctx.config.password {
            PasswordPolicy::Explicit(secret) => {
                let path = ctx.layout.work_dir().join(".root-password");
                let file = SecretFile::write(&path, secret.expose())
                    .map_err(|e| StageError::new(stage, e))?;
                extra.push((
                    "PASSWORD_FILE".to_string(),
                    file.path.display().to_string(),
                ));
                Some(file)
            }
            _ => None,
        };
        self.run_hook(stage, &self.project.hook(stage), ctx, extra)
    }

    fn configure(
        &mut self,
        ctx: &StageContext<'_>,
        effective_config: &Path,
    ) -> Result<(), StageError> {
        let extra = vec![(
            "EFFECTIVE_CONFIG".to_string(),
            effective_config.display().to_string(),
        )];
        self.run_hook(Stage::Configure, &self.project.hook(Stage::Configure), ctx, extra)
    }

    fn compile(&mut self, ctx: &StageContext<'_>) -> Result<PathBuf, StageError> {
        self.run_hook(Stage::Compile, &self.project.hook(Stage::Compile), ctx, Vec::new())?;
        Ok(ctx.layout.raw_artifact())
    }

    fn cleanup(&mut self, stage: Stage, ctx: &StageContext<'_>) -> Result<(), StageError> {
        let script = self.project.cleanup_hook(stage);
        if script.is_file() {
            return self.run_hook(stage, &script, ctx, Vec::new());
        }
        if stage == Stage::Install {
            let root = ctx.layout.rootfs_dir();
            if root.exists() {
                log::info!("[stage:{stage}] clearing {}", root.display());
                fs::remove_dir_all(&root).map_err(|e| {
                    StageError::new(stage, format!("clearing '{}': {e}", root.display()))
                })?;
            }
            fs::create_dir_all(&root).map_err(|e| {
                StageError::new(stage, format!("creating '{}': {e}", root.display()))
            })?;
        }
        Ok(())
    }
}

/// Variables every hook receives. Secrets never appear here.
pub fn hook_environment(
    stage: Stage,
    project: &ProjectLayout,
    ctx: &StageContext<'_>,
) -> Vec<(String, String)> {
    let path = |p: &Path| p.display().to_string();
    let flag = |b: bool| if b { "1" } else { "0" }.to_string();
    let jobs = ctx.resources.safe_workers;

    let mut env = vec![
        ("STAGE_NAME".to_string(), stage.name().to_string()),
        ("STAGE_ORDINAL".to_string(), stage.ordinal().to_string()),
        ("FINGERPRINT".to_string(), ctx.fingerprint.to_string()),
        ("PROJECT_DIR".to_string(), path(project.root())),
        ("WORK_DIR".to_string(), path(ctx.layout.work_dir())),
        ("TARGET_ROOT".to_string(), path(&ctx.layout.rootfs_dir())),
        ("SOURCES_DIR".to_string(), path(&ctx.layout.sources_dir())),
        (
            "KERNEL_BUILD_DIR".to_string(),
            path(&ctx.layout.kernel_build_dir()),
        ),
        (
            "EFFECTIVE_CONFIG".to_string(),
            path(&ctx.layout.effective_config()),
        ),
        ("ARTIFACT_PATH".to_string(), path(&ctx.layout.raw_artifact())),
        (
            "CACHE_DIR".to_string(),
            ctx.layout.cache_dir().map(path).unwrap_or_default(),
        ),
        ("JOBS".to_string(), jobs.to_string()),
        ("MAKEFLAGS".to_string(), format!("-j{jobs}")),
        (
            "KCFLAGS".to_string(),
            ctx.resources.compiler.kcflags().to_string(),
        ),
        (
            "COMPILER_PROFILE".to_string(),
            ctx.resources.compiler.slug().to_string(),
        ),
        ("PRESET".to_string(), ctx.config.preset.slug().to_string()),
        (
            "COMPONENTS".to_string(),
            ctx.config
                .components
                .enabled()
                .map(Component::slug)
                .collect::<Vec<_>>()
                .join(","),
        ),
        (
            "EXECUTION_CONTEXT".to_string(),
            ctx.resources.context.slug().to_string(),
        ),
        ("PRIVILEGED".to_string(), flag(ctx.resources.privileged)),
    ];

    for (component, enabled) in ctx.config.components.iter() {
        env.push((component_variable(component), flag(enabled)));
    }

    let (mode, length) = match &ctx.config.password {
        PasswordPolicy::Explicit(_) => ("explicit", String::new()),
        PasswordPolicy::Random { length } => ("random", length.to_string()),
        PasswordPolicy::NoPassword => ("none", String::new()),
    };
    env.push(("ROOT_PASSWORD_MODE".to_string(), mode.to_string()));
    env.push(("ROOT_PASSWORD_LENGTH".to_string(), length));

    env
}

/// `network-tools` → `WITH_NETWORK_TOOLS`.
pub fn component_variable(component: Component) -> String {
    format!(
        "WITH_{}",
        component.slug().replace('-', "_").to_ascii_uppercase()
    )
}

/// Owner-only file holding a secret; deleted on drop.
#[derive(Debug)]
struct SecretFile {
    path: PathBuf,
}

impl SecretFile {
    fn write(path: &Path, contents: &str) -> Result<Self, String> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("creating '{}': {e}", parent.display()))?;
        }
        let _ = fs::remove_file(path);
        let guard = Self {
            path: path.to_path_buf(),
        };
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(path)
            .map_err(|e| format!("creating password file: {e}"))?;
        file.write_all(contents.as_bytes())
            .map_err(|e| format!("writing password file: {e}"))?;
        Ok(guard)
    }
}

impl Drop for SecretFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{resolve, Secret};
    use crate::kconfig::{merge, ConfigDocument};
    use crate::resources::{plan, ExecutionContext, ResourceSnapshot};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        project: ProjectLayout,
        config: BuildConfiguration,
        fingerprint: Fingerprint,
        effective: EffectiveConfig,
        resources: ResourceProfile,
        layout: WorkLayout,
        interrupt: Interrupt,
    }

    impl Fixture {
        fn new(args: &[&str]) -> Self {
            let dir = TempDir::new().unwrap();
            let project = ProjectLayout::new(&dir.path().join("project"));
            let config = resolve(args, None).unwrap().config;
            let fingerprint = config.fingerprint();
            let layout = WorkLayout::new(&dir.path().join("state"), &fingerprint, &config);
            layout.create().unwrap();
            let resources = plan(
                &ResourceSnapshot {
                    context: ExecutionContext::Ci,
                    available_memory: 16 * 1024 * 1024 * 1024,
                    core_count: 4,
                    privileged: false,
                },
                None,
                true,
            );
            Self {
                _dir: dir,
                project,
                config,
                fingerprint,
                effective: merge(&ConfigDocument::default(), &[]).unwrap(),
                resources,
                layout,
                interrupt: Interrupt::new(),
            }
        }

        fn ctx(&self) -> StageContext<'_> {
            StageContext {
                config: &self.config,
                fingerprint: &self.fingerprint,
                effective: &self.effective,
                resources: &self.resources,
                layout: &self.layout,
                interrupt: &self.interrupt,
            }
        }

        fn hook(&self, stage: Stage, body: &str) {
            let path = self.project.hook(stage);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, body).unwrap();
        }
    }

    #[test]
    fn environment_describes_configuration() {
        let fx = Fixture::new(&["minimal", "--with-network-tools", "-j2"]);
        let env: BTreeMap<_, _> = hook_environment(Stage::Compile, &fx.project, &fx.ctx())
            .into_iter()
            .collect();
        assert_eq!(env["WITH_NETWORK_TOOLS"], "1");
        assert_eq!(env["WITH_ZFS"], "0");
        assert_eq!(env["COMPONENTS"], "network-tools");
        assert_eq!(env["JOBS"], fx.resources.safe_workers.to_string());
        assert_eq!(env["EXECUTION_CONTEXT"], "ci");
        assert_eq!(env["ROOT_PASSWORD_MODE"], "random");
        assert_eq!(env["KCFLAGS"], "-O2");
    }

    #[test]
    fn explicit_password_only_reaches_install_through_a_file() {
        let mut fx = Fixture::new(&["minimal"]);
        fx.config.password = PasswordPolicy::Explicit(Secret::new("tr0ub4dor&3"));
        let env = hook_environment(Stage::Install, &fx.project, &fx.ctx());
        assert!(env.iter().all(|(_, v)| !v.contains("tr0ub4dor")));

        let capture = fx.layout.work_dir().join("captured");
        fx.hook(
            Stage::Install,
            &format!(
                "stat -c %a \"$PASSWORD_FILE\" > {0}\ncat \"$PASSWORD_FILE\" >> {0}\n",
                capture.display()
            ),
        );
        let rootfs = fx.layout.rootfs_dir();
        let mut toolchain = HookToolchain::new(&fx.project);
        toolchain.install(&fx.ctx(), &rootfs).unwrap();

        let captured = fs::read_to_string(&capture).unwrap();
        assert!(captured.starts_with("600"));
        assert!(captured.contains("tr0ub4dor&3"));
        assert!(!fx.layout.work_dir().join(".root-password").exists());
    }

    #[test]
    fn missing_hook_is_a_stage_error() {
        let fx = Fixture::new(&["minimal"]);
        let mut toolchain = HookToolchain::new(&fx.project);
        let err = toolchain.compile(&fx.ctx()).unwrap_err();
        assert_eq!(err.stage, Stage::Compile);
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn failing_fetch_hook_is_exhausted() {
        let fx = Fixture::new(&["minimal"]);
        fx.hook(Stage::Fetch, "echo 'all mirrors down' >&2\nexit 1\n");
        let mut toolchain = HookToolchain::new(&fx.project);
        assert!(matches!(
            toolchain.fetch(&fx.ctx()),
            Err(FetchError::Exhausted(_))
        ));
    }

    #[test]
    fn install_cleanup_clears_rootfs_without_hook() {
        let fx = Fixture::new(&["minimal"]);
        let stale = fx.layout.rootfs_dir().join("etc/leftover");
        fs::create_dir_all(stale.parent().unwrap()).unwrap();
        fs::write(&stale, "x").unwrap();

        let mut toolchain = HookToolchain::new(&fx.project);
        toolchain.cleanup(Stage::Install, &fx.ctx()).unwrap();
        assert!(!stale.exists());
        assert!(fx.layout.rootfs_dir().is_dir());
    }

    #[test]
    fn component_variable_names() {
        assert_eq!(component_variable(Component::DevTools), "WITH_DEV_TOOLS");
        assert_eq!(component_variable(Component::Zfs), "WITH_ZFS");
    }
}
