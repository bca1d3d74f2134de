//! Temporary swap provisioning.
//!
//! The provisioner may decline any request; declining is never an error.
//! A provisioned swap file lives exactly as long as its [`SwapGuard`].

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::fsutil::format_bytes;
use crate::process::Cmd;
use crate::resources::{ResourceProfile, SwapDecision};

/// Disk that must stay free beyond the swap file itself.
const DISK_HEADROOM: u64 = 1024 * 1024 * 1024;

/// Result of a provisioning attempt.
#[derive(Debug)]
pub enum SwapOutcome {
    NotRequested,
    Provisioned(SwapGuard),
    Declined { reason: String },
}

impl SwapOutcome {
    /// Apply the outcome to a profile; a decline drops to one worker.
    pub fn adjust(&self, profile: ResourceProfile) -> ResourceProfile {
        match self {
            SwapOutcome::Declined { .. } => profile.swap_declined(),
            _ => profile,
        }
    }
}

/// Creates and activates a swap file at a fixed path.
#[derive(Debug, Clone)]
pub struct SwapProvisioner {
    path: PathBuf,
}

impl SwapProvisioner {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn provision(&self, profile: &ResourceProfile) -> SwapOutcome {
        let bytes = match profile.swap {
            SwapDecision::Requested { bytes } => bytes,
            SwapDecision::NotNeeded | SwapDecision::Disallowed => {
                return SwapOutcome::NotRequested
            }
        };
        if !profile.privileged {
            return SwapOutcome::Declined {
                reason: "activating swap requires root".to_string(),
            };
        }
        let Some(dir) = self.path.parent() else {
            return SwapOutcome::Declined {
                reason: format!("swap path '{}' has no parent", self.path.display()),
            };
        };
        if let Err(e) = fs::create_dir_all(dir) {
            return SwapOutcome::Declined {
                reason: format!("creating '{}': {e}", dir.display()),
            };
        }
        match free_space(dir) {
            Some(free) if free >= bytes + DISK_HEADROOM => {}
            Some(free) => {
                return SwapOutcome::Declined {
                    reason: format!(
                        "only {} free on '{}', need {}",
                        format_bytes(free),
                        dir.display(),
                        format_bytes(bytes + DISK_HEADROOM)
                    ),
                }
            }
            None => {
                return SwapOutcome::Declined {
                    reason: format!("cannot determine free space on '{}'", dir.display()),
                }
            }
        }

        match self.activate(bytes) {
            Ok(guard) => {
                log::info!(
                    "[swap] activated {} at {}",
                    format_bytes(bytes),
                    self.path.display()
                );
                SwapOutcome::Provisioned(guard)
            }
            Err(e) => SwapOutcome::Declined {
                reason: format!("{e:#}"),
            },
        }
    }

    fn activate(&self, bytes: u64) -> Result<SwapGuard> {
        // The guard exists before the file so every failure below removes it.
        let mut guard = SwapGuard {
            path: self.path.clone(),
            active: false,
        };
        Cmd::new("fallocate")
            .args(["-l", &bytes.to_string()])
            .arg_path(&self.path)
            .error_msg("allocating swap file failed")
            .run()?;
        fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))
            .with_context(|| format!("restricting '{}'", self.path.display()))?;
        Cmd::new("mkswap")
            .arg_path(&self.path)
            .error_msg("mkswap failed")
            .run()?;
        Cmd::new("swapon")
            .arg_path(&self.path)
            .error_msg("swapon failed")
            .run()?;
        guard.active = true;
        Ok(guard)
    }
}

/// Deactivates and deletes the swap file on drop.
#[derive(Debug)]
pub struct SwapGuard {
    path: PathBuf,
    active: bool,
}

impl SwapGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SwapGuard {
    fn drop(&mut self) {
        if self.active {
            match Cmd::new("swapoff").arg_path(&self.path).allow_fail().run() {
                Ok(result) if result.success() => {}
                Ok(result) => log::warn!(
                    "[swap] swapoff '{}' failed: {}",
                    self.path.display(),
                    result.stderr.trim()
                ),
                Err(e) => log::warn!("[swap] swapoff '{}': {e:#}", self.path.display()),
            }
        }
        if self.path.exists() {
            if let Err(e) = fs::remove_file(&self.path) {
                log::warn!("[swap] removing '{}': {e}", self.path.display());
            } else {
                log::info!("[swap] released {}", self.path.display());
            }
        }
    }
}

/// Bytes available to unprivileged writers on the filesystem holding `path`.
pub fn free_space(path: &Path) -> Option<u64> {
    fs2::available_space(path).ok()
}
