use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::artifact::compress::{sibling, Compressor};
use crate::config::{CompressionPolicy, CompressionTool};
use crate::error::FinalizeError;
use crate::fsutil::sha256_file;

/// Compressed copy kept next to the final artifact for size comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sidecar {
    pub path: PathBuf,
    pub tool: CompressionTool,
    pub size: u64,
}

/// What [`finalize`] produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalArtifact {
    pub path: PathBuf,
    pub sha256: String,
    pub size: u64,
    pub raw_size: u64,
    /// Tool whose output became the final artifact, if any.
    pub compressed_with: Option<CompressionTool>,
    pub sidecar: Option<Sidecar>,
    /// Recovered compression failures.
    pub warnings: Vec<String>,
}

impl FinalArtifact {
    pub fn checksum_path(&self) -> PathBuf {
        checksum_path(&self.path)
    }
}

pub fn checksum_path(artifact: &Path) -> PathBuf {
    let name = artifact
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    artifact.with_file_name(format!("{name}.sha256"))
}

/// Turn the raw build output into the final artifact at `output`.
///
/// Compression failures never fail this call: the raw bytes become the final
/// artifact and a warning is recorded. Errors are reserved for a missing raw
/// artifact and for failing to write `output`.
pub fn finalize(
    raw: &Path,
    output: &Path,
    policy: &CompressionPolicy,
    compressor: &dyn Compressor,
) -> Result<FinalArtifact, FinalizeError> {
    let raw_size = match fs::metadata(raw) {
        Ok(meta) if meta.is_file() && meta.len() > 0 => meta.len(),
        _ => {
            return Err(FinalizeError::MissingArtifact {
                path: raw.to_path_buf(),
            })
        }
    };
    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent).map_err(|source| FinalizeError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let mut warnings = Vec::new();
    let mut compressed_with = None;
    let mut sidecar = None;

    if !policy.enabled {
        copy_atomic(raw, output)?;
    } else if policy.tool.produces_bootable() {
        let staged = sibling(output, "partial");
        match compress_verified(compressor, policy.tool, raw, &staged) {
            Ok(()) => {
                fs::rename(&staged, output).map_err(|source| FinalizeError::Io {
                    path: output.to_path_buf(),
                    source,
                })?;
                compressed_with = Some(policy.tool);
            }
            Err(e) => {
                let _ = fs::remove_file(&staged);
                let warning = format!("compression skipped, keeping uncompressed image: {e}");
                log::warn!("[finalize] {warning}");
                warnings.push(warning);
                copy_atomic(raw, output)?;
            }
        }
    } else {
        copy_atomic(raw, output)?;
        let target = PathBuf::from(format!(
            "{}.{}",
            output.display(),
            policy.tool.sidecar_extension()
        ));
        let staged = sibling(&target, "partial");
        match compress_verified(compressor, policy.tool, raw, &staged) {
            Ok(()) => {
                fs::rename(&staged, &target).map_err(|source| FinalizeError::Io {
                    path: target.clone(),
                    source,
                })?;
                let size = fs::metadata(&target).map(|m| m.len()).unwrap_or(0);
                log::info!(
                    "[finalize] {} is measurement only; sidecar {} ({} of {} bytes)",
                    policy.tool,
                    target.display(),
                    size,
                    raw_size
                );
                sidecar = Some(Sidecar {
                    path: target,
                    tool: policy.tool,
                    size,
                });
            }
            Err(e) => {
                let _ = fs::remove_file(&staged);
                let warning = format!("no {} sidecar: {e}", policy.tool);
                log::warn!("[finalize] {warning}");
                warnings.push(warning);
            }
        }
    }

    let (sha256, size) = sha256_file(output).map_err(|e| FinalizeError::Io {
        path: output.to_path_buf(),
        source: io::Error::other(format!("{e:#}")),
    })?;
    let name = output
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let checksum = checksum_path(output);
    fs::write(&checksum, format!("{sha256}  {name}\n")).map_err(|source| FinalizeError::Io {
        path: checksum.clone(),
        source,
    })?;

    Ok(FinalArtifact {
        path: output.to_path_buf(),
        sha256,
        size,
        raw_size,
        compressed_with,
        sidecar,
        warnings,
    })
}

fn compress_verified(
    compressor: &dyn Compressor,
    tool: CompressionTool,
    input: &Path,
    staged: &Path,
) -> Result<(), FinalizeError> {
    if !compressor.available(tool) {
        return Err(FinalizeError::ToolMissing { tool });
    }
    compressor.compress(tool, input, staged)?;
    compressor.verify(tool, staged)?;
    match fs::metadata(staged) {
        Ok(meta) if meta.len() > 0 => Ok(()),
        Ok(_) => Err(FinalizeError::Verification(format!(
            "{tool} produced an empty file"
        ))),
        Err(_) => Err(FinalizeError::Verification(format!(
            "{tool} produced no output at '{}'",
            staged.display()
        ))),
    }
}

fn copy_atomic(src: &Path, dst: &Path) -> Result<(), FinalizeError> {
    let staged = sibling(dst, "copy");
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| FinalizeError::Io { path, source }
    };
    fs::copy(src, &staged).map_err(io_err(&staged))?;
    fs::rename(&staged, dst).map_err(io_err(dst))?;
    Ok(())
}
