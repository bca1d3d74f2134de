//! Compression capability.
//!
//! [`HostCompressor`] drives `upx` and `xz` from the host and compresses
//! zstd sidecars in-process.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::config::CompressionTool;
use crate::error::FinalizeError;
use crate::interrupt::Interrupt;
use crate::process::Cmd;

const ZSTD_LEVEL: i32 = 19;

pub trait Compressor {
    /// Whether `tool` can run on this host.
    fn available(&self, tool: CompressionTool) -> bool;

    /// Compress `input` into `output`; `input` must be left untouched.
    fn compress(
        &self,
        tool: CompressionTool,
        input: &Path,
        output: &Path,
    ) -> Result<(), FinalizeError>;

    /// Check that `output` is a valid product of `tool`.
    fn verify(&self, tool: CompressionTool, output: &Path) -> Result<(), FinalizeError>;
}

#[derive(Debug, Clone, Default)]
pub struct HostCompressor {
    interrupt: Option<Interrupt>,
}

impl HostCompressor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kill running `upx`/`xz` children when `interrupt` is raised.
    pub fn interruptible(mut self, interrupt: &Interrupt) -> Self {
        self.interrupt = Some(interrupt.clone());
        self
    }

    fn cmd(&self, program: &str) -> Cmd {
        let cmd = Cmd::new(program);
        match &self.interrupt {
            Some(interrupt) => cmd.interruptible(interrupt),
            None => cmd,
        }
    }

    fn binary(tool: CompressionTool) -> Option<&'static str> {
        match tool {
            CompressionTool::Upx => Some("upx"),
            CompressionTool::Xz => Some("xz"),
            CompressionTool::Zstd => None,
        }
    }
}

impl Compressor for HostCompressor {
    fn available(&self, tool: CompressionTool) -> bool {
        match Self::binary(tool) {
            Some(binary) => which::which(binary).is_ok(),
            None => true,
        }
    }

    fn compress(
        &self,
        tool: CompressionTool,
        input: &Path,
        output: &Path,
    ) -> Result<(), FinalizeError> {
        if !self.available(tool) {
            return Err(FinalizeError::ToolMissing { tool });
        }
        let failed = |message: String| FinalizeError::Compression { tool, message };

        match tool {
            CompressionTool::Upx => {
                let _ = fs::remove_file(output);
                self.cmd("upx")
                    .args(["--best", "-q", "-o"])
                    .arg_path(output)
                    .arg_path(input)
                    .run()
                    .map_err(|e| failed(format!("{e:#}")))?;
            }
            CompressionTool::Xz => {
                // xz compresses in place, so work on a private copy.
                let staging = sibling(output, "xz-input");
                fs::copy(input, &staging).map_err(|source| FinalizeError::Io {
                    path: staging.clone(),
                    source,
                })?;
                let result = self.cmd("xz")
                    .args(["-T0", "-9", "--force"])
                    .arg_path(&staging)
                    .run();
                let produced = PathBuf::from(format!("{}.xz", staging.display()));
                if let Err(e) = result {
                    let _ = fs::remove_file(&staging);
                    let _ = fs::remove_file(&produced);
                    return Err(failed(format!("{e:#}")));
                }
                fs::rename(&produced, output).map_err(|source| FinalizeError::Io {
                    path: output.to_path_buf(),
                    source,
                })?;
            }
            CompressionTool::Zstd => zstd_encode(input, output).map_err(|source| {
                FinalizeError::Io {
                    path: output.to_path_buf(),
                    source,
                }
            })?,
        }
        Ok(())
    }

    fn verify(&self, tool: CompressionTool, output: &Path) -> Result<(), FinalizeError> {
        match tool {
            CompressionTool::Upx => self.cmd("upx")
                .args(["-t", "-q"])
                .arg_path(output)
                .run()
                .map(|_| ())
                .map_err(|e| FinalizeError::Verification(format!("{e:#}"))),
            CompressionTool::Xz => self.cmd("xz")
                .arg("-t")
                .arg_path(output)
                .run()
                .map(|_| ())
                .map_err(|e| FinalizeError::Verification(format!("{e:#}"))),
            CompressionTool::Zstd => {
                let f = File::open(output).map_err(|source| FinalizeError::Io {
                    path: output.to_path_buf(),
                    source,
                })?;
                zstd::stream::copy_decode(BufReader::new(f), io::sink())
                    .map_err(|e| FinalizeError::Verification(e.to_string()))
            }
        }
    }
}

fn zstd_encode(input: &Path, output: &Path) -> io::Result<()> {
    let mut reader = BufReader::new(File::open(input)?);
    let out = BufWriter::new(File::create(output)?);
    let mut encoder = zstd::stream::Encoder::new(out, ZSTD_LEVEL)?;
    io::copy(&mut reader, &mut encoder)?;
    let mut out = encoder.finish()?;
    out.flush()
}

/// `<dir>/.<name>.<suffix>` next to `path`.
pub(crate) fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "artifact".to_string());
    path.with_file_name(format!(".{name}.{suffix}"))
}
