//! Resumable, resource-aware build orchestration for a single-file bootable
//! rescue image.
//!
//! A build is five fixed stages (fetch, install, configure, compile,
//! finalize). Each stage delegates its real work to a collaborator and is
//! checkpointed on success, scoped to the fingerprint of the configuration
//! that produced it:
//!
//! - **Configuration** - presets, `--with-*`/`--without-*` overrides and saved defaults
//! - **Kernel config** - base document plus ordered overlays, later wins
//! - **Resources** - worker count, swap and compiler profile from probed memory
//! - **Pipeline** - checkpointed stage state machine with resume and retry
//! - **Artifact** - compression with a verified fallback to the raw image
//!
//! # Architecture
//!
//! ```text
//! argv ──► config::resolve ──► BuildConfiguration ──► fingerprint
//!                                   │
//!          kconfig::load_effective ◄┤──► resources::plan ◄── resources::probe
//!                                   ▼
//!                           pipeline::Pipeline ──► Toolchain (hooks/<stage>.sh)
//!                                   │
//!                          checkpoint::CheckpointStore
//!                                   │
//!                           artifact::finalize ──► Compressor
//! ```

pub mod artifact;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod fsutil;
pub mod interrupt;
pub mod kconfig;
pub mod lock;
pub mod pipeline;
pub mod preflight;
pub mod process;
pub mod resources;
pub mod stage_runs;

pub use config::{BuildConfiguration, Component, Fingerprint, Preset};
pub use error::{ConfigError, MergeError, PipelineError, StageError};
pub use pipeline::{Pipeline, Stage, StageSelection};
