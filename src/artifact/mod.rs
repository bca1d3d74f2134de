//! Final artifact production: optional compression with a verified fallback
//! to the raw image.

pub mod compress;
pub mod finalize;

pub use compress::{Compressor, HostCompressor};
pub use finalize::{checksum_path, finalize, FinalArtifact, Sidecar};
