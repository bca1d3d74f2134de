//! Resource-adaptive scheduling.
//!
//! [`plan`] turns a [`ResourceSnapshot`] and the requested job count into a
//! [`ResourceProfile`]. The profile is recomputed on every invocation.

pub mod probe;
pub mod swap;

use std::fmt;

use crate::fsutil::format_bytes;

pub use probe::{probe, ExecutionContext, ResourceSnapshot};
pub use swap::{SwapGuard, SwapOutcome, SwapProvisioner};

const GIB: u64 = 1024 * 1024 * 1024;

/// Memory one compile worker may need at peak.
pub const PER_WORKER_MEMORY_BUDGET: u64 = 2 * GIB;

/// Below this much available memory the build asks for swap and reduces
/// compiler flags.
pub const LOW_MEMORY_THRESHOLD: u64 = 4 * GIB;

pub const SWAP_FILE_SIZE: u64 = 4 * GIB;

/// Whether temporary swap should be provisioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapDecision {
    NotNeeded,
    Requested { bytes: u64 },
    /// Memory is low but the configuration forbids swap.
    Disallowed,
}

/// Compiler flag set handed to the compile collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompilerProfile {
    Optimized,
    /// Smaller per-unit memory footprint: `-O1`, no debug info.
    Reduced,
}

impl CompilerProfile {
    pub fn slug(self) -> &'static str {
        match self {
            CompilerProfile::Optimized => "optimized",
            CompilerProfile::Reduced => "reduced",
        }
    }

    /// Value exported as `KCFLAGS`.
    pub fn kcflags(self) -> &'static str {
        match self {
            CompilerProfile::Optimized => "-O2",
            CompilerProfile::Reduced => "-O1 -g0",
        }
    }
}

/// Scheduling decisions for one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceProfile {
    pub context: ExecutionContext,
    pub available_memory: u64,
    pub core_count: usize,
    pub safe_workers: usize,
    pub swap: SwapDecision,
    pub compiler: CompilerProfile,
    pub privileged: bool,
}

impl ResourceProfile {
    /// Degrade after the swap provisioner declined a request.
    pub fn swap_declined(self) -> Self {
        Self {
            safe_workers: 1,
            swap: SwapDecision::NotNeeded,
            ..self
        }
    }
}

impl fmt::Display for ResourceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "context:      {}", self.context)?;
        writeln!(f, "memory:       {} available", format_bytes(self.available_memory))?;
        writeln!(f, "cores:        {}", self.core_count)?;
        writeln!(f, "workers:      {}", self.safe_workers)?;
        let swap = match self.swap {
            SwapDecision::NotNeeded => "not needed".to_string(),
            SwapDecision::Requested { bytes } => format!("request {}", format_bytes(bytes)),
            SwapDecision::Disallowed => "needed but disallowed".to_string(),
        };
        writeln!(f, "swap:         {swap}")?;
        writeln!(
            f,
            "compiler:     {} (KCFLAGS=\"{}\")",
            self.compiler.slug(),
            self.compiler.kcflags()
        )
    }
}

/// Compute worker count, swap request and compiler profile.
///
/// `requested_jobs` is an upper bound. The result is never below one worker.
pub fn plan(
    snapshot: &ResourceSnapshot,
    requested_jobs: Option<usize>,
    allow_swap: bool,
) -> ResourceProfile {
    let wanted = requested_jobs.unwrap_or(snapshot.core_count).max(1);
    let memory_workers = (snapshot.available_memory / PER_WORKER_MEMORY_BUDGET) as usize;
    let safe_workers = wanted.min(memory_workers).max(1);

    let low_memory = snapshot.available_memory < LOW_MEMORY_THRESHOLD;
    let swap = match (low_memory, allow_swap) {
        (false, _) => SwapDecision::NotNeeded,
        (true, true) => SwapDecision::Requested {
            bytes: SWAP_FILE_SIZE,
        },
        (true, false) => SwapDecision::Disallowed,
    };
    let compiler = if low_memory {
        CompilerProfile::Reduced
    } else {
        CompilerProfile::Optimized
    };

    ResourceProfile {
        context: snapshot.context,
        available_memory: snapshot.available_memory,
        core_count: snapshot.core_count,
        safe_workers,
        swap,
        compiler,
        privileged: snapshot.privileged,
    }
}
