use std::fmt;

use serde::{Deserialize, Serialize};

/// Whether a failed stage may simply be run again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Idempotency {
    SafeToRerun,
    /// The collaborator's cleanup must run before every attempt.
    RequiresCleanup,
}

/// Fixed, totally ordered build stages.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Fetch,
    Install,
    Configure,
    Compile,
    Finalize,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Fetch,
        Stage::Install,
        Stage::Configure,
        Stage::Compile,
        Stage::Finalize,
    ];

    /// One-based position in the pipeline.
    pub fn ordinal(self) -> usize {
        match self {
            Stage::Fetch => 1,
            Stage::Install => 2,
            Stage::Configure => 3,
            Stage::Compile => 4,
            Stage::Finalize => 5,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Stage::Fetch => "fetch",
            Stage::Install => "install",
            Stage::Configure => "configure",
            Stage::Compile => "compile",
            Stage::Finalize => "finalize",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Stage::ALL.into_iter().find(|stage| stage.name() == name)
    }

    pub fn idempotency(self) -> Idempotency {
        match self {
            Stage::Install => Idempotency::RequiresCleanup,
            Stage::Fetch | Stage::Configure | Stage::Compile | Stage::Finalize => {
                Idempotency::SafeToRerun
            }
        }
    }

    /// Every stage with a lower ordinal, in order.
    pub fn prerequisites(self) -> impl Iterator<Item = Stage> {
        Stage::ALL
            .into_iter()
            .filter(move |stage| stage.ordinal() < self.ordinal())
    }

    pub fn previous(self) -> Option<Stage> {
        self.prerequisites().last()
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
