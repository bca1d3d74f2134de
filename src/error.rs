//! Error taxonomy for the orchestrator.
//!
//! Configuration and merge errors are fatal before any stage runs. Fetch and
//! collaborator failures surface as a single [`StageError`] naming the stage.
//! Finalize errors are recovered locally by the artifact finalizer except when
//! the raw artifact itself is unusable.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::config::CompressionTool;
use crate::pipeline::Stage;

/// Malformed or conflicting flags.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {option}: {reason}")]
    InvalidValue {
        option: String,
        value: String,
        reason: String,
    },

    #[error("{option} requires a value")]
    MissingValue { option: String },

    #[error("conflicting values for {option}: '{first}' and '{second}'")]
    Conflict {
        option: String,
        first: String,
        second: String,
    },

    #[error("saved defaults '{}' are unusable: {reason}", path.display())]
    Defaults { path: PathBuf, reason: String },
}

/// Malformed or missing kernel configuration documents.
#[derive(Error, Debug)]
pub enum MergeError {
    #[error("malformed line {line} in '{}': {content}", path.display())]
    Malformed {
        path: PathBuf,
        line: usize,
        content: String,
    },

    #[error("configuration document not found: {}", path.display())]
    MissingDocument { path: PathBuf },

    #[error("overlay '{name}' was selected but does not exist at {}", path.display())]
    MissingOverlay { name: String, path: PathBuf },

    #[error("reading '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A component could not be obtained after every fallback source was tried.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("all sources exhausted: {0}")]
    Exhausted(String),

    #[error("fetch reported success but '{}' is missing", path.display())]
    MissingArtifact { path: PathBuf },
}

/// A collaborator reported failure for one stage.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("stage '{stage}' failed{}", message_suffix(.message))]
pub struct StageError {
    pub stage: Stage,
    pub message: Option<String>,
}

impl StageError {
    pub fn new(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: Some(message.into()),
        }
    }

    pub fn bare(stage: Stage) -> Self {
        Self {
            stage,
            message: None,
        }
    }
}

fn message_suffix(message: &Option<String>) -> String {
    match message {
        Some(message) if !message.trim().is_empty() => format!(": {}", message.trim()),
        _ => String::new(),
    }
}

/// Compression failures; the finalizer turns most of these into warnings.
#[derive(Error, Debug)]
pub enum FinalizeError {
    #[error("raw artifact not found: {}", path.display())]
    MissingArtifact { path: PathBuf },

    #[error("{tool} is not available on this host")]
    ToolMissing { tool: CompressionTool },

    #[error("{tool} failed: {message}")]
    Compression {
        tool: CompressionTool,
        message: String,
    },

    #[error("compressed output failed verification: {0}")]
    Verification(String),

    #[error("writing '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Pipeline-level terminal failure.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(
        "{source}\n  last completed stage: {}\n  a resume invocation will retry '{stage}' and every later stage",
        describe_stage(.last_completed)
    )]
    StageFailed {
        stage: Stage,
        last_completed: Option<Stage>,
        #[source]
        source: StageError,
    },

    #[error("stage '{stage}' cannot start: '{missing}' has not completed for this configuration")]
    PrerequisiteMissing { stage: Stage, missing: Stage },

    #[error("interrupted during stage '{stage}'; a resume invocation will restart it from the beginning")]
    Interrupted { stage: Stage },

    #[error("checkpoint store: {0:#}")]
    Store(anyhow::Error),
}

impl PipelineError {
    /// The stage the failure is attributed to, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineError::StageFailed { stage, .. }
            | PipelineError::PrerequisiteMissing { stage, .. }
            | PipelineError::Interrupted { stage } => Some(*stage),
            PipelineError::Store(_) => None,
        }
    }
}

fn describe_stage(stage: &Option<Stage>) -> String {
    match stage {
        Some(stage) => stage.to_string(),
        None => "none".to_string(),
    }
}
