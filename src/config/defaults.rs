//! Saved default configuration (`<state>/defaults.toml`).
//!
//! Explicit passwords are never written; a configuration carrying one is
//! saved with the default random policy instead.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::config::{
    BuildConfiguration, CachePolicy, ComponentSet, CompressionPolicy, CompressionTool,
    PasswordPolicy, Preset, DEFAULT_PASSWORD_LENGTH, MIN_PASSWORD_LENGTH,
};
use crate::error::ConfigError;
use crate::fsutil::write_atomic;

pub const DEFAULTS_FILENAME: &str = "defaults.toml";

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct DefaultsToml {
    defaults: DefaultsSection,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct DefaultsSection {
    preset: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    jobs: Option<usize>,
    #[serde(default = "default_true")]
    allow_swap: bool,
    #[serde(default)]
    kernel_overlays: Vec<PathBuf>,
    components: ComponentSet,
    compression: CompressionToml,
    password: PasswordToml,
    cache: CacheToml,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct CompressionToml {
    enabled: bool,
    tool: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct PasswordToml {
    mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    length: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct CacheToml {
    enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dir: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

/// Outcome of [`save_defaults`].
#[derive(Debug, Clone)]
pub struct SavedDefaults {
    pub path: PathBuf,
    /// An explicit password was replaced by the default random policy.
    pub password_dropped: bool,
}

pub fn defaults_path(state_root: &Path) -> PathBuf {
    state_root.join(DEFAULTS_FILENAME)
}

/// Load the saved baseline, if one exists.
pub fn load_defaults(path: &Path) -> Result<Option<BuildConfiguration>, ConfigError> {
    if !path.is_file() {
        return Ok(None);
    }
    let unusable = |reason: String| ConfigError::Defaults {
        path: path.to_path_buf(),
        reason,
    };
    let raw = fs::read_to_string(path).map_err(|e| unusable(e.to_string()))?;
    let parsed: DefaultsToml = toml::from_str(&raw).map_err(|e| unusable(e.to_string()))?;
    let section = parsed.defaults;

    let preset = Preset::from_slug(section.preset.trim())
        .ok_or_else(|| unusable(format!("unknown preset '{}'", section.preset)))?;
    let tool = CompressionTool::from_slug(&section.compression.tool).ok_or_else(|| {
        unusable(format!(
            "unknown compression tool '{}'",
            section.compression.tool
        ))
    })?;
    let password = match section.password.mode.as_str() {
        "none" => PasswordPolicy::NoPassword,
        "random" => {
            let length = section.password.length.unwrap_or(DEFAULT_PASSWORD_LENGTH);
            if length < MIN_PASSWORD_LENGTH {
                return Err(unusable(format!(
                    "password length {length} is below {MIN_PASSWORD_LENGTH}"
                )));
            }
            PasswordPolicy::Random { length }
        }
        other => {
            return Err(unusable(format!(
                "unsupported password mode '{other}' (expected 'random' or 'none')"
            )))
        }
    };
    if section.jobs == Some(0) {
        return Err(unusable("jobs must be at least 1".to_string()));
    }
    let cache = if section.cache.enabled {
        CachePolicy::Enabled {
            dir: section.cache.dir,
        }
    } else {
        CachePolicy::Disabled
    };

    Ok(Some(BuildConfiguration {
        preset,
        components: section.components,
        compression: CompressionPolicy {
            enabled: section.compression.enabled,
            tool,
        },
        password,
        jobs: section.jobs,
        cache,
        allow_swap: section.allow_swap,
        kernel_overlays: section.kernel_overlays,
    }))
}

/// Persist `config` as the baseline for later invocations.
pub fn save_defaults(path: &Path, config: &BuildConfiguration) -> Result<SavedDefaults> {
    let mut password_dropped = false;
    let password = match &config.password {
        PasswordPolicy::Explicit(_) => {
            password_dropped = true;
            PasswordToml {
                mode: "random".to_string(),
                length: Some(DEFAULT_PASSWORD_LENGTH),
            }
        }
        PasswordPolicy::Random { length } => PasswordToml {
            mode: "random".to_string(),
            length: Some(*length),
        },
        PasswordPolicy::NoPassword => PasswordToml {
            mode: "none".to_string(),
            length: None,
        },
    };
    let cache = match &config.cache {
        CachePolicy::Enabled { dir } => CacheToml {
            enabled: true,
            dir: dir.clone(),
        },
        CachePolicy::Disabled => CacheToml {
            enabled: false,
            dir: None,
        },
    };
    let document = DefaultsToml {
        defaults: DefaultsSection {
            preset: config.preset.slug().to_string(),
            jobs: config.jobs,
            allow_swap: config.allow_swap,
            kernel_overlays: config.kernel_overlays.clone(),
            components: config.components.clone(),
            compression: CompressionToml {
                enabled: config.compression.enabled,
                tool: config.compression.tool.slug().to_string(),
            },
            password,
            cache,
        },
    };
    let rendered = toml::to_string_pretty(&document).context("serializing saved defaults")?;
    write_atomic(path, rendered.as_bytes())
        .with_context(|| format!("writing saved defaults '{}'", path.display()))?;

    Ok(SavedDefaults {
        path: path.to_path_buf(),
        password_dropped,
    })
}
