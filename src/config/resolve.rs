//! Flag resolution.
//!
//! Tokens are scanned left to right. Presets replace the component baseline at
//! their position; `--with-X`/`--without-X` are collected separately and laid
//! over the final baseline, so the last explicit token per component wins no
//! matter where the preset appears.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::PathBuf;

use crate::config::{
    BuildConfiguration, CachePolicy, Component, CompressionTool, PasswordPolicy, Preset, Secret,
    DEFAULT_PASSWORD_LENGTH, MIN_PASSWORD_LENGTH,
};
use crate::error::ConfigError;

/// Whether prior checkpoints for the fingerprint may be reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestartMode {
    #[default]
    Resume,
    /// Invalidate this fingerprint's checkpoints before stage 1.
    Clean,
}

/// Output of [`resolve`].
#[derive(Debug, Clone)]
pub struct Resolved {
    pub config: BuildConfiguration,
    pub restart: RestartMode,
    /// Unknown or ignored tokens. Never contain secret values.
    pub warnings: Vec<String>,
}

/// A value-bearing option that may be given more than once only with the same value.
struct Slot<T> {
    option: &'static str,
    value: Option<T>,
}

impl<T: PartialEq + Display> Slot<T> {
    fn new(option: &'static str) -> Self {
        Self {
            option,
            value: None,
        }
    }

    fn set(&mut self, value: T) -> Result<(), ConfigError> {
        match &self.value {
            Some(existing) if *existing != value => Err(ConfigError::Conflict {
                option: self.option.to_string(),
                first: existing.to_string(),
                second: value.to_string(),
            }),
            _ => {
                self.value = Some(value);
                Ok(())
            }
        }
    }
}

#[derive(Default)]
struct Scan {
    preset: Option<Preset>,
    explicit: BTreeMap<Component, bool>,
    compress: Option<bool>,
    no_cache: Option<bool>,
    swap: Option<bool>,
    no_password: bool,
    overlays: Vec<PathBuf>,
    restart: RestartMode,
    warnings: Vec<String>,
}

/// Resolve an ordered token list into a configuration.
///
/// `baseline` is the saved default configuration, if any; without one the
/// `standard` preset applies.
pub fn resolve<S: AsRef<str>>(
    args: &[S],
    baseline: Option<BuildConfiguration>,
) -> Result<Resolved, ConfigError> {
    let mut scan = Scan::default();
    let mut jobs: Slot<usize> = Slot::new("--jobs");
    let mut compressor: Slot<CompressionTool> = Slot::new("--compressor");
    let mut cache_dir: Slot<String> = Slot::new("--cache-dir");
    let mut password: Slot<Secret> = Slot::new("--password");
    let mut random: Slot<usize> = Slot::new("--random-password");

    let mut tokens = args.iter().map(AsRef::as_ref);
    while let Some(token) = tokens.next() {
        let (name, inline) = match token.split_once('=') {
            Some((name, value)) if name.starts_with("--") => (name, Some(value)),
            _ => (token, None),
        };

        if let Some(preset) = Preset::from_slug(name.trim_start_matches("--")) {
            if inline.is_none() {
                scan.preset = Some(preset);
                continue;
            }
        }

        match name {
            "--compress" => scan.compress = Some(true),
            "--no-compress" => scan.compress = Some(false),
            "--compressor" => {
                let value = required(name, inline)?;
                let tool =
                    CompressionTool::from_slug(value).ok_or_else(|| ConfigError::InvalidValue {
                        option: name.to_string(),
                        value: value.to_string(),
                        reason: "expected one of upx, zstd, xz".to_string(),
                    })?;
                compressor.set(tool)?;
                scan.compress = Some(true);
            }
            "--jobs" | "-j" => {
                let value = match inline {
                    Some(value) => value,
                    None => tokens.next().ok_or_else(|| ConfigError::MissingValue {
                        option: "--jobs".to_string(),
                    })?,
                };
                jobs.set(parse_jobs(value)?)?;
            }
            "--cache-dir" => {
                let value = required(name, inline)?;
                non_empty_path(name, value)?;
                cache_dir.set(value.to_string())?;
                scan.no_cache = Some(false);
            }
            "--no-cache" => scan.no_cache = Some(true),
            "--password" => {
                let value = inline.ok_or_else(|| ConfigError::MissingValue {
                    option: name.to_string(),
                })?;
                if value.is_empty() {
                    return Err(ConfigError::InvalidValue {
                        option: name.to_string(),
                        value: Secret::new(value).to_string(),
                        reason: "password must not be empty".to_string(),
                    });
                }
                password.set(Secret::new(value))?;
            }
            "--random-password" => {
                let length = match inline {
                    Some(value) => parse_password_length(value)?,
                    None => DEFAULT_PASSWORD_LENGTH,
                };
                random.set(length)?;
            }
            "--no-password" => scan.no_password = true,
            "--swap" => scan.swap = Some(true),
            "--no-swap" => scan.swap = Some(false),
            "--kernel-overlay" => {
                let value = required(name, inline)?;
                non_empty_path(name, value)?;
                scan.overlays.push(PathBuf::from(value));
            }
            "--resume" => scan.restart = RestartMode::Resume,
            "--clean" => scan.restart = RestartMode::Clean,
            _ => {
                if let Some(short) = token.strip_prefix("-j").filter(|v| !v.is_empty()) {
                    jobs.set(parse_jobs(short)?)?;
                } else if let Some(slug) = token.strip_prefix("--with-") {
                    toggle(&mut scan, slug, true, token);
                } else if let Some(slug) = token.strip_prefix("--without-") {
                    toggle(&mut scan, slug, false, token);
                } else {
                    scan.warnings.push(format!("ignoring unknown flag '{token}'"));
                }
            }
        }
    }

    let mut config = baseline.unwrap_or_default();
    if let Some(preset) = scan.preset {
        config.preset = preset;
        config.components = preset.components();
    }
    for (component, value) in &scan.explicit {
        config.components.set(*component, *value);
    }

    if let Some(tool) = compressor.value {
        config.compression.tool = tool;
    }
    if let Some(enabled) = scan.compress {
        config.compression.enabled = enabled;
    }

    if let Some(value) = jobs.value {
        config.jobs = Some(value);
    }

    match (scan.no_cache, cache_dir.value) {
        (Some(true), _) => config.cache = CachePolicy::Disabled,
        (_, Some(dir)) => {
            config.cache = CachePolicy::Enabled {
                dir: Some(PathBuf::from(dir)),
            }
        }
        _ => {}
    }

    if let Some(secret) = password.value {
        config.password = PasswordPolicy::Explicit(secret);
    } else if let Some(length) = random.value {
        config.password = PasswordPolicy::Random { length };
    } else if scan.no_password {
        config.password = PasswordPolicy::NoPassword;
    }

    if let Some(allow) = scan.swap {
        config.allow_swap = allow;
    }
    if !scan.overlays.is_empty() {
        config.kernel_overlays = scan.overlays;
    }

    Ok(Resolved {
        config,
        restart: scan.restart,
        warnings: scan.warnings,
    })
}

fn toggle(scan: &mut Scan, slug: &str, value: bool, token: &str) {
    match Component::from_slug(slug) {
        Some(component) => {
            scan.explicit.insert(component, value);
        }
        None => scan
            .warnings
            .push(format!("ignoring unknown component in '{token}'")),
    }
}

fn required<'a>(option: &str, inline: Option<&'a str>) -> Result<&'a str, ConfigError> {
    inline.ok_or_else(|| ConfigError::MissingValue {
        option: option.to_string(),
    })
}

fn non_empty_path(option: &str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::InvalidValue {
            option: option.to_string(),
            value: value.to_string(),
            reason: "path must not be empty".to_string(),
        });
    }
    Ok(())
}

fn parse_jobs(value: &str) -> Result<usize, ConfigError> {
    match value.parse::<usize>() {
        Ok(0) => Err(ConfigError::InvalidValue {
            option: "--jobs".to_string(),
            value: value.to_string(),
            reason: "must be at least 1".to_string(),
        }),
        Ok(jobs) => Ok(jobs),
        Err(e) => Err(ConfigError::InvalidValue {
            option: "--jobs".to_string(),
            value: value.to_string(),
            reason: e.to_string(),
        }),
    }
}

fn parse_password_length(value: &str) -> Result<usize, ConfigError> {
    let length = value
        .parse::<usize>()
        .map_err(|e| ConfigError::InvalidValue {
            option: "--random-password".to_string(),
            value: value.to_string(),
            reason: e.to_string(),
        })?;
    if length < MIN_PASSWORD_LENGTH {
        return Err(ConfigError::InvalidValue {
            option: "--random-password".to_string(),
            value: value.to_string(),
            reason: format!("length must be at least {MIN_PASSWORD_LENGTH}"),
        });
    }
    Ok(length)
}
