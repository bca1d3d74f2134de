use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use crate::error::MergeError;

/// Value of one configuration key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Setting {
    /// `KEY=value`; the value is kept verbatim (`y`, `m`, `"str"`, `0x10`).
    Value(String),
    /// `# KEY is not set`
    NotSet,
}

impl Setting {
    pub fn render(&self, key: &str) -> String {
        match self {
            Setting::Value(value) => format!("{key}={value}"),
            Setting::NotSet => format!("# {key} is not set"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    Setting { key: String, setting: Setting },
    Comment(String),
    Blank,
}

/// Result of applying a single setting to a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Added,
    Modified,
    Unchanged,
}

/// Parsed line-oriented kernel configuration.
///
/// Comments and blank lines are preserved so rendering a freshly parsed
/// document reproduces its settings in their original order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConfigDocument {
    lines: Vec<Line>,
}

/// Parse one line. `Ok(None)` is a blank line or a plain comment.
pub(crate) fn parse_line(raw: &str) -> Result<Option<(String, Setting)>, ()> {
    let line = raw.trim();
    if line.is_empty() {
        return Ok(None);
    }
    if let Some(comment) = line.strip_prefix('#') {
        if let Some(key) = comment
            .trim()
            .strip_suffix("is not set")
            .map(str::trim)
            .filter(|key| valid_key(key))
        {
            return Ok(Some((key.to_string(), Setting::NotSet)));
        }
        return Ok(None);
    }
    match line.split_once('=') {
        Some((key, value)) if valid_key(key.trim()) => Ok(Some((
            key.trim().to_string(),
            Setting::Value(value.trim().to_string()),
        ))),
        _ => Err(()),
    }
}

pub(crate) fn valid_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl ConfigDocument {
    pub fn parse(path: &Path, text: &str) -> Result<Self, MergeError> {
        let mut lines = Vec::new();
        for (idx, raw) in text.lines().enumerate() {
            let parsed = parse_line(raw).map_err(|()| MergeError::Malformed {
                path: path.to_path_buf(),
                line: idx + 1,
                content: raw.to_string(),
            })?;
            let line = match parsed {
                Some((key, setting)) => Line::Setting { key, setting },
                None if raw.trim().is_empty() => Line::Blank,
                None => Line::Comment(raw.trim_end().to_string()),
            };
            lines.push(line);
        }
        Ok(Self { lines })
    }

    pub fn load(path: &Path) -> Result<Self, MergeError> {
        let text = fs::read_to_string(path).map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                MergeError::MissingDocument {
                    path: path.to_path_buf(),
                }
            } else {
                MergeError::Io {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;
        Self::parse(path, &text)
    }

    pub fn get(&self, key: &str) -> Option<&Setting> {
        self.lines.iter().rev().find_map(|line| match line {
            Line::Setting { key: k, setting } if k == key => Some(setting),
            _ => None,
        })
    }

    /// Every key with the setting that takes effect for it.
    pub fn settings(&self) -> BTreeMap<&str, &Setting> {
        let mut map = BTreeMap::new();
        for line in &self.lines {
            if let Line::Setting { key, setting } = line {
                map.insert(key.as_str(), setting);
            }
        }
        map
    }

    /// Number of lines carrying `key`.
    pub fn occurrences(&self, key: &str) -> usize {
        self.lines
            .iter()
            .filter(|line| matches!(line, Line::Setting { key: k, .. } if k == key))
            .count()
    }

    /// Remove every occurrence of `key`, then append `setting` for it.
    pub fn apply(&mut self, key: &str, setting: Setting) -> ApplyOutcome {
        let previous = self.get(key).cloned();
        self.lines
            .retain(|line| !matches!(line, Line::Setting { key: k, .. } if k == key));
        self.lines.push(Line::Setting {
            key: key.to_string(),
            setting: setting.clone(),
        });
        match previous {
            None => ApplyOutcome::Added,
            Some(prev) if prev == setting => ApplyOutcome::Unchanged,
            Some(_) => ApplyOutcome::Modified,
        }
    }

    /// Same effective setting for every key, ignoring line order and comments.
    pub fn equivalent(&self, other: &ConfigDocument) -> bool {
        self.settings() == other.settings()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            match line {
                Line::Setting { key, setting } => out.push_str(&setting.render(key)),
                Line::Comment(text) => out.push_str(text),
                Line::Blank => {}
            }
            out.push('\n');
        }
        out
    }
}
