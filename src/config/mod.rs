//! Resolved build configuration.
//!
//! A [`BuildConfiguration`] is produced once per invocation by
//! [`resolve::resolve`] and then only ever handed out by shared reference.
//! Its [`Fingerprint`] scopes checkpoint validity.

pub mod defaults;
pub mod resolve;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::de::Deserializer;
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub use resolve::{resolve, Resolved, RestartMode};

/// Default length of generated root passwords.
pub const DEFAULT_PASSWORD_LENGTH: usize = 16;

/// Shortest random password the resolver accepts.
pub const MIN_PASSWORD_LENGTH: usize = 8;

/// Optional pieces of the image that can be toggled independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Component {
    /// Out-of-tree ZFS filesystem driver.
    Zfs,
    RecoveryTools,
    NetworkTools,
    /// dm-crypt/LUKS support.
    Encryption,
    /// Text UI menu on the console.
    Tui,
    StorageTools,
    Diagnostics,
    DevTools,
}

impl Component {
    /// Declaration order doubles as overlay application order.
    pub const ALL: [Component; 8] = [
        Component::Zfs,
        Component::RecoveryTools,
        Component::NetworkTools,
        Component::Encryption,
        Component::Tui,
        Component::StorageTools,
        Component::Diagnostics,
        Component::DevTools,
    ];

    pub fn slug(self) -> &'static str {
        match self {
            Component::Zfs => "zfs",
            Component::RecoveryTools => "recovery-tools",
            Component::NetworkTools => "network-tools",
            Component::Encryption => "encryption",
            Component::Tui => "tui",
            Component::StorageTools => "storage-tools",
            Component::Diagnostics => "diagnostics",
            Component::DevTools => "dev-tools",
        }
    }

    pub fn from_slug(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "zfs" | "filesystem-driver" => Some(Component::Zfs),
            "recovery-tools" | "recovery" => Some(Component::RecoveryTools),
            "network-tools" | "network" => Some(Component::NetworkTools),
            "encryption" | "crypt" => Some(Component::Encryption),
            "tui" | "text-ui" => Some(Component::Tui),
            "storage-tools" => Some(Component::StorageTools),
            "diagnostics" | "diag-tools" => Some(Component::Diagnostics),
            "dev-tools" => Some(Component::DevTools),
            _ => None,
        }
    }

    /// Advanced package groups are only part of the `full` preset.
    pub fn is_advanced_group(self) -> bool {
        matches!(
            self,
            Component::StorageTools | Component::Diagnostics | Component::DevTools
        )
    }

    /// Whether selecting this component requires a kernel overlay file.
    ///
    /// Components without kernel requirements may still ship an overlay; it is
    /// applied when present.
    pub fn overlay_required(self) -> bool {
        matches!(self, Component::Zfs | Component::Encryption)
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

/// Inclusion boolean for every [`Component`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ComponentSet {
    flags: BTreeMap<Component, bool>,
}

impl ComponentSet {
    pub fn uniform(value: bool) -> Self {
        Self {
            flags: Component::ALL.iter().map(|c| (*c, value)).collect(),
        }
    }

    pub fn get(&self, component: Component) -> bool {
        self.flags.get(&component).copied().unwrap_or(false)
    }

    pub fn set(&mut self, component: Component, value: bool) {
        self.flags.insert(component, value);
    }

    /// Enabled components in declaration order.
    pub fn enabled(&self) -> impl Iterator<Item = Component> + '_ {
        Component::ALL.into_iter().filter(|c| self.get(*c))
    }

    pub fn iter(&self) -> impl Iterator<Item = (Component, bool)> + '_ {
        Component::ALL.into_iter().map(|c| (c, self.get(c)))
    }
}

impl Serialize for ComponentSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(Component::ALL.len()))?;
        for (component, value) in self.iter() {
            map.serialize_entry(component.slug(), &value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ComponentSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = BTreeMap::<String, bool>::deserialize(deserializer)?;
        let mut set = ComponentSet::uniform(false);
        for (key, value) in raw {
            let component = Component::from_slug(&key).ok_or_else(|| {
                serde::de::Error::custom(format!("unknown component '{key}'"))
            })?;
            set.set(component, value);
        }
        Ok(set)
    }
}

/// Named bundle of component defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Preset {
    Minimal,
    #[default]
    Standard,
    Full,
}

impl Preset {
    pub fn slug(self) -> &'static str {
        match self {
            Preset::Minimal => "minimal",
            Preset::Standard => "standard",
            Preset::Full => "full",
        }
    }

    pub fn from_slug(value: &str) -> Option<Self> {
        match value {
            "minimal" => Some(Preset::Minimal),
            "standard" => Some(Preset::Standard),
            "full" => Some(Preset::Full),
            _ => None,
        }
    }

    /// Full baseline of component booleans for this preset.
    pub fn components(self) -> ComponentSet {
        match self {
            Preset::Minimal => ComponentSet::uniform(false),
            Preset::Full => ComponentSet::uniform(true),
            Preset::Standard => {
                let mut set = ComponentSet::uniform(true);
                for component in Component::ALL {
                    if component.is_advanced_group() {
                        set.set(component, false);
                    }
                }
                set
            }
        }
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

/// Closed set of compression capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompressionTool {
    /// Self-decompressing executable packer; output stays bootable.
    #[default]
    Upx,
    Zstd,
    Xz,
}

impl CompressionTool {
    pub const ALL: [CompressionTool; 3] =
        [CompressionTool::Upx, CompressionTool::Zstd, CompressionTool::Xz];

    pub fn slug(self) -> &'static str {
        match self {
            CompressionTool::Upx => "upx",
            CompressionTool::Zstd => "zstd",
            CompressionTool::Xz => "xz",
        }
    }

    pub fn from_slug(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "upx" => Some(CompressionTool::Upx),
            "zstd" | "zst" => Some(CompressionTool::Zstd),
            "xz" => Some(CompressionTool::Xz),
            _ => None,
        }
    }

    /// Whether the compressed output can be booted directly.
    ///
    /// Tools that only produce a sidecar are measurement only.
    pub fn produces_bootable(self) -> bool {
        matches!(self, CompressionTool::Upx)
    }

    /// File extension for sidecar output.
    pub fn sidecar_extension(self) -> &'static str {
        match self {
            CompressionTool::Upx => "upx",
            CompressionTool::Zstd => "zst",
            CompressionTool::Xz => "xz",
        }
    }
}

impl fmt::Display for CompressionTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompressionPolicy {
    pub enabled: bool,
    pub tool: CompressionTool,
}

impl Default for CompressionPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            tool: CompressionTool::Upx,
        }
    }
}

/// A value that must never be printed.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// SHA-256 of the value; safe to persist or log.
    pub fn digest(&self) -> String {
        format!("{:x}", Sha256::digest(self.0.as_bytes()))
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

/// How the root password of the image is set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PasswordPolicy {
    Explicit(Secret),
    Random { length: usize },
    NoPassword,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        PasswordPolicy::Random {
            length: DEFAULT_PASSWORD_LENGTH,
        }
    }
}

impl fmt::Display for PasswordPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PasswordPolicy::Explicit(secret) => write!(f, "explicit ({secret})"),
            PasswordPolicy::Random { length } => write!(f, "random ({length} characters)"),
            PasswordPolicy::NoPassword => f.write_str("none"),
        }
    }
}

/// Where fetched components are cached.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CachePolicy {
    /// `dir: None` uses `<state>/cache`.
    Enabled { dir: Option<PathBuf> },
    Disabled,
}

impl Default for CachePolicy {
    fn default() -> Self {
        CachePolicy::Enabled { dir: None }
    }
}

/// Immutable result of flag resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildConfiguration {
    pub preset: Preset,
    pub components: ComponentSet,
    pub compression: CompressionPolicy,
    pub password: PasswordPolicy,
    /// Upper bound on workers; `None` means one per core.
    pub jobs: Option<usize>,
    pub cache: CachePolicy,
    /// Whether the scheduler may request temporary swap.
    pub allow_swap: bool,
    /// Ad hoc overlays named on the command line, in application order.
    pub kernel_overlays: Vec<PathBuf>,
}

impl Default for BuildConfiguration {
    fn default() -> Self {
        Self {
            preset: Preset::Standard,
            components: Preset::Standard.components(),
            compression: CompressionPolicy::default(),
            password: PasswordPolicy::default(),
            jobs: None,
            cache: CachePolicy::default(),
            allow_swap: true,
            kernel_overlays: Vec::new(),
        }
    }
}

impl BuildConfiguration {
    pub fn includes(&self, component: Component) -> bool {
        self.components.get(component)
    }

    /// Deterministic hash over everything that shapes the produced image.
    ///
    /// Jobs, cache location and swap permission are execution knobs and do not
    /// participate. Explicit passwords enter only as their digest.
    pub fn fingerprint(&self) -> Fingerprint {
        let password = match &self.password {
            PasswordPolicy::Explicit(secret) => {
                serde_json::json!({ "mode": "explicit", "sha256": secret.digest() })
            }
            PasswordPolicy::Random { length } => {
                serde_json::json!({ "mode": "random", "length": length })
            }
            PasswordPolicy::NoPassword => serde_json::json!({ "mode": "none" }),
        };
        let overlays: Vec<String> = self
            .kernel_overlays
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        let canonical = serde_json::json!({
            "schema": 1,
            "components": self.components,
            "compression": {
                "enabled": self.compression.enabled,
                "tool": self.compression.tool.slug(),
            },
            "password": password,
            "kernel_overlays": overlays,
        });
        let digest = Sha256::digest(canonical.to_string().as_bytes());
        Fingerprint(format!("{digest:x}"))
    }
}

impl fmt::Display for BuildConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "preset:       {}", self.preset)?;
        writeln!(f, "components:")?;
        for (component, enabled) in self.components.iter() {
            writeln!(
                f,
                "  {:<16} {}",
                component.slug(),
                if enabled { "yes" } else { "no" }
            )?;
        }
        let state = if self.compression.enabled {
            "enabled"
        } else {
            "disabled"
        };
        writeln!(f, "compression:  {} ({state})", self.compression.tool)?;
        writeln!(f, "password:     {}", self.password)?;
        match self.jobs {
            Some(jobs) => writeln!(f, "jobs:         at most {jobs}")?,
            None => writeln!(f, "jobs:         auto")?,
        }
        match &self.cache {
            CachePolicy::Enabled { dir: Some(dir) } => {
                writeln!(f, "cache:        {}", dir.display())?
            }
            CachePolicy::Enabled { dir: None } => writeln!(f, "cache:        default")?,
            CachePolicy::Disabled => writeln!(f, "cache:        disabled")?,
        }
        writeln!(
            f,
            "swap:         {}",
            if self.allow_swap { "allowed" } else { "never" }
        )?;
        if !self.kernel_overlays.is_empty() {
            writeln!(f, "kernel overlays:")?;
            for overlay in &self.kernel_overlays {
                writeln!(f, "  {}", overlay.display())?;
            }
        }
        Ok(())
    }
}

/// Hex SHA-256 of a resolved configuration.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Prefix used for directory names.
    pub fn short(&self) -> &str {
        self.0.get(..16).unwrap_or(&self.0)
    }
}

impl From<&str> for Fingerprint {
    fn from(value: &str) -> Self {
        Fingerprint(value.to_string())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_fingerprint_tolerates_foreign_values() {
        let hex = Fingerprint::from("0123456789abcdef0123");
        assert_eq!(hex.short(), "0123456789abcdef");
        assert_eq!(Fingerprint::from("abc").short(), "abc");
        // Byte 16 falls inside a two-byte character.
        let odd = Fingerprint::from("aéééééééééé");
        assert_eq!(odd.short(), "aéééééééééé");
    }

    #[test]
    fn standard_preset_excludes_advanced_groups() {
        let set = Preset::Standard.components();
        assert!(set.get(Component::Zfs));
        assert!(set.get(Component::Tui));
        assert!(!set.get(Component::DevTools));
        assert!(!set.get(Component::StorageTools));
    }

    #[test]
    fn fingerprint_changes_with_any_component() {
        let base = BuildConfiguration::default();
        for component in Component::ALL {
            let mut changed = base.clone();
            let current = changed.components.get(component);
            changed.components.set(component, !current);
            assert_ne!(
                base.fingerprint(),
                changed.fingerprint(),
                "toggling {component} must change the fingerprint"
            );
        }
    }

    #[test]
    fn fingerprint_ignores_execution_knobs() {
        let base = BuildConfiguration::default();
        let mut tuned = base.clone();
        tuned.jobs = Some(3);
        tuned.allow_swap = false;
        tuned.cache = CachePolicy::Disabled;
        assert_eq!(base.fingerprint(), tuned.fingerprint());
    }

    #[test]
    fn secret_never_formats_its_value() {
        let policy = PasswordPolicy::Explicit(Secret::new("hunter2"));
        assert!(!format!("{policy}").contains("hunter2"));
        assert!(!format!("{policy:?}").contains("hunter2"));

        let config = BuildConfiguration {
            password: policy,
            ..BuildConfiguration::default()
        };
        assert!(!config.to_string().contains("hunter2"));
    }

    #[test]
    fn component_set_serializes_with_slugs() {
        let set = Preset::Minimal.components();
        let json = serde_json::to_value(&set).unwrap();
        assert_eq!(json["network-tools"], serde_json::Value::Bool(false));
        let back: ComponentSet = serde_json::from_value(json).unwrap();
        assert_eq!(back, set);
    }
}
