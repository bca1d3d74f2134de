use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::config::Component;
use crate::error::MergeError;
use crate::kconfig::document::{parse_line, valid_key, ApplyOutcome, ConfigDocument, Setting};

/// What selected an overlay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverlaySource {
    Component(Component),
    /// Dropped into `kernel/custom/` or named with `--kernel-overlay`.
    Custom,
}

/// Ordered settings merged into a base document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigOverlay {
    pub name: String,
    pub source: OverlaySource,
    pub path: Option<PathBuf>,
    settings: Vec<(String, Setting)>,
}

impl ConfigOverlay {
    pub fn new(name: impl Into<String>, source: OverlaySource) -> Self {
        Self {
            name: name.into(),
            source,
            path: None,
            settings: Vec::new(),
        }
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.settings
            .push((key.into(), Setting::Value(value.into())));
        self
    }

    pub fn unset(mut self, key: impl Into<String>) -> Self {
        self.settings.push((key.into(), Setting::NotSet));
        self
    }

    /// Parse overlay text. Comments and blank lines carry no settings.
    pub fn parse(
        name: impl Into<String>,
        source: OverlaySource,
        path: &Path,
        text: &str,
    ) -> Result<Self, MergeError> {
        let mut overlay = Self::new(name, source);
        overlay.path = Some(path.to_path_buf());
        for (idx, raw) in text.lines().enumerate() {
            match parse_line(raw) {
                Ok(Some(setting)) => overlay.settings.push(setting),
                Ok(None) => {}
                Err(()) => {
                    return Err(MergeError::Malformed {
                        path: path.to_path_buf(),
                        line: idx + 1,
                        content: raw.to_string(),
                    })
                }
            }
        }
        Ok(overlay)
    }

    /// Read an overlay file; a missing file yields `Ok(None)`.
    pub fn load(
        name: impl Into<String>,
        source: OverlaySource,
        path: &Path,
    ) -> Result<Option<Self>, MergeError> {
        match fs::read_to_string(path) {
            Ok(text) => Self::parse(name, source, path, &text).map(Some),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(MergeError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn settings(&self) -> &[(String, Setting)] {
        &self.settings
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.settings.iter().map(|(key, _)| key.as_str())
    }

    fn origin(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("<{}>", self.name)))
    }
}

/// Per-overlay merge statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeReport {
    pub overlay: String,
    pub added: usize,
    pub modified: usize,
    pub unchanged: usize,
}

impl fmt::Display for MergeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} added, {} modified, {} unchanged",
            self.overlay, self.added, self.modified, self.unchanged
        )
    }
}

/// Base document with every selected overlay applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveConfig {
    pub document: ConfigDocument,
    pub reports: Vec<MergeReport>,
}

impl EffectiveConfig {
    pub fn render(&self) -> String {
        self.document.render()
    }
}

/// Apply `overlays` to a copy of `base` in slice order; later overlays win.
pub fn merge(
    base: &ConfigDocument,
    overlays: &[ConfigOverlay],
) -> Result<EffectiveConfig, MergeError> {
    let mut document = base.clone();
    let mut reports = Vec::with_capacity(overlays.len());

    for overlay in overlays {
        let mut report = MergeReport {
            overlay: overlay.name.clone(),
            added: 0,
            modified: 0,
            unchanged: 0,
        };
        for (key, setting) in &overlay.settings {
            if !valid_key(key) {
                return Err(MergeError::Malformed {
                    path: overlay.origin(),
                    line: 0,
                    content: setting.render(key),
                });
            }
            match document.apply(key, setting.clone()) {
                ApplyOutcome::Added => report.added += 1,
                ApplyOutcome::Modified => report.modified += 1,
                ApplyOutcome::Unchanged => report.unchanged += 1,
            }
        }
        reports.push(report);
    }

    Ok(EffectiveConfig { document, reports })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn base(text: &str) -> ConfigDocument {
        ConfigDocument::parse(Path::new("base.config"), text).unwrap()
    }

    #[test]
    fn not_set_marker_is_replaced() {
        let overlay = ConfigOverlay::new("opt", OverlaySource::Custom).set("OPT_A", "y");
        let merged = merge(&base("# OPT_A is not set\n"), &[overlay]).unwrap();
        assert_eq!(merged.render(), "OPT_A=y\n");
        assert_eq!(merged.reports[0].modified, 1);
    }

    #[test]
    fn later_overlay_wins_on_shared_key() {
        let first = ConfigOverlay::new("first", OverlaySource::Custom).set("CONFIG_X", "y");
        let second = ConfigOverlay::new("second", OverlaySource::Custom).set("CONFIG_X", "m");
        let merged = merge(&base(""), &[first.clone(), second.clone()]).unwrap();
        assert_eq!(
            merged.document.get("CONFIG_X"),
            Some(&Setting::Value("m".to_string()))
        );
        let reversed = merge(&base(""), &[second, first]).unwrap();
        assert_eq!(
            reversed.document.get("CONFIG_X"),
            Some(&Setting::Value("y".to_string()))
        );
    }

    #[test]
    fn reports_count_added_and_modified() {
        let overlay = ConfigOverlay::new("zfs", OverlaySource::Component(Component::Zfs))
            .set("CONFIG_A", "y")
            .set("CONFIG_B", "m")
            .unset("CONFIG_C");
        let merged = merge(&base("CONFIG_A=n\n# CONFIG_C is not set\n"), &[overlay]).unwrap();
        let report = &merged.reports[0];
        assert_eq!((report.added, report.modified, report.unchanged), (1, 1, 1));
        assert_eq!(report.to_string(), "zfs: 1 added, 1 modified, 1 unchanged");
    }

    #[test]
    fn invalid_key_is_malformed() {
        let overlay = ConfigOverlay::new("bad", OverlaySource::Custom).set("NOT A KEY", "y");
        assert!(matches!(
            merge(&base(""), &[overlay]),
            Err(MergeError::Malformed { .. })
        ));
    }

    #[test]
    fn overlay_parse_ignores_comments() {
        let overlay = ConfigOverlay::parse(
            "net",
            OverlaySource::Custom,
            Path::new("net.config"),
            "# network drivers\nCONFIG_E1000=y\n\n# CONFIG_WLAN is not set\n",
        )
        .unwrap();
        assert_eq!(overlay.settings().len(), 2);
    }

    #[test]
    fn missing_overlay_file_loads_as_none() {
        let loaded =
            ConfigOverlay::load("gone", OverlaySource::Custom, Path::new("/nonexistent/x.config"))
                .unwrap();
        assert!(loaded.is_none());
    }

    fn key() -> impl Strategy<Value = String> {
        "CONFIG_[A-F]{1,2}".prop_map(String::from)
    }

    fn setting() -> impl Strategy<Value = Setting> {
        prop_oneof![
            Just(Setting::NotSet),
            prop::sample::select(vec!["y", "m", "n", "\"x\"", "0x10"])
                .prop_map(|v| Setting::Value(v.to_string())),
        ]
    }

    fn overlay(name: &'static str) -> impl Strategy<Value = ConfigOverlay> {
        prop::collection::vec((key(), setting()), 0..8).prop_map(move |settings| {
            let mut overlay = ConfigOverlay::new(name, OverlaySource::Custom);
            overlay.settings = settings;
            overlay
        })
    }

    fn document() -> impl Strategy<Value = ConfigDocument> {
        prop::collection::vec((key(), setting()), 0..10).prop_map(|settings| {
            let text: String = settings
                .iter()
                .map(|(k, s)| format!("{}\n", s.render(k)))
                .collect();
            ConfigDocument::parse(Path::new("base.config"), &text).unwrap()
        })
    }

    proptest! {
        #[test]
        fn merge_is_idempotent(doc in document(), o in overlay("o")) {
            let once = merge(&doc, &[o.clone()]).unwrap().document;
            let twice = merge(&once, &[o]).unwrap().document;
            prop_assert_eq!(once.render(), twice.render());
        }

        #[test]
        fn at_most_one_line_per_key(doc in document(), a in overlay("a"), b in overlay("b")) {
            let merged = merge(&doc, &[a.clone(), b.clone()]).unwrap().document;
            for key in a.keys().chain(b.keys()) {
                prop_assert_eq!(merged.occurrences(key), 1);
            }
        }

        #[test]
        fn disjoint_overlays_commute(doc in document(), a in overlay("a"), b in overlay("b")) {
            let a_keys: Vec<&str> = a.keys().collect();
            prop_assume!(b.keys().all(|k| !a_keys.contains(&k)));
            let ab = merge(&doc, &[a.clone(), b.clone()]).unwrap().document;
            let ba = merge(&doc, &[b, a]).unwrap().document;
            prop_assert!(ab.equivalent(&ba));
        }

        #[test]
        fn later_overlay_wins(doc in document(), a in overlay("a"), b in overlay("b")) {
            let merged = merge(&doc, &[a, b.clone()]).unwrap().document;
            for key in b.keys() {
                let last = b
                    .settings()
                    .iter()
                    .rev()
                    .find(|(k, _)| k == key)
                    .map(|(_, s)| s);
                prop_assert_eq!(merged.get(key), last);
            }
        }
    }
}
