//! Kernel configuration documents and overlay merging.
//!
//! Application order is fixed: component overlays in component declaration
//! order, then `kernel/custom/*.config` sorted by file name, then overlays
//! named with `--kernel-overlay` in command-line order.

pub mod document;
pub mod overlay;

use std::fs;
use std::path::PathBuf;

use crate::config::BuildConfiguration;
use crate::error::MergeError;
use crate::pipeline::layout::ProjectLayout;

pub use document::{ApplyOutcome, ConfigDocument, Setting};
pub use overlay::{merge, ConfigOverlay, EffectiveConfig, MergeReport, OverlaySource};

/// One overlay chosen for a configuration, before it is read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedOverlay {
    pub name: String,
    pub source: OverlaySource,
    pub path: PathBuf,
    /// Missing required overlays are a [`MergeError::MissingOverlay`].
    pub required: bool,
}

/// Overlays that apply to `config`, in application order.
///
/// Only components that are enabled are considered; nothing is read for
/// the rest.
pub fn select_overlays(
    project: &ProjectLayout,
    config: &BuildConfiguration,
) -> Result<Vec<SelectedOverlay>, MergeError> {
    let mut selected = Vec::new();

    for component in config.components.enabled() {
        selected.push(SelectedOverlay {
            name: component.slug().to_string(),
            source: OverlaySource::Component(component),
            path: project.component_overlay(component),
            required: component.overlay_required(),
        });
    }

    let custom_dir = project.custom_overlay_dir();
    if custom_dir.is_dir() {
        let entries = fs::read_dir(&custom_dir).map_err(|source| MergeError::Io {
            path: custom_dir.clone(),
            source,
        })?;
        let mut custom = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| MergeError::Io {
                path: custom_dir.clone(),
                source,
            })?;
            let path = entry.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "config") {
                custom.push(path);
            }
        }
        custom.sort();
        for path in custom {
            let name = path
                .file_stem()
                .map(|s| format!("custom/{}", s.to_string_lossy()))
                .unwrap_or_else(|| "custom".to_string());
            selected.push(SelectedOverlay {
                name,
                source: OverlaySource::Custom,
                path,
                required: true,
            });
        }
    }

    for named in &config.kernel_overlays {
        selected.push(SelectedOverlay {
            name: named.display().to_string(),
            source: OverlaySource::Custom,
            path: project.resolve(named),
            required: true,
        });
    }

    Ok(selected)
}

/// Load the base document and every selected overlay, then merge.
pub fn load_effective(
    project: &ProjectLayout,
    config: &BuildConfiguration,
) -> Result<EffectiveConfig, MergeError> {
    let base = ConfigDocument::load(&project.base_config())?;

    let mut overlays = Vec::new();
    for selected in select_overlays(project, config)? {
        match ConfigOverlay::load(selected.name.clone(), selected.source, &selected.path)? {
            Some(overlay) => overlays.push(overlay),
            None if selected.required => {
                return Err(MergeError::MissingOverlay {
                    name: selected.name,
                    path: selected.path,
                })
            }
            None => log::debug!(
                "[kconfig] no overlay for '{}' at {}",
                selected.name,
                selected.path.display()
            ),
        }
    }

    let effective = merge(&base, &overlays)?;
    for report in &effective.reports {
        log::info!("[kconfig] {report}");
    }
    Ok(effective)
}
