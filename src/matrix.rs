//! Variation matrix: presets × dimensions × formats.
//!
//! Expands the preset table into the flat list of [`Variation`]s the batch
//! job generates. Iteration order is deterministic and follows the config
//! file: presets in declaration order, each preset's dimensions in
//! declaration order, then formats (the preset's list, or the global default
//! order) with duplicates removed.
//!
//! Filters are independent allow-lists; an empty filter lets everything
//! through at its level.

use crate::config::PresetConfig;
use crate::dimensions::DimensionSpec;
use crate::imaging::{CropMode, FocalPoint, OutputFormat};
use indexmap::IndexMap;

/// One concrete derivative to generate for every source image.
#[derive(Debug, Clone, PartialEq)]
pub struct Variation {
    pub preset: String,
    pub dimensions: DimensionSpec,
    pub format: OutputFormat,
    pub crop: CropMode,
    pub focal: FocalPoint,
}

/// Allow-lists applied while expanding the matrix.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatrixFilter {
    pub presets: Vec<String>,
    pub dimensions: Vec<DimensionSpec>,
    pub formats: Vec<OutputFormat>,
}

impl MatrixFilter {
    fn allows_preset(&self, name: &str) -> bool {
        self.presets.is_empty() || self.presets.iter().any(|p| p == name)
    }

    fn allows_dimensions(&self, dims: &DimensionSpec) -> bool {
        self.dimensions.is_empty() || self.dimensions.contains(dims)
    }

    fn allows_format(&self, format: OutputFormat) -> bool {
        self.formats.is_empty() || self.formats.contains(&format)
    }
}

/// Formats in first-seen order with duplicates removed.
pub fn dedup_formats(formats: &[OutputFormat]) -> Vec<OutputFormat> {
    let mut out = Vec::with_capacity(formats.len());
    for &f in formats {
        if !out.contains(&f) {
            out.push(f);
        }
    }
    out
}

/// Expand presets into variations.
///
/// Presets without a `dimensions` table are skipped: they are not yet
/// configured for batch output, which is not an error.
pub fn build(
    presets: &IndexMap<String, PresetConfig>,
    default_formats: &[OutputFormat],
    filter: &MatrixFilter,
) -> Vec<Variation> {
    let mut variations = Vec::new();

    for (name, preset) in presets {
        if !filter.allows_preset(name) {
            continue;
        }
        let Some(dimensions) = &preset.dimensions else {
            tracing::debug!(preset = %name, "preset has no dimensions, skipping");
            continue;
        };
        let formats = dedup_formats(preset.formats.as_deref().unwrap_or(default_formats));
        let focal = preset.focal.unwrap_or_default();

        for dims in dimensions.keys() {
            if !filter.allows_dimensions(dims) {
                continue;
            }
            for &format in formats.iter().filter(|&&f| filter.allows_format(f)) {
                variations.push(Variation {
                    preset: name.clone(),
                    dimensions: *dims,
                    format,
                    crop: preset.crop,
                    focal,
                });
            }
        }
    }

    variations
}
