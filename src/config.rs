//! Service configuration module.
//!
//! Handles loading, validating, and merging `config.toml`. The file is
//! optional: stock defaults cover every key, and a user file only needs the
//! values it wants to change.
//!
//! ## Configuration Options
//!
//! ```toml
//! # All options are optional - defaults shown below
//!
//! public_root = "public"           # Web root; sources and cache live under it
//! default_formats = ["avif", "webp", "jpg"]
//! allowed_dimensions = []          # Empty = any dimension token may be served
//!
//! [cache]
//! root = "/cache/images"           # URL prefix and path under public_root
//!
//! [engine]
//! binary = "convert"
//! timeout_secs = 60
//!
//! [quality]
//! jpg = 85
//! jpeg = 85
//! webp = 85
//! avif = 75
//! png = 90
//!
//! [optimization]
//! strip_metadata = true
//! colorspace = "sRGB"              # "" skips colorspace normalization
//! interlace = "Plane"              # "" disables interlacing
//! background = "white"             # Canvas color for the `fill` crop mode
//!
//! [serve]
//! bind = "127.0.0.1:8080"
//! default_crop = "cover"
//!
//! [batch]
//! source_dir = "library"           # Under public_root
//!
//! [processing]
//! max_processes = 4                # Omit for auto = CPU cores
//!
//! [lazy_load]
//! enabled = true
//! picture_attr = "data-lazysrc"
//! # ... attribute renames, see stock_config_toml()
//!
//! [presets.hero]
//! crop = "cover"
//! formats = ["avif", "webp", "jpg"]
//! sizes = "100vw"
//! [presets.hero.dimensions]
//! "1920x1080" = "1920w"
//! "960x540" = "960w"
//! ```
//!
//! ## Merging
//!
//! User values are merged over the stock defaults table by table with
//! [`merge_toml`]. The one exception is `presets`: a user file that defines
//! any preset replaces the stock preset table entirely, so stock dimension
//! sets never leak into user-defined presets.
//!
//! Unknown keys are rejected to catch typos early.

use crate::dimensions::DimensionSpec;
use crate::imaging::{CropMode, FocalPoint, OutputFormat};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Service configuration loaded from `config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    /// Web root. Source images and the derivative cache both live under it.
    pub public_root: PathBuf,
    /// Output formats in preference order, used when a preset lists none.
    pub default_formats: Vec<OutputFormat>,
    /// Dimension tokens the on-demand route may generate. Empty = any.
    pub allowed_dimensions: Vec<DimensionSpec>,
    pub cache: CacheConfig,
    pub engine: EngineConfig,
    /// Encoding quality per output extension.
    pub quality: BTreeMap<String, u32>,
    pub optimization: OptimizationConfig,
    pub serve: ServeConfig,
    pub batch: BatchConfig,
    pub processing: ProcessingConfig,
    pub lazy_load: LazyLoadConfig,
    /// Named presets, in file order.
    pub presets: IndexMap<String, PresetConfig>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            public_root: PathBuf::from("public"),
            default_formats: vec![OutputFormat::Avif, OutputFormat::Webp, OutputFormat::Jpg],
            allowed_dimensions: Vec::new(),
            cache: CacheConfig::default(),
            engine: EngineConfig::default(),
            quality: default_quality_table(),
            optimization: OptimizationConfig::default(),
            serve: ServeConfig::default(),
            batch: BatchConfig::default(),
            processing: ProcessingConfig::default(),
            lazy_load: LazyLoadConfig::default(),
            presets: default_presets(),
        }
    }
}

fn default_quality_table() -> BTreeMap<String, u32> {
    OutputFormat::ALL
        .into_iter()
        .map(|f| (f.extension().to_string(), f.default_quality().value()))
        .collect()
}

impl ServiceConfig {
    /// Validate config values are within acceptable ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (ext, &q) in &self.quality {
            if OutputFormat::from_extension(ext).is_none() {
                return Err(ConfigError::Validation(format!(
                    "quality.{ext}: not a supported output format"
                )));
            }
            if !(1..=100).contains(&q) {
                return Err(ConfigError::Validation(format!(
                    "quality.{ext} must be 1-100"
                )));
            }
        }
        if self.default_formats.is_empty() {
            return Err(ConfigError::Validation(
                "default_formats must not be empty".into(),
            ));
        }
        if !self.cache.root.starts_with('/') {
            return Err(ConfigError::Validation(
                "cache.root must start with '/'".into(),
            ));
        }
        if self.cache.root.contains("..") {
            return Err(ConfigError::Validation(
                "cache.root must not contain '..'".into(),
            ));
        }
        if self.engine.binary.is_empty() {
            return Err(ConfigError::Validation(
                "engine.binary must not be empty".into(),
            ));
        }
        if self.engine.timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "engine.timeout_secs must be greater than 0".into(),
            ));
        }
        for (name, preset) in &self.presets {
            if preset.formats.as_ref().is_some_and(|f| f.is_empty()) {
                return Err(ConfigError::Validation(format!(
                    "presets.{name}.formats must not be empty when set"
                )));
            }
            for bp in &preset.breakpoints {
                if bp.dimensions.is_empty() {
                    return Err(ConfigError::Validation(format!(
                        "presets.{name}: breakpoint at {}px has no dimensions",
                        bp.min_width
                    )));
                }
            }
        }
        Ok(())
    }

    /// Cache root without a trailing slash, e.g. `/cache/images`.
    pub fn cache_root(&self) -> &str {
        let trimmed = self.cache.root.trim_end_matches('/');
        if trimmed.is_empty() { "/" } else { trimmed }
    }

    pub fn engine_timeout(&self) -> Duration {
        Duration::from_secs(self.engine.timeout_secs)
    }
}

/// Derivative cache location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// URL prefix of every derivative; also its path under `public_root`.
    pub root: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: "/cache/images".to_string(),
        }
    }
}

/// External transform engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// ImageMagick binary, resolved through `PATH` when not absolute.
    pub binary: String,
    /// Wall-clock limit per invocation.
    pub timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary: "convert".to_string(),
            timeout_secs: 60,
        }
    }
}

/// Encoder-independent optimization flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OptimizationConfig {
    pub strip_metadata: bool,
    /// Target colorspace; empty string skips normalization.
    pub colorspace: String,
    /// Interlace mode for formats other than jpeg and png; empty disables
    /// interlacing for every format.
    pub interlace: String,
    /// Canvas color for the `fill` crop mode.
    pub background: String,
}

impl Default for OptimizationConfig {
    fn default() -> Self {
        Self {
            strip_metadata: true,
            colorspace: "sRGB".to_string(),
            interlace: "Plane".to_string(),
            background: "white".to_string(),
        }
    }
}

/// On-demand HTTP route settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServeConfig {
    pub bind: String,
    /// Crop mode for tokens no preset lists.
    pub default_crop: CropMode,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            default_crop: CropMode::Cover,
        }
    }
}

/// Batch precomputation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchConfig {
    /// Directory under `public_root` scanned for source images.
    pub source_dir: String,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            source_dir: "library".to_string(),
        }
    }
}

/// Parallel processing settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessingConfig {
    /// Maximum number of parallel batch workers.
    /// When absent, defaults to the number of CPU cores.
    /// Values larger than the core count are clamped down.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_processes: Option<usize>,
}

/// Resolve the effective thread count from config.
///
/// - `None` → use all available cores
/// - `Some(n)` → use `min(n, cores)` (user can constrain down, not up)
pub fn effective_threads(config: &ProcessingConfig) -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    config.max_processes.map(|n| n.min(cores)).unwrap_or(cores)
}

/// Attribute renames applied to `<picture>` markup when lazy loading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LazyLoadConfig {
    pub enabled: bool,
    /// Boolean marker attribute set on `<picture>`.
    pub picture_attr: String,
    pub source_srcset_attr: String,
    pub source_sizes_attr: String,
    pub img_src_attr: String,
    pub img_srcset_attr: String,
    pub img_sizes_attr: String,
}

impl Default for LazyLoadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            picture_attr: "data-lazysrc".to_string(),
            source_srcset_attr: "data-lazysrc-srcset".to_string(),
            source_sizes_attr: "data-lazysrc-sizes".to_string(),
            img_src_attr: "data-lazysrc-src".to_string(),
            img_srcset_attr: "data-lazysrc-srcset".to_string(),
            img_sizes_attr: "data-lazysrc-sizes".to_string(),
        }
    }
}

/// A named set of derivative sizes.
///
/// `dimensions` maps each token to the srcset descriptor it is labeled with
/// (`"800w"`, `"2x"`). A preset without dimensions is valid but produces
/// nothing in batch runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PresetConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<IndexMap<DimensionSpec, String>>,
    pub crop: CropMode,
    /// Overrides `default_formats` for this preset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formats: Option<Vec<OutputFormat>>,
    /// HTML `sizes` attribute value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sizes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub focal: Option<FocalPoint>,
    /// Art-direction breakpoints for markup.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub breakpoints: Vec<BreakpointConfig>,
}

/// A viewport-width-conditional dimension set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BreakpointConfig {
    /// Emitted as `(min-width: Npx)`.
    pub min_width: u32,
    pub dimensions: IndexMap<DimensionSpec, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crop: Option<CropMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sizes: Option<String>,
}

fn preset(crop: CropMode, formats: Option<Vec<OutputFormat>>, dims: &[(u32, u32, &str)]) -> PresetConfig {
    PresetConfig {
        dimensions: Some(
            dims.iter()
                .map(|&(w, h, d)| (DimensionSpec::new(w, Some(h)), d.to_string()))
                .collect(),
        ),
        crop,
        formats,
        ..PresetConfig::default()
    }
}

fn default_presets() -> IndexMap<String, PresetConfig> {
    let mut presets = IndexMap::new();
    presets.insert(
        "hero".to_string(),
        preset(
            CropMode::Cover,
            Some(vec![OutputFormat::Avif, OutputFormat::Webp, OutputFormat::Jpg]),
            &[
                (1920, 1080, "1920w"),
                (1280, 720, "1280w"),
                (960, 540, "960w"),
                (640, 360, "640w"),
            ],
        ),
    );
    presets.insert(
        "thumbnail".to_string(),
        preset(CropMode::Cover, None, &[(400, 400, "2x"), (200, 200, "1x")]),
    );
    presets.insert(
        "portrait".to_string(),
        preset(
            CropMode::Cover,
            None,
            &[(800, 1200, "800w"), (600, 900, "600w"), (400, 600, "400w")],
        ),
    );
    presets.insert(
        "responsive".to_string(),
        preset(
            CropMode::Cover,
            None,
            &[
                (1600, 900, "1600w"),
                (1200, 675, "1200w"),
                (800, 450, "800w"),
                (400, 225, "400w"),
            ],
        ),
    );
    presets
}

// =============================================================================
// Config loading, merging, and validation
// =============================================================================

/// Top-level tables an overlay replaces wholesale instead of merging.
const REPLACED_TABLES: &[&str] = &["presets"];

/// Returns the stock default config as a `toml::Value::Table`.
///
/// This is the canonical representation of all default values, used as the
/// base layer for merging user overrides on top.
pub fn stock_defaults_value() -> Result<toml::Value, ConfigError> {
    toml::Value::try_from(ServiceConfig::default())
        .map_err(|e| ConfigError::Validation(format!("default config must serialize: {e}")))
}

/// Recursively merge `overlay` on top of `base`.
///
/// - Tables are merged key-by-key (overlay keys override base keys).
/// - Non-table values in overlay replace base values entirely.
/// - Keys in base that are not in overlay are preserved.
pub fn merge_toml(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                let merged = match base_table.remove(&key) {
                    Some(base_val) => merge_toml(base_val, overlay_val),
                    None => overlay_val,
                };
                base_table.insert(key, merged);
            }
            toml::Value::Table(base_table)
        }
        (_, overlay) => overlay,
    }
}

/// [`merge_toml`] at every key except the [`REPLACED_TABLES`], which the
/// overlay replaces outright.
pub fn merge_config_value(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut base_table), toml::Value::Table(mut overlay_table)) => {
            for key in REPLACED_TABLES {
                if let Some(replacement) = overlay_table.remove(*key) {
                    base_table.insert((*key).to_string(), replacement);
                }
            }
            merge_toml(
                toml::Value::Table(base_table),
                toml::Value::Table(overlay_table),
            )
        }
        (base, overlay) => merge_toml(base, overlay),
    }
}

/// Load a config file as a raw TOML value.
///
/// Returns `Ok(None)` if the file does not exist.
/// Returns `Err` if the file exists but contains invalid TOML.
pub fn load_raw_config(path: &Path) -> Result<Option<toml::Value>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)?;
    let value: toml::Value = toml::from_str(&content)?;
    Ok(Some(value))
}

/// Merge an optional overlay onto a base value, then deserialize and validate.
pub fn resolve_config(
    base: toml::Value,
    overlay: Option<toml::Value>,
) -> Result<ServiceConfig, ConfigError> {
    let merged = match overlay {
        Some(ov) => merge_config_value(base, ov),
        None => base,
    };
    let config: ServiceConfig = merged.try_into()?;
    config.validate()?;
    Ok(config)
}

/// Load config from a `config.toml` path.
///
/// Merges user values on top of stock defaults, rejects unknown keys,
/// and validates the result. A missing file yields the stock defaults.
pub fn load_config(path: &Path) -> Result<ServiceConfig, ConfigError> {
    let base = stock_defaults_value()?;
    let overlay = load_raw_config(path)?;
    resolve_config(base, overlay)
}

/// Returns a fully-commented stock `config.toml` with all keys and explanations.
///
/// Used by the `gen-config` CLI command.
pub fn stock_config_toml() -> &'static str {
    r##"# image-variants configuration
# ============================
# All settings are optional. Remove or comment out any you don't need.
# Values shown below are the defaults.
#
# Tables are merged over these defaults key by key, except [presets]:
# defining any preset replaces the stock presets entirely.
# Unknown keys will cause an error.

# Web root. Source images and the derivative cache both live under it.
public_root = "public"

# Output formats in preference order, used when a preset lists none.
default_formats = ["avif", "webp", "jpg"]

# Dimension tokens ("WxH" or "W") the on-demand route may generate.
# Empty allows any token; list tokens to cap cache-fill from arbitrary URLs.
allowed_dimensions = []

# ---------------------------------------------------------------------------
# Derivative cache
# ---------------------------------------------------------------------------
[cache]
# URL prefix of every derivative; also its directory under public_root.
# A derivative lives at {root}/{dimensions}/{source dir}/{name}.{format}
root = "/cache/images"

# ---------------------------------------------------------------------------
# Transform engine (ImageMagick)
# ---------------------------------------------------------------------------
[engine]
# Binary name or absolute path. Use "magick" for ImageMagick 7.
binary = "convert"

# Hard wall-clock limit per invocation. The child is killed when exceeded.
timeout_secs = 60

# ---------------------------------------------------------------------------
# Encoding quality per output format (1-100)
# ---------------------------------------------------------------------------
[quality]
avif = 75
jpeg = 85
jpg = 85
png = 90
webp = 85

# ---------------------------------------------------------------------------
# Optimization
# ---------------------------------------------------------------------------
[optimization]
# Remove EXIF/IPTC/XMP and color profiles other than the target colorspace.
strip_metadata = true

# Colorspace to normalize to. "" skips normalization.
colorspace = "sRGB"

# Interlace mode for avif/webp. jpeg always uses Plane and png uses PNG.
# "" disables interlacing for every format.
interlace = "Plane"

# Canvas color for the "fill" crop mode.
background = "white"

# ---------------------------------------------------------------------------
# On-demand HTTP route
# ---------------------------------------------------------------------------
[serve]
bind = "127.0.0.1:8080"

# Crop mode for requested tokens that no preset lists:
# cover, contain, fill or exact.
default_crop = "cover"

# ---------------------------------------------------------------------------
# Batch precomputation
# ---------------------------------------------------------------------------
[batch]
# Directory under public_root scanned for source images.
source_dir = "library"

# ---------------------------------------------------------------------------
# Processing
# ---------------------------------------------------------------------------
[processing]
# Maximum parallel batch workers.
# Omit or comment out to auto-detect (= number of CPU cores).
# max_processes = 4

# ---------------------------------------------------------------------------
# Lazy loading
# ---------------------------------------------------------------------------
# When enabled, <picture> markup carries its URLs in these attributes instead
# of src/srcset/sizes, for a client-side loader to promote later. An image
# with loading="eager" is always rendered eagerly.
[lazy_load]
enabled = true
picture_attr = "data-lazysrc"
source_srcset_attr = "data-lazysrc-srcset"
source_sizes_attr = "data-lazysrc-sizes"
img_src_attr = "data-lazysrc-src"
img_srcset_attr = "data-lazysrc-srcset"
img_sizes_attr = "data-lazysrc-sizes"

# ---------------------------------------------------------------------------
# Presets
# ---------------------------------------------------------------------------
# Each preset maps dimension tokens to srcset descriptors. Optional keys:
#   formats = ["avif", "webp", "jpg"]   (default: default_formats)
#   sizes = "(max-width: 768px) 100vw, 50vw"
#   focal = { x = 0.5, y = 0.3 }
#   [[presets.NAME.breakpoints]]
#   min_width = 1024
#   dimensions = { "1600x900" = "1600w" }
#   crop = "cover"                      (optional)
#   sizes = "100vw"                     (optional)
[presets.hero]
crop = "cover"
formats = ["avif", "webp", "jpg"]

[presets.hero.dimensions]
"1920x1080" = "1920w"
"1280x720" = "1280w"
"960x540" = "960w"
"640x360" = "640w"

[presets.thumbnail]
crop = "cover"

[presets.thumbnail.dimensions]
"400x400" = "2x"
"200x200" = "1x"

[presets.portrait]
crop = "cover"

[presets.portrait.dimensions]
"800x1200" = "800w"
"600x900" = "600w"
"400x600" = "400w"

[presets.responsive]
crop = "cover"

[presets.responsive.dimensions]
"1600x900" = "1600w"
"1200x675" = "1200w"
"800x450" = "800w"
"400x225" = "400w"
"##
}
