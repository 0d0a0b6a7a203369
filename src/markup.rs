//! Responsive `<picture>` markup.
//!
//! Turns an image reference and a preset into an ordered list of `<source>`
//! candidates plus one fallback `<img>`. URLs come from
//! [`CachePathResolver::resolve`], so every URL emitted here is exactly the
//! path the on-demand route serves. Nothing is generated while building
//! markup.
//!
//! ## Modes
//!
//! ```text
//! format mode (no breakpoints)        breakpoint mode (art direction)
//! ─────────────────────────────       ─────────────────────────────────
//! <source type=avif srcset=…>         <source media=(min-width: 1024px) …>
//! <source type=webp srcset=…>         <source media=(min-width: 768px) …>
//! <img src=smallest.jpg>              <img src=smallest.jpg>
//! ```
//!
//! In format mode jpeg-family formats are left to the fallback `<img>`, and
//! each srcset lists candidates from smallest to largest area. In breakpoint
//! mode breakpoints are emitted widest first because browsers take the first
//! matching `media`.
//!
//! ## Lazy loading
//!
//! When lazy loading applies, `srcset`, `sizes` and `src` are emitted under
//! the configured `data-*` names and `<picture>` gets a marker attribute.
//! The values are identical to the eager output.
//!
//! ## Crop and focal point
//!
//! Derivative URLs carry no crop, so a built [`Picture`] records the crop of
//! each source (a breakpoint's own crop wins) and the resolved focal point.
//! [`Picture::derivatives`] turns them into generator requests for
//! precomputing exactly what the markup references.

use crate::cache::CachePathResolver;
use crate::config::{BreakpointConfig, LazyLoadConfig, PresetConfig, ServiceConfig};
use crate::dimensions::{DimensionSpec, InvalidDimensions};
use crate::generator::DerivativeRequest;
use crate::imaging::{CropMode, FocalPoint, OutputFormat};
use crate::matrix::dedup_formats;
use indexmap::IndexMap;
use maud::{Escaper, Markup, PreEscaped, Render, html};
use serde_json::Value;
use std::fmt::Write as _;
use thiserror::Error;

/// Used for the fallback `<img>` when no dimensions are configured.
pub const FALLBACK_DIMENSIONS: DimensionSpec = DimensionSpec {
    width: 1200,
    height: Some(800),
};

#[derive(Error, Debug)]
pub enum MarkupError {
    #[error("Invalid image reference: {0}")]
    InvalidImageReference(String),
    #[error("Unknown preset: {0}")]
    UnknownPreset(String),
    #[error(transparent)]
    InvalidDimensions(#[from] InvalidDimensions),
}

// ============================================================================
// Image references
// ============================================================================

/// The image a picture is built for.
#[derive(Debug, Clone, PartialEq)]
pub enum ImageRef {
    PathOnly(String),
    WithMetadata {
        path: String,
        focal: Option<FocalPoint>,
        /// Remaining string fields of the record; `alt` is used when the
        /// call site sets none.
        attributes: IndexMap<String, String>,
    },
}

impl ImageRef {
    pub fn path(&self) -> &str {
        match self {
            ImageRef::PathOnly(path) | ImageRef::WithMetadata { path, .. } => path,
        }
    }

    pub fn focal(&self) -> Option<FocalPoint> {
        match self {
            ImageRef::PathOnly(_) => None,
            ImageRef::WithMetadata { focal, .. } => *focal,
        }
    }

    fn attribute(&self, name: &str) -> Option<&str> {
        match self {
            ImageRef::PathOnly(_) => None,
            ImageRef::WithMetadata { attributes, .. } => attributes.get(name).map(String::as_str),
        }
    }

    /// Resolve a loosely shaped reference.
    ///
    /// Accepts a path string, or an object with `path` (or `image_lg`) and
    /// optional numeric `focal_x`/`focal_y`. Both focal coordinates must be
    /// present for the focal point to be used.
    pub fn from_value(value: &Value) -> Result<Self, MarkupError> {
        match value {
            Value::String(path) if !path.is_empty() => Ok(ImageRef::PathOnly(path.clone())),
            Value::Object(map) => {
                let path = ["path", "image_lg"]
                    .iter()
                    .find_map(|k| map.get(*k).and_then(Value::as_str))
                    .filter(|p| !p.is_empty())
                    .ok_or_else(|| {
                        MarkupError::InvalidImageReference(
                            "object has no `path` or `image_lg`".to_string(),
                        )
                    })?;

                let focal = match (
                    map.get("focal_x").and_then(Value::as_f64),
                    map.get("focal_y").and_then(Value::as_f64),
                ) {
                    (Some(x), Some(y)) => Some(FocalPoint::new(x, y)),
                    _ => None,
                };

                let attributes = map
                    .iter()
                    .filter(|(k, _)| !matches!(k.as_str(), "path" | "image_lg" | "focal_x" | "focal_y"))
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect();

                Ok(ImageRef::WithMetadata {
                    path: path.to_string(),
                    focal,
                    attributes,
                })
            }
            other => Err(MarkupError::InvalidImageReference(format!(
                "expected a path or an object, got {other}"
            ))),
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Everything needed to build one picture, after preset resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct PictureConfig {
    pub dimensions: IndexMap<DimensionSpec, String>,
    pub crop: CropMode,
    pub formats: Vec<OutputFormat>,
    pub sizes: Option<String>,
    pub focal: Option<FocalPoint>,
    pub breakpoints: Vec<BreakpointConfig>,
    /// Attributes for `<img>`, merged over `loading=lazy decoding=async`.
    pub img: IndexMap<String, String>,
    pub picture: IndexMap<String, String>,
}

impl PictureConfig {
    /// A config with no dimensions and the given formats.
    pub fn empty(default_formats: &[OutputFormat]) -> Self {
        Self {
            dimensions: IndexMap::new(),
            crop: CropMode::default(),
            formats: dedup_formats(default_formats),
            sizes: None,
            focal: None,
            breakpoints: Vec::new(),
            img: IndexMap::new(),
            picture: IndexMap::new(),
        }
    }

    pub fn from_preset(preset: &PresetConfig, default_formats: &[OutputFormat]) -> Self {
        Self {
            dimensions: preset.dimensions.clone().unwrap_or_default(),
            crop: preset.crop,
            formats: dedup_formats(preset.formats.as_deref().unwrap_or(default_formats)),
            sizes: preset.sizes.clone(),
            focal: preset.focal,
            breakpoints: preset.breakpoints.clone(),
            ..Self::empty(default_formats)
        }
    }

    /// Merge call-site overrides field by field; every field the overrides
    /// set replaces the preset's. `img` and `picture` attributes merge per
    /// key.
    pub fn apply_overrides(mut self, overrides: &PictureOverrides) -> Self {
        if let Some(dimensions) = &overrides.dimensions {
            self.dimensions = dimensions.clone();
        }
        if let Some(crop) = overrides.crop {
            self.crop = crop;
        }
        if let Some(formats) = &overrides.formats {
            self.formats = dedup_formats(formats);
        }
        if let Some(sizes) = &overrides.sizes {
            self.sizes = Some(sizes.clone());
        }
        if let Some(focal) = overrides.focal {
            self.focal = Some(focal);
        }
        if let Some(breakpoints) = &overrides.breakpoints {
            self.breakpoints = breakpoints.clone();
        }
        for (k, v) in &overrides.img {
            self.img.insert(k.clone(), v.clone());
        }
        for (k, v) in &overrides.picture {
            self.picture.insert(k.clone(), v.clone());
        }
        self
    }
}

/// Call-site settings layered over an optional base preset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PictureOverrides {
    pub preset: Option<String>,
    pub dimensions: Option<IndexMap<DimensionSpec, String>>,
    pub crop: Option<CropMode>,
    pub formats: Option<Vec<OutputFormat>>,
    pub sizes: Option<String>,
    pub focal: Option<FocalPoint>,
    pub breakpoints: Option<Vec<BreakpointConfig>>,
    pub img: IndexMap<String, String>,
    pub picture: IndexMap<String, String>,
}

impl PictureOverrides {
    pub fn preset(name: impl Into<String>) -> Self {
        Self {
            preset: Some(name.into()),
            ..Self::default()
        }
    }

    /// Set dimensions from `(token, descriptor)` pairs.
    pub fn with_dimensions(mut self, entries: &[(&str, &str)]) -> Result<Self, MarkupError> {
        let mut dimensions = IndexMap::new();
        for &(token, descriptor) in entries {
            dimensions.insert(DimensionSpec::parse(token)?, descriptor.to_string());
        }
        self.dimensions = Some(dimensions);
        Ok(self)
    }

    pub fn with_img_attr(mut self, name: &str, value: &str) -> Self {
        self.img.insert(name.to_string(), value.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MarkupOptions {
    Preset(String),
    Custom(PictureOverrides),
}

// ============================================================================
// Picture model
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct PictureSource {
    pub format: OutputFormat,
    pub media: Option<String>,
    pub srcset: String,
    pub sizes: Option<String>,
    /// srcset entries, in srcset order.
    pub dimensions: Vec<DimensionSpec>,
    /// Crop the entries are generated with; a breakpoint's own crop wins.
    pub crop: CropMode,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Fallback {
    pub src: String,
    pub dimensions: DimensionSpec,
    /// `<img>` attributes other than `src`, in output order.
    pub attributes: IndexMap<String, String>,
}

/// A built picture, independent of how its attributes will be named.
#[derive(Debug, Clone, PartialEq)]
pub struct Picture {
    /// Source image path relative to the public root.
    pub source: String,
    pub sources: Vec<PictureSource>,
    pub fallback: Fallback,
    pub attributes: IndexMap<String, String>,
    pub crop: CropMode,
    pub focal: FocalPoint,
    pub lazy: bool,
}

impl Picture {
    /// Every derivative the markup references, each once, with the crop
    /// and focal point it should be generated with.
    ///
    /// URLs carry no crop, so whichever request generates a key first
    /// decides its pixels; precomputing these keeps art-directed crops.
    pub fn derivatives(&self) -> Vec<DerivativeRequest> {
        let mut requests: Vec<DerivativeRequest> = Vec::new();
        let mut push = |request: DerivativeRequest| {
            let seen = requests.iter().any(|r| {
                r.dimensions == request.dimensions && r.format == request.format
            });
            if !seen {
                requests.push(request);
            }
        };
        for source in &self.sources {
            for dims in &source.dimensions {
                push(
                    DerivativeRequest::new(self.source.as_str(), *dims, source.format)
                        .with_crop(source.crop)
                        .with_focal(self.focal),
                );
            }
        }
        push(
            DerivativeRequest::new(self.source.as_str(), self.fallback.dimensions, OutputFormat::Jpg)
                .with_crop(self.crop)
                .with_focal(self.focal),
        );
        requests
    }
}

// ============================================================================
// Builder
// ============================================================================

pub struct MarkupBuilder {
    resolver: CachePathResolver,
    presets: IndexMap<String, PresetConfig>,
    default_formats: Vec<OutputFormat>,
    lazy_load: LazyLoadConfig,
}

impl MarkupBuilder {
    pub fn new(
        resolver: CachePathResolver,
        presets: IndexMap<String, PresetConfig>,
        default_formats: &[OutputFormat],
        lazy_load: LazyLoadConfig,
    ) -> Self {
        Self {
            resolver,
            presets,
            default_formats: dedup_formats(default_formats),
            lazy_load,
        }
    }

    pub fn from_config(config: &ServiceConfig) -> Self {
        Self::new(
            CachePathResolver::from_config(config),
            config.presets.clone(),
            &config.default_formats,
            config.lazy_load.clone(),
        )
    }

    /// URL of a single derivative.
    pub fn url(&self, source: &str, size: &DimensionSpec, format: OutputFormat) -> String {
        self.resolver.resolve(source, size, format).to_string()
    }

    /// Resolve options into a plain [`PictureConfig`].
    pub fn resolve_options(&self, options: &MarkupOptions) -> Result<PictureConfig, MarkupError> {
        match options {
            MarkupOptions::Preset(name) => self.preset_config(name),
            MarkupOptions::Custom(overrides) => {
                let base = match &overrides.preset {
                    Some(name) => self.preset_config(name)?,
                    None => PictureConfig::empty(&self.default_formats),
                };
                Ok(base.apply_overrides(overrides))
            }
        }
    }

    fn preset_config(&self, name: &str) -> Result<PictureConfig, MarkupError> {
        self.presets
            .get(name)
            .map(|p| PictureConfig::from_preset(p, &self.default_formats))
            .ok_or_else(|| MarkupError::UnknownPreset(name.to_string()))
    }

    pub fn build(&self, image: &ImageRef, options: &MarkupOptions) -> Result<Picture, MarkupError> {
        let config = self.resolve_options(options)?;
        Ok(self.build_with(image, &config))
    }

    /// Build from an already resolved config.
    pub fn build_with(&self, image: &ImageRef, config: &PictureConfig) -> Picture {
        let path = image.path();
        let focal = config.focal.or(image.focal()).unwrap_or_default();

        let mut img = IndexMap::new();
        img.insert("loading".to_string(), "lazy".to_string());
        img.insert("decoding".to_string(), "async".to_string());
        for (k, v) in &config.img {
            img.insert(k.clone(), v.clone());
        }
        if !img.contains_key("alt") {
            if let Some(alt) = image.attribute("alt") {
                img.insert("alt".to_string(), alt.to_string());
            }
        }
        let lazy = self.uses_lazy_load(&img);

        let sources = if config.breakpoints.is_empty() {
            self.format_sources(path, config)
        } else {
            self.breakpoint_sources(path, config)
        };

        let fallback_dims = smallest_by_area(&config.dimensions).unwrap_or(FALLBACK_DIMENSIONS);
        let fallback = Fallback {
            src: self.url(path, &fallback_dims, OutputFormat::Jpg),
            dimensions: fallback_dims,
            attributes: img,
        };

        Picture {
            source: path.to_string(),
            sources,
            fallback,
            attributes: config.picture.clone(),
            crop: config.crop,
            focal,
            lazy,
        }
    }

    /// Lazy loading applies when enabled, unless `<img>` asks for another
    /// `loading` mode. An explicit marker attribute always opts in.
    fn uses_lazy_load(&self, img: &IndexMap<String, String>) -> bool {
        if !self.lazy_load.enabled {
            return false;
        }
        if img
            .get(&self.lazy_load.picture_attr)
            .is_some_and(|v| !v.is_empty() && v != "false")
        {
            return true;
        }
        match img.get("loading") {
            Some(loading) => loading == "lazy",
            None => true,
        }
    }

    fn format_sources(&self, path: &str, config: &PictureConfig) -> Vec<PictureSource> {
        if config.dimensions.is_empty() {
            return Vec::new();
        }
        config
            .formats
            .iter()
            .filter(|f| !f.is_jpeg_family())
            .map(|&format| {
                let (srcset, dimensions) = self.srcset(path, &config.dimensions, format);
                PictureSource {
                    format,
                    media: None,
                    srcset,
                    sizes: config.sizes.clone(),
                    dimensions,
                    crop: config.crop,
                }
            })
            .collect()
    }

    fn breakpoint_sources(&self, path: &str, config: &PictureConfig) -> Vec<PictureSource> {
        let mut breakpoints: Vec<&BreakpointConfig> = config.breakpoints.iter().collect();
        breakpoints.sort_by(|a, b| b.min_width.cmp(&a.min_width));

        let mut sources = Vec::new();
        for bp in breakpoints {
            if bp.dimensions.is_empty() {
                continue;
            }
            let media = format!("(min-width: {}px)", bp.min_width);
            let sizes = bp.sizes.clone().or_else(|| config.sizes.clone());
            let crop = bp.crop.unwrap_or(config.crop);
            for &format in &config.formats {
                let (srcset, dimensions) = self.srcset(path, &bp.dimensions, format);
                sources.push(PictureSource {
                    format,
                    media: Some(media.clone()),
                    srcset,
                    sizes: sizes.clone(),
                    dimensions,
                    crop,
                });
            }
        }
        sources
    }

    /// `url descriptor` pairs, smallest area first; equal areas keep
    /// configuration order.
    fn srcset(
        &self,
        path: &str,
        dimensions: &IndexMap<DimensionSpec, String>,
        format: OutputFormat,
    ) -> (String, Vec<DimensionSpec>) {
        let mut sorted: Vec<(&DimensionSpec, &String)> = dimensions.iter().collect();
        sorted.sort_by_key(|(dims, _)| dims.area());
        let srcset = sorted
            .iter()
            .map(|(dims, descriptor)| format!("{} {}", self.url(path, dims, format), descriptor))
            .collect::<Vec<_>>()
            .join(", ");
        (srcset, sorted.into_iter().map(|(dims, _)| *dims).collect())
    }

    /// Render a built picture.
    pub fn render(&self, picture: &Picture) -> Markup {
        let lazy = picture.lazy;
        let names = AttrNames::new(&self.lazy_load, lazy);

        let mut picture_attrs: Vec<Attr> = picture
            .attributes
            .iter()
            .map(|(k, v)| Attr::text(k, v))
            .collect();
        if lazy {
            picture_attrs.push(Attr::flag(&self.lazy_load.picture_attr));
        }

        let mut img_attrs: Vec<Attr> = picture
            .fallback
            .attributes
            .iter()
            .map(|(k, v)| Attr::text(k, v))
            .collect();
        img_attrs.push(Attr::text(names.img_src, &picture.fallback.src));

        html! {
            (Tag::open("picture", picture_attrs))
            @for source in &picture.sources {
                (Tag::void("source", source_attrs(source, &names)))
            }
            (Tag::void("img", img_attrs))
            (PreEscaped("</picture>"))
        }
    }

    /// Build and render in one step.
    pub fn picture(&self, image: &ImageRef, options: &MarkupOptions) -> Result<Markup, MarkupError> {
        Ok(self.render(&self.build(image, options)?))
    }
}

/// Smallest dimension by area; the first one wins ties.
fn smallest_by_area(dimensions: &IndexMap<DimensionSpec, String>) -> Option<DimensionSpec> {
    let mut smallest: Option<DimensionSpec> = None;
    for dims in dimensions.keys() {
        if smallest.is_none_or(|s| dims.area() < s.area()) {
            smallest = Some(*dims);
        }
    }
    smallest
}

// ============================================================================
// Sizes
// ============================================================================

/// Media condition of one `sizes` entry.
#[derive(Debug, Clone, PartialEq)]
pub enum SizeCondition {
    /// Rendered as `(max-width: Npx)`.
    MaxWidth(u32),
    /// A media condition used verbatim.
    Media(String),
}

/// Build a `sizes` attribute value.
///
/// The last entry is the default and is emitted without its condition.
///
/// ```
/// use image_variants::markup::{SizeCondition, sizes_attribute};
///
/// let sizes = sizes_attribute(&[
///     (Some(SizeCondition::MaxWidth(768)), "100vw".to_string()),
///     (None, "50vw".to_string()),
/// ]);
/// assert_eq!(sizes, "(max-width: 768px) 100vw, 50vw");
/// ```
pub fn sizes_attribute(entries: &[(Option<SizeCondition>, String)]) -> String {
    let last = entries.len().saturating_sub(1);
    entries
        .iter()
        .enumerate()
        .map(|(i, (condition, value))| match condition {
            Some(SizeCondition::MaxWidth(px)) if i != last => {
                format!("(max-width: {px}px) {value}")
            }
            Some(SizeCondition::Media(media)) if i != last => format!("{media} {value}"),
            _ => value.clone(),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

// ============================================================================
// Attribute rendering
// ============================================================================

/// Attribute names in effect for one render.
struct AttrNames<'a> {
    srcset: &'a str,
    sizes: &'a str,
    img_src: &'a str,
}

impl<'a> AttrNames<'a> {
    fn new(lazy_load: &'a LazyLoadConfig, lazy: bool) -> Self {
        if lazy {
            Self {
                srcset: &lazy_load.source_srcset_attr,
                sizes: &lazy_load.source_sizes_attr,
                img_src: &lazy_load.img_src_attr,
            }
        } else {
            Self {
                srcset: "srcset",
                sizes: "sizes",
                img_src: "src",
            }
        }
    }
}

fn source_attrs<'a>(source: &'a PictureSource, names: &AttrNames<'a>) -> Vec<Attr<'a>> {
    let mut attrs = vec![Attr::text("type", source.format.mime_type())];
    if let Some(media) = &source.media {
        attrs.push(Attr::text("media", media));
    }
    attrs.push(Attr::text(names.srcset, &source.srcset));
    if let Some(sizes) = &source.sizes {
        attrs.push(Attr::text(names.sizes, sizes));
    }
    attrs
}

struct Attr<'a> {
    name: &'a str,
    value: Option<&'a str>,
}

impl<'a> Attr<'a> {
    fn text(name: &'a str, value: &'a str) -> Self {
        Self {
            name,
            value: Some(value),
        }
    }

    /// Bare boolean attribute.
    fn flag(name: &'a str) -> Self {
        Self { name, value: None }
    }
}

/// A tag whose attribute names are only known at runtime, which `html!`
/// cannot express.
struct Tag<'a> {
    name: &'static str,
    attrs: Vec<Attr<'a>>,
}

impl<'a> Tag<'a> {
    fn open(name: &'static str, attrs: Vec<Attr<'a>>) -> Self {
        Self { name, attrs }
    }

    fn void(name: &'static str, attrs: Vec<Attr<'a>>) -> Self {
        Self { name, attrs }
    }
}

impl Render for Tag<'_> {
    fn render_to(&self, buffer: &mut String) {
        buffer.push('<');
        buffer.push_str(self.name);
        for attr in &self.attrs {
            buffer.push(' ');
            escape_into(buffer, attr.name);
            if let Some(value) = attr.value {
                buffer.push_str("=\"");
                escape_into(buffer, value);
                buffer.push('"');
            }
        }
        buffer.push('>');
    }
}

fn escape_into(buffer: &mut String, s: &str) {
    // Writing into a String cannot fail.
    let _ = Escaper::new(buffer).write_str(s);
}
