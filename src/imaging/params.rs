//! Parameter types for image transforms.
//!
//! These types describe *what* to do, not *how* to do it. They are the
//! interface between the [`planner`](super::planner) (which decides the
//! parameter list for a request) and the [`engine`](super::engine) (which
//! runs the external tool). Keeping them engine-neutral lets tests swap in a
//! recording engine without touching planning logic.
//!
//! ## Types
//!
//! - [`OutputFormat`]: derivative file format; also the cache-key extension.
//! - [`CropMode`]: how a source aspect ratio is reconciled with a target box.
//! - [`FocalPoint`] / [`Gravity`]: crop bias for `cover`, on a 9-point grid.
//! - [`Quality`]: lossy encoding quality (1–100). Clamped on construction.
//! - [`TransformParam`]: one step of the ordered list handed to the engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Quality setting for lossy image encoding (1-100).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quality(pub u32);

impl Quality {
    pub fn new(value: u32) -> Self {
        Self(value.clamp(1, 100))
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

impl Default for Quality {
    fn default() -> Self {
        Self(85)
    }
}

/// Output format of a derivative.
///
/// `Jpg` and `Jpeg` encode identically but are distinct cache slots because
/// the extension is part of the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Avif,
    Webp,
    Jpg,
    Jpeg,
    Png,
}

/// A format string that is not one of the supported output formats.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unsupported output format: {0:?}")]
pub struct UnknownFormat(pub String);

impl OutputFormat {
    pub const ALL: [OutputFormat; 5] = [
        OutputFormat::Jpg,
        OutputFormat::Jpeg,
        OutputFormat::Png,
        OutputFormat::Webp,
        OutputFormat::Avif,
    ];

    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Avif => "avif",
            OutputFormat::Webp => "webp",
            OutputFormat::Jpg => "jpg",
            OutputFormat::Jpeg => "jpeg",
            OutputFormat::Png => "png",
        }
    }

    /// Parse a lowercase file extension.
    pub fn from_extension(ext: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.extension() == ext)
    }

    pub fn is_jpeg_family(self) -> bool {
        matches!(self, OutputFormat::Jpg | OutputFormat::Jpeg)
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            OutputFormat::Avif => "image/avif",
            OutputFormat::Webp => "image/webp",
            OutputFormat::Jpg | OutputFormat::Jpeg => "image/jpeg",
            OutputFormat::Png => "image/png",
        }
    }

    /// Built-in quality used when the config table has no entry.
    pub fn default_quality(self) -> Quality {
        match self {
            OutputFormat::Avif => Quality::new(75),
            OutputFormat::Png => Quality::new(90),
            OutputFormat::Webp | OutputFormat::Jpg | OutputFormat::Jpeg => Quality::new(85),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for OutputFormat {
    type Err = UnknownFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_extension(s).ok_or_else(|| UnknownFormat(s.to_string()))
    }
}

/// A crop mode name that is not `cover`, `contain`, `fill` or `exact`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown crop mode: {0:?} (expected cover, contain, fill or exact)")]
pub struct UnknownCropMode(pub String);

/// Policy for fitting a source into a `WxH` box.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum CropMode {
    /// Fill the box, cropping overflow toward the focal point.
    #[default]
    Cover,
    /// Fit inside the box; one axis may come out smaller.
    Contain,
    /// Fit inside the box, then pad with the background color.
    Fill,
    /// Force both dimensions; may distort.
    Exact,
}

impl CropMode {
    pub fn as_str(self) -> &'static str {
        match self {
            CropMode::Cover => "cover",
            CropMode::Contain => "contain",
            CropMode::Fill => "fill",
            CropMode::Exact => "exact",
        }
    }
}

impl FromStr for CropMode {
    type Err = UnknownCropMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cover" => Ok(CropMode::Cover),
            "contain" => Ok(CropMode::Contain),
            "fill" => Ok(CropMode::Fill),
            "exact" => Ok(CropMode::Exact),
            other => Err(UnknownCropMode(other.to_string())),
        }
    }
}

impl TryFrom<String> for CropMode {
    type Error = UnknownCropMode;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for CropMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized point of interest: `x` left→right, `y` top→bottom, both 0..=1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FocalPoint {
    pub x: f64,
    pub y: f64,
}

impl FocalPoint {
    /// Build a focal point, clamping each axis into `[0, 1]`.
    pub fn new(x: f64, y: f64) -> Self {
        Self {
            x: clamp_unit(x),
            y: clamp_unit(y),
        }
    }

    /// Map onto the 9-point gravity grid (thresholds at 0.33 and 0.66).
    pub fn gravity(self) -> Gravity {
        let column = if self.x < 0.33 {
            0
        } else if self.x > 0.66 {
            2
        } else {
            1
        };
        let row = if self.y < 0.33 {
            0
        } else if self.y > 0.66 {
            2
        } else {
            1
        };
        match (row, column) {
            (0, 0) => Gravity::NorthWest,
            (0, 1) => Gravity::North,
            (0, _) => Gravity::NorthEast,
            (1, 0) => Gravity::West,
            (1, 1) => Gravity::Center,
            (1, _) => Gravity::East,
            (_, 0) => Gravity::SouthWest,
            (_, 1) => Gravity::South,
            _ => Gravity::SouthEast,
        }
    }
}

fn clamp_unit(v: f64) -> f64 {
    if v.is_nan() { 0.5 } else { v.clamp(0.0, 1.0) }
}

impl Default for FocalPoint {
    fn default() -> Self {
        Self { x: 0.5, y: 0.5 }
    }
}

/// Anchor for crop/extent operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gravity {
    NorthWest,
    North,
    NorthEast,
    West,
    Center,
    East,
    SouthWest,
    South,
    SouthEast,
}

impl Gravity {
    pub fn as_str(self) -> &'static str {
        match self {
            Gravity::NorthWest => "NorthWest",
            Gravity::North => "North",
            Gravity::NorthEast => "NorthEast",
            Gravity::West => "West",
            Gravity::Center => "Center",
            Gravity::East => "East",
            Gravity::SouthWest => "SouthWest",
            Gravity::South => "South",
            Gravity::SouthEast => "SouthEast",
        }
    }
}

/// How a resize geometry treats the target box.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeFit {
    /// Fit inside (`WxH`), or proportional to width when no height is given.
    Within,
    /// Cover the box (`WxH^`); one axis overflows.
    Cover,
    /// Ignore aspect ratio (`WxH!`).
    Force,
}

/// One step of a transform, in engine order.
#[derive(Debug, Clone, PartialEq)]
pub enum TransformParam {
    AutoOrient,
    Colorspace(String),
    Resize {
        width: u32,
        height: Option<u32>,
        fit: ResizeFit,
    },
    Gravity(Gravity),
    Background(String),
    Extent {
        width: u32,
        height: u32,
    },
    Strip,
    Interlace(String),
    Quality(Quality),
    SamplingFactor(&'static str),
}

impl TransformParam {
    /// Render as ImageMagick command-line arguments.
    pub fn to_args(&self) -> Vec<String> {
        match self {
            TransformParam::AutoOrient => vec!["-auto-orient".into()],
            TransformParam::Colorspace(space) => vec!["-colorspace".into(), space.clone()],
            TransformParam::Resize { width, height, fit } => {
                let geometry = match (height, fit) {
                    (None, _) => width.to_string(),
                    (Some(h), ResizeFit::Within) => format!("{width}x{h}"),
                    (Some(h), ResizeFit::Cover) => format!("{width}x{h}^"),
                    (Some(h), ResizeFit::Force) => format!("{width}x{h}!"),
                };
                vec!["-resize".into(), geometry]
            }
            TransformParam::Gravity(g) => vec!["-gravity".into(), g.as_str().into()],
            TransformParam::Background(color) => vec!["-background".into(), color.clone()],
            TransformParam::Extent { width, height } => {
                vec!["-extent".into(), format!("{width}x{height}")]
            }
            TransformParam::Strip => vec!["-strip".into()],
            TransformParam::Interlace(mode) => vec!["-interlace".into(), mode.clone()],
            TransformParam::Quality(q) => vec!["-quality".into(), q.value().to_string()],
            TransformParam::SamplingFactor(f) => vec!["-sampling-factor".into(), (*f).into()],
        }
    }
}

/// Flatten a parameter list into engine arguments.
pub fn render_args(params: &[TransformParam]) -> Vec<String> {
    params.iter().flat_map(TransformParam::to_args).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_clamps_to_valid_range() {
        assert_eq!(Quality::new(0).value(), 1);
        assert_eq!(Quality::new(50).value(), 50);
        assert_eq!(Quality::new(150).value(), 100);
    }

    #[test]
    fn default_quality_table() {
        assert_eq!(OutputFormat::Jpg.default_quality().value(), 85);
        assert_eq!(OutputFormat::Jpeg.default_quality().value(), 85);
        assert_eq!(OutputFormat::Webp.default_quality().value(), 85);
        assert_eq!(OutputFormat::Avif.default_quality().value(), 75);
        assert_eq!(OutputFormat::Png.default_quality().value(), 90);
    }

    #[test]
    fn format_extension_roundtrip() {
        for f in OutputFormat::ALL {
            assert_eq!(OutputFormat::from_extension(f.extension()), Some(f));
        }
        assert_eq!(OutputFormat::from_extension("gif"), None);
        assert_eq!(OutputFormat::from_extension("JPG"), None);
    }

    #[test]
    fn format_deserializes_lowercase() {
        let f: Vec<OutputFormat> = serde_json::from_str(r#"["avif","webp","jpg"]"#).unwrap();
        assert_eq!(
            f,
            vec![OutputFormat::Avif, OutputFormat::Webp, OutputFormat::Jpg]
        );
    }

    #[test]
    fn crop_mode_parses_known_values() {
        assert_eq!("cover".parse(), Ok(CropMode::Cover));
        assert_eq!("contain".parse(), Ok(CropMode::Contain));
        assert_eq!("fill".parse(), Ok(CropMode::Fill));
        assert_eq!("exact".parse(), Ok(CropMode::Exact));
    }

    #[test]
    fn crop_mode_unknown_is_error() {
        assert_eq!(
            "portrait".parse::<CropMode>(),
            Err(UnknownCropMode("portrait".to_string()))
        );
        let err = serde_json::from_str::<CropMode>("\"stretch\"").unwrap_err();
        assert!(err.to_string().contains("Unknown crop mode"));
    }

    // =========================================================================
    // Gravity grid
    // =========================================================================

    #[test]
    fn gravity_corners_and_center() {
        assert_eq!(FocalPoint::new(0.1, 0.1).gravity(), Gravity::NorthWest);
        assert_eq!(FocalPoint::new(0.5, 0.5).gravity(), Gravity::Center);
        assert_eq!(FocalPoint::new(0.9, 0.1).gravity(), Gravity::NorthEast);
        assert_eq!(FocalPoint::new(0.1, 0.9).gravity(), Gravity::SouthWest);
        assert_eq!(FocalPoint::new(0.9, 0.9).gravity(), Gravity::SouthEast);
    }

    #[test]
    fn gravity_edges() {
        assert_eq!(FocalPoint::new(0.5, 0.1).gravity(), Gravity::North);
        assert_eq!(FocalPoint::new(0.5, 0.9).gravity(), Gravity::South);
        assert_eq!(FocalPoint::new(0.1, 0.5).gravity(), Gravity::West);
        assert_eq!(FocalPoint::new(0.9, 0.5).gravity(), Gravity::East);
    }

    #[test]
    fn gravity_thresholds_are_exclusive() {
        // 0.33 and 0.66 themselves fall in the middle band
        assert_eq!(FocalPoint::new(0.33, 0.66).gravity(), Gravity::Center);
    }

    #[test]
    fn focal_point_clamps() {
        let p = FocalPoint::new(-1.0, 4.0);
        assert_eq!((p.x, p.y), (0.0, 1.0));
        assert_eq!(FocalPoint::default(), FocalPoint::new(0.5, 0.5));
    }

    // =========================================================================
    // Argument rendering
    // =========================================================================

    #[test]
    fn resize_geometry_flags() {
        let args = |fit, height| {
            TransformParam::Resize {
                width: 800,
                height,
                fit,
            }
            .to_args()
        };
        assert_eq!(args(ResizeFit::Within, None), vec!["-resize", "800"]);
        assert_eq!(args(ResizeFit::Within, Some(600)), vec!["-resize", "800x600"]);
        assert_eq!(args(ResizeFit::Cover, Some(600)), vec!["-resize", "800x600^"]);
        assert_eq!(args(ResizeFit::Force, Some(600)), vec!["-resize", "800x600!"]);
    }

    #[test]
    fn render_args_flattens_in_order() {
        let params = vec![
            TransformParam::AutoOrient,
            TransformParam::Gravity(Gravity::North),
            TransformParam::Quality(Quality::new(80)),
            TransformParam::SamplingFactor("4:2:0"),
        ];
        assert_eq!(
            render_args(&params),
            vec![
                "-auto-orient",
                "-gravity",
                "North",
                "-quality",
                "80",
                "-sampling-factor",
                "4:2:0"
            ]
        );
    }
}
