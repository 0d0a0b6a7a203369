//! Transform planning: logical request → ordered engine parameters.
//!
//! The plan is a pure function of the request and the optimization settings.
//! Its order is fixed:
//!
//! ```text
//! auto-orient → colorspace → geometry → strip → interlace → quality → sampling
//! ```
//!
//! Geometry depends on the crop mode when a height is given:
//!
//! | Mode | Parameters |
//! |---|---|
//! | (width only) | `-resize W` |
//! | `cover` | `-resize WxH^ -gravity G -extent WxH` |
//! | `contain` | `-resize WxH` |
//! | `fill` | `-resize WxH -gravity Center -background C -extent WxH` |
//! | `exact` | `-resize WxH!` |

use super::params::{
    CropMode, FocalPoint, Gravity, OutputFormat, Quality, ResizeFit, TransformParam,
};
use crate::config::ServiceConfig;
use crate::dimensions::DimensionSpec;
use std::collections::BTreeMap;

/// Chroma subsampling applied to every jpeg-family output.
pub const JPEG_SAMPLING_FACTOR: &str = "4:2:0";

/// Optimization settings the planner reads from configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanSettings {
    pub strip_metadata: bool,
    /// `None` skips colorspace normalization.
    pub colorspace: Option<String>,
    /// Interlace mode for formats other than jpeg and png. `None` disables
    /// interlacing for every format.
    pub interlace: Option<String>,
    /// Canvas color used by `fill`.
    pub background: String,
    /// Quality per output extension.
    pub quality: BTreeMap<String, u32>,
}

impl PlanSettings {
    pub fn from_config(config: &ServiceConfig) -> Self {
        let opt = &config.optimization;
        Self {
            strip_metadata: opt.strip_metadata,
            colorspace: non_empty(&opt.colorspace),
            interlace: non_empty(&opt.interlace),
            background: opt.background.clone(),
            quality: config.quality.clone(),
        }
    }

    /// Quality for a format: table entry if present, else 85.
    pub fn quality_for(&self, format: OutputFormat) -> Quality {
        self.quality
            .get(format.extension())
            .map(|&q| Quality::new(q))
            .unwrap_or_default()
    }
}

impl Default for PlanSettings {
    fn default() -> Self {
        Self::from_config(&ServiceConfig::default())
    }
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

/// Build the ordered parameter list for one derivative.
pub fn plan(
    dimensions: &DimensionSpec,
    crop: CropMode,
    focal: FocalPoint,
    format: OutputFormat,
    settings: &PlanSettings,
) -> Vec<TransformParam> {
    let mut params = vec![TransformParam::AutoOrient];

    if let Some(space) = &settings.colorspace {
        params.push(TransformParam::Colorspace(space.clone()));
    }

    push_geometry(&mut params, dimensions, crop, focal, &settings.background);

    if settings.strip_metadata {
        params.push(TransformParam::Strip);
    }

    if let Some(configured) = &settings.interlace {
        let mode = if format.is_jpeg_family() {
            "Plane".to_string()
        } else if format == OutputFormat::Png {
            "PNG".to_string()
        } else {
            configured.clone()
        };
        params.push(TransformParam::Interlace(mode));
    }

    params.push(TransformParam::Quality(settings.quality_for(format)));

    if format.is_jpeg_family() {
        params.push(TransformParam::SamplingFactor(JPEG_SAMPLING_FACTOR));
    }

    params
}

fn push_geometry(
    params: &mut Vec<TransformParam>,
    dimensions: &DimensionSpec,
    crop: CropMode,
    focal: FocalPoint,
    background: &str,
) {
    let width = dimensions.width;
    let Some(height) = dimensions.height else {
        params.push(TransformParam::Resize {
            width,
            height: None,
            fit: ResizeFit::Within,
        });
        return;
    };

    let resize = |fit| TransformParam::Resize {
        width,
        height: Some(height),
        fit,
    };
    match crop {
        CropMode::Cover => {
            params.push(resize(ResizeFit::Cover));
            params.push(TransformParam::Gravity(focal.gravity()));
            params.push(TransformParam::Extent { width, height });
        }
        CropMode::Contain => params.push(resize(ResizeFit::Within)),
        CropMode::Fill => {
            params.push(resize(ResizeFit::Within));
            params.push(TransformParam::Gravity(Gravity::Center));
            params.push(TransformParam::Background(background.to_string()));
            params.push(TransformParam::Extent { width, height });
        }
        CropMode::Exact => params.push(resize(ResizeFit::Force)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imaging::params::render_args;

    fn dims(token: &str) -> DimensionSpec {
        DimensionSpec::parse(token).unwrap()
    }

    fn args(token: &str, crop: CropMode, focal: FocalPoint, format: OutputFormat) -> Vec<String> {
        render_args(&plan(
            &dims(token),
            crop,
            focal,
            format,
            &PlanSettings::default(),
        ))
    }

    // =========================================================================
    // Geometry
    // =========================================================================

    #[test]
    fn cover_resizes_then_crops_toward_focal_point() {
        let a = args(
            "800x600",
            CropMode::Cover,
            FocalPoint::new(0.1, 0.1),
            OutputFormat::Webp,
        );
        let joined = a.join(" ");
        assert!(joined.contains("-resize 800x600^ -gravity NorthWest -extent 800x600"));
    }

    #[test]
    fn cover_center_gravity_by_default() {
        let a = args(
            "400x400",
            CropMode::Cover,
            FocalPoint::default(),
            OutputFormat::Avif,
        );
        assert!(a.join(" ").contains("-gravity Center"));
    }

    #[test]
    fn contain_has_no_crop() {
        let a = args(
            "800x600",
            CropMode::Contain,
            FocalPoint::default(),
            OutputFormat::Webp,
        );
        let joined = a.join(" ");
        assert!(joined.contains("-resize 800x600 "));
        assert!(!joined.contains("-extent"));
        assert!(!joined.contains("-gravity"));
    }

    #[test]
    fn fill_pads_with_background() {
        let a = args(
            "800x600",
            CropMode::Fill,
            FocalPoint::new(0.9, 0.9),
            OutputFormat::Png,
        );
        let joined = a.join(" ");
        assert!(
            joined.contains("-resize 800x600 -gravity Center -background white -extent 800x600")
        );
    }

    #[test]
    fn exact_forces_dimensions() {
        let a = args(
            "800x600",
            CropMode::Exact,
            FocalPoint::default(),
            OutputFormat::Webp,
        );
        assert!(a.join(" ").contains("-resize 800x600!"));
    }

    #[test]
    fn width_only_ignores_crop_mode() {
        for crop in [
            CropMode::Cover,
            CropMode::Contain,
            CropMode::Fill,
            CropMode::Exact,
        ] {
            let a = args("640", crop, FocalPoint::new(0.1, 0.9), OutputFormat::Webp);
            let joined = a.join(" ");
            assert!(joined.contains("-resize 640 "), "{crop}: {joined}");
            assert!(!joined.contains("-extent"));
            assert!(!joined.contains("-gravity"));
        }
    }

    // =========================================================================
    // Full ordering and format hints
    // =========================================================================

    #[test]
    fn jpeg_plan_full_order() {
        let a = args(
            "800x600",
            CropMode::Cover,
            FocalPoint::default(),
            OutputFormat::Jpg,
        );
        assert_eq!(
            a,
            vec![
                "-auto-orient",
                "-colorspace",
                "sRGB",
                "-resize",
                "800x600^",
                "-gravity",
                "Center",
                "-extent",
                "800x600",
                "-strip",
                "-interlace",
                "Plane",
                "-quality",
                "85",
                "-sampling-factor",
                "4:2:0",
            ]
        );
    }

    #[test]
    fn png_uses_png_interlace_and_quality_90() {
        let a = args(
            "800",
            CropMode::Cover,
            FocalPoint::default(),
            OutputFormat::Png,
        );
        let joined = a.join(" ");
        assert!(joined.contains("-interlace PNG"));
        assert!(joined.contains("-quality 90"));
        assert!(!joined.contains("-sampling-factor"));
    }

    #[test]
    fn avif_uses_configured_interlace_and_quality_75() {
        let a = args(
            "800",
            CropMode::Cover,
            FocalPoint::default(),
            OutputFormat::Avif,
        );
        let joined = a.join(" ");
        assert!(joined.contains("-interlace Plane"));
        assert!(joined.contains("-quality 75"));
    }

    #[test]
    fn jpeg_extension_gets_sampling_factor() {
        let a = args(
            "800",
            CropMode::Cover,
            FocalPoint::default(),
            OutputFormat::Jpeg,
        );
        assert!(a.join(" ").ends_with("-sampling-factor 4:2:0"));
    }

    // =========================================================================
    // Settings
    // =========================================================================

    #[test]
    fn disabled_optimizations_are_omitted() {
        let settings = PlanSettings {
            strip_metadata: false,
            colorspace: None,
            interlace: None,
            ..PlanSettings::default()
        };
        let a = render_args(&plan(
            &dims("800x600"),
            CropMode::Contain,
            FocalPoint::default(),
            OutputFormat::Jpg,
            &settings,
        ));
        assert_eq!(
            a,
            vec![
                "-auto-orient",
                "-resize",
                "800x600",
                "-quality",
                "85",
                "-sampling-factor",
                "4:2:0"
            ]
        );
    }

    #[test]
    fn quality_table_override_is_clamped() {
        let mut settings = PlanSettings::default();
        settings.quality.insert("webp".into(), 250);
        assert_eq!(settings.quality_for(OutputFormat::Webp).value(), 100);
    }

    #[test]
    fn missing_quality_entry_falls_back_to_85() {
        let mut settings = PlanSettings::default();
        settings.quality.clear();
        assert_eq!(settings.quality_for(OutputFormat::Png).value(), 85);
    }

    #[test]
    fn custom_background_for_fill() {
        let settings = PlanSettings {
            background: "#000000".into(),
            ..PlanSettings::default()
        };
        let a = render_args(&plan(
            &dims("100x100"),
            CropMode::Fill,
            FocalPoint::default(),
            OutputFormat::Png,
            &settings,
        ));
        assert!(a.join(" ").contains("-background #000000"));
    }
}
