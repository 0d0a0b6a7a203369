//! Image transforms: planning in-process, pixel work out of process.
//!
//! | Piece | Role |
//! |---|---|
//! | **Parameters** | Engine-neutral types: formats, crop modes, gravity, params |
//! | **Planner** | Pure function from a request to an ordered parameter list |
//! | **Engine** | [`TransformEngine`] trait, the seam tests mock |
//! | **Magick** | [`MagickEngine`]: ImageMagick with a wall-clock timeout |

pub mod engine;
pub mod magick;
pub mod params;
pub mod planner;

pub use engine::{EngineError, TransformEngine};
pub use magick::MagickEngine;
pub use params::{
    CropMode, FocalPoint, Gravity, OutputFormat, Quality, TransformParam, UnknownCropMode,
    UnknownFormat,
};
pub use planner::{PlanSettings, plan};
