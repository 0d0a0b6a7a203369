//! Transform engine trait and shared error type.
//!
//! A [`TransformEngine`] takes a source file, an ordered parameter list from
//! the [`planner`](super::planner), and a destination path. It either leaves
//! an encoded image at the destination or reports why it could not.
//!
//! The production implementation is
//! [`MagickEngine`](super::magick::MagickEngine), which runs ImageMagick out
//! of process with a wall-clock timeout. Pixel work never happens in this
//! crate.

use super::params::TransformParam;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Failed to start transform engine: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("Transform engine failed: {diagnostic}")]
    Failed { diagnostic: String },
    #[error("Transform engine timed out after {0:?}")]
    TimedOut(Duration),
}

/// Out-of-process image transform.
///
/// Implementations must be `Send + Sync`: the generator shares one engine
/// across rayon workers and tokio blocking threads.
pub trait TransformEngine: Send + Sync {
    /// Transform `source` into `dest`, applying `params` in order.
    fn transform(
        &self,
        source: &Path,
        params: &[TransformParam],
        dest: &Path,
    ) -> Result<(), EngineError>;
}
