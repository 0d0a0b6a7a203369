//! # Image Variants
//!
//! Resized and re-encoded image derivatives, served on demand and
//! precomputed in batch, cached on the filesystem under a URL that is also
//! the cache path.
//!
//! # Architecture
//!
//! ```text
//! GET /cache/images/800x600/library/dawn.webp      image-variants generate
//!              │                                          │
//!          server ─────────────┐          ┌──────── batch ◄── matrix ◄── presets
//!                              ▼          ▼
//!                          generator ── cache (key = URL = path)
//!                              │
//!                 imaging::planner → imaging::engine (ImageMagick)
//!
//! markup ── presets + cache ──► <picture> with URLs the server answers
//! ```
//!
//! Every consumer derives keys through [`cache::CachePathResolver::resolve`].
//! A derivative exists exactly when its file does; there is no index, no
//! expiry and no database.
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`dimensions`] | `WxH` / `W` token parser |
//! | [`imaging`] | Transform parameters, the planner, and the out-of-process engine |
//! | [`cache`] | Cache keys and their filesystem locations |
//! | [`generator`] | Cache check, engine run, verified atomic write |
//! | [`server`] | axum route generating derivatives on first request |
//! | [`matrix`] | Presets × dimensions × formats expansion |
//! | [`batch`] | Parallel precomputation over the source library |
//! | [`markup`] | Responsive `<picture>` markup from presets |
//! | [`config`] | `config.toml` loading, stock defaults, validation |
//! | [`output`] | CLI output formatting for batch runs |
//!
//! # Design Decisions
//!
//! ## The URL Is the Cache Key
//!
//! A derivative's public URL, its cache key and (relative to the public root)
//! its file path are the same string. A static file server in front of the
//! service answers every hit without involving it; only misses reach the
//! on-demand route. The key carries no content hash or timestamp, so a
//! source replaced in place keeps its old derivatives until a forced batch
//! run regenerates them.
//!
//! ## ImageMagick Out of Process
//!
//! Pixel work is delegated to ImageMagick through the
//! [`imaging::TransformEngine`] trait. This crate plans the arguments,
//! enforces a timeout, and verifies the output; it never decodes an image.
//! Tests substitute a recording mock at the same seam.

pub mod batch;
pub mod cache;
pub mod config;
pub mod dimensions;
pub mod generator;
pub mod imaging;
pub mod markup;
pub mod matrix;
pub mod output;
pub mod server;

#[cfg(test)]
pub(crate) mod test_helpers;
