//! Shared test utilities for the image-variants test suite.
//!
//! Provides a throwaway public root with source files and a generator wired
//! to a mock engine.
//!
//! # Usage
//!
//! ```rust
//! use crate::test_helpers::*;
//!
//! let public = PublicDir::with_sources(&["library/dawn.jpg"]);
//! let engine = Arc::new(MockEngine::new());
//! let generator = mock_generator(&public, engine.clone());
//!
//! generator.ensure(&request, false).unwrap();
//! assert_eq!(engine.call_count(), 1);
//! assert_cached(&generator, "library/dawn.jpg", "800x600", OutputFormat::Webp);
//! ```

use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

use crate::cache::CachePathResolver;
use crate::dimensions::DimensionSpec;
use crate::generator::DerivativeGenerator;
use crate::imaging::{OutputFormat, PlanSettings, TransformEngine};

/// Placeholder source bytes; the mock engine never decodes them.
pub const SOURCE_BYTES: &[u8] = b"\xff\xd8\xff\xe0source";

pub const CACHE_ROOT: &str = "/cache/images";

// =========================================================================
// Fixture setup
// =========================================================================

/// A temporary public root. Removed on drop.
pub struct PublicDir {
    tmp: TempDir,
}

impl PublicDir {
    /// Create a public root containing the given source files (paths
    /// relative to the root; parent directories are created).
    pub fn with_sources(sources: &[&str]) -> Self {
        let tmp = TempDir::new().unwrap();
        for source in sources {
            let path = tmp.path().join(source);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(&path, SOURCE_BYTES).unwrap();
        }
        Self { tmp }
    }

    pub fn path(&self) -> &Path {
        self.tmp.path()
    }
}

/// A generator over `public` with stock plan settings and the given engine.
pub fn mock_generator(public: &PublicDir, engine: Arc<dyn TransformEngine>) -> DerivativeGenerator {
    DerivativeGenerator::new(
        CachePathResolver::new(public.path(), CACHE_ROOT),
        PlanSettings::default(),
        engine,
    )
}

// =========================================================================
// Assertions
// =========================================================================

/// Assert the derivative for `(source, token, format)` exists on disk.
pub fn assert_cached(
    generator: &DerivativeGenerator,
    source: &str,
    token: &str,
    format: OutputFormat,
) {
    let dims = DimensionSpec::parse(token).unwrap();
    let key = generator.resolver().resolve(source, &dims, format);
    assert!(
        generator.resolver().exists(&key),
        "expected {key} to be cached"
    );
}

/// List every file under the cache root, relative to the public root.
pub fn cached_files(public: &PublicDir) -> Vec<String> {
    let root = public.path().join(CACHE_ROOT.trim_start_matches('/'));
    if !root.is_dir() {
        return Vec::new();
    }
    let mut files: Vec<String> = walkdir::WalkDir::new(&root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            e.path()
                .strip_prefix(public.path())
                .ok()
                .map(|p| p.to_string_lossy().replace('\\', "/"))
        })
        .collect();
    files.sort();
    files
}
