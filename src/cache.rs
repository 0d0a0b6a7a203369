//! Derivative cache keys and their filesystem locations.
//!
//! Every derivative is addressed by a [`CacheKey`], a pure function of the
//! source path, the dimension token and the output format:
//!
//! ```text
//! {cache_root}/{dimensions}/{source dir}/{source stem}.{format}
//!
//! resolve("library/2024/dawn.jpg", 800x600, webp)
//!   → /cache/images/800x600/library/2024/dawn.webp
//! ```
//!
//! The key is also the derivative's public URL and, relative to the public
//! root, its location on disk. Nothing else is stored: a derivative exists
//! exactly when its file does. There are no timestamps or content hashes in
//! the key, so the same request always lands on the same file and
//! regeneration overwrites in place.
//!
//! The on-demand route, the batch job and the markup builder all derive keys
//! through [`CachePathResolver::resolve`]; there is no second copy of the
//! formula.
//!
//! ## Known collision
//!
//! The source extension is not part of the key. `photo.jpg` and `photo.png`
//! in the same directory share one slot per dimension/format; whichever is
//! generated first wins.

use crate::config::ServiceConfig;
use crate::dimensions::DimensionSpec;
use crate::imaging::OutputFormat;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

/// Canonical identifier of one derivative; doubles as its URL path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Maps logical derivative requests to keys and keys to files.
#[derive(Debug, Clone)]
pub struct CachePathResolver {
    public_root: PathBuf,
    cache_root: String,
}

impl CachePathResolver {
    pub fn new(public_root: impl Into<PathBuf>, cache_root: &str) -> Self {
        Self {
            public_root: public_root.into(),
            cache_root: cache_root.trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(config: &ServiceConfig) -> Self {
        Self::new(config.public_root.clone(), config.cache_root())
    }

    pub fn public_root(&self) -> &Path {
        &self.public_root
    }

    /// URL prefix of every key, without a trailing slash.
    pub fn cache_root(&self) -> &str {
        &self.cache_root
    }

    /// Derive the cache key for a source path (relative to the public root).
    pub fn resolve(
        &self,
        source: &str,
        dimensions: &DimensionSpec,
        format: OutputFormat,
    ) -> CacheKey {
        let (dir, file) = match source.rsplit_once('/') {
            Some((dir, file)) => (dir, file),
            None => ("", source),
        };
        let dir = if dir == "." { "" } else { dir };
        let raw = format!(
            "{}/{}/{}/{}.{}",
            self.cache_root,
            dimensions,
            dir,
            file_stem(file),
            format.extension()
        );
        CacheKey(collapse_separators(&raw))
    }

    /// Absolute location of a derivative: the public root joined with the
    /// key minus its leading `/`.
    pub fn filesystem_path(&self, key: &CacheKey) -> PathBuf {
        self.public_root.join(key.as_str().trim_start_matches('/'))
    }

    /// Whether the derivative file is present.
    pub fn exists(&self, key: &CacheKey) -> bool {
        self.filesystem_path(key).is_file()
    }

    /// Create the derivative's parent directory (idempotent) and return it.
    pub fn ensure_directory(&self, key: &CacheKey) -> io::Result<PathBuf> {
        let path = self.filesystem_path(key);
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.public_root.clone());
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Absolute path of a source image given relative to the public root.
    pub fn source_path(&self, relative: &str) -> PathBuf {
        self.public_root.join(relative.trim_start_matches('/'))
    }
}

/// File name without its last extension (`"a.b.jpg"` → `"a.b"`).
fn file_stem(file: &str) -> &str {
    match file.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => file,
    }
}

fn collapse_separators(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut previous_slash = false;
    for c in path.chars() {
        if c == '/' {
            if !previous_slash {
                out.push(c);
            }
            previous_slash = true;
        } else {
            out.push(c);
            previous_slash = false;
        }
    }
    out
}
