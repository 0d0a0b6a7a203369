//! Derivative generation: cache check → engine → verified atomic write.
//!
//! [`DerivativeGenerator::ensure`] is the single entry point used by both the
//! on-demand route and the batch job:
//!
//! ```text
//! resolve key ─ exists? ──yes──► return path (no engine call)
//!                  │no (or force)
//!                  ▼
//!          lock key (in-process) ─ exists now? ──yes──► return path
//!                  │no
//!                  ▼
//!   engine → .<random>.<ext> in the target directory
//!                  │
//!        non-empty? ──no──► GenerationFailed, temp file removed
//!                  │yes
//!                  ▼
//!        rename into place ──► return path
//! ```
//!
//! ## Concurrency
//!
//! Two requests for the same key inside one process serialize on a per-key
//! mutex; the second finds the file the first wrote and returns without
//! running the engine. Across processes (a batch run racing the server) both
//! may run the engine, but each writes to its own temp file and renames it
//! into place, so readers only ever see no file or a complete one.
//!
//! The temp file keeps the target extension because ImageMagick picks the
//! encoder from it.

use crate::cache::{CacheKey, CachePathResolver};
use crate::config::ServiceConfig;
use crate::dimensions::DimensionSpec;
use crate::imaging::{
    CropMode, EngineError, FocalPoint, OutputFormat, PlanSettings, TransformEngine, plan,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GenerateError {
    #[error("Source image not found: {0}")]
    SourceNotFound(PathBuf),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Generation failed for {key}: {diagnostic}")]
    GenerationFailed { key: CacheKey, diagnostic: String },
}

/// One logical derivative: what to make from which source.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivativeRequest {
    /// Source path relative to the public root.
    pub source: String,
    pub dimensions: DimensionSpec,
    pub format: OutputFormat,
    pub crop: CropMode,
    pub focal: FocalPoint,
}

impl DerivativeRequest {
    pub fn new(source: impl Into<String>, dimensions: DimensionSpec, format: OutputFormat) -> Self {
        Self {
            source: source.into(),
            dimensions,
            format,
            crop: CropMode::default(),
            focal: FocalPoint::default(),
        }
    }

    pub fn with_crop(mut self, crop: CropMode) -> Self {
        self.crop = crop;
        self
    }

    pub fn with_focal(mut self, focal: FocalPoint) -> Self {
        self.focal = focal;
        self
    }
}

type KeyLock = Arc<Mutex<()>>;

pub struct DerivativeGenerator {
    resolver: CachePathResolver,
    settings: PlanSettings,
    engine: Arc<dyn TransformEngine>,
    in_flight: Mutex<HashMap<CacheKey, KeyLock>>,
}

impl DerivativeGenerator {
    pub fn new(
        resolver: CachePathResolver,
        settings: PlanSettings,
        engine: Arc<dyn TransformEngine>,
    ) -> Self {
        Self {
            resolver,
            settings,
            engine,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &ServiceConfig, engine: Arc<dyn TransformEngine>) -> Self {
        Self::new(
            CachePathResolver::from_config(config),
            PlanSettings::from_config(config),
            engine,
        )
    }

    pub fn resolver(&self) -> &CachePathResolver {
        &self.resolver
    }

    /// Cache key of a request, without touching the filesystem.
    pub fn key_for(&self, request: &DerivativeRequest) -> CacheKey {
        self.resolver
            .resolve(&request.source, &request.dimensions, request.format)
    }

    /// Whether the request's derivative is already on disk.
    pub fn is_cached(&self, request: &DerivativeRequest) -> bool {
        self.resolver.exists(&self.key_for(request))
    }

    /// Return the path of a valid derivative, generating it if needed.
    ///
    /// With `force`, an existing derivative is regenerated and overwritten.
    pub fn ensure(
        &self,
        request: &DerivativeRequest,
        force: bool,
    ) -> Result<PathBuf, GenerateError> {
        let key = self.key_for(request);
        let dest = self.resolver.filesystem_path(&key);

        if !force && dest.is_file() {
            tracing::debug!(cache_key = %key, "cache hit");
            return Ok(dest);
        }

        let source = self.resolver.source_path(&request.source);
        if !source.is_file() {
            return Err(GenerateError::SourceNotFound(source));
        }

        let lock = self.key_lock(&key);
        let result = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            // Another caller may have finished while we waited.
            if !force && dest.is_file() {
                tracing::debug!(cache_key = %key, "generated by concurrent request");
                Ok(dest)
            } else {
                self.generate(&key, &source, request, &dest)
            }
        };
        drop(lock);
        self.release_locks();
        result
    }

    fn generate(
        &self,
        key: &CacheKey,
        source: &Path,
        request: &DerivativeRequest,
        dest: &Path,
    ) -> Result<PathBuf, GenerateError> {
        let dir = self.resolver.ensure_directory(key)?;
        let params = plan(
            &request.dimensions,
            request.crop,
            request.focal,
            request.format,
            &self.settings,
        );

        let temp = tempfile::Builder::new()
            .prefix(".")
            .suffix(&format!(".{}", request.format.extension()))
            .tempfile_in(&dir)?;

        // Dropping `temp` on any early return removes the partial file.
        self.engine
            .transform(source, &params, temp.path())
            .map_err(|e| failed(key, &e))?;

        let written = std::fs::metadata(temp.path()).map(|m| m.len()).unwrap_or(0);
        if written == 0 {
            return Err(GenerateError::GenerationFailed {
                key: key.clone(),
                diagnostic: "engine produced no output".to_string(),
            });
        }

        temp.persist(dest).map_err(|e| GenerateError::Io(e.error))?;
        tracing::info!(cache_key = %key, bytes = written, "generated derivative");
        Ok(dest.to_path_buf())
    }

    fn lock_map(&self) -> MutexGuard<'_, HashMap<CacheKey, KeyLock>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn key_lock(&self, key: &CacheKey) -> KeyLock {
        Arc::clone(self.lock_map().entry(key.clone()).or_default())
    }

    /// Drop map entries nobody holds anymore.
    fn release_locks(&self) {
        self.lock_map()
            .retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    #[cfg(test)]
    fn in_flight_len(&self) -> usize {
        self.lock_map().len()
    }
}

fn failed(key: &CacheKey, error: &EngineError) -> GenerateError {
    GenerateError::GenerationFailed {
        key: key.clone(),
        diagnostic: error.to_string(),
    }
}
