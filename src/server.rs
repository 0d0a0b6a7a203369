//! On-demand derivative route.
//!
//! ```text
//! GET {cache_root}/{dimensions}/{image path}.{format}
//!
//!   source probe (jpg, jpeg, png, gif, webp) ── none ──► 404
//!   dimension whitelist ──────────────────────── miss ──► 400
//!   token parse ──────────────────────────────── bad  ──► 400
//!   generator.ensure (blocking pool) ─────────── fail ──► 500 + diagnostic
//!   200, sniffed Content-Type, immutable caching, body streamed from disk
//! ```
//!
//! The `{dimensions}` segment accepts both `WxH` and width-only `W` tokens.
//! The markup builder and the batch job emit width-only URLs for width-only
//! preset entries, so the route answers every token [`DimensionSpec`]
//! parses. A dangling `800x` reaches the parser and is a 400.
//!
//! The request URL is the cache key: a derivative written here is served
//! straight from disk by any static file server in front of this one, so
//! the route only sees cache misses in production.
//!
//! Generation runs under `spawn_blocking` and is not tied to the request
//! future. A client that disconnects mid-generation still leaves a complete
//! derivative behind for the next request.

use crate::batch::SOURCE_EXTENSIONS;
use crate::config::{PresetConfig, ServiceConfig};
use crate::dimensions::{DimensionSpec, InvalidDimensions};
use crate::generator::{DerivativeGenerator, DerivativeRequest, GenerateError};
use crate::imaging::{CropMode, OutputFormat, TransformEngine};
use axum::Router;
use axum::body::Body;
use axum::extract::{Path as UrlPath, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use indexmap::IndexMap;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::io::ReaderStream;

pub const CACHE_CONTROL: &str = "public, max-age=31536000, immutable";

/// Bytes read from the derivative for content-type sniffing.
const SNIFF_LEN: usize = 64;

#[derive(Error, Debug)]
pub enum ServeError {
    #[error("Source image not found: {0}")]
    SourceNotFound(String),
    #[error("Dimensions not allowed: {0}")]
    DimensionNotAllowed(String),
    #[error(transparent)]
    InvalidDimensions(#[from] InvalidDimensions),
    #[error("Image generation failed: {0}")]
    Generation(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServeError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServeError::SourceNotFound(_) => StatusCode::NOT_FOUND,
            ServeError::DimensionNotAllowed(_) | ServeError::InvalidDimensions(_) => {
                StatusCode::BAD_REQUEST
            }
            ServeError::Generation(_) | ServeError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<GenerateError> for ServeError {
    fn from(e: GenerateError) -> Self {
        match e {
            GenerateError::SourceNotFound(path) => {
                ServeError::SourceNotFound(path.display().to_string())
            }
            GenerateError::GenerationFailed { diagnostic, .. } => ServeError::Generation(diagnostic),
            GenerateError::Io(e) => ServeError::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for ServeError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "derivative request failed");
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "derivative request rejected");
        }
        (status, self.to_string()).into_response()
    }
}

/// Shared state of the route.
pub struct ServeState {
    generator: DerivativeGenerator,
    allowed_dimensions: Vec<String>,
    presets: IndexMap<String, PresetConfig>,
    default_crop: CropMode,
}

impl ServeState {
    pub fn new(generator: DerivativeGenerator, config: &ServiceConfig) -> Self {
        Self {
            generator,
            allowed_dimensions: config
                .allowed_dimensions
                .iter()
                .map(DimensionSpec::token)
                .collect(),
            presets: config.presets.clone(),
            default_crop: config.serve.default_crop,
        }
    }

    pub fn from_config(config: &ServiceConfig, engine: Arc<dyn TransformEngine>) -> Self {
        Self::new(DerivativeGenerator::from_config(config, engine), config)
    }

    pub fn generator(&self) -> &DerivativeGenerator {
        &self.generator
    }

    /// Crop of the first preset listing `dimensions`, else the default.
    fn crop_for(&self, dimensions: &DimensionSpec) -> CropMode {
        self.presets
            .values()
            .find(|p| {
                p.dimensions
                    .as_ref()
                    .is_some_and(|d| d.contains_key(dimensions))
            })
            .map(|p| p.crop)
            .unwrap_or(self.default_crop)
    }
}

/// Build the router serving `{cache_root}/{dimensions}/{*path}`.
pub fn router(state: Arc<ServeState>) -> Router {
    let root = state.generator.resolver().cache_root().trim_end_matches('/');
    let route = format!("{root}/{{dimensions}}/{{*path}}");
    Router::new()
        .route(&route, get(serve_derivative))
        .with_state(state)
}

/// Bind and serve until the process is stopped.
pub async fn run(state: Arc<ServeState>, bind: &str) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(
        bind = %bind,
        cache_root = %state.generator.resolver().cache_root(),
        "serving derivatives"
    );
    axum::serve(listener, router(state)).await
}

/// Validate a request and turn it into a derivative request.
///
/// `path` is the wildcard tail: the source path without its extension,
/// followed by the output format extension.
pub fn resolve_request(
    state: &ServeState,
    dimensions: &str,
    path: &str,
) -> Result<DerivativeRequest, ServeError> {
    let not_found = || ServeError::SourceNotFound(path.to_string());

    let (stem, extension) = path.rsplit_once('.').ok_or_else(not_found)?;
    let format = OutputFormat::from_extension(extension).ok_or_else(not_found)?;
    if !is_safe_relative(stem) {
        return Err(not_found());
    }

    let resolver = state.generator.resolver();
    let source = SOURCE_EXTENSIONS
        .iter()
        .map(|ext| format!("{stem}.{ext}"))
        .find(|candidate| resolver.source_path(candidate).is_file())
        .ok_or_else(not_found)?;

    if !state.allowed_dimensions.is_empty()
        && !state.allowed_dimensions.iter().any(|d| d == dimensions)
    {
        return Err(ServeError::DimensionNotAllowed(dimensions.to_string()));
    }
    let dimensions = DimensionSpec::parse(dimensions)?;

    Ok(DerivativeRequest::new(source, dimensions, format).with_crop(state.crop_for(&dimensions)))
}

/// Relative, without `..`, and not escaping through a drive or root.
fn is_safe_relative(path: &str) -> bool {
    !path.is_empty()
        && !path.starts_with('/')
        && !path.contains('\\')
        && path.split('/').all(|segment| segment != ".." && !segment.contains(':'))
}

async fn serve_derivative(
    State(state): State<Arc<ServeState>>,
    UrlPath((dimensions, path)): UrlPath<(String, String)>,
) -> Result<Response, ServeError> {
    let request = resolve_request(&state, &dimensions, &path)?;

    let format = request.format;
    let worker = Arc::clone(&state);
    let (file_path, content_type, len) = tokio::task::spawn_blocking(move || {
        let file_path = worker.generator.ensure(&request, false)?;
        let (head, len) = sniff(&file_path)?;
        let content_type = image::guess_format(&head)
            .map(|f| f.to_mime_type())
            .unwrap_or_else(|_| format.mime_type());
        Ok::<_, ServeError>((file_path, content_type, len))
    })
    .await
    .map_err(|e| ServeError::Internal(e.to_string()))??;

    let file = tokio::fs::File::open(&file_path)
        .await
        .map_err(|e| ServeError::Internal(e.to_string()))?;

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, len)
        .header(header::CACHE_CONTROL, CACHE_CONTROL)
        .body(Body::from_stream(ReaderStream::new(file)))
        .map_err(|e| ServeError::Internal(e.to_string()))
}

/// First bytes and total length of a file.
fn sniff(path: &Path) -> Result<(Vec<u8>, u64), ServeError> {
    let internal = |e: std::io::Error| ServeError::Internal(e.to_string());
    let mut file = std::fs::File::open(path).map_err(internal)?;
    let len = file.metadata().map_err(internal)?.len();
    let mut head = Vec::with_capacity(SNIFF_LEN);
    file.by_ref()
        .take(SNIFF_LEN as u64)
        .read_to_end(&mut head)
        .map_err(internal)?;
    Ok((head, len))
}
