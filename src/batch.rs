//! Batch precomputation of derivatives.
//!
//! Generates ahead of time what the on-demand route would otherwise create
//! lazily: every [`Variation`] for every discovered source image.
//!
//! ```text
//! discover_sources(public/library)     build(presets)
//!            │                               │
//!            └──────────► sources × variations ◄┘
//!                               │ (rayon)
//!                               ▼
//!         exists && !force → skipped
//!         dry_run          → generated (engine not called)
//!         ensure()         → generated | errors
//!                               │
//!                               ▼
//!                      Σ Stats (ordering-insensitive)
//! ```
//!
//! Failures are logged and counted; the run always covers every pair. The
//! caller decides the exit status from [`Stats::is_success`].

use crate::generator::{DerivativeGenerator, DerivativeRequest};
use crate::matrix::Variation;
use rayon::prelude::*;
use std::fmt;
use std::ops::{Add, AddAssign};
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use thiserror::Error;
use walkdir::WalkDir;

/// Extensions (lowercase) accepted as source images. The on-demand route
/// probes them in this order.
pub const SOURCE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp"];

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("Failed to walk source directory: {0}")]
    Walk(#[from] walkdir::Error),
}

/// Per-run outcome counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub generated: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl Stats {
    pub fn generated() -> Self {
        Self {
            generated: 1,
            ..Self::default()
        }
    }

    pub fn skipped() -> Self {
        Self {
            skipped: 1,
            ..Self::default()
        }
    }

    pub fn error() -> Self {
        Self {
            errors: 1,
            ..Self::default()
        }
    }

    pub fn total(&self) -> usize {
        self.generated + self.skipped + self.errors
    }

    /// A run succeeds when nothing failed, dry runs included.
    pub fn is_success(&self) -> bool {
        self.errors == 0
    }
}

impl Add for Stats {
    type Output = Stats;

    fn add(self, rhs: Stats) -> Stats {
        Stats {
            generated: self.generated + rhs.generated,
            skipped: self.skipped + rhs.skipped,
            errors: self.errors + rhs.errors,
        }
    }
}

impl AddAssign for Stats {
    fn add_assign(&mut self, rhs: Stats) {
        *self = *self + rhs;
    }
}

impl std::iter::Sum for Stats {
    fn sum<I: Iterator<Item = Stats>>(iter: I) -> Stats {
        iter.fold(Stats::default(), Add::add)
    }
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} generated, {} skipped, {} errors ({} total)",
            self.generated,
            self.skipped,
            self.errors,
            self.total()
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOptions {
    /// Regenerate derivatives that already exist.
    pub force: bool,
    /// Count what would be generated without calling the engine.
    pub dry_run: bool,
}

/// Progress reported while a batch runs.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchEvent {
    Generated { source: String, key: String },
    /// Dry run: the derivative would have been generated.
    Planned { source: String, key: String },
    Skipped { source: String, key: String },
    Failed {
        source: String,
        key: String,
        error: String,
    },
}

/// Find source images under `{public_root}/{source_dir}`.
///
/// Returns paths relative to the public root, `/`-separated and sorted. The
/// optional `path_filter` keeps only paths containing it as a substring. A
/// missing source directory yields no sources.
pub fn discover_sources(
    public_root: &Path,
    source_dir: &str,
    path_filter: Option<&str>,
) -> Result<Vec<String>, BatchError> {
    let base = public_root.join(source_dir.trim_matches('/'));
    if !base.is_dir() {
        tracing::warn!(dir = %base.display(), "source directory not found");
        return Ok(Vec::new());
    }

    let mut sources = Vec::new();
    for entry in WalkDir::new(&base) {
        let entry = entry?;
        if !entry.file_type().is_file() || !has_source_extension(entry.path()) {
            continue;
        }
        let Some(relative) = relative_slash_path(public_root, entry.path()) else {
            continue;
        };
        if path_filter.is_some_and(|f| !relative.contains(f)) {
            continue;
        }
        sources.push(relative);
    }
    sources.sort();
    Ok(sources)
}

fn has_source_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| SOURCE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn relative_slash_path(root: &Path, path: &Path) -> Option<String> {
    let relative: PathBuf = path.strip_prefix(root).ok()?.to_path_buf();
    let parts: Vec<&str> = relative
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<_>>()?;
    Some(parts.join("/"))
}

/// Generate every (source, variation) pair in parallel and sum the outcomes.
pub fn run(
    generator: &DerivativeGenerator,
    variations: &[Variation],
    sources: &[String],
    options: BatchOptions,
    events: Option<&Sender<BatchEvent>>,
) -> Stats {
    let pairs: Vec<(&String, &Variation)> = sources
        .iter()
        .flat_map(|s| variations.iter().map(move |v| (s, v)))
        .collect();

    tracing::info!(
        sources = sources.len(),
        variations = variations.len(),
        tasks = pairs.len(),
        force = options.force,
        dry_run = options.dry_run,
        "starting batch"
    );

    let stats = pairs
        .par_iter()
        .map(|&(source, variation)| process_pair(generator, source, variation, options, events))
        .reduce(Stats::default, Add::add);

    tracing::info!(
        generated = stats.generated,
        skipped = stats.skipped,
        errors = stats.errors,
        "batch finished"
    );
    stats
}

fn process_pair(
    generator: &DerivativeGenerator,
    source: &str,
    variation: &Variation,
    options: BatchOptions,
    events: Option<&Sender<BatchEvent>>,
) -> Stats {
    let request = DerivativeRequest {
        source: source.to_string(),
        dimensions: variation.dimensions,
        format: variation.format,
        crop: variation.crop,
        focal: variation.focal,
    };
    let key = generator.key_for(&request);
    let emit = |event: BatchEvent| {
        if let Some(tx) = events {
            // Receiver gone means nobody is printing; keep working.
            let _ = tx.send(event);
        }
    };

    if !options.force && generator.resolver().exists(&key) {
        emit(BatchEvent::Skipped {
            source: source.to_string(),
            key: key.to_string(),
        });
        return Stats::skipped();
    }

    if options.dry_run {
        emit(BatchEvent::Planned {
            source: source.to_string(),
            key: key.to_string(),
        });
        return Stats::generated();
    }

    match generator.ensure(&request, options.force) {
        Ok(_) => {
            emit(BatchEvent::Generated {
                source: source.to_string(),
                key: key.to_string(),
            });
            Stats::generated()
        }
        Err(e) => {
            tracing::warn!(source = %source, cache_key = %key, error = %e, "variation failed");
            emit(BatchEvent::Failed {
                source: source.to_string(),
                key: key.to_string(),
                error: e.to_string(),
            });
            Stats::error()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimensions::DimensionSpec;
    use crate::imaging::engine::tests::MockEngine;
    use crate::imaging::{CropMode, FocalPoint, OutputFormat};
    use crate::test_helpers::{PublicDir, assert_cached, cached_files, mock_generator};
    use std::sync::Arc;

    fn variation(token: &str, format: OutputFormat) -> Variation {
        Variation {
            preset: "test".to_string(),
            dimensions: DimensionSpec::parse(token).unwrap(),
            format,
            crop: CropMode::Cover,
            focal: FocalPoint::default(),
        }
    }

    fn three_variations() -> Vec<Variation> {
        vec![
            variation("800x600", OutputFormat::Avif),
            variation("800x600", OutputFormat::Jpg),
            variation("400x300", OutputFormat::Webp),
        ]
    }

    fn two_sources() -> Vec<String> {
        vec!["library/a.jpg".to_string(), "library/b.png".to_string()]
    }

    // =========================================================================
    // Stats
    // =========================================================================

    #[test]
    fn stats_add_is_fieldwise() {
        let a = Stats {
            generated: 1,
            skipped: 2,
            errors: 3,
        };
        let b = Stats {
            generated: 10,
            skipped: 20,
            errors: 30,
        };
        assert_eq!(
            a + b,
            Stats {
                generated: 11,
                skipped: 22,
                errors: 33
            }
        );
        let mut c = a;
        c += b;
        assert_eq!(c, a + b);
    }

    #[test]
    fn stats_sum_and_success() {
        let total: Stats = vec![Stats::generated(), Stats::skipped(), Stats::generated()]
            .into_iter()
            .sum();
        assert_eq!(total.generated, 2);
        assert_eq!(total.skipped, 1);
        assert!(total.is_success());
        assert!(!(total + Stats::error()).is_success());
    }

    #[test]
    fn stats_display() {
        let s = Stats {
            generated: 5,
            skipped: 1,
            errors: 1,
        };
        assert_eq!(s.to_string(), "5 generated, 1 skipped, 1 errors (7 total)");
    }

    // =========================================================================
    // Source discovery
    // =========================================================================

    #[test]
    fn discovers_images_recursively_sorted() {
        let public = PublicDir::with_sources(&[
            "library/z.jpg",
            "library/project/b.PNG",
            "library/project/a.webp",
            "library/notes.txt",
            "library/anim.gif",
            "elsewhere/c.jpg",
        ]);
        let sources = discover_sources(public.path(), "library", None).unwrap();
        assert_eq!(
            sources,
            vec![
                "library/anim.gif",
                "library/project/a.webp",
                "library/project/b.PNG",
                "library/z.jpg",
            ]
        );
    }

    #[test]
    fn path_filter_is_substring_match() {
        let public = PublicDir::with_sources(&[
            "library/project/axton/1.jpg",
            "library/project/other/2.jpg",
        ]);
        let sources = discover_sources(public.path(), "library", Some("axton")).unwrap();
        assert_eq!(sources, vec!["library/project/axton/1.jpg"]);
    }

    #[test]
    fn missing_source_dir_yields_nothing() {
        let public = PublicDir::with_sources(&[]);
        let sources = discover_sources(public.path(), "library", None).unwrap();
        assert!(sources.is_empty());
    }

    // =========================================================================
    // Runs
    // =========================================================================

    #[test]
    fn all_existing_are_skipped() {
        let public = PublicDir::with_sources(&["library/a.jpg", "library/b.png"]);
        let engine = Arc::new(MockEngine::new());
        let generator = mock_generator(&public, engine.clone());
        let variations = three_variations();
        let sources = two_sources();

        // Pre-populate every derivative.
        let first = run(&generator, &variations, &sources, BatchOptions::default(), None);
        assert_eq!(first.generated, 6);
        assert_eq!(
            cached_files(&public),
            vec![
                "cache/images/400x300/library/a.webp",
                "cache/images/400x300/library/b.webp",
                "cache/images/800x600/library/a.avif",
                "cache/images/800x600/library/a.jpg",
                "cache/images/800x600/library/b.avif",
                "cache/images/800x600/library/b.jpg",
            ]
        );
        let calls_before = engine.call_count();

        let stats = run(&generator, &variations, &sources, BatchOptions::default(), None);
        assert_eq!(
            stats,
            Stats {
                generated: 0,
                skipped: 6,
                errors: 0
            }
        );
        assert!(stats.is_success());
        assert_eq!(engine.call_count(), calls_before);
    }

    #[test]
    fn one_failure_is_counted_and_run_continues() {
        let public = PublicDir::with_sources(&["library/a.jpg", "library/broken.png"]);
        let engine = Arc::new(MockEngine::new());
        engine
            .fail_sources
            .lock()
            .unwrap()
            .push("broken".to_string());
        let generator = mock_generator(&public, engine.clone());

        let variations = three_variations();
        // Pre-generate two of broken.png's three derivatives by hand so only
        // one of its pairs reaches the engine.
        for v in &variations[1..] {
            let key = generator.resolver().resolve("library/broken.png", &v.dimensions, v.format);
            generator.resolver().ensure_directory(&key).unwrap();
            std::fs::write(generator.resolver().filesystem_path(&key), b"x").unwrap();
        }

        let sources = vec!["library/a.jpg".to_string(), "library/broken.png".to_string()];
        let stats = run(
            &generator,
            &variations,
            &sources,
            BatchOptions {
                force: false,
                dry_run: false,
            },
            None,
        );
        assert_eq!(
            stats,
            Stats {
                generated: 3,
                skipped: 2,
                errors: 1
            }
        );
        assert!(!stats.is_success());
    }

    #[test]
    fn two_sources_three_variations_one_failure() {
        let public = PublicDir::with_sources(&["library/a.jpg", "library/b.png"]);
        let engine = Arc::new(MockEngine::new());
        engine
            .fail_pairs
            .lock()
            .unwrap()
            .push(("library/b.png".to_string(), ".avif".to_string()));
        let generator = mock_generator(&public, engine.clone());

        let stats = run(
            &generator,
            &three_variations(),
            &two_sources(),
            BatchOptions::default(),
            None,
        );
        assert_eq!(
            stats,
            Stats {
                generated: 5,
                skipped: 0,
                errors: 1
            }
        );
        assert_eq!(engine.call_count(), 6);
        assert!(!public.path().join("cache/images/800x600/library/b.avif").exists());
        assert_cached(&generator, "library/b.png", "800x600", OutputFormat::Jpg);
    }

    #[test]
    fn force_with_one_failure() {
        let public = PublicDir::with_sources(&["library/a.jpg", "library/broken.png"]);
        let engine = Arc::new(MockEngine::new());
        let generator = mock_generator(&public, engine.clone());
        let variations = three_variations();
        let sources = vec!["library/a.jpg".to_string(), "library/broken.png".to_string()];
        run(&generator, &variations, &sources, BatchOptions::default(), None);

        // Regenerate one variation; only broken.png fails.
        engine
            .fail_sources
            .lock()
            .unwrap()
            .push("broken".to_string());
        let stats = run(
            &generator,
            &variations[..1],
            &sources,
            BatchOptions {
                force: true,
                dry_run: false,
            },
            None,
        );
        assert_eq!(stats.generated, 1);
        assert_eq!(stats.errors, 1);
    }

    #[test]
    fn dry_run_counts_without_engine() {
        let public = PublicDir::with_sources(&["library/a.jpg", "library/b.png"]);
        let engine = Arc::new(MockEngine::new());
        let generator = mock_generator(&public, engine.clone());

        let stats = run(
            &generator,
            &three_variations(),
            &two_sources(),
            BatchOptions {
                force: false,
                dry_run: true,
            },
            None,
        );
        assert_eq!(stats.generated, 6);
        assert_eq!(engine.call_count(), 0);
        assert!(stats.is_success());
        assert!(cached_files(&public).is_empty());
    }

    #[test]
    fn dry_run_still_skips_existing() {
        let public = PublicDir::with_sources(&["library/a.jpg", "library/b.png"]);
        let generator = mock_generator(&public, Arc::new(MockEngine::new()));
        let variations = three_variations();
        run(&generator, &variations[..1], &two_sources(), BatchOptions::default(), None);

        let stats = run(
            &generator,
            &variations,
            &two_sources(),
            BatchOptions {
                force: false,
                dry_run: true,
            },
            None,
        );
        assert_eq!(stats.skipped, 2);
        assert_eq!(stats.generated, 4);
    }

    #[test]
    fn events_are_reported_per_pair() {
        let public = PublicDir::with_sources(&["library/a.jpg"]);
        let generator = mock_generator(&public, Arc::new(MockEngine::new()));
        let (tx, rx) = std::sync::mpsc::channel();

        run(
            &generator,
            &three_variations(),
            &["library/a.jpg".to_string()],
            BatchOptions::default(),
            Some(&tx),
        );
        drop(tx);

        assert_cached(&generator, "library/a.jpg", "400x300", OutputFormat::Webp);
        let events: Vec<BatchEvent> = rx.iter().collect();
        assert_eq!(events.len(), 3);
        assert!(
            events
                .iter()
                .all(|e| matches!(e, BatchEvent::Generated { .. }))
        );
    }

    #[test]
    fn empty_inputs_yield_zero_stats() {
        let public = PublicDir::with_sources(&[]);
        let generator = mock_generator(&public, Arc::new(MockEngine::new()));
        let stats = run(&generator, &three_variations(), &[], BatchOptions::default(), None);
        assert_eq!(stats, Stats::default());
        assert!(stats.is_success());
    }
}
