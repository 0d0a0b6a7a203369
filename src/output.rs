//! CLI output formatting for the batch job.
//!
//! # Output Format
//!
//! ## Plan
//!
//! Printed before work starts: the variation matrix grouped by preset, then
//! the discovered sources.
//!
//! ```text
//! Variations
//! 001 hero (12)
//!     1920x1080: avif, webp, jpg
//!     1280x720: avif, webp, jpg
//! 002 thumbnail (6)
//!     400x400: avif, webp, jpg
//!
//! Sources
//!     3 images under library/
//! ```
//!
//! ## Progress
//!
//! One line per (source, variation) pair as it finishes, keyed by the
//! derivative URL:
//!
//! ```text
//! generated /cache/images/1920x1080/library/dawn.avif
//! skipped   /cache/images/1920x1080/library/dawn.webp
//! FAILED    /cache/images/1920x1080/library/dusk.avif
//!     Source: library/dusk.png
//!     Error: Generation failed for …
//! ```
//!
//! ## Summary
//!
//! ```text
//! Generated 11, skipped 6, errors 1 (18 total)
//! ```
//!
//! # Architecture
//!
//! Each section has a `format_*` function (returns `Vec<String>`) for
//! testability and a `print_*` wrapper that writes to stdout. Format
//! functions are pure: no I/O, no side effects.

use crate::batch::{BatchEvent, Stats};
use crate::imaging::OutputFormat;
use crate::matrix::Variation;

// ============================================================================
// Shared helpers
// ============================================================================

/// Format a 1-based positional index as 3-digit zero-padded.
fn format_index(pos: usize) -> String {
    format!("{:0>3}", pos)
}

/// Return indentation string: 4 spaces per depth level.
fn indent(depth: usize) -> String {
    "    ".repeat(depth)
}

fn format_list(formats: &[OutputFormat]) -> String {
    formats
        .iter()
        .map(|f| f.extension())
        .collect::<Vec<_>>()
        .join(", ")
}

fn plural(n: usize, one: &str, many: &str) -> String {
    if n == 1 {
        format!("{n} {one}")
    } else {
        format!("{n} {many}")
    }
}

// ============================================================================
// Plan
// ============================================================================

/// Format the variation matrix and source count.
///
/// Presets appear in matrix order; within a preset, one line per dimension
/// lists its formats in generation order.
pub fn format_batch_plan(variations: &[Variation], source_count: usize, source_dir: &str) -> Vec<String> {
    let mut lines = vec!["Variations".to_string()];

    // (preset, [(dimension token, formats)])
    let mut groups: Vec<(&str, Vec<(String, Vec<OutputFormat>)>)> = Vec::new();
    for v in variations {
        if groups.last().is_none_or(|(name, _)| *name != v.preset) {
            groups.push((v.preset.as_str(), Vec::new()));
        }
        let Some((_, rows)) = groups.last_mut() else {
            continue;
        };
        let token = v.dimensions.token();
        match rows.iter_mut().find(|(t, _)| *t == token) {
            Some((_, formats)) => formats.push(v.format),
            None => rows.push((token, vec![v.format])),
        }
    }

    if groups.is_empty() {
        lines.push(format!("{}(none)", indent(1)));
    }
    for (i, (name, rows)) in groups.iter().enumerate() {
        let count: usize = rows.iter().map(|(_, f)| f.len()).sum();
        lines.push(format!("{} {} ({})", format_index(i + 1), name, count));
        for (token, formats) in rows {
            lines.push(format!("{}{}: {}", indent(1), token, format_list(formats)));
        }
    }

    lines.push(String::new());
    lines.push("Sources".to_string());
    lines.push(format!(
        "{}{} under {}/",
        indent(1),
        plural(source_count, "image", "images"),
        source_dir.trim_end_matches('/')
    ));
    lines
}

pub fn print_batch_plan(variations: &[Variation], source_count: usize, source_dir: &str) {
    for line in format_batch_plan(variations, source_count, source_dir) {
        println!("{}", line);
    }
}

// ============================================================================
// Progress
// ============================================================================

/// Format a single batch progress event as display lines.
pub fn format_batch_event(event: &BatchEvent) -> Vec<String> {
    match event {
        BatchEvent::Generated { key, .. } => vec![format!("generated {}", key)],
        BatchEvent::Planned { key, .. } => vec![format!("would generate {}", key)],
        BatchEvent::Skipped { key, .. } => vec![format!("skipped   {}", key)],
        BatchEvent::Failed { source, key, error } => vec![
            format!("FAILED    {}", key),
            format!("{}Source: {}", indent(1), source),
            format!("{}Error: {}", indent(1), error),
        ],
    }
}

// ============================================================================
// Summary
// ============================================================================

/// Format the end-of-run totals.
pub fn format_batch_summary(stats: &Stats, dry_run: bool) -> Vec<String> {
    let verb = if dry_run { "Would generate" } else { "Generated" };
    vec![format!(
        "{} {}, skipped {}, errors {} ({} total)",
        verb,
        stats.generated,
        stats.skipped,
        stats.errors,
        stats.total()
    )]
}

pub fn print_batch_summary(stats: &Stats, dry_run: bool) {
    for line in format_batch_summary(stats, dry_run) {
        println!("{}", line);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimensions::DimensionSpec;
    use crate::imaging::{CropMode, FocalPoint};

    fn variation(preset: &str, token: &str, format: OutputFormat) -> Variation {
        Variation {
            preset: preset.to_string(),
            dimensions: DimensionSpec::parse(token).unwrap(),
            format,
            crop: CropMode::Cover,
            focal: FocalPoint::default(),
        }
    }

    // =========================================================================
    // Helper tests
    // =========================================================================

    #[test]
    fn format_index_pads() {
        assert_eq!(format_index(1), "001");
        assert_eq!(format_index(42), "042");
        assert_eq!(format_index(100), "100");
    }

    #[test]
    fn plural_forms() {
        assert_eq!(plural(1, "image", "images"), "1 image");
        assert_eq!(plural(0, "image", "images"), "0 images");
    }

    // =========================================================================
    // Plan
    // =========================================================================

    #[test]
    fn plan_groups_by_preset_and_dimension() {
        let variations = vec![
            variation("hero", "1920x1080", OutputFormat::Avif),
            variation("hero", "1920x1080", OutputFormat::Jpg),
            variation("hero", "960x540", OutputFormat::Avif),
            variation("thumbnail", "400x400", OutputFormat::Webp),
        ];
        let lines = format_batch_plan(&variations, 3, "library");
        assert_eq!(
            lines,
            vec![
                "Variations",
                "001 hero (3)",
                "    1920x1080: avif, jpg",
                "    960x540: avif",
                "002 thumbnail (1)",
                "    400x400: webp",
                "",
                "Sources",
                "    3 images under library/",
            ]
        );
    }

    #[test]
    fn plan_with_nothing_to_do() {
        let lines = format_batch_plan(&[], 1, "library/");
        assert_eq!(lines[1], "    (none)");
        assert_eq!(lines.last().unwrap(), "    1 image under library/");
    }

    // =========================================================================
    // Progress and summary
    // =========================================================================

    #[test]
    fn failed_event_shows_source_and_error() {
        let lines = format_batch_event(&BatchEvent::Failed {
            source: "library/dusk.png".into(),
            key: "/cache/images/10x10/library/dusk.avif".into(),
            error: "boom".into(),
        });
        assert_eq!(
            lines,
            vec![
                "FAILED    /cache/images/10x10/library/dusk.avif",
                "    Source: library/dusk.png",
                "    Error: boom",
            ]
        );
    }

    #[test]
    fn single_line_events() {
        let key = "/cache/images/10x10/a.webp".to_string();
        let source = "a.jpg".to_string();
        assert_eq!(
            format_batch_event(&BatchEvent::Skipped {
                source: source.clone(),
                key: key.clone()
            }),
            vec!["skipped   /cache/images/10x10/a.webp"]
        );
        assert_eq!(
            format_batch_event(&BatchEvent::Planned { source, key }),
            vec!["would generate /cache/images/10x10/a.webp"]
        );
    }

    #[test]
    fn summary_line() {
        let stats = Stats {
            generated: 11,
            skipped: 6,
            errors: 1,
        };
        assert_eq!(
            format_batch_summary(&stats, false),
            vec!["Generated 11, skipped 6, errors 1 (18 total)"]
        );
        assert!(format_batch_summary(&stats, true)[0].starts_with("Would generate 11"));
    }
}
