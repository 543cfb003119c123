//! CLI output formatting.
//!
//! # Output Format
//!
//! ## Build
//!
//! ```text
//! Scanned 14 items
//!     Rendered: 9
//!     Copied:   6
//!     Indexes:  1 (from 8 documents)
//! Wrote 15 files to public/ in 42ms
//! ```
//!
//! ## Check
//!
//! ```text
//! Scanned 14 items
//!     ...
//! Check passed: 15 files would be written
//!     about/index.html
//!     index.html
//! ```
//!
//! ## Watch
//!
//! ```text
//! Watching content/, static/ (Ctrl-C to stop)
//! ```
//!
//! # Architecture
//!
//! Each report has a `format_*` function (returns `Vec<String>`) for
//! testability and a `print_*` wrapper that writes to stdout. Format functions
//! are pure: no I/O, no side effects.

use crate::pipeline::RunStats;
use crate::watch::WatchStats;
use std::path::{Path, PathBuf};

fn indent(line: impl AsRef<str>) -> String {
    format!("    {}", line.as_ref())
}

fn plural(count: usize, one: &str, many: &str) -> String {
    format!("{count} {}", if count == 1 { one } else { many })
}

fn stage_lines(stats: &RunStats) -> Vec<String> {
    vec![
        format!("Scanned {}", plural(stats.scanned, "item", "items")),
        indent(format!("Rendered: {}", stats.rendered)),
        indent(format!("Copied:   {}", stats.passed_through)),
        indent(format!(
            "Indexes:  {} (from {})",
            stats.index_pages,
            plural(stats.projections, "document", "documents")
        )),
    ]
}

// ============================================================================
// Build
// ============================================================================

pub fn format_build_output(stats: &RunStats, output_dir: &Path) -> Vec<String> {
    let mut lines = stage_lines(stats);
    lines.push(format!(
        "Wrote {} to {}/ in {}ms",
        plural(stats.written, "file", "files"),
        output_dir.display().to_string().trim_end_matches('/'),
        stats.elapsed.as_millis()
    ));
    lines
}

pub fn print_build_output(stats: &RunStats, output_dir: &Path) {
    for line in format_build_output(stats, output_dir) {
        println!("{line}");
    }
}

// ============================================================================
// Check
// ============================================================================

pub fn format_check_output(stats: &RunStats, paths: &[String]) -> Vec<String> {
    let mut lines = stage_lines(stats);
    lines.push(format!(
        "Check passed: {} would be written",
        plural(paths.len(), "file", "files")
    ));
    lines.extend(paths.iter().map(indent));
    lines
}

pub fn print_check_output(stats: &RunStats, paths: &[String]) {
    for line in format_check_output(stats, paths) {
        println!("{line}");
    }
}

// ============================================================================
// Watch
// ============================================================================

pub fn format_watch_banner(paths: &[PathBuf]) -> String {
    let listed: Vec<String> = paths
        .iter()
        .map(|p| format!("{}/", p.display().to_string().trim_end_matches('/')))
        .collect();
    if listed.is_empty() {
        "Nothing to watch (Ctrl-C to stop)".to_string()
    } else {
        format!("Watching {} (Ctrl-C to stop)", listed.join(", "))
    }
}

pub fn format_watch_summary(stats: &WatchStats) -> String {
    format!(
        "Stopped after {} ({} failed)",
        plural(stats.runs, "build", "builds"),
        stats.failed
    )
}
