//! Shared test utilities for the quire test suite.
//!
//! Builders for the items that flow between stages, a fixed site identity,
//! and a helper to inspect what ended up on disk.
//!
//! # Usage
//!
//! ```rust
//! use crate::test_helpers::*;
//!
//! let item = document("hello/index.html", "<p>Hi</p>", &[("title", "Hello")]);
//! let entry = projection("hello/index.html", &[("date", "2024-01-01")]);
//! assert_eq!(list_files(tmp.path()), vec!["a.txt", "b/index.html"]);
//! ```

use std::path::Path;
use walkdir::WalkDir;

use crate::config::SiteInfo;
use crate::types::{File, IndexProjection, Metadata, ScannedItem};

// =========================================================================
// Item builders
// =========================================================================

fn metadata(pairs: &[(&str, &str)]) -> Metadata {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.to_string())))
        .collect()
}

/// An indexable, non-raw document with string metadata.
pub fn document(path: &str, body: &str, pairs: &[(&str, &str)]) -> ScannedItem {
    ScannedItem::document(File::new(path, body), metadata(pairs), true)
}

pub fn projection(path: &str, pairs: &[(&str, &str)]) -> IndexProjection {
    IndexProjection {
        path: path.to_string(),
        metadata: metadata(pairs),
    }
}

pub fn site() -> SiteInfo {
    SiteInfo {
        title: "Test Site".to_string(),
        url: "https://example.org".to_string(),
    }
}

// =========================================================================
// Filesystem inspection
// =========================================================================

/// Every regular file below `dir`, as sorted `/`-separated relative paths.
pub fn list_files(dir: &Path) -> Vec<String> {
    let mut files: Vec<String> = WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            e.path().strip_prefix(dir).ok().map(|rel| {
                rel.components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/")
            })
        })
        .collect();
    files.sort();
    files
}
