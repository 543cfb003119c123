//! Shared types that flow between pipeline stages.
//!
//! A [`ScannedItem`] enters the pipeline from a scanner, is either rendered
//! or passed through, and leaves it as a plain [`File`]. Indexable items also
//! leave an [`IndexProjection`] behind for the index aggregator.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Arbitrary per-item metadata, typically parsed from front matter.
pub type Metadata = BTreeMap<String, Value>;

/// A single output file.
///
/// `path` is relative to some output root. It may syntactically start with
/// `..`; writers are responsible for rejecting anything that leaves their root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct File {
    pub path: String,
    pub contents: Vec<u8>,
}

impl File {
    pub fn new(path: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            contents: contents.into(),
        }
    }

    /// Site-absolute link to this file.
    pub fn link(&self) -> String {
        link_for(&self.path)
    }
}

/// A file produced by a scanner, together with routing flags.
#[derive(Debug, Clone)]
pub struct ScannedItem {
    pub file: File,
    pub metadata: Metadata,
    /// Should a projection of this item be handed to the index aggregator?
    pub indexable: bool,
    /// Raw items bypass content rendering and post-processing.
    pub raw: bool,
}

impl ScannedItem {
    /// A raw, non-indexable item copied through unchanged.
    pub fn raw(file: File) -> Self {
        Self {
            file,
            metadata: Metadata::new(),
            indexable: false,
            raw: true,
        }
    }

    /// A document to be rendered through the content template.
    pub fn document(file: File, metadata: Metadata, indexable: bool) -> Self {
        Self {
            file,
            metadata,
            indexable,
            raw: false,
        }
    }

    pub fn path(&self) -> &str {
        &self.file.path
    }

    /// String value of a metadata key, if present and a string.
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    pub fn projection(&self) -> IndexProjection {
        IndexProjection {
            path: self.file.path.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

/// What the index aggregator sees of an indexable item.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexProjection {
    pub path: String,
    pub metadata: Metadata,
}

impl IndexProjection {
    pub fn link(&self) -> String {
        link_for(&self.path)
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }
}

/// Turn an output path into a site-absolute link.
///
/// - `index.html` → `/`
/// - `posts/hello/index.html` → `/posts/hello/`
/// - `feed.json` → `/feed.json`
pub fn link_for(path: &str) -> String {
    let clean = path.trim_matches('/');
    if clean == "index.html" {
        return "/".to_string();
    }
    match clean.strip_suffix("/index.html") {
        Some(dir) => format!("/{dir}/"),
        None => format!("/{clean}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_for_root_index() {
        assert_eq!(link_for("index.html"), "/");
        assert_eq!(link_for("/index.html"), "/");
    }

    #[test]
    fn link_for_nested_index_keeps_trailing_slash() {
        assert_eq!(link_for("posts/hello/index.html"), "/posts/hello/");
    }

    #[test]
    fn link_for_plain_file() {
        assert_eq!(link_for("feed.json"), "/feed.json");
        assert_eq!(link_for("css/site.css"), "/css/site.css");
    }

    #[test]
    fn projection_copies_path_and_metadata() {
        let mut metadata = Metadata::new();
        metadata.insert("date".into(), Value::String("2024-01-01".into()));
        let item = ScannedItem::document(File::new("b/index.html", "body"), metadata, true);

        let projection = item.projection();
        assert_eq!(projection.path, "b/index.html");
        assert_eq!(projection.meta_str("date"), Some("2024-01-01"));
        assert_eq!(projection.link(), "/b/");
    }

    #[test]
    fn raw_constructor_is_not_indexable() {
        let item = ScannedItem::raw(File::new("a.txt", "hi"));
        assert!(item.raw);
        assert!(!item.indexable);
        assert!(item.metadata.is_empty());
    }
}
