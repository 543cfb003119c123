//! Index aggregation.
//!
//! Index pages (post lists, feeds) are built from projections of every
//! indexable item seen in a run. They can only be rendered once the whole
//! projection set is known, so the pipeline calls [`render_indexes`] after
//! the scanners have drained, and pushes the results back into its own
//! classification stage through the feedback queue.
//!
//! Every index spec sees the same projection set, sorted independently with its
//! own comparator. Sorting is stable and falls back to path order for
//! entries the comparator considers equal.
//!
//! Index pages are never indexable themselves. A renderer that marks its
//! page indexable is not corrected here: the pipeline rejects it as a
//! recursive index, which is a fatal run error.

use crate::queue::{Producer, QueueError};
use crate::render::RenderError;
use crate::types::{File, IndexProjection, Metadata, ScannedItem};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("failed to render index {path}: {source}")]
    Render { path: String, source: RenderError },
    #[error("failed to emit index page: {0}")]
    Queue(#[from] QueueError),
    #[error("index rendering cancelled")]
    Cancelled,
}

/// Ordering over projections.
pub type Comparator = Arc<dyn Fn(&IndexProjection, &IndexProjection) -> Ordering + Send + Sync>;

type RenderFn = Arc<dyn Fn(&[IndexProjection]) -> Result<IndexPage, RenderError> + Send + Sync>;

/// What an index renderer produces.
#[derive(Debug, Clone, Default)]
pub struct IndexPage {
    pub contents: Vec<u8>,
    pub metadata: Metadata,
    /// Must stay `false`; an indexable index page aborts the run.
    pub indexable: bool,
}

impl IndexPage {
    pub fn new(contents: impl Into<Vec<u8>>) -> Self {
        Self {
            contents: contents.into(),
            ..Self::default()
        }
    }
}

/// Static description of one index output.
#[derive(Clone)]
pub struct IndexSpec {
    pub path: String,
    pub raw: bool,
    compare: Comparator,
    render: RenderFn,
}

impl fmt::Debug for IndexSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexSpec")
            .field("path", &self.path)
            .field("raw", &self.raw)
            .finish_non_exhaustive()
    }
}

impl IndexSpec {
    /// An index at `path`, sorted by path, whose page goes through the
    /// content renderer (not raw).
    pub fn new<F>(path: impl Into<String>, render: F) -> Self
    where
        F: Fn(&[IndexProjection]) -> Result<IndexPage, RenderError> + Send + Sync + 'static,
    {
        Self {
            path: path.into(),
            raw: false,
            compare: Arc::new(by_path),
            render: Arc::new(render),
        }
    }

    pub fn raw(mut self, raw: bool) -> Self {
        self.raw = raw;
        self
    }

    pub fn sorted_by<F>(mut self, compare: F) -> Self
    where
        F: Fn(&IndexProjection, &IndexProjection) -> Ordering + Send + Sync + 'static,
    {
        self.compare = Arc::new(compare);
        self
    }

    /// A sorted copy of `projections`.
    pub fn sort(&self, projections: &[IndexProjection]) -> Vec<IndexProjection> {
        let mut sorted = projections.to_vec();
        sorted.sort_by(|a, b| (self.compare)(a, b).then_with(|| by_path(a, b)));
        sorted
    }

    /// Sort, render and wrap the page as a scanned item for the feedback edge.
    pub fn render(&self, projections: &[IndexProjection]) -> Result<ScannedItem, IndexError> {
        info!(path = %self.path, entry_count = projections.len(), "sorting index");
        let sorted = self.sort(projections);

        info!(path = %self.path, entry_count = sorted.len(), "generating index content");
        let page = (self.render)(&sorted).map_err(|source| IndexError::Render {
            path: self.path.clone(),
            source,
        })?;

        Ok(ScannedItem {
            file: File::new(self.path.clone(), page.contents),
            metadata: page.metadata,
            indexable: page.indexable,
            raw: self.raw,
        })
    }
}

/// Lexicographic path order, the default comparator.
pub fn by_path(a: &IndexProjection, b: &IndexProjection) -> Ordering {
    a.path.cmp(&b.path)
}

/// Order by the value of a metadata key, then by path.
///
/// Entries missing the key sort after entries that have it, in either
/// direction. Strings compare lexicographically (so `YYYY-MM-DD` dates sort
/// chronologically), numbers numerically.
pub fn by_key(
    key: impl Into<String>,
    descending: bool,
) -> impl Fn(&IndexProjection, &IndexProjection) -> Ordering + Send + Sync + 'static {
    let key = key.into();
    move |a, b| {
        let ordering = match (a.metadata.get(&key), b.metadata.get(&key)) {
            (Some(left), Some(right)) => {
                let ordering = compare_values(left, right);
                if descending { ordering.reverse() } else { ordering }
            }
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        ordering.then_with(|| by_path(a, b))
    }
}

fn compare_values(left: &Value, right: &Value) -> Ordering {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => l
            .as_f64()
            .partial_cmp(&r.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(l), Value::String(r)) => l.cmp(r),
        (Value::Bool(l), Value::Bool(r)) => l.cmp(r),
        (l, r) => l.to_string().cmp(&r.to_string()),
    }
}

/// Render every index spec against the same projection set and push the pages
/// onto `output`. Returns the number of pages emitted.
pub async fn render_indexes(
    cancel: &CancellationToken,
    projections: &[IndexProjection],
    specs: &[IndexSpec],
    output: &Producer<ScannedItem>,
) -> Result<usize, IndexError> {
    let mut emitted = 0;
    for spec in specs {
        if cancel.is_cancelled() {
            return Err(IndexError::Cancelled);
        }
        let item = spec.render(projections)?;
        output.push(item).await?;
        emitted += 1;
    }
    Ok(emitted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue;
    use crate::test_helpers::projection;
    use std::sync::Mutex;

    fn paths(projections: &[IndexProjection]) -> Vec<&str> {
        projections.iter().map(|p| p.path.as_str()).collect()
    }

    #[test]
    fn default_sort_is_by_path() {
        let spec = IndexSpec::new("index.html", |_| Ok(IndexPage::new("")));
        let sorted = spec.sort(&[
            projection("c/index.html", &[]),
            projection("a/index.html", &[]),
            projection("b/index.html", &[]),
        ]);
        assert_eq!(paths(&sorted), vec!["a/index.html", "b/index.html", "c/index.html"]);
    }

    #[test]
    fn by_key_descending_by_date() {
        let spec = IndexSpec::new("index.html", |_| Ok(IndexPage::new("")))
            .sorted_by(by_key("date", true));
        let sorted = spec.sort(&[
            projection("old/index.html", &[("date", "2020-01-01")]),
            projection("undated/index.html", &[]),
            projection("new/index.html", &[("date", "2024-01-01")]),
        ]);
        assert_eq!(
            paths(&sorted),
            vec!["new/index.html", "old/index.html", "undated/index.html"]
        );
    }

    #[test]
    fn ties_broken_by_path() {
        let spec = IndexSpec::new("index.html", |_| Ok(IndexPage::new("")))
            .sorted_by(|_, _| Ordering::Equal);
        let sorted = spec.sort(&[projection("z", &[]), projection("m", &[]), projection("a", &[])]);
        assert_eq!(paths(&sorted), vec!["a", "m", "z"]);
    }

    #[test]
    fn sort_leaves_input_untouched() {
        let spec = IndexSpec::new("index.html", |_| Ok(IndexPage::new("")));
        let input = vec![projection("b", &[]), projection("a", &[])];
        let _ = spec.sort(&input);
        assert_eq!(paths(&input), vec!["b", "a"]);
    }

    #[test]
    fn render_emits_item_with_spec_path_and_raw_flag() {
        let spec = IndexSpec::new("feed.json", |entries| {
            Ok(IndexPage::new(format!("{} entries", entries.len())))
        })
        .raw(true);

        let item = spec.render(&[projection("a", &[])]).unwrap();
        assert_eq!(item.file.path, "feed.json");
        assert_eq!(item.file.contents, b"1 entries");
        assert!(item.raw);
        assert!(!item.indexable);
    }

    #[test]
    fn render_error_names_the_index() {
        let spec = IndexSpec::new("broken.html", |_| {
            Err(RenderError::Template {
                path: "broken.html".into(),
                message: "boom".into(),
            })
        });
        let err = spec.render(&[]).unwrap_err();
        assert!(matches!(err, IndexError::Render { ref path, .. } if path == "broken.html"));
    }

    #[tokio::test]
    async fn every_spec_sees_the_full_projection_set() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let specs: Vec<IndexSpec> = ["one.html", "two.html"]
            .into_iter()
            .map(|path| {
                let seen = Arc::clone(&seen);
                IndexSpec::new(path, move |entries| {
                    seen.lock().unwrap().push(entries.len());
                    Ok(IndexPage::new(""))
                })
            })
            .collect();

        let token = CancellationToken::new();
        let (tx, rx) = queue::bounded("feedback", 4, token.clone());
        let projections = vec![projection("a", &[]), projection("b", &[]), projection("c", &[])];

        let emitted = render_indexes(&token, &projections, &specs, &tx).await.unwrap();
        drop(tx);

        assert_eq!(emitted, 2);
        assert_eq!(*seen.lock().unwrap(), vec![3, 3]);
        let mut out = Vec::new();
        while let Some(item) = rx.pull().await {
            out.push(item.file.path);
        }
        assert_eq!(out, vec!["one.html", "two.html"]);
    }

    #[tokio::test]
    async fn cancelled_before_start_renders_nothing() {
        let spec = IndexSpec::new("index.html", |_| Ok(IndexPage::new("")));
        let token = CancellationToken::new();
        let (tx, _rx) = queue::bounded("feedback", 1, token.clone());
        token.cancel();

        let result = render_indexes(&token, &[], &[spec], &tx).await;
        assert!(matches!(result, Err(IndexError::Cancelled)));
    }
}
