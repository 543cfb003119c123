//! Input scanners.
//!
//! A scanner walks one input source and pushes [`ScannedItem`]s into the
//! pipeline. It also reports the filesystem paths it reads from, so that the
//! watch driver knows what to observe.
//!
//! ## Stock scanners
//!
//! | Scanner | Source | Items |
//! |---------|--------|-------|
//! | [`StaticScanner`] | a directory of assets | raw, never indexed |
//! | [`MarkdownScanner`] | a directory of `.md` documents | rendered, indexed unless filtered |
//! | [`RedirectScanner`] | a `source → target` map | raw redirect pages |
//!
//! ## Markdown documents
//!
//! ```text
//! content/
//! ├── hello.md          → hello/index.html
//! ├── posts/
//! │   └── second.md     → posts/second/index.html
//! └── _404.md           → 404.html   (leading underscore: flat file)
//! ```
//!
//! Documents may start with TOML front matter between `+++` lines:
//!
//! ```text
//! +++
//! title = "Hello"
//! date = 2024-01-01
//! +++
//! # Hello
//! ```
//!
//! Front matter becomes the item's metadata. Without a `title`, the first
//! `# heading` of the body is used.
//!
//! Skipping an input (excluded name, not markdown) is not an error; anything
//! else that goes wrong aborts the scan.

use crate::queue::{Producer, QueueError};
use crate::render::redirect_page;
use crate::types::{File, Metadata, ScannedItem};
use async_trait::async_trait;
use pulldown_cmark::{CowStr, Event, Options, Parser, Tag, html as md_html};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("input directory not found: {}", .0.display())]
    MissingDirectory(PathBuf),
    #[error("failed to walk input directory: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("failed to read {}: {source}", .path.display())]
    Read { path: PathBuf, source: std::io::Error },
    #[error("invalid front matter in {}: {source}", .path.display())]
    FrontMatter { path: PathBuf, source: toml::de::Error },
    #[error("unterminated front matter in {}", .0.display())]
    UnterminatedFrontMatter(PathBuf),
    #[error("{} is not valid UTF-8", .0.display())]
    Encoding(PathBuf),
    #[error("failed to emit scanned item: {0}")]
    Queue(#[from] QueueError),
    #[error("scan cancelled")]
    Cancelled,
    #[error("directory walk aborted: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// A source of input items.
#[async_trait]
pub trait Scanner: Send + Sync {
    /// Short name used in logs and errors.
    fn name(&self) -> &str;

    /// Filesystem paths this scanner reads from.
    fn paths(&self) -> Vec<PathBuf>;

    /// Push every item of this source onto `output`.
    async fn scan(
        &self,
        cancel: &CancellationToken,
        output: &Producer<ScannedItem>,
    ) -> Result<(), ScanError>;
}

/// A file found below a scanner's directory.
struct Found {
    /// Path relative to the directory, `/`-separated.
    relative: String,
    absolute: PathBuf,
}

/// List every file below `dir`, skipping entries `skip` rejects by name.
/// Runs on the blocking pool.
async fn walk_files(
    dir: PathBuf,
    skip: Arc<dyn Fn(&str) -> bool + Send + Sync>,
) -> Result<Vec<Found>, ScanError> {
    tokio::task::spawn_blocking(move || {
        if !dir.is_dir() {
            return Err(ScanError::MissingDirectory(dir));
        }

        let mut found = Vec::new();
        let walker = WalkDir::new(&dir)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                entry.depth() == 0 || !skip(&entry.file_name().to_string_lossy())
            });

        for entry in walker {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&dir) else {
                continue;
            };
            found.push(Found {
                relative: relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/"),
                absolute: entry.path().to_path_buf(),
            });
        }
        Ok(found)
    })
    .await?
}

async fn read_file(path: &Path) -> Result<Vec<u8>, ScanError> {
    tokio::fs::read(path).await.map_err(|source| ScanError::Read {
        path: path.to_path_buf(),
        source,
    })
}

// ============================================================================
// Static assets
// ============================================================================

/// Copies every file below a directory verbatim.
pub struct StaticScanner {
    dir: PathBuf,
    exclude: Vec<String>,
}

impl StaticScanner {
    /// Files and directories whose name starts with any of `exclude` are skipped.
    pub fn new(dir: impl Into<PathBuf>, exclude: Vec<String>) -> Self {
        Self {
            dir: dir.into(),
            exclude,
        }
    }
}

#[async_trait]
impl Scanner for StaticScanner {
    fn name(&self) -> &str {
        "static"
    }

    fn paths(&self) -> Vec<PathBuf> {
        vec![self.dir.clone()]
    }

    async fn scan(
        &self,
        cancel: &CancellationToken,
        output: &Producer<ScannedItem>,
    ) -> Result<(), ScanError> {
        let exclude = self.exclude.clone();
        let skip = Arc::new(move |name: &str| {
            let skipped = exclude.iter().any(|prefix| name.starts_with(prefix.as_str()));
            if skipped {
                debug!(name, "skipping excluded entry");
            }
            skipped
        });

        for found in walk_files(self.dir.clone(), skip).await? {
            if cancel.is_cancelled() {
                return Err(ScanError::Cancelled);
            }
            let contents = read_file(&found.absolute).await?;
            info!(path = %found.relative, "scanned file");
            output
                .push(ScannedItem::raw(File::new(found.relative, contents)))
                .await?;
        }
        Ok(())
    }
}

// ============================================================================
// Markdown documents
// ============================================================================

/// Decides whether a document is indexed, given its output path and metadata.
pub type IndexFilter = Arc<dyn Fn(&str, &Metadata) -> bool + Send + Sync>;

/// Rejects documents marked `draft = true`.
pub fn skip_drafts(_path: &str, metadata: &Metadata) -> bool {
    metadata.get("draft") != Some(&Value::Bool(true))
}

/// Renders `.md` files below a directory to HTML fragments.
pub struct MarkdownScanner {
    dir: PathBuf,
    filter: IndexFilter,
}

impl MarkdownScanner {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            filter: Arc::new(skip_drafts),
        }
    }

    pub fn with_index_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&str, &Metadata) -> bool + Send + Sync + 'static,
    {
        self.filter = Arc::new(filter);
        self
    }

    fn process(&self, found: &Found, contents: Vec<u8>) -> Result<ScannedItem, ScanError> {
        let text =
            String::from_utf8(contents).map_err(|_| ScanError::Encoding(found.absolute.clone()))?;
        let (mut metadata, body) = split_front_matter(&text, &found.absolute)?;

        if !metadata.contains_key("title") {
            if let Some(heading) = first_heading(body) {
                metadata.insert("title".to_string(), Value::String(heading));
            }
        }

        let path = output_path(&found.relative);
        let indexable = (self.filter)(&path, &metadata);
        Ok(ScannedItem::document(
            File::new(path, render_markdown(body)),
            metadata,
            indexable,
        ))
    }
}

#[async_trait]
impl Scanner for MarkdownScanner {
    fn name(&self) -> &str {
        "markdown"
    }

    fn paths(&self) -> Vec<PathBuf> {
        vec![self.dir.clone()]
    }

    async fn scan(
        &self,
        cancel: &CancellationToken,
        output: &Producer<ScannedItem>,
    ) -> Result<(), ScanError> {
        for found in walk_files(self.dir.clone(), Arc::new(|name: &str| name.starts_with('.'))).await? {
            if cancel.is_cancelled() {
                return Err(ScanError::Cancelled);
            }
            if !found.relative.ends_with(".md") {
                debug!(path = %found.relative, "skipping file");
                continue;
            }

            let contents = read_file(&found.absolute).await?;
            let item = self.process(&found, contents)?;
            info!(path = %found.relative, output = %item.path(), indexable = item.indexable, "scanned file");
            output.push(item).await?;
        }
        Ok(())
    }
}

/// `a/b.md` → `a/b/index.html`; `a/_b.md` → `a/b.html`.
fn output_path(relative: &str) -> String {
    let stem = relative.strip_suffix(".md").unwrap_or(relative);
    let (dir, name) = match stem.rsplit_once('/') {
        Some((dir, name)) => (Some(dir), name),
        None => (None, stem),
    };

    let file = match name.strip_prefix('_') {
        Some(flat) => format!("{flat}.html"),
        None => format!("{name}/index.html"),
    };
    match dir {
        Some(dir) => format!("{dir}/{file}"),
        None => file,
    }
}

/// Split `+++`-delimited TOML front matter from the body.
fn split_front_matter<'a>(text: &'a str, path: &Path) -> Result<(Metadata, &'a str), ScanError> {
    let Some(rest) = text
        .strip_prefix("+++\n")
        .or_else(|| text.strip_prefix("+++\r\n"))
    else {
        return Ok((Metadata::new(), text));
    };

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == "+++" {
            let front = &rest[..offset];
            let body = &rest[offset + line.len()..];
            let table: toml::Table =
                toml::from_str(front).map_err(|source| ScanError::FrontMatter {
                    path: path.to_path_buf(),
                    source,
                })?;
            let metadata = table
                .into_iter()
                .map(|(key, value)| (key, toml_to_json(value)))
                .collect();
            return Ok((metadata, body));
        }
        offset += line.len();
    }
    Err(ScanError::UnterminatedFrontMatter(path.to_path_buf()))
}

/// TOML datetimes become their string form (`2024-01-01`).
fn toml_to_json(value: toml::Value) -> Value {
    match value {
        toml::Value::String(s) => Value::String(s),
        toml::Value::Integer(i) => Value::from(i),
        toml::Value::Float(f) => Value::from(f),
        toml::Value::Boolean(b) => Value::Bool(b),
        toml::Value::Datetime(dt) => Value::String(dt.to_string()),
        toml::Value::Array(items) => Value::Array(items.into_iter().map(toml_to_json).collect()),
        toml::Value::Table(table) => Value::Object(
            table
                .into_iter()
                .map(|(key, value)| (key, toml_to_json(value)))
                .collect(),
        ),
    }
}

fn first_heading(body: &str) -> Option<String> {
    body.lines()
        .find(|line| line.starts_with("# "))
        .map(|line| line.trim_start_matches("# ").trim().to_string())
        .filter(|title| !title.is_empty())
}

/// Every link except in-page fragments opens in a new tab.
fn opens_new_tab(url: &str) -> bool {
    !url.starts_with('#')
}

fn escape_attr(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Render markdown to an HTML fragment.
pub fn render_markdown(body: &str) -> String {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_FOOTNOTES);
    options.insert(Options::ENABLE_STRIKETHROUGH);

    let events = Parser::new_ext(body, options).map(|event| match event {
        Event::Start(Tag::Link {
            dest_url, title, ..
        }) if opens_new_tab(&dest_url) => {
            let title = if title.is_empty() {
                String::new()
            } else {
                format!(r#" title="{}""#, escape_attr(&title))
            };
            Event::InlineHtml(CowStr::from(format!(
                r#"<a href="{}"{title} target="_blank" rel="noopener noreferrer">"#,
                escape_attr(&dest_url)
            )))
        }
        other => other,
    });

    let mut html = String::new();
    md_html::push_html(&mut html, events);
    html
}

// ============================================================================
// Redirects
// ============================================================================

/// Emits a meta-refresh page for every `source → target` pair.
pub struct RedirectScanner {
    redirects: BTreeMap<String, String>,
}

impl RedirectScanner {
    pub fn new(redirects: BTreeMap<String, String>) -> Self {
        Self { redirects }
    }
}

#[async_trait]
impl Scanner for RedirectScanner {
    fn name(&self) -> &str {
        "redirects"
    }

    fn paths(&self) -> Vec<PathBuf> {
        Vec::new()
    }

    async fn scan(
        &self,
        cancel: &CancellationToken,
        output: &Producer<ScannedItem>,
    ) -> Result<(), ScanError> {
        for (source, target) in &self.redirects {
            if cancel.is_cancelled() {
                return Err(ScanError::Cancelled);
            }
            let source = source.trim_matches('/');
            let path = if source.is_empty() {
                "index.html".to_string()
            } else {
                format!("{source}/index.html")
            };
            debug!(%path, %target, "emitting redirect");
            let page = redirect_page(target).into_string();
            output.push(ScannedItem::raw(File::new(path, page))).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue;
    use std::fs;
    use tempfile::TempDir;

    async fn collect(scanner: &dyn Scanner) -> Result<Vec<ScannedItem>, ScanError> {
        let token = CancellationToken::new();
        let (tx, rx) = queue::bounded("scan", 64, token.clone());
        scanner.scan(&token, &tx).await?;
        drop(tx);
        let mut items = Vec::new();
        while let Some(item) = rx.pull().await {
            items.push(item);
        }
        Ok(items)
    }

    fn paths(items: &[ScannedItem]) -> Vec<&str> {
        items.iter().map(|i| i.path()).collect()
    }

    // =========================================================================
    // Output paths and front matter
    // =========================================================================

    #[test]
    fn output_path_for_documents() {
        assert_eq!(output_path("hello.md"), "hello/index.html");
        assert_eq!(output_path("posts/second.md"), "posts/second/index.html");
    }

    #[test]
    fn output_path_for_underscore_documents() {
        assert_eq!(output_path("_404.md"), "404.html");
        assert_eq!(output_path("docs/_about.md"), "docs/about.html");
    }

    #[test]
    fn front_matter_becomes_metadata() {
        let text = "+++\ntitle = \"Hello\"\ndate = 2024-01-01\ndraft = false\n+++\n# Body\n";
        let (metadata, body) = split_front_matter(text, Path::new("x.md")).unwrap();

        assert_eq!(metadata["title"], "Hello");
        assert_eq!(metadata["date"], "2024-01-01");
        assert_eq!(metadata["draft"], false);
        assert_eq!(body, "# Body\n");
    }

    #[test]
    fn no_front_matter_leaves_body_alone() {
        let (metadata, body) = split_front_matter("# Just text", Path::new("x.md")).unwrap();
        assert!(metadata.is_empty());
        assert_eq!(body, "# Just text");
    }

    #[test]
    fn unterminated_front_matter_is_error() {
        let result = split_front_matter("+++\ntitle = \"x\"\n", Path::new("x.md"));
        assert!(matches!(result, Err(ScanError::UnterminatedFrontMatter(_))));
    }

    #[test]
    fn invalid_front_matter_is_error() {
        let result = split_front_matter("+++\ntitle = \n+++\n", Path::new("x.md"));
        assert!(matches!(result, Err(ScanError::FrontMatter { .. })));
    }

    #[test]
    fn drafts_are_not_indexed() {
        let mut metadata = Metadata::new();
        assert!(skip_drafts("a", &metadata));
        metadata.insert("draft".into(), Value::Bool(true));
        assert!(!skip_drafts("a", &metadata));
    }

    // =========================================================================
    // Markdown rendering
    // =========================================================================

    #[test]
    fn render_markdown_basic() {
        let html = render_markdown("# Title\n\nSome *text*.");
        assert!(html.contains("<h1>Title</h1>"));
        assert!(html.contains("<em>text</em>"));
    }

    #[test]
    fn links_open_in_new_tab() {
        let html = render_markdown("[site](https://example.org/?a=1&b=2)");
        assert!(html.contains(
            r#"<a href="https://example.org/?a=1&amp;b=2" target="_blank" rel="noopener noreferrer">site</a>"#
        ));
    }

    #[test]
    fn fragment_links_untouched() {
        let html = render_markdown("[top](#top) and [post](/posts/a/)");
        assert!(html.contains(r##"<a href="#top">top</a>"##));
        assert!(html.contains(
            r#"<a href="/posts/a/" target="_blank" rel="noopener noreferrer">post</a>"#
        ));
    }

    // =========================================================================
    // Scanners
    // =========================================================================

    #[tokio::test]
    async fn static_scanner_emits_raw_items_and_skips_excluded() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("css")).unwrap();
        fs::create_dir_all(tmp.path().join("_drafts")).unwrap();
        fs::write(tmp.path().join("robots.txt"), "User-agent: *").unwrap();
        fs::write(tmp.path().join("css/site.css"), "body{}").unwrap();
        fs::write(tmp.path().join(".hidden"), "x").unwrap();
        fs::write(tmp.path().join("_drafts/wip.txt"), "x").unwrap();

        let scanner = StaticScanner::new(tmp.path(), vec![".".into(), "_".into()]);
        let items = collect(&scanner).await.unwrap();

        assert_eq!(paths(&items), vec!["css/site.css", "robots.txt"]);
        assert!(items.iter().all(|i| i.raw && !i.indexable));
        assert_eq!(items[1].file.contents, b"User-agent: *");
    }

    #[tokio::test]
    async fn static_scanner_missing_directory_is_error() {
        let tmp = TempDir::new().unwrap();
        let scanner = StaticScanner::new(tmp.path().join("nope"), vec![]);
        let result = collect(&scanner).await;
        assert!(matches!(result, Err(ScanError::MissingDirectory(_))));
    }

    #[tokio::test]
    async fn markdown_scanner_renders_and_indexes() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("posts")).unwrap();
        fs::write(
            tmp.path().join("posts/hello.md"),
            "+++\ndate = 2024-01-01\n+++\n# Hello World\n\nBody.",
        )
        .unwrap();
        fs::write(tmp.path().join("_404.md"), "Not found").unwrap();
        fs::write(tmp.path().join("notes.txt"), "ignored").unwrap();

        let scanner = MarkdownScanner::new(tmp.path());
        let items = collect(&scanner).await.unwrap();

        assert_eq!(paths(&items), vec!["404.html", "posts/hello/index.html"]);
        let hello = &items[1];
        assert!(!hello.raw);
        assert!(hello.indexable);
        assert_eq!(hello.meta_str("title"), Some("Hello World"));
        assert_eq!(hello.meta_str("date"), Some("2024-01-01"));
        assert!(String::from_utf8_lossy(&hello.file.contents).contains("<p>Body.</p>"));
    }

    #[tokio::test]
    async fn markdown_scanner_respects_index_filter() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.md"), "+++\ndraft = true\n+++\nDraft").unwrap();
        fs::write(tmp.path().join("b.md"), "Published").unwrap();

        let items = collect(&MarkdownScanner::new(tmp.path())).await.unwrap();
        let indexed: Vec<_> = items.iter().filter(|i| i.indexable).map(|i| i.path()).collect();
        assert_eq!(indexed, vec!["b/index.html"]);

        let none = MarkdownScanner::new(tmp.path()).with_index_filter(|_, _| false);
        let items = collect(&none).await.unwrap();
        assert!(items.iter().all(|i| !i.indexable));
    }

    #[tokio::test]
    async fn redirect_scanner_emits_refresh_pages() {
        let redirects = BTreeMap::from([
            ("/2016/02/old-post/".to_string(), "/old-post/".to_string()),
            ("drafts/x".to_string(), "/x/".to_string()),
        ]);
        let scanner = RedirectScanner::new(redirects);
        let items = collect(&scanner).await.unwrap();

        assert_eq!(
            paths(&items),
            vec!["2016/02/old-post/index.html", "drafts/x/index.html"]
        );
        assert!(items.iter().all(|i| i.raw && !i.indexable));
        assert!(String::from_utf8_lossy(&items[0].file.contents).contains("url=/old-post/"));
        assert!(scanner.paths().is_empty());
    }

    #[tokio::test]
    async fn scan_stops_when_cancelled() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.txt"), "a").unwrap();

        let token = CancellationToken::new();
        let (tx, _rx) = queue::bounded("scan", 4, token.clone());
        token.cancel();

        let result = StaticScanner::new(tmp.path(), vec![]).scan(&token, &tx).await;
        assert!(matches!(result, Err(ScanError::Cancelled)));
    }
}
