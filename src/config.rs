//! Project configuration module.
//!
//! Handles loading, validating, and merging `quire.toml`. Stock defaults form
//! the base layer; the project file overrides only the keys it sets.
//!
//! ## Config File Location
//!
//! ```text
//! my-site/
//! ├── quire.toml       # Optional project config
//! ├── content/         # Markdown documents
//! ├── static/          # Assets copied verbatim
//! └── public/          # Output root (created on first build)
//! ```
//!
//! ## Configuration Options
//!
//! ```toml
//! # All options are optional - defaults shown below
//!
//! content_dir = "content"
//! static_dir = "static"
//! output_dir = "public"
//! clean_output = true
//! static_exclude = [".", "_"]
//!
//! [site]
//! title = "Quire"
//! url = ""
//!
//! [redirects]
//! # "old/post" = "/new-post/"
//!
//! [[indexes]]
//! path = "index.html"
//! title = "Posts"
//! sort_by = "date"
//! descending = true
//! format = "html"
//! raw = false
//!
//! [processing]
//! max_workers = 4           # omit for auto = available parallelism
//! queue_capacity = 0        # 0 = one slot per worker
//!
//! [post]
//! strip_trailing_whitespace = true
//!
//! [watch]
//! debounce_ms = 1000
//! keep_last = false
//! ```
//!
//! Unknown keys are rejected to catch typos early.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Name of the project config file.
pub const CONFIG_FILE: &str = "quire.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Project configuration loaded from `quire.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SiteConfig {
    /// Directory of markdown documents, relative to the project root.
    pub content_dir: String,
    /// Directory of static assets, relative to the project root.
    pub static_dir: String,
    /// Output root. Every file the pipeline writes stays inside it.
    pub output_dir: String,
    /// Purge the output root at the start of every run.
    pub clean_output: bool,
    /// File name prefixes the static scanner skips.
    pub static_exclude: Vec<String>,
    pub site: SiteInfo,
    /// Redirect pages, `source path → target URL`.
    pub redirects: BTreeMap<String, String>,
    pub indexes: Vec<IndexConfig>,
    pub processing: ProcessingConfig,
    pub post: PostConfig,
    pub watch: WatchConfig,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            content_dir: "content".to_string(),
            static_dir: "static".to_string(),
            output_dir: "public".to_string(),
            clean_output: true,
            static_exclude: vec![".".to_string(), "_".to_string()],
            site: SiteInfo::default(),
            redirects: BTreeMap::new(),
            indexes: vec![IndexConfig::default()],
            processing: ProcessingConfig::default(),
            post: PostConfig::default(),
            watch: WatchConfig::default(),
        }
    }
}

impl SiteConfig {
    /// Validate config values are within acceptable ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.output_dir.trim().is_empty() {
            return Err(ConfigError::Validation("output_dir must not be empty".into()));
        }
        if self.processing.max_workers == Some(0) {
            return Err(ConfigError::Validation(
                "processing.max_workers must be at least 1".into(),
            ));
        }
        let mut seen = std::collections::BTreeSet::new();
        for index in &self.indexes {
            if index.path.trim_matches('/').is_empty() {
                return Err(ConfigError::Validation("indexes.path must not be empty".into()));
            }
            if !seen.insert(index.path.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate index path: {}",
                    index.path
                )));
            }
        }
        Ok(())
    }
}

/// Site identity used by the page and index templates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SiteInfo {
    pub title: String,
    /// Absolute base URL, used for links in JSON feeds.
    pub url: String,
}

impl Default for SiteInfo {
    fn default() -> Self {
        Self {
            title: "Quire".to_string(),
            url: String::new(),
        }
    }
}

/// Output flavour of an index page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexFormat {
    Html,
    Json,
}

/// One `[[indexes]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IndexConfig {
    /// Output path of the index page.
    pub path: String,
    /// Heading of HTML indexes.
    pub title: String,
    /// Metadata key to sort by. Empty sorts by path.
    pub sort_by: String,
    pub descending: bool,
    pub format: IndexFormat,
    /// Skip the content template and post-processing.
    pub raw: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            path: "index.html".to_string(),
            title: "Posts".to_string(),
            sort_by: "date".to_string(),
            descending: true,
            format: IndexFormat::Html,
            raw: false,
        }
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessingConfig {
    /// Maximum number of workers per stage.
    /// When absent, defaults to the available parallelism.
    /// Values larger than the core count are clamped down.
    pub max_workers: Option<usize>,
    /// Capacity of each inter-stage queue. `0` means one slot per worker.
    pub queue_capacity: usize,
}

/// Resolve the effective worker count from config.
///
/// - `None` → use all available cores
/// - `Some(n)` → use `min(n, cores)` (user can constrain down, not up)
pub fn effective_workers(config: &ProcessingConfig) -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    config
        .max_workers
        .map(|n| n.min(cores))
        .unwrap_or(cores)
        .max(1)
}

/// Resolve the per-queue capacity for a given worker count.
pub fn effective_queue_capacity(config: &ProcessingConfig, workers: usize) -> usize {
    match config.queue_capacity {
        0 => workers.max(1),
        n => n,
    }
}

/// Post-processing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PostConfig {
    /// Trim trailing whitespace from rendered text files.
    pub strip_trailing_whitespace: bool,
}

impl Default for PostConfig {
    fn default() -> Self {
        Self {
            strip_trailing_whitespace: true,
        }
    }
}

/// Watch mode settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WatchConfig {
    /// Quiet period before a burst of changes triggers a rebuild.
    pub debounce_ms: u64,
    /// Report the last change of a burst instead of the first.
    pub keep_last: bool,
}

impl WatchConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 1000,
            keep_last: false,
        }
    }
}

// =============================================================================
// Config loading, merging, and validation
// =============================================================================

/// Returns the stock default config as a `toml::Value::Table`.
pub fn stock_defaults_value() -> Result<toml::Value, ConfigError> {
    Ok(toml::Value::try_from(SiteConfig::default())?)
}

/// Recursively merge `overlay` on top of `base`.
///
/// - Tables are merged key-by-key (overlay keys override base keys).
/// - Non-table values in overlay replace base values entirely, so an
///   `[[indexes]]` list in the project file replaces the stock list.
/// - Keys in base that are not in overlay are preserved.
pub fn merge_toml(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                let merged = match base_table.remove(&key) {
                    Some(base_val) => merge_toml(base_val, overlay_val),
                    None => overlay_val,
                };
                base_table.insert(key, merged);
            }
            toml::Value::Table(base_table)
        }
        (_, overlay) => overlay,
    }
}

/// Load `quire.toml` from a directory as a raw TOML value.
///
/// Returns `Ok(None)` if the file does not exist.
pub fn load_raw_config(root: &Path) -> Result<Option<toml::Value>, ConfigError> {
    let config_path = root.join(CONFIG_FILE);
    if !config_path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(&config_path)?;
    let value: toml::Value = toml::from_str(&content)?;
    Ok(Some(value))
}

/// Merge an optional overlay onto a base value, then deserialize and validate.
pub fn resolve_config(
    base: toml::Value,
    overlay: Option<toml::Value>,
) -> Result<SiteConfig, ConfigError> {
    let merged = match overlay {
        Some(ov) => merge_toml(base, ov),
        None => base,
    };
    let config: SiteConfig = merged.try_into()?;
    config.validate()?;
    Ok(config)
}

/// Load config from `quire.toml` in the given directory.
pub fn load_config(root: &Path) -> Result<SiteConfig, ConfigError> {
    let base = stock_defaults_value()?;
    let overlay = load_raw_config(root)?;
    resolve_config(base, overlay)
}

/// Returns a fully-commented stock `quire.toml` with all keys and explanations.
///
/// Used by the `gen-config` CLI command.
pub fn stock_config_toml() -> &'static str {
    r##"# Quire Configuration
# ===================
# All settings are optional. Remove or comment out any you don't need.
# Values shown below are the defaults. Unknown keys will cause an error.

# Directory of markdown documents.
content_dir = "content"

# Directory of assets copied verbatim.
static_dir = "static"

# Output root. Nothing is ever written outside it.
output_dir = "public"

# Remove everything inside the output root before each build.
clean_output = true

# Static files and directories whose name starts with one of these are skipped.
static_exclude = [".", "_"]

# ---------------------------------------------------------------------------
# Site
# ---------------------------------------------------------------------------
[site]
title = "Quire"

# Absolute base URL, used by JSON feeds.
url = ""

# ---------------------------------------------------------------------------
# Redirects: source path = target URL
# ---------------------------------------------------------------------------
[redirects]
# "2016/02/old-post" = "/old-post/"

# ---------------------------------------------------------------------------
# Index pages, built from every indexable document
# ---------------------------------------------------------------------------
[[indexes]]
path = "index.html"
title = "Posts"

# Metadata key to sort by. Leave empty to sort by output path.
sort_by = "date"
descending = true

# "html" for a list of links, "json" for a feed.
format = "html"

# Raw indexes skip the page template and post-processing.
raw = false

# ---------------------------------------------------------------------------
# Processing
# ---------------------------------------------------------------------------
[processing]
# Maximum workers per stage.
# Omit or comment out to auto-detect (= number of CPU cores).
# max_workers = 4

# Capacity of each queue between stages. 0 = one slot per worker.
queue_capacity = 0

# ---------------------------------------------------------------------------
# Post-processing
# ---------------------------------------------------------------------------
[post]
strip_trailing_whitespace = true

# ---------------------------------------------------------------------------
# Watch mode
# ---------------------------------------------------------------------------
[watch]
# Quiet period (milliseconds) before a burst of changes triggers a rebuild.
debounce_ms = 1000

# Report the last change of a burst instead of the first.
keep_last = false
"##
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_config_has_directories() {
        let config = SiteConfig::default();
        assert_eq!(config.content_dir, "content");
        assert_eq!(config.static_dir, "static");
        assert_eq!(config.output_dir, "public");
        assert!(config.clean_output);
        assert_eq!(config.static_exclude, vec![".", "_"]);
    }

    #[test]
    fn default_config_has_one_html_index() {
        let config = SiteConfig::default();
        assert_eq!(config.indexes.len(), 1);
        assert_eq!(config.indexes[0].path, "index.html");
        assert_eq!(config.indexes[0].format, IndexFormat::Html);
        assert!(config.indexes[0].descending);
    }

    #[test]
    fn parse_partial_config() {
        let config: SiteConfig = toml::from_str(
            r#"
[site]
title = "My Blog"
"#,
        )
        .unwrap();
        assert_eq!(config.site.title, "My Blog");
        assert_eq!(config.site.url, "");
        assert_eq!(config.output_dir, "public");
        assert_eq!(config.watch.debounce_ms, 1000);
    }

    #[test]
    fn parse_indexes_and_redirects() {
        let config: SiteConfig = toml::from_str(
            r#"
[redirects]
"old/post" = "/new/"

[[indexes]]
path = "feed.json"
format = "json"
raw = true

[[indexes]]
path = "all/index.html"
sort_by = ""
"#,
        )
        .unwrap();
        assert_eq!(config.redirects["old/post"], "/new/");
        assert_eq!(config.indexes.len(), 2);
        assert_eq!(config.indexes[0].format, IndexFormat::Json);
        assert!(config.indexes[0].raw);
        assert_eq!(config.indexes[1].sort_by, "");
        assert_eq!(config.indexes[1].title, "Posts");
    }

    #[test]
    fn watch_window_from_millis() {
        let config = WatchConfig {
            debounce_ms: 250,
            keep_last: true,
        };
        assert_eq!(config.window(), Duration::from_millis(250));
    }

    // =========================================================================
    // load_config tests
    // =========================================================================

    #[test]
    fn load_config_returns_default_when_no_file() {
        let tmp = TempDir::new().unwrap();
        let config = load_config(tmp.path()).unwrap();
        assert_eq!(config.site.title, "Quire");
        assert_eq!(config.indexes.len(), 1);
    }

    #[test]
    fn load_config_reads_file() {
        let tmp = TempDir::new().unwrap();
        fs::write(
            tmp.path().join(CONFIG_FILE),
            r#"
output_dir = "dist"

[processing]
max_workers = 2
"#,
        )
        .unwrap();

        let config = load_config(tmp.path()).unwrap();
        assert_eq!(config.output_dir, "dist");
        assert_eq!(config.processing.max_workers, Some(2));
        // Unspecified values should be defaults
        assert_eq!(config.content_dir, "content");
        assert!(config.post.strip_trailing_whitespace);
    }

    #[test]
    fn load_config_index_list_replaces_stock_list() {
        let tmp = TempDir::new().unwrap();
        fs::write(
            tmp.path().join(CONFIG_FILE),
            r#"
[[indexes]]
path = "feed.json"
format = "json"
"#,
        )
        .unwrap();

        let config = load_config(tmp.path()).unwrap();
        assert_eq!(config.indexes.len(), 1);
        assert_eq!(config.indexes[0].path, "feed.json");
    }

    #[test]
    fn load_config_invalid_toml_is_error() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join(CONFIG_FILE), "this is not valid toml [[[").unwrap();

        let result = load_config(tmp.path());
        assert!(matches!(result, Err(ConfigError::Toml(_))));
    }

    // =========================================================================
    // Processing config tests
    // =========================================================================

    #[test]
    fn effective_workers_auto() {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        assert_eq!(effective_workers(&ProcessingConfig::default()), cores);
    }

    #[test]
    fn effective_workers_clamped_to_cores() {
        let config = ProcessingConfig {
            max_workers: Some(99999),
            queue_capacity: 0,
        };
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        assert_eq!(effective_workers(&config), cores);
    }

    #[test]
    fn effective_workers_user_constrains_down() {
        let config = ProcessingConfig {
            max_workers: Some(1),
            queue_capacity: 0,
        };
        assert_eq!(effective_workers(&config), 1);
    }

    #[test]
    fn queue_capacity_defaults_to_worker_count() {
        let mut config = ProcessingConfig::default();
        assert_eq!(effective_queue_capacity(&config, 3), 3);
        config.queue_capacity = 16;
        assert_eq!(effective_queue_capacity(&config, 3), 16);
    }

    // =========================================================================
    // merge_toml tests
    // =========================================================================

    #[test]
    fn merge_toml_table_merge() {
        let base: toml::Value = toml::from_str(
            r#"
[watch]
debounce_ms = 1000
keep_last = false
"#,
        )
        .unwrap();
        let overlay: toml::Value = toml::from_str(
            r#"
[watch]
keep_last = true
"#,
        )
        .unwrap();
        let merged = merge_toml(base, overlay);
        let watch = merged.get("watch").unwrap();
        assert_eq!(watch.get("keep_last").unwrap().as_bool(), Some(true));
        assert_eq!(watch.get("debounce_ms").unwrap().as_integer(), Some(1000));
    }

    #[test]
    fn merge_toml_arrays_replace() {
        let base: toml::Value = toml::from_str(r#"static_exclude = [".", "_"]"#).unwrap();
        let overlay: toml::Value = toml::from_str(r#"static_exclude = ["~"]"#).unwrap();
        let merged = merge_toml(base, overlay);
        assert_eq!(
            merged.get("static_exclude").unwrap().as_array().unwrap().len(),
            1
        );
    }

    // =========================================================================
    // Unknown key rejection tests
    // =========================================================================

    #[test]
    fn unknown_key_rejected() {
        let result: Result<SiteConfig, _> = toml::from_str("[watch]\ndebounce = 5\n");
        let err = result.unwrap_err().to_string();
        assert!(err.contains("unknown field"));
    }

    #[test]
    fn unknown_index_format_rejected() {
        let result: Result<SiteConfig, _> =
            toml::from_str("[[indexes]]\npath = \"x.xml\"\nformat = \"rss\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn unknown_key_rejected_via_load_config() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join(CONFIG_FILE), "outptu_dir = \"x\"\n").unwrap();
        assert!(load_config(tmp.path()).is_err());
    }

    // =========================================================================
    // Validation tests
    // =========================================================================

    #[test]
    fn validate_default_config_passes() {
        assert!(SiteConfig::default().validate().is_ok());
    }

    #[test]
    fn validate_zero_workers() {
        let mut config = SiteConfig::default();
        config.processing.max_workers = Some(0);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_workers"));
    }

    #[test]
    fn validate_duplicate_index_paths() {
        let mut config = SiteConfig::default();
        config.indexes.push(IndexConfig::default());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate index path"));
    }

    #[test]
    fn validate_empty_output_dir() {
        let mut config = SiteConfig::default();
        config.output_dir = " ".into();
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn load_config_validates_values() {
        let tmp = TempDir::new().unwrap();
        fs::write(
            tmp.path().join(CONFIG_FILE),
            "[processing]\nmax_workers = 0\n",
        )
        .unwrap();
        assert!(matches!(
            load_config(tmp.path()),
            Err(ConfigError::Validation(_))
        ));
    }

    // =========================================================================
    // stock_config_toml tests
    // =========================================================================

    #[test]
    fn stock_config_toml_roundtrips_to_defaults() {
        let config: SiteConfig = toml::from_str(stock_config_toml()).unwrap();
        let defaults = SiteConfig::default();
        assert_eq!(config.output_dir, defaults.output_dir);
        assert_eq!(config.static_exclude, defaults.static_exclude);
        assert_eq!(config.site, defaults.site);
        assert_eq!(config.indexes.len(), 1);
        assert_eq!(config.indexes[0].sort_by, "date");
        assert_eq!(config.processing.max_workers, None);
        assert_eq!(config.watch.debounce_ms, 1000);
    }

    #[test]
    fn stock_defaults_value_has_all_sections() {
        let val = stock_defaults_value().unwrap();
        for section in ["site", "redirects", "indexes", "processing", "post", "watch"] {
            assert!(val.get(section).is_some(), "missing {section}");
        }
    }
}
