//! Content and index rendering.
//!
//! The pipeline only knows the [`ContentRenderer`] contract: one scanned
//! document in, one output file out. [`PageTemplate`] is the stock
//! implementation, wrapping each document body in a site layout.
//!
//! Index pages are rendered by plain functions over a sorted projection
//! list; [`html_index`] and [`json_index`] build the two stock flavours.
//! HTML indexes produce a titled fragment that goes through the content
//! template like any document. JSON feeds are complete on their own.
//!
//! ## HTML Generation
//!
//! Markup is produced with [maud](https://maud.lambda.xyz/), so templates are
//! checked at compile time and interpolated values are escaped. Document
//! bodies arrive already rendered (the markdown scanner produces HTML) and
//! are inserted verbatim.

use crate::config::SiteInfo;
use crate::index::IndexPage;
use crate::types::{File, IndexProjection, ScannedItem};
use chrono::{Datelike, NaiveDate};
use maud::{DOCTYPE, Markup, PreEscaped, html};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("invalid date {value:?} in {path} (expected YYYY-MM-DD)")]
    InvalidDate { path: String, value: String },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to render {path}: {message}")]
    Template { path: String, message: String },
}

/// Turns a non-raw scanned item into its final output file.
pub trait ContentRenderer: Send + Sync {
    fn render(&self, item: &ScannedItem) -> Result<File, RenderError>;
}

const CSS: &str = include_str!("../static/style.css");

/// Format a `YYYY-MM-DD` date as `January 1st 2024`.
pub fn format_date(value: &str) -> Option<String> {
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d").ok()?;
    let day = date.day();
    Some(format!(
        "{} {}{} {}",
        date.format("%B"),
        day,
        ordinal_suffix(day),
        date.year()
    ))
}

fn ordinal_suffix(day: u32) -> &'static str {
    if (11..=13).contains(&day) {
        return "th";
    }
    match day % 10 {
        1 => "st",
        2 => "nd",
        3 => "rd",
        _ => "th",
    }
}

fn checked_date(path: &str, value: Option<&str>) -> Result<Option<String>, RenderError> {
    value
        .map(|value| {
            format_date(value).ok_or_else(|| RenderError::InvalidDate {
                path: path.to_string(),
                value: value.to_string(),
            })
        })
        .transpose()
}

// ============================================================================
// HTML Components
// ============================================================================

/// Renders the base HTML document structure
fn base_document(title: &str, site: &SiteInfo, content: Markup) -> Markup {
    html! {
        (DOCTYPE)
        html lang="en" {
            head {
                meta charset="UTF-8";
                meta name="viewport" content="width=device-width, initial-scale=1.0";
                title { (title) }
                style { (PreEscaped(CSS)) }
            }
            body {
                header.site-header {
                    a href="/" { (site.title) }
                }
                main {
                    (content)
                }
            }
        }
    }
}

fn page_title(title: Option<&str>, site: &SiteInfo) -> String {
    match title {
        Some(title) if title != site.title => format!("{title} · {}", site.title),
        _ => site.title.clone(),
    }
}

/// A meta-refresh page pointing at `target`.
pub fn redirect_page(target: &str) -> Markup {
    html! {
        (DOCTYPE)
        title { (target) }
        meta http-equiv="refresh" content=(format!("0;url={target}"));
    }
}

// ============================================================================
// Content pages
// ============================================================================

/// Stock content template: site header, document title and date, body.
pub struct PageTemplate {
    site: SiteInfo,
}

impl PageTemplate {
    pub fn new(site: SiteInfo) -> Self {
        Self { site }
    }
}

impl ContentRenderer for PageTemplate {
    fn render(&self, item: &ScannedItem) -> Result<File, RenderError> {
        let raw_date = item.meta_str("date");
        let date = checked_date(item.path(), raw_date)?;
        let title = item.meta_str("title");
        let body = String::from_utf8_lossy(&item.file.contents);

        let markup = base_document(
            &page_title(title, &self.site),
            &self.site,
            html! {
                article {
                    @if title.is_some() || date.is_some() {
                        header {
                            @if let Some(title) = title {
                                h1 { (title) }
                            }
                            @if let (Some(date), Some(raw)) = (&date, raw_date) {
                                time datetime=(raw) { (date) }
                            }
                        }
                    }
                    (PreEscaped(body.as_ref()))
                }
            },
        );

        Ok(File::new(item.file.path.clone(), markup.into_string()))
    }
}

// ============================================================================
// Index pages
// ============================================================================

/// HTML list of links to every projection, in the order given.
///
/// The page is a fragment titled `heading`; the content template supplies
/// the surrounding document, so HTML indexes are not meant to be raw.
pub fn html_index(
    heading: String,
) -> impl Fn(&[IndexProjection]) -> Result<IndexPage, RenderError> + Send + Sync + 'static {
    move |entries| {
        let mut rows = Vec::with_capacity(entries.len());
        for entry in entries {
            let date = checked_date(&entry.path, entry.meta_str("date"))?;
            let title = entry
                .meta_str("title")
                .map(str::to_string)
                .unwrap_or_else(|| entry.link());
            rows.push((entry.link(), title, entry.meta_str("date"), date));
        }

        let markup = html! {
            ul.index-list {
                @for (link, title, raw, date) in &rows {
                    li {
                        a href=(link) { (title) }
                        @if let (Some(raw), Some(date)) = (raw, date) {
                            " "
                            time datetime=(raw) { (date) }
                        }
                    }
                }
            }
        };

        let mut page = IndexPage::new(markup.into_string());
        page.metadata
            .insert("title".to_string(), Value::String(heading.clone()));
        Ok(page)
    }
}

#[derive(Serialize)]
struct Feed<'a> {
    title: &'a str,
    home_page_url: &'a str,
    items: Vec<FeedItem<'a>>,
}

#[derive(Serialize)]
struct FeedItem<'a> {
    url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    date: Option<&'a str>,
    metadata: &'a crate::types::Metadata,
}

/// JSON feed of every projection, in the order given.
pub fn json_index(
    site: SiteInfo,
) -> impl Fn(&[IndexProjection]) -> Result<IndexPage, RenderError> + Send + Sync + 'static {
    move |entries| {
        let base = site.url.trim_end_matches('/');
        let feed = Feed {
            title: &site.title,
            home_page_url: &site.url,
            items: entries
                .iter()
                .map(|entry| FeedItem {
                    url: format!("{base}{}", entry.link()),
                    title: entry.meta_str("title"),
                    date: entry.meta_str("date"),
                    metadata: &entry.metadata,
                })
                .collect(),
        };
        Ok(IndexPage::new(serde_json::to_vec_pretty(&feed)?))
    }
}
