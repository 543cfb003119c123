//! Post-processing of rendered files.
//!
//! Post-processors run in order over every rendered (non-raw) file after the
//! content stage. Raw files skip this stage untouched.
//!
//! Processors are plain values built once from configuration and shared by
//! every worker of a run. They hold no mutable state.

use crate::config::PostConfig;
use crate::types::File;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum PostError {
    #[error("{processor} failed on {path}: {message}")]
    Failed {
        processor: String,
        path: String,
        message: String,
    },
}

/// Transforms one output file.
pub trait PostProcessor: Send + Sync {
    fn process(&self, file: File) -> Result<File, PostError>;
}

impl<F> PostProcessor for F
where
    F: Fn(File) -> Result<File, PostError> + Send + Sync,
{
    fn process(&self, file: File) -> Result<File, PostError> {
        self(file)
    }
}

/// Run `file` through every processor in order.
pub fn apply(processors: &[Arc<dyn PostProcessor>], file: File) -> Result<File, PostError> {
    processors
        .iter()
        .try_fold(file, |file, processor| processor.process(file))
}

/// Build the stock processor chain from configuration.
pub fn from_config(config: &PostConfig) -> Vec<Arc<dyn PostProcessor>> {
    let mut processors: Vec<Arc<dyn PostProcessor>> = Vec::new();
    if config.strip_trailing_whitespace {
        processors.push(Arc::new(TrailingWhitespace::default()));
    }
    processors
}

/// Strips trailing whitespace from every line of text files and ends them
/// with exactly one newline.
#[derive(Debug, Clone)]
pub struct TrailingWhitespace {
    extensions: Vec<String>,
}

impl Default for TrailingWhitespace {
    fn default() -> Self {
        Self::new(["html", "css", "js", "json", "xml", "txt"])
    }
}

impl TrailingWhitespace {
    /// Only files with one of `extensions` are touched.
    pub fn new<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            extensions: extensions.into_iter().map(Into::into).collect(),
        }
    }

    fn applies_to(&self, path: &str) -> bool {
        path.rsplit_once('.')
            .is_some_and(|(_, ext)| self.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
    }
}

impl PostProcessor for TrailingWhitespace {
    fn process(&self, file: File) -> Result<File, PostError> {
        if !self.applies_to(&file.path) {
            return Ok(file);
        }
        // Binary content under a text extension is left alone.
        let Ok(text) = std::str::from_utf8(&file.contents) else {
            debug!(path = %file.path, "not UTF-8, skipping whitespace trim");
            return Ok(file);
        };

        let mut out = String::with_capacity(text.len());
        for line in text.lines() {
            out.push_str(line.trim_end());
            out.push('\n');
        }
        let trimmed = out.trim_end_matches('\n');
        let contents = if trimmed.is_empty() {
            String::new()
        } else {
            format!("{trimmed}\n")
        };
        Ok(File::new(file.path, contents))
    }
}
