//! Pipeline orchestration.
//!
//! A run wires the stages into one flow graph with a bounded queue on every
//! edge:
//!
//! ```text
//!  scanners ──▶ classify ──┬──▶ render pool ──┐
//!                 │  ▲      │                  ├──▶ post pool ──▶ output pool ──▶ sink
//!                 │  │      └──(raw)───────────┘
//!                 ▼  │
//!           indexes ─┴─ feedback ─▶ route
//! ```
//!
//! Classification buffers a projection of every indexable item. Once every
//! scanner has finished, it renders the index pages and pushes them onto the
//! feedback queue, whose consumer routes them like any other item. A fed-back
//! item that is itself indexable fails the run.
//!
//! ## Shutdown
//!
//! Each stage owns the producer handles of the queues it feeds and drops them
//! when it returns, so a queue closes exactly when its last producer is done.
//! The graph therefore drains in dependency order: scanner output, feedback,
//! render, post, output.
//!
//! The first error cancels the run's token. Every queue operation observes
//! the token, so all stages wind down promptly, and [`Pipeline::run`] only
//! returns once every task it spawned has finished.

use crate::config::{
    IndexConfig, IndexFormat, SiteConfig, SiteInfo, effective_queue_capacity, effective_workers,
};
use crate::index::{IndexError, IndexSpec, by_key, render_indexes};
use crate::post::{self, PostError, PostProcessor};
use crate::queue::{self, Consumer, Producer, QueueError};
use crate::render::{ContentRenderer, PageTemplate, RenderError, html_index, json_index};
use crate::scan::{MarkdownScanner, RedirectScanner, ScanError, Scanner, StaticScanner};
use crate::sink::{OutputSink, SinkError};
use crate::types::{File, ScannedItem};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("scanner '{scanner}' failed: {source}")]
    Scan { scanner: String, source: ScanError },
    #[error("failed to render {path}: {source}")]
    Render { path: String, source: RenderError },
    #[error("post-processing failed: {0}")]
    PostProcess(#[from] PostError),
    #[error("index rendering failed: {0}")]
    Index(#[from] IndexError),
    #[error("output failed: {0}")]
    Sink(#[from] SinkError),
    #[error("failed to reset output: {0}")]
    Reset(#[source] SinkError),
    #[error("index page {path} is itself indexable")]
    RecursiveIndex { path: String },
    #[error("{0}")]
    Queue(#[from] QueueError),
    #[error("run cancelled")]
    Cancelled,
    #[error("pipeline worker panicked: {0}")]
    WorkerPanicked(String),
}

impl PipelineError {
    /// True for errors that only report a stage noticing cancellation.
    pub fn is_cancellation(&self) -> bool {
        self.queue_error()
            .is_some_and(|err| matches!(err, QueueError::Cancelled(_)))
            || match self {
                Self::Cancelled => true,
                Self::Scan { source, .. } => matches!(source, ScanError::Cancelled),
                Self::Index(err) => matches!(err, IndexError::Cancelled),
                Self::Sink(err) => matches!(err, SinkError::Cancelled(_)),
                _ => false,
            }
    }

    /// True when a stage stopped because every consumer downstream of it had
    /// already given up. Such an error is a consequence of another failure.
    pub fn is_disconnect(&self) -> bool {
        self.queue_error()
            .is_some_and(|err| matches!(err, QueueError::Disconnected(_)))
    }

    fn queue_error(&self) -> Option<QueueError> {
        match self {
            Self::Queue(err)
            | Self::Scan {
                source: ScanError::Queue(err),
                ..
            }
            | Self::Index(IndexError::Queue(err)) => Some(*err),
            _ => None,
        }
    }
}

/// Counts from one successful run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Items produced by scanners.
    pub scanned: usize,
    /// Items that went through the content renderer, index pages included.
    pub rendered: usize,
    /// Raw items copied through unchanged, index pages included.
    pub passed_through: usize,
    /// Projections handed to the index aggregator.
    pub projections: usize,
    pub index_pages: usize,
    pub written: usize,
    pub elapsed: Duration,
}

#[derive(Default)]
struct Counters {
    scanned: AtomicUsize,
    rendered: AtomicUsize,
    passed_through: AtomicUsize,
    projections: AtomicUsize,
    index_pages: AtomicUsize,
    written: AtomicUsize,
}

impl Counters {
    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self, elapsed: Duration) -> RunStats {
        RunStats {
            scanned: self.scanned.load(Ordering::Relaxed),
            rendered: self.rendered.load(Ordering::Relaxed),
            passed_through: self.passed_through.load(Ordering::Relaxed),
            projections: self.projections.load(Ordering::Relaxed),
            index_pages: self.index_pages.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
            elapsed,
        }
    }
}

/// A rendered or passed-through file on its way to post-processing.
struct Staged {
    file: File,
    raw: bool,
}

/// The two exits of classification.
#[derive(Clone)]
struct Routes {
    render: Producer<ScannedItem>,
    pass: Producer<Staged>,
    counters: Arc<Counters>,
}

impl Routes {
    async fn route(&self, item: ScannedItem) -> Result<(), QueueError> {
        if item.raw {
            Counters::bump(&self.counters.passed_through);
            self.pass
                .push(Staged {
                    file: item.file,
                    raw: true,
                })
                .await
        } else {
            self.render.push(item).await
        }
    }
}

/// The first real failure of a run, shared by every stage.
///
/// A stage records its error the moment it gives up, which also cancels the
/// run. Cancellation errors are dropped. Disconnects are kept aside and only
/// reported if nothing else was recorded.
#[derive(Clone)]
struct FirstFailure {
    slot: Arc<Mutex<FailureSlot>>,
    token: CancellationToken,
}

#[derive(Default)]
struct FailureSlot {
    first: Option<PipelineError>,
    knock_on: Option<PipelineError>,
}

impl FirstFailure {
    fn new(token: CancellationToken) -> Self {
        Self {
            slot: Arc::new(Mutex::new(FailureSlot::default())),
            token,
        }
    }

    fn record(&self, err: PipelineError) {
        if err.is_cancellation() {
            debug!(error = %err, "stage stopped by cancellation");
            return;
        }

        let mut slot = self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if err.is_disconnect() {
            debug!(error = %err, "stage lost its consumers");
            slot.knock_on.get_or_insert(err);
        } else if slot.first.is_some() {
            debug!(error = %err, "discarding error after first failure");
        } else {
            error!(error = %err, "pipeline run failed");
            slot.first = Some(err);
        }
        drop(slot);
        self.token.cancel();
    }

    /// The recorded failure and the first disconnect, in that order.
    fn take(&self) -> (Option<PipelineError>, Option<PipelineError>) {
        let mut slot = self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        (slot.first.take(), slot.knock_on.take())
    }
}

/// Spawn one stage; its error goes straight to `failure`.
fn spawn_stage<F>(tasks: &mut JoinSet<()>, failure: &FirstFailure, stage: F)
where
    F: Future<Output = Result<(), PipelineError>> + Send + 'static,
{
    let failure = failure.clone();
    tasks.spawn(async move {
        if let Err(err) = stage.await {
            failure.record(err);
        }
    });
}

/// A configured flow graph. Cheap to run repeatedly; nothing is kept
/// between runs.
pub struct Pipeline {
    scanners: Vec<Arc<dyn Scanner>>,
    indexes: Arc<[IndexSpec]>,
    renderer: Arc<dyn ContentRenderer>,
    post: Arc<[Arc<dyn PostProcessor>]>,
    sink: Arc<dyn OutputSink>,
    workers: usize,
    queue_capacity: usize,
}

impl Pipeline {
    /// An empty pipeline with one worker per stage.
    pub fn new(renderer: Arc<dyn ContentRenderer>, sink: Arc<dyn OutputSink>) -> Self {
        Self {
            scanners: Vec::new(),
            indexes: Arc::from(Vec::new()),
            renderer,
            post: Arc::from(Vec::new()),
            sink,
            workers: 1,
            queue_capacity: 1,
        }
    }

    pub fn scanner(mut self, scanner: impl Scanner + 'static) -> Self {
        self.scanners.push(Arc::new(scanner));
        self
    }

    pub fn index(mut self, spec: IndexSpec) -> Self {
        let mut indexes = self.indexes.to_vec();
        indexes.push(spec);
        self.indexes = Arc::from(indexes);
        self
    }

    pub fn post_processor(mut self, processor: Arc<dyn PostProcessor>) -> Self {
        let mut post = self.post.to_vec();
        post.push(processor);
        self.post = Arc::from(post);
        self
    }

    /// Workers per fan-out stage (at least one).
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Capacity of every inter-stage queue (at least one).
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Every filesystem path the scanners read from.
    pub fn watched_paths(&self) -> Vec<PathBuf> {
        self.scanners.iter().flat_map(|s| s.paths()).collect()
    }

    /// Assemble the stock pipeline for a project rooted at `root`.
    pub fn from_config(config: &SiteConfig, root: &Path, sink: Arc<dyn OutputSink>) -> Self {
        let workers = effective_workers(&config.processing);
        let mut pipeline = Pipeline::new(Arc::new(PageTemplate::new(config.site.clone())), sink)
            .workers(workers)
            .queue_capacity(effective_queue_capacity(&config.processing, workers));

        let static_dir = root.join(&config.static_dir);
        if static_dir.is_dir() {
            pipeline = pipeline.scanner(StaticScanner::new(
                static_dir,
                config.static_exclude.clone(),
            ));
        } else {
            warn!(path = %static_dir.display(), "static directory not found, skipping");
        }
        pipeline = pipeline.scanner(MarkdownScanner::new(root.join(&config.content_dir)));
        if !config.redirects.is_empty() {
            pipeline = pipeline.scanner(RedirectScanner::new(config.redirects.clone()));
        }

        for processor in post::from_config(&config.post) {
            pipeline = pipeline.post_processor(processor);
        }
        for index in &config.indexes {
            pipeline = pipeline.index(index_spec(index, &config.site));
        }
        pipeline
    }

    /// Run every input through to the sink once.
    ///
    /// Returns the first fatal error of the run, or [`PipelineError::Cancelled`]
    /// if `cancel` fired. Never returns while a stage is still running.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<RunStats, PipelineError> {
        let started = Instant::now();
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let sink = Arc::clone(&self.sink);
        tokio::task::spawn_blocking(move || sink.reset())
            .await
            .map_err(|e| PipelineError::WorkerPanicked(e.to_string()))?
            .map_err(PipelineError::Reset)?;

        info!(
            scanners = self.scanners.len(),
            indexes = self.indexes.len(),
            workers = self.workers,
            "starting pipeline run"
        );

        let token = cancel.child_token();
        let counters = Arc::new(Counters::default());
        let capacity = self.queue_capacity;

        let (scan_tx, scan_rx) = queue::bounded("scanned", capacity, token.clone());
        let (feedback_tx, feedback_rx) = queue::bounded("feedback", capacity, token.clone());
        let (render_tx, render_rx) = queue::bounded("render", capacity, token.clone());
        let (post_tx, post_rx) = queue::bounded("post", capacity, token.clone());
        let (out_tx, out_rx) = queue::bounded("output", capacity, token.clone());

        let routes = Routes {
            render: render_tx,
            pass: post_tx.clone(),
            counters: Arc::clone(&counters),
        };

        let failure = FirstFailure::new(token.clone());
        let mut tasks = JoinSet::new();

        for scanner in &self.scanners {
            let scanner = Arc::clone(scanner);
            let output = scan_tx.clone();
            let token = token.clone();
            spawn_stage(&mut tasks, &failure, async move {
                debug!(scanner = scanner.name(), "scanner started");
                scanner
                    .scan(&token, &output)
                    .await
                    .map_err(|source| PipelineError::Scan {
                        scanner: scanner.name().to_string(),
                        source,
                    })
            });
        }
        drop(scan_tx);

        spawn_stage(
            &mut tasks,
            &failure,
            classify(
                scan_rx,
                routes.clone(),
                feedback_tx,
                Arc::clone(&self.indexes),
                token.clone(),
                Arc::clone(&counters),
            ),
        );
        spawn_stage(&mut tasks, &failure, route_feedback(feedback_rx, routes));

        for _ in 0..self.workers {
            spawn_stage(
                &mut tasks,
                &failure,
                render_worker(
                    render_rx.clone(),
                    post_tx.clone(),
                    Arc::clone(&self.renderer),
                    Arc::clone(&counters),
                ),
            );
            spawn_stage(
                &mut tasks,
                &failure,
                post_worker(post_rx.clone(), out_tx.clone(), Arc::clone(&self.post)),
            );
            spawn_stage(
                &mut tasks,
                &failure,
                output_worker(
                    out_rx.clone(),
                    Arc::clone(&self.sink),
                    token.clone(),
                    Arc::clone(&counters),
                ),
            );
        }
        drop((render_rx, post_tx, post_rx, out_tx, out_rx));

        while let Some(joined) = tasks.join_next().await {
            if let Err(join) = joined {
                failure.record(PipelineError::WorkerPanicked(join.to_string()));
            }
        }

        let (first, knock_on) = failure.take();
        if let Some(err) = first {
            return Err(err);
        }
        if cancel.is_cancelled() {
            info!("pipeline run cancelled");
            return Err(PipelineError::Cancelled);
        }
        if let Some(err) = knock_on {
            return Err(err);
        }

        let stats = counters.snapshot(started.elapsed());
        info!(
            scanned = stats.scanned,
            rendered = stats.rendered,
            passed_through = stats.passed_through,
            index_pages = stats.index_pages,
            written = stats.written,
            elapsed_ms = stats.elapsed.as_millis() as u64,
            "pipeline run finished"
        );
        Ok(stats)
    }
}

/// Build the index spec for one `[[indexes]]` entry. JSON feeds are always raw.
pub fn index_spec(config: &IndexConfig, site: &SiteInfo) -> IndexSpec {
    let spec = match config.format {
        IndexFormat::Html => IndexSpec::new(&config.path, html_index(config.title.clone()))
            .raw(config.raw),
        IndexFormat::Json => IndexSpec::new(&config.path, json_index(site.clone())).raw(true),
    };
    if config.sort_by.is_empty() {
        spec
    } else {
        spec.sorted_by(by_key(config.sort_by.clone(), config.descending))
    }
}

// ============================================================================
// Stages
// ============================================================================

async fn classify(
    input: Consumer<ScannedItem>,
    routes: Routes,
    feedback: Producer<ScannedItem>,
    specs: Arc<[IndexSpec]>,
    token: CancellationToken,
    counters: Arc<Counters>,
) -> Result<(), PipelineError> {
    let mut projections = Vec::new();
    while let Some(item) = input.pull().await {
        Counters::bump(&counters.scanned);
        if item.indexable {
            projections.push(item.projection());
        }
        routes.route(item).await?;
    }
    if token.is_cancelled() {
        return Err(PipelineError::Cancelled);
    }

    counters
        .projections
        .store(projections.len(), Ordering::Relaxed);
    debug!(projections = projections.len(), "scanning finished, rendering indexes");
    let pages = render_indexes(&token, &projections, &specs, &feedback).await?;
    counters.index_pages.store(pages, Ordering::Relaxed);
    Ok(())
}

async fn route_feedback(input: Consumer<ScannedItem>, routes: Routes) -> Result<(), PipelineError> {
    while let Some(item) = input.pull().await {
        if item.indexable {
            return Err(PipelineError::RecursiveIndex {
                path: item.file.path,
            });
        }
        routes.route(item).await?;
    }
    Ok(())
}

async fn render_worker(
    input: Consumer<ScannedItem>,
    output: Producer<Staged>,
    renderer: Arc<dyn ContentRenderer>,
    counters: Arc<Counters>,
) -> Result<(), PipelineError> {
    while let Some(item) = input.pull().await {
        let file = renderer
            .render(&item)
            .map_err(|source| PipelineError::Render {
                path: item.file.path.clone(),
                source,
            })?;
        Counters::bump(&counters.rendered);
        output.push(Staged { file, raw: false }).await?;
    }
    Ok(())
}

async fn post_worker(
    input: Consumer<Staged>,
    output: Producer<File>,
    processors: Arc<[Arc<dyn PostProcessor>]>,
) -> Result<(), PipelineError> {
    while let Some(Staged { file, raw }) = input.pull().await {
        let file = if raw {
            file
        } else {
            post::apply(&processors, file)?
        };
        output.push(file).await?;
    }
    Ok(())
}

async fn output_worker(
    input: Consumer<File>,
    sink: Arc<dyn OutputSink>,
    token: CancellationToken,
    counters: Arc<Counters>,
) -> Result<(), PipelineError> {
    while let Some(file) = input.pull().await {
        let sink = Arc::clone(&sink);
        let token = token.clone();
        tokio::task::spawn_blocking(move || sink.write(&token, &file))
            .await
            .map_err(|e| PipelineError::WorkerPanicked(e.to_string()))??;
        Counters::bump(&counters.written);
    }
    Ok(())
}
