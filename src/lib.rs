//! # Quire
//!
//! A small static site generator built around a concurrent pipeline.
//! Markdown documents are rendered through a page template, static assets are
//! copied verbatim, and index pages (post lists, feeds) are assembled from the
//! metadata of every document in the same run.
//!
//! # Architecture: One Flow Graph per Run
//!
//! ```text
//! scanners → classify ─┬─ render ─┐
//!               ▲      └─ (raw) ──┴─ post-process → output sink
//!               └── index pages ◀── projections of indexable items
//! ```
//!
//! Every edge is a bounded queue; every fan-out stage is a pool of workers.
//! Index pages are rendered once scanning has finished and re-enter the graph
//! through a feedback queue, so they get the same template and
//! post-processing as regular documents. A fed-back page must not be
//! indexable itself; if it is, the run fails instead of looping.
//!
//! Each run starts from scratch: the output root is reset, every input is
//! scanned again, and nothing survives to the next run.
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`pipeline`] | Orchestrator: queues, worker pools, first-error cancellation, shutdown order |
//! | [`queue`] | Bounded, cancellation-aware queues that close when their last producer drops |
//! | [`scan`] | Scanner contract plus static, markdown and redirect scanners |
//! | [`render`] | Content renderer contract, Maud page template, HTML and JSON index renderers |
//! | [`post`] | Post-processor contract and the trailing-whitespace processor |
//! | [`index`] | Index specs, comparators, and the aggregator feeding pages back |
//! | [`sink`] | Output sinks: a scoped directory root and an in-memory map |
//! | [`debounce`] | Coalesces bursts of change events into single triggers |
//! | [`watch`] | Rebuild loop and filesystem notifications |
//! | [`config`] | `quire.toml` loading, merging over stock defaults, validation |
//! | [`types`] | Items that flow between stages (`File`, `ScannedItem`, `IndexProjection`) |
//! | [`output`] | CLI output formatting |
//!
//! # Design Decisions
//!
//! ## Queues Close Themselves
//!
//! A queue closes when its last producer handle is dropped. Each stage owns
//! the producers of the queues it feeds, so the graph drains in dependency
//! order without a coordinator counting finished workers.
//!
//! ## The Output Root Is a Capability
//!
//! [`sink::ScopedRoot`] is the only way output reaches the disk. Paths are
//! split into plain components up front; `..`, absolute paths and symlinks
//! inside the root are rejected rather than resolved. What remains is
//! resolved through an open handle on the root (`cap-std`), never through a
//! joined path string.
//!
//! ## Maud Over Template Engines
//!
//! HTML is generated with [Maud](https://maud.lambda.xyz/): templates are
//! checked at compile time, interpolation is escaped, and there are no
//! template files to ship.
//!
//! ## Logging
//!
//! The library logs through `tracing` and never installs a subscriber. The
//! binary installs one filtered by `RUST_LOG`, defaulting to `quire=info`.

pub mod config;
pub mod debounce;
pub mod index;
pub mod output;
pub mod pipeline;
pub mod post;
pub mod queue;
pub mod render;
pub mod scan;
pub mod sink;
pub mod types;
pub mod watch;

#[cfg(test)]
pub(crate) mod test_helpers;
