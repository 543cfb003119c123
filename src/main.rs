use clap::{Parser, Subcommand};
use quire::config::{self, SiteConfig};
use quire::output;
use quire::pipeline::Pipeline;
use quire::sink::{DirectorySink, MemorySink};
use quire::watch::{self, FsNotifier};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Capacity of the filesystem event channel in watch mode.
const WATCH_EVENT_CAPACITY: usize = 64;

fn version_string() -> &'static str {
    let on_tag = env!("ON_RELEASE_TAG");
    if on_tag == "true" {
        env!("CARGO_PKG_VERSION")
    } else {
        let hash = env!("GIT_HASH");
        if hash.is_empty() {
            "dev@unknown"
        } else {
            Box::leak(format!("dev@{hash}").into_boxed_str())
        }
    }
}

#[derive(Parser)]
#[command(name = "quire")]
#[command(about = "Concurrent static site generator for markdown sites")]
#[command(long_about = "\
Concurrent static site generator for markdown sites

Markdown documents are rendered through a page template, static assets are
copied verbatim, and index pages are built from every document's metadata.

Project structure:

  my-site/
  ├── quire.toml              # Optional config (see 'quire gen-config')
  ├── content/
  │   ├── hello.md            # → hello/index.html
  │   ├── _404.md             # → 404.html
  │   └── posts/first.md      # → posts/first/index.html
  └── static/
      └── css/site.css        # → css/site.css (copied verbatim)

Front matter is TOML between '+++' lines:

  +++
  title = \"Hello\"
  date = 2024-01-01
  draft = false
  +++

Set RUST_LOG (e.g. RUST_LOG=quire=debug) to control log output.")]
#[command(version = version_string())]
struct Cli {
    /// Project directory containing quire.toml
    #[arg(long, default_value = ".", global = true)]
    root: PathBuf,

    /// Output directory (overrides output_dir from quire.toml)
    #[arg(long, global = true)]
    output: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build the site once
    Build,
    /// Build, then rebuild whenever content or static files change
    Watch,
    /// Run every stage without writing anything to disk
    Check,
    /// Print a stock quire.toml with all options documented
    GenConfig,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "quire=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Command::GenConfig => {
            print!("{}", config::stock_config_toml());
        }
        Command::Build => {
            let run = RunContext::load(&cli)?;
            let sink = Arc::new(DirectorySink::new(&run.output_dir, run.config.clean_output));
            let pipeline = Pipeline::from_config(&run.config, &cli.root, sink);
            let stats = pipeline.run(&run.cancel).await?;
            output::print_build_output(&stats, &run.output_dir);
        }
        Command::Watch => {
            let run = RunContext::load(&cli)?;
            let sink = Arc::new(DirectorySink::new(&run.output_dir, run.config.clean_output));
            let pipeline = Pipeline::from_config(&run.config, &cli.root, sink);
            let paths = pipeline.watched_paths();
            let (_notifier, events) = FsNotifier::start(&paths, WATCH_EVENT_CAPACITY)?;

            println!("{}", output::format_watch_banner(&paths));
            let stats = watch::watch(
                &pipeline,
                &run.cancel,
                events,
                run.config.watch.window(),
                run.config.watch.keep_last,
            )
            .await;
            println!("{}", output::format_watch_summary(&stats));
        }
        Command::Check => {
            let run = RunContext::load(&cli)?;
            let sink = Arc::new(MemorySink::new());
            let pipeline = Pipeline::from_config(&run.config, &cli.root, sink.clone());
            let stats = pipeline.run(&run.cancel).await?;
            output::print_check_output(&stats, &sink.paths());
        }
    }

    Ok(())
}

/// Everything a pipeline command needs before it starts.
struct RunContext {
    config: SiteConfig,
    output_dir: PathBuf,
    cancel: CancellationToken,
}

impl RunContext {
    fn load(cli: &Cli) -> Result<Self, config::ConfigError> {
        let config = config::load_config(&cli.root)?;
        let output_dir = resolve_output_dir(cli, &config);
        let cancel = CancellationToken::new();
        cancel_on_interrupt(cancel.clone());
        Ok(Self {
            config,
            output_dir,
            cancel,
        })
    }
}

/// `--output` wins over the config file; relative config paths are taken
/// from the project root.
fn resolve_output_dir(cli: &Cli, site_config: &SiteConfig) -> PathBuf {
    match &cli.output {
        Some(dir) => dir.clone(),
        None => join_root(&cli.root, &site_config.output_dir),
    }
}

fn join_root(root: &Path, dir: &str) -> PathBuf {
    if root == Path::new(".") {
        PathBuf::from(dir)
    } else {
        root.join(dir)
    }
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping");
            token.cancel();
        }
    });
}
