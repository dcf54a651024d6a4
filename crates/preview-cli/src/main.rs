//! Preview - pull request preview deployments
//!
//! Usage:
//!   preview publish --id 42 --title "..." --head abc1234 --artifact site.zip
//!   preview cleanup --id 42
//!   preview list
//!   preview verify --id 42
//!   preview handle --event event.json --artifact site/

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use preview_core::config::{default_config_path, load_config};
use preview_core::prelude::*;

#[derive(Parser)]
#[command(name = "preview")]
#[command(about = "Pull request preview deployments", long_about = None)]
struct Cli {
    /// Configuration file (defaults to the user config directory)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Print the lifecycle report as one JSON line on stdout
    #[arg(long, global = true)]
    json: bool,

    /// Append lifecycle reports as JSON lines to this file
    #[arg(long, global = true, value_name = "PATH")]
    report_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish a build artifact as the preview of a request
    Publish {
        /// Request number
        #[arg(long)]
        id: RequestId,
        /// Request title, used in the commit message
        #[arg(long)]
        title: String,
        /// Head revision the artifact was built from
        #[arg(long)]
        head: String,
        /// Built site: a directory or a .zip archive
        #[arg(long)]
        artifact: PathBuf,
        /// Size in bytes declared by the build system
        #[arg(long)]
        size: Option<u64>,
    },

    /// Remove a request's preview, and the container once it is empty
    #[command(alias = "rm")]
    Cleanup {
        /// Request number
        #[arg(long)]
        id: RequestId,
    },

    /// List requests that currently have a preview
    #[command(alias = "ls")]
    List,

    /// Poll a deployed preview until it answers
    Verify {
        /// Request number whose preview URL to poll
        #[arg(long, conflicts_with = "url", required_unless_present = "url")]
        id: Option<RequestId>,
        /// Explicit URL to poll
        #[arg(long)]
        url: Option<String>,
    },

    /// Process a lifecycle event read from a JSON file
    Handle {
        /// Event file ("-" for stdin)
        #[arg(long)]
        event: PathBuf,
        /// Built site for open/update events
        #[arg(long)]
        artifact: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "preview=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = load(cli.config.as_deref())?;
    let notifier = notifier_for(&cli);
    let controller = Controller::from_config(&config, notifier)?;

    let report = match cli.command {
        Commands::Publish {
            id,
            title,
            head,
            artifact,
            size,
        } => {
            let prepared = Request::new(id, title, head).and_then(|request| {
                let artifact = Artifact::open_for(id, &artifact)?;
                let artifact = match size {
                    Some(bytes) => artifact.with_declared_size(bytes),
                    None => artifact,
                };
                Ok((request, artifact))
            });
            match prepared {
                Ok((request, artifact)) => controller.publish(&request, &artifact).await,
                Err(err) => controller.reject(id, Operation::Publish, &err).await,
            }
        }
        Commands::Cleanup { id } => controller.cleanup(id, CleanupReason::Manual).await,
        Commands::List => return run_list(&controller, &config).await,
        Commands::Verify { id, url } => return run_verify(&controller, &config, id, url).await,
        Commands::Handle { event, artifact } => {
            let event = read_event(&event)?;
            let id = event.request_id();
            let artifact = match &event {
                LifecycleEvent::RequestOpenedOrUpdated { .. } => artifact
                    .as_deref()
                    .map(|path| Artifact::open_for(id, path))
                    .transpose(),
                LifecycleEvent::RequestClosed { .. } => Ok(None),
            };
            match artifact {
                Ok(artifact) => controller.handle(event, artifact).await,
                Err(err) => controller.reject(id, Operation::Publish, &err).await,
            }
        }
    };

    if !cli.json {
        print_report(&report);
    }
    if !report.outcome.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

fn load(path: Option<&Path>) -> Result<PreviewConfig> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => default_config_path()?,
    };
    load_config(&path)
}

fn notifier_for(cli: &Cli) -> Arc<dyn Notifier> {
    if let Some(path) = &cli.report_file {
        Arc::new(JsonLinesNotifier::file(path))
    } else if cli.json {
        Arc::new(JsonLinesNotifier::stdout())
    } else {
        Arc::new(LogNotifier)
    }
}

fn read_event(path: &Path) -> Result<LifecycleEvent> {
    let content = if path == Path::new("-") {
        std::io::read_to_string(std::io::stdin()).context("Failed to read event from stdin")?
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read event file: {}", path.display()))?
    };
    serde_json::from_str(&content).context("Failed to parse lifecycle event")
}

async fn run_list(controller: &Controller, config: &PreviewConfig) -> Result<()> {
    let ids = controller
        .list_slots()
        .await
        .context("Failed to read preview slots")?;
    let urls = config.urls()?;
    if ids.is_empty() {
        println!("No previews deployed.");
        return Ok(());
    }
    for id in ids {
        println!("#{:<8} {}", id.to_string(), urls.preview(id));
    }
    Ok(())
}

async fn run_verify(
    controller: &Controller,
    config: &PreviewConfig,
    id: Option<RequestId>,
    url: Option<String>,
) -> Result<()> {
    let url = match (id, url) {
        (_, Some(raw)) => raw
            .parse::<url::Url>()
            .with_context(|| format!("Invalid URL: {}", raw))?,
        (Some(id), None) => config.urls()?.preview(id),
        (None, None) => anyhow::bail!("either --id or --url is required"),
    };
    let report = controller
        .verifier()
        .verify_with(&url, &config.verify_policy())
        .await;
    if report.verified {
        println!("✓ {} is live (attempt {})", url, report.attempts);
        Ok(())
    } else {
        println!("✗ {} did not answer after {} attempts", url, report.attempts);
        std::process::exit(1);
    }
}

fn print_report(report: &LifecycleReport) {
    let mark = if report.outcome.is_success() { "✓" } else { "✗" };
    println!(
        "{} {} #{}: {}",
        mark, report.operation, report.request_id, report.outcome
    );
    if let Some(url) = &report.url {
        println!("  url:      {}", url);
    }
    if let Some(metrics) = &report.size_metrics {
        println!("  size:     {} files, {} bytes", metrics.files, metrics.bytes);
    }
    if let Some(revision) = &report.revision {
        println!("  revision: {}", revision);
    }
    if let Some(step) = report.step {
        println!("  step:     {}", step);
    }
    if let Some(detail) = &report.error_detail {
        println!("  error:    {}", detail);
    }
}
