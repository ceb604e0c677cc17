use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use ktail_core::{Callbacks, Controller};
use ktail_k8s::{KubeClient, KubeWatchSource};
use ktail_logs::ContainerTailerFactory;

mod config;
mod output;
mod shutdown;

use config::Config;
use output::{OutputFormat, Printer};

/// ktail - tail the logs of every container in every matching pod
#[derive(Parser, Debug)]
#[command(name = "ktail")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Only tail pods or containers whose name matches one of these regexes
    #[arg(value_name = "PATTERN")]
    patterns: Vec<String>,

    /// Namespace (defaults to the context's namespace, then "default")
    #[arg(short = 'n', long)]
    namespace: Option<String>,

    /// Watch pods in every namespace
    #[arg(short = 'A', long, conflicts_with = "namespace")]
    all_namespaces: bool,

    /// Kubernetes context name
    #[arg(long)]
    context: Option<String>,

    /// Path to the kubeconfig file
    #[arg(long, value_name = "PATH")]
    kubeconfig: Option<PathBuf>,

    /// Label selector (e.g. app=web,tier in (frontend))
    #[arg(short = 'l', long)]
    selector: Option<String>,

    /// Skip pods or containers whose name matches this regex (repeatable)
    #[arg(short = 'x', long, value_name = "PATTERN")]
    exclude: Vec<String>,

    /// Historical lines to show for containers that were already running
    #[arg(long)]
    tail_lines: Option<i64>,

    /// Only show history newer than this for containers that were already running
    #[arg(long)]
    since_seconds: Option<i64>,

    /// Prefix lines with their timestamp
    #[arg(short = 't', long)]
    timestamps: bool,

    /// Output format
    #[arg(short = 'o', long, value_enum)]
    output: Option<OutputFormat>,

    /// Only report errors
    #[arg(short = 'q', long)]
    quiet: bool,

    /// Seconds to wait for tailers to stop on exit
    #[arg(long, value_name = "SECS")]
    shutdown_timeout_secs: Option<u64>,

    /// TOML config file with defaults for these options
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load(Args::parse())?;

    let default_level = if config.quiet {
        tracing::Level::WARN
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let result = run(config).await;

    if let Err(e) = &result {
        eprintln!("Error: {:#}", e);
    }

    result
}

async fn run(config: Config) -> Result<()> {
    let kube = KubeClient::load(config.kubeconfig.as_deref())?;
    let client = kube.connect(config.context.as_deref()).await?;

    let namespace = if config.all_namespaces {
        None
    } else {
        Some(
            config
                .namespace
                .clone()
                .or_else(|| kube.context_namespace(config.context.as_deref()))
                .unwrap_or_else(|| "default".to_string()),
        )
    };

    let shutdown = CancellationToken::new();
    let printer = Printer::new(config.output, config.timestamps, namespace.is_none());
    let callbacks = callbacks(&config, printer, shutdown.clone());

    let source = KubeWatchSource::new(client.clone(), namespace.as_deref());
    let factory = ContainerTailerFactory::new(client, config.tail.clone());
    let controller = Controller::new(source, factory, namespace, config.selector.clone(), callbacks)
        .with_shutdown_timeout(config.shutdown_timeout);

    let signals = tokio::spawn(shutdown::wait_for_signal(shutdown.clone()));

    let outcome = controller.run(shutdown.clone()).await;
    shutdown.cancel();
    if let Ok(Some(reason)) = signals.await {
        tracing::debug!(?reason, "shutdown requested");
    }

    let stats = controller.stats();
    tracing::debug!(
        admitted = stats.admitted,
        evicted = stats.evicted,
        failed = stats.failed,
        malformed = stats.malformed,
        watch_errors = stats.watch_errors,
        "controller stopped"
    );

    outcome.context("Pod watch failed")
}

/// Wire the controller hooks to the container filter, stdout and the log
fn callbacks(config: &Config, printer: Printer, shutdown: CancellationToken) -> Callbacks {
    let filter = config.filter.clone();
    let output_closed = Arc::new(AtomicBool::new(false));

    Callbacks::new()
        .on_enter(move |pod, container| {
            if !filter.matches(pod, container) {
                return false;
            }
            tracing::info!(
                namespace = %pod.namespace,
                pod = %pod.name,
                container = %container.name,
                "+ tailing"
            );
            true
        })
        .on_exit(|pod, container| {
            tracing::info!(
                namespace = %pod.namespace,
                pod = %pod.name,
                container = %container.name,
                "- stopped"
            );
        })
        .on_error(|pod, container, err| {
            tracing::error!(
                namespace = %pod.namespace,
                pod = %pod.name,
                container = %container.name,
                error = %err,
                "tailer failed"
            );
        })
        .on_event(move |entry| {
            if let Err(e) = printer.print(&entry) {
                // Downstream closed (e.g. `ktail | head`): stop everything once
                if !output_closed.swap(true, Ordering::SeqCst) {
                    tracing::debug!(error = %e, "stdout closed; shutting down");
                    shutdown.cancel();
                }
            }
        })
}
