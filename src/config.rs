//! Configuration: command line merged over an optional TOML file

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use ktail_core::{DEFAULT_SHUTDOWN_TIMEOUT, LabelSelector};
use ktail_logs::{ContainerFilter, TailOptions};

use crate::Args;
use crate::output::OutputFormat;

/// Settings that may come from `--config`; every key is optional
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct FileConfig {
    pub namespace: Option<String>,
    pub all_namespaces: Option<bool>,
    pub context: Option<String>,
    pub kubeconfig: Option<PathBuf>,
    pub selector: Option<String>,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub tail_lines: Option<i64>,
    pub since_seconds: Option<i64>,
    pub timestamps: Option<bool>,
    pub output: Option<OutputFormat>,
    pub quiet: Option<bool>,
    pub shutdown_timeout_secs: Option<u64>,
}

impl FileConfig {
    /// Read and parse a TOML config file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }
}

/// Fully resolved settings
#[derive(Debug)]
pub struct Config {
    /// Explicit namespace; `None` falls back to the context default
    pub namespace: Option<String>,
    pub all_namespaces: bool,
    pub context: Option<String>,
    pub kubeconfig: Option<PathBuf>,
    pub selector: LabelSelector,
    pub filter: ContainerFilter,
    pub tail: TailOptions,
    pub output: OutputFormat,
    pub timestamps: bool,
    pub quiet: bool,
    pub shutdown_timeout: Duration,
}

impl Config {
    /// Load the config file named by `--config` (if any) and merge the CLI over it
    pub fn load(args: Args) -> Result<Self> {
        let file = match &args.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Self::merge(args, file)
    }

    /// Command line flags win over file values, which win over defaults
    pub fn merge(args: Args, file: FileConfig) -> Result<Self> {
        let selector_text = args.selector.or(file.selector).unwrap_or_default();
        let selector = LabelSelector::parse(&selector_text)
            .with_context(|| format!("Invalid label selector '{}'", selector_text))?;

        let include = if args.patterns.is_empty() {
            file.include
        } else {
            args.patterns
        };
        let exclude = if args.exclude.is_empty() {
            file.exclude
        } else {
            args.exclude
        };
        let filter =
            ContainerFilter::new(&include, &exclude).context("Invalid container name pattern")?;

        let defaults = TailOptions::default();
        let tail = TailOptions {
            tail_lines: args.tail_lines.or(file.tail_lines).unwrap_or(defaults.tail_lines),
            since_seconds: args.since_seconds.or(file.since_seconds),
            ..defaults
        };

        let shutdown_timeout = args
            .shutdown_timeout_secs
            .or(file.shutdown_timeout_secs)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);

        Ok(Self {
            namespace: args.namespace.or(file.namespace),
            all_namespaces: args.all_namespaces || file.all_namespaces.unwrap_or(false),
            context: args.context.or(file.context),
            kubeconfig: args.kubeconfig.or(file.kubeconfig),
            selector,
            filter,
            tail,
            output: args.output.or(file.output).unwrap_or_default(),
            timestamps: args.timestamps || file.timestamps.unwrap_or(false),
            quiet: args.quiet || file.quiet.unwrap_or(false),
            shutdown_timeout,
        })
    }
}
