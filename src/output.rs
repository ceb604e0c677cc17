//! Rendering of log entries to stdout

use std::io::{self, Write};

use clap::ValueEnum;
use serde::Deserialize;

use ktail_logs::LogEntry;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// `pod/container message`, using the message field of JSON logs
    #[default]
    Text,
    /// One JSON object per line
    Json,
    /// The message only, as for text
    Raw,
}

/// Formats entries for one output stream
#[derive(Clone, Debug)]
pub struct Printer {
    format: OutputFormat,
    timestamps: bool,
    show_namespace: bool,
}

impl Printer {
    pub fn new(format: OutputFormat, timestamps: bool, show_namespace: bool) -> Self {
        Self {
            format,
            timestamps,
            show_namespace,
        }
    }

    /// Render one entry as a single line (without the newline)
    pub fn format(&self, entry: &LogEntry) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string(entry).unwrap_or_else(|_| entry.raw.clone()),
            OutputFormat::Raw => entry.message().to_string(),
            OutputFormat::Text => {
                let mut line = String::new();
                if self.timestamps {
                    if let Some(ts) = entry.timestamp {
                        line.push_str(&ts.format("%Y-%m-%dT%H:%M:%S%.3fZ ").to_string());
                    }
                }
                if self.show_namespace {
                    line.push_str(&entry.namespace);
                    line.push('/');
                }
                line.push_str(&entry.pod);
                line.push('/');
                line.push_str(&entry.container);
                line.push(' ');
                line.push_str(entry.message());
                line
            }
        }
    }

    /// Write one entry to stdout
    pub fn print(&self, entry: &LogEntry) -> io::Result<()> {
        let line = self.format(entry);
        let mut out = io::stdout().lock();
        writeln!(out, "{}", line)?;
        out.flush()
    }
}
