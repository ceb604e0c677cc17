//! Log processing for ktail
//!
//! This crate provides the Kubernetes-backed container tailer, log line
//! parsing, and container name filtering.

mod filter;
mod parser;
mod tailer;

pub use filter::ContainerFilter;
pub use parser::LogParser;
pub use tailer::{ContainerTailer, ContainerTailerFactory, TailOptions};

// Re-export types used in our public API
pub use ktail_types::{LogEntry, LogLevel};
