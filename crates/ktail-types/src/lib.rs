//! Shared types for ktail
//!
//! This crate contains the data structures passed between the watch source,
//! the reconciliation controller and the container tailers.

mod selector;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

pub use selector::{LabelSelector, Requirement, SelectorError};

// ============================================================================
// Kubernetes Resource Types
// ============================================================================

/// Owned snapshot of a pod as seen by the watch source.
///
/// Every value handed to a tailer or a callback is one of these, never a
/// reference into the watch source's own cache.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodSnapshot {
    pub namespace: String,
    pub name: String,
    pub uid: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub containers: Vec<ContainerSpec>,
}

impl PodSnapshot {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            uid: None,
            labels: BTreeMap::new(),
            containers: Vec::new(),
        }
    }

    /// Add a label
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Append a container by name
    pub fn with_container(mut self, name: impl Into<String>) -> Self {
        self.containers.push(ContainerSpec::new(name));
        self
    }

    /// Key for one of this pod's containers
    pub fn key_for(&self, container: &ContainerSpec) -> ContainerKey {
        ContainerKey::new(&self.namespace, &self.name, &container.name)
    }
}

/// Container entry from a pod spec
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: Option<String>,
}

impl ContainerSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: None,
        }
    }
}

/// Identity of one container of one pod: (namespace, pod, container)
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContainerKey {
    pub namespace: String,
    pub pod: String,
    pub container: String,
}

impl ContainerKey {
    pub fn new(namespace: &str, pod: &str, container: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            pod: pod.to_string(),
            container: container.to_string(),
        }
    }
}

impl fmt::Display for ContainerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.pod, self.container)
    }
}

// ============================================================================
// Watch Types
// ============================================================================

/// Kind of a watch notification
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchEventKind {
    Added,
    Updated,
    Deleted,
}

impl WatchEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
        }
    }
}

/// A watch notification, decoded once at the watch boundary
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchEvent {
    Added(PodSnapshot),
    Updated(PodSnapshot),
    Deleted(PodSnapshot),
    /// The payload could not be decoded into a pod
    Malformed {
        kind: WatchEventKind,
        reason: String,
    },
}

// ============================================================================
// Log Types
// ============================================================================

/// Log severity level
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Fatal,
    Unknown,
}

impl LogLevel {
    /// Parse log level from common formats
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "trace" | "trc" | "trce" => Self::Trace,
            "debug" | "dbg" | "debg" => Self::Debug,
            "info" | "inf" | "information" => Self::Info,
            "warn" | "warning" | "wrn" => Self::Warn,
            "error" | "err" | "erro" => Self::Error,
            "fatal" | "panic" | "critical" | "crit" | "ftl" => Self::Fatal,
            _ => Self::Unknown,
        }
    }
}

/// A single log record read from one container
#[derive(Clone, Debug, Serialize)]
pub struct LogEntry {
    /// Source namespace
    pub namespace: String,

    /// Source pod name
    pub pod: String,

    /// Source container name
    pub container: String,

    /// Line number within this container's stream
    pub line_number: u64,

    /// Original line, without the timestamp prefix
    pub raw: String,

    /// Parsed timestamp (if available)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,

    /// Detected log level
    pub level: LogLevel,

    /// Parsed structured fields (if JSON)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<HashMap<String, serde_json::Value>>,
}

impl LogEntry {
    /// Create a new log entry with minimal fields
    pub fn new(key: &ContainerKey, line_number: u64, raw: String) -> Self {
        Self {
            namespace: key.namespace.clone(),
            pod: key.pod.clone(),
            container: key.container.clone(),
            line_number,
            raw,
            timestamp: None,
            level: LogLevel::Unknown,
            fields: None,
        }
    }

    /// Get the message content (from JSON field or raw line)
    pub fn message(&self) -> &str {
        if let Some(fields) = &self.fields {
            // Try common message field names
            for key in &["message", "msg", "log", "text", "body"] {
                if let Some(serde_json::Value::String(s)) = fields.get(*key) {
                    return s;
                }
            }
        }
        &self.raw
    }
}
