//! Reconciliation controller for ktail
//!
//! This crate keeps exactly one log tailer running per container of every
//! pod that matches a label selector. The watch source and the tailer
//! implementation are collaborators supplied by the caller through the
//! [`WatchSource`] and [`TailerFactory`] traits.

mod callbacks;
mod controller;
mod error;
mod registry;
mod source;
mod tailer;

pub use callbacks::{Callbacks, OnEnter, OnError, OnEvent, OnExit};
pub use controller::{Controller, ControllerStats, DEFAULT_SHUTDOWN_TIMEOUT};
pub use error::{BoxError, ControllerError, TailError, WatchError};
pub use registry::{RegistryGuard, TailerEntry, TailerRegistry};
pub use source::WatchSource;
pub use tailer::{DiscoveryMode, Tailer, TailerFactory};

// Re-export types used in our public API
pub use ktail_types::{
    ContainerKey, ContainerSpec, LabelSelector, LogEntry, PodSnapshot, WatchEvent, WatchEventKind,
};
