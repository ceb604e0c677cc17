use std::fmt;
use std::sync::Arc;

use ktail_types::{ContainerSpec, LogEntry, PodSnapshot};

use crate::error::TailError;

/// Called for every log record read by a tailer
pub type OnEvent = Arc<dyn Fn(LogEntry) + Send + Sync>;

/// Admission gate: return `false` to skip tailing the container
pub type OnEnter = Arc<dyn Fn(&PodSnapshot, &ContainerSpec) -> bool + Send + Sync>;

/// Called after a container's tailer has been removed and stopped
pub type OnExit = Arc<dyn Fn(&PodSnapshot, &ContainerSpec) + Send + Sync>;

/// Called when a tailer terminates abnormally
pub type OnError = Arc<dyn Fn(&PodSnapshot, &ContainerSpec, &TailError) + Send + Sync>;

/// The hooks a caller integrates against
///
/// Only the boolean returned by `on_enter` influences the controller;
/// the others are notifications.
#[derive(Clone)]
pub struct Callbacks {
    pub on_event: OnEvent,
    pub on_enter: OnEnter,
    pub on_exit: OnExit,
    pub on_error: OnError,
}

impl Callbacks {
    /// Admit every container and ignore all notifications
    pub fn new() -> Self {
        Self {
            on_event: Arc::new(|_: LogEntry| {}),
            on_enter: Arc::new(|_: &PodSnapshot, _: &ContainerSpec| true),
            on_exit: Arc::new(|_: &PodSnapshot, _: &ContainerSpec| {}),
            on_error: Arc::new(|_: &PodSnapshot, _: &ContainerSpec, _: &TailError| {}),
        }
    }

    pub fn on_event<F>(mut self, f: F) -> Self
    where
        F: Fn(LogEntry) + Send + Sync + 'static,
    {
        self.on_event = Arc::new(f);
        self
    }

    pub fn on_enter<F>(mut self, f: F) -> Self
    where
        F: Fn(&PodSnapshot, &ContainerSpec) -> bool + Send + Sync + 'static,
    {
        self.on_enter = Arc::new(f);
        self
    }

    pub fn on_exit<F>(mut self, f: F) -> Self
    where
        F: Fn(&PodSnapshot, &ContainerSpec) + Send + Sync + 'static,
    {
        self.on_exit = Arc::new(f);
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&PodSnapshot, &ContainerSpec, &TailError) + Send + Sync + 'static,
    {
        self.on_error = Arc::new(f);
        self
    }
}

impl Default for Callbacks {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks").finish_non_exhaustive()
    }
}
