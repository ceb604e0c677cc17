use thiserror::Error;

/// Boxed error from a collaborator
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Failures reported by a watch source
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("failed to list pods: {0}")]
    List(#[source] BoxError),

    #[error("watch stream error: {0}")]
    Stream(#[source] BoxError),
}

/// Abnormal termination of a single container tailer
#[derive(Debug, Error)]
pub enum TailError {
    #[error("failed to open log stream: {0}")]
    Open(#[source] BoxError),

    #[error("failed to read log stream: {0}")]
    Read(#[source] BoxError),

    #[error("tailer panicked: {0}")]
    Panicked(String),
}

/// Errors returned from [`crate::Controller::run`]
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("initial pod listing failed")]
    InitialList(#[source] WatchError),

    #[error("watch stream closed unexpectedly")]
    WatchClosed,
}
