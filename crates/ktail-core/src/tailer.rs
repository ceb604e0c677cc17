use std::future::Future;

use ktail_types::{ContainerSpec, PodSnapshot};

use crate::callbacks::OnEvent;
use crate::error::TailError;

/// How a container came to be tailed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiscoveryMode {
    /// Already running when the controller started (found by the initial listing)
    Discovered,
    /// Appeared through a live add notification
    Live,
}

impl DiscoveryMode {
    /// Whether the tail should start from the beginning of the container's output
    pub fn from_beginning(&self) -> bool {
        matches!(self, Self::Live)
    }
}

/// Long-running log reader for exactly one container
pub trait Tailer: Send + Sync + 'static {
    /// Stream logs until the stream ends, fails, or [`stop`](Tailer::stop) is called
    fn run(&self) -> impl Future<Output = Result<(), TailError>> + Send;

    /// Request the tailer to stop.
    ///
    /// Must not block and must be safe to call any number of times, before
    /// or after `run` has returned.
    fn stop(&self);
}

/// Builds a tailer for an admitted container
pub trait TailerFactory: Send + Sync + 'static {
    type Tailer: Tailer;

    fn create(
        &self,
        pod: PodSnapshot,
        container: ContainerSpec,
        mode: DiscoveryMode,
        on_event: OnEvent,
    ) -> Self::Tailer;
}
