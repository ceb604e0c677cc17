use std::future::Future;

use futures::stream::BoxStream;
use ktail_types::{PodSnapshot, WatchEvent};

use crate::error::WatchError;

/// Source of pod listings and incremental pod notifications
///
/// The controller calls [`list`](WatchSource::list) once, processes every
/// pod it returns, and only then subscribes with
/// [`watch`](WatchSource::watch). Implementations are expected to deliver
/// notifications for everything that changes after the listing.
pub trait WatchSource: Send + Sync + 'static {
    /// Full listing of the pods currently in scope
    fn list(&self) -> impl Future<Output = Result<Vec<PodSnapshot>, WatchError>> + Send;

    /// Incremental add/update/delete notifications, in delivery order
    fn watch(&self) -> BoxStream<'static, Result<WatchEvent, WatchError>>;
}
