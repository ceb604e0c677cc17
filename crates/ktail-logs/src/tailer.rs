use std::time::Duration;

use futures::{AsyncBufRead, AsyncBufReadExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::LogParams;
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;

use ktail_core::{DiscoveryMode, OnEvent, TailError, Tailer, TailerFactory};
use ktail_types::{ContainerKey, ContainerSpec, PodSnapshot};

use crate::parser::LogParser;

/// Settings shared by every container tailer
#[derive(Clone, Debug)]
pub struct TailOptions {
    /// Historical lines to fetch for containers that were already running
    pub tail_lines: i64,

    /// Only fetch history newer than this, for containers that were already running
    pub since_seconds: Option<i64>,

    /// Give up waiting for a container to start after this long
    pub start_timeout: Duration,
}

impl Default for TailOptions {
    fn default() -> Self {
        Self {
            tail_lines: 0,
            since_seconds: None,
            start_timeout: Duration::from_secs(300),
        }
    }
}

/// Builds [`ContainerTailer`]s sharing one client
pub struct ContainerTailerFactory {
    client: Client,
    options: TailOptions,
}

impl ContainerTailerFactory {
    pub fn new(client: Client, options: TailOptions) -> Self {
        Self { client, options }
    }
}

impl TailerFactory for ContainerTailerFactory {
    type Tailer = ContainerTailer;

    fn create(
        &self,
        pod: PodSnapshot,
        container: ContainerSpec,
        mode: DiscoveryMode,
        on_event: OnEvent,
    ) -> ContainerTailer {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &pod.namespace);
        ContainerTailer::new(api, &pod, &container, mode, on_event, &self.options)
    }
}

/// Follows the log of one container until stopped
pub struct ContainerTailer {
    api: Api<Pod>,
    key: ContainerKey,
    params: LogParams,
    start_timeout: Duration,
    on_event: OnEvent,
    cancel: CancellationToken,
}

impl ContainerTailer {
    pub fn new(
        api: Api<Pod>,
        pod: &PodSnapshot,
        container: &ContainerSpec,
        mode: DiscoveryMode,
        on_event: OnEvent,
        options: &TailOptions,
    ) -> Self {
        Self {
            api,
            key: pod.key_for(container),
            params: log_params(&container.name, mode, options),
            start_timeout: options.start_timeout,
            on_event,
            cancel: CancellationToken::new(),
        }
    }
}

impl Tailer for ContainerTailer {
    async fn run(&self) -> Result<(), TailError> {
        let mut backoff = Backoff::new(Duration::from_millis(250), Duration::from_secs(5));
        let deadline = tokio::time::Instant::now() + self.start_timeout;

        // A freshly created pod's containers may still be waiting to start
        let stream = loop {
            let opened = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                opened = self.api.log_stream(&self.key.pod, &self.params) => opened,
            };

            match opened {
                Ok(stream) => break stream,
                Err(e) if is_not_started(&e) && tokio::time::Instant::now() < deadline => {
                    tracing::debug!(key = %self.key, error = %e, "container not started yet; waiting");
                }
                Err(e) => return Err(TailError::Open(Box::new(e))),
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(backoff.next_delay()) => {}
            }
        };

        tracing::debug!(key = %self.key, "log stream opened");
        follow_lines(std::pin::pin!(stream), &self.key, &self.on_event, &self.cancel).await
    }

    fn stop(&self) {
        self.cancel.cancel();
    }
}

/// Deliver every line of `reader` to `on_event` until it ends or `cancel` fires.
///
/// Bytes that are not valid UTF-8 are replaced rather than ending the stream.
async fn follow_lines<R>(
    mut reader: R,
    key: &ContainerKey,
    on_event: &OnEvent,
    cancel: &CancellationToken,
) -> Result<(), TailError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let mut line_number = 0u64;

    loop {
        buf.clear();
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            read = reader.read_until(b'\n', &mut buf) => read,
        };

        match read {
            // Stream ended (container terminated)
            Ok(0) => return Ok(()),
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']);
                line_number += 1;
                on_event(LogParser::parse(line, key, line_number));
            }
            Err(e) => return Err(TailError::Read(Box::new(e))),
        }
    }
}

/// Log request for a container.
///
/// Containers that appeared after startup are read from the beginning; ones
/// that were already running only get recent history.
fn log_params(container: &str, mode: DiscoveryMode, options: &TailOptions) -> LogParams {
    let (tail_lines, since_seconds) = if mode.from_beginning() {
        (None, None)
    } else if options.since_seconds.is_some() {
        (None, options.since_seconds)
    } else {
        (Some(options.tail_lines), None)
    };

    LogParams {
        follow: true,
        container: Some(container.to_string()),
        tail_lines,
        since_seconds,
        timestamps: true,
        ..Default::default()
    }
}

/// The API answers 400 while a container is still waiting to start
fn is_not_started(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 400)
}

struct Backoff {
    cur: Duration,
    max: Duration,
}

impl Backoff {
    fn new(min: Duration, max: Duration) -> Self {
        Self { cur: min, max }
    }

    fn next_delay(&mut self) -> Duration {
        let d = self.cur;
        self.cur = std::cmp::min(self.cur * 2, self.max);
        d
    }
}
