use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use ktail_types::{ContainerKey, ContainerSpec, LabelSelector, PodSnapshot, WatchEvent};

use crate::callbacks::{Callbacks, OnError};
use crate::error::{ControllerError, TailError};
use crate::registry::{TailerEntry, TailerRegistry};
use crate::source::WatchSource;
use crate::tailer::{DiscoveryMode, Tailer, TailerFactory};

/// How long shutdown waits for tailer tasks before aborting them
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Counters describing what the controller has done so far
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ControllerStats {
    pub admitted: u64,
    pub rejected: u64,
    pub evicted: u64,
    pub failed: u64,
    pub malformed: u64,
    pub watch_errors: u64,
    pub active: usize,
}

#[derive(Default)]
struct Counters {
    admitted: AtomicU64,
    rejected: AtomicU64,
    evicted: AtomicU64,
    failed: AtomicU64,
    malformed: AtomicU64,
    watch_errors: AtomicU64,
}

/// Keeps one tailer running per container of every matching pod
pub struct Controller<S, F: TailerFactory> {
    source: S,
    factory: F,
    namespace: Option<String>,
    selector: LabelSelector,
    callbacks: Callbacks,
    registry: TailerRegistry<F::Tailer>,
    /// Tasks of evicted tailers that may still be winding down
    stopping: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<Counters>,
    shutdown_timeout: Duration,
}

impl<S, F> Controller<S, F>
where
    S: WatchSource,
    F: TailerFactory,
{
    /// Create a controller. No I/O happens until [`run`](Self::run).
    ///
    /// `namespace` of `None` means every namespace the source reports.
    pub fn new(
        source: S,
        factory: F,
        namespace: Option<String>,
        selector: LabelSelector,
        callbacks: Callbacks,
    ) -> Self {
        Self {
            source,
            factory,
            namespace,
            selector,
            callbacks,
            registry: TailerRegistry::new(),
            stopping: Mutex::new(Vec::new()),
            counters: Arc::new(Counters::default()),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    /// Bound on how long [`shutdown`](Self::shutdown) waits for tailer tasks
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// List pods, admit what is already running, then follow the watch
    /// stream until `shutdown` is cancelled.
    ///
    /// All tailers are stopped before this returns.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), ControllerError> {
        let pods = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            listed = self.source.list() => listed.map_err(ControllerError::InitialList)?,
        };

        tracing::info!(
            namespace = self.namespace.as_deref().unwrap_or("*"),
            selector = %self.selector,
            pods = pods.len(),
            "initial pod listing"
        );
        for pod in &pods {
            self.on_pod_added(pod, DiscoveryMode::Discovered);
        }

        let mut events = self.source.watch();
        let result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                next = events.next() => match next {
                    Some(Ok(event)) => self.handle_event(event),
                    Some(Err(e)) => {
                        self.counters.watch_errors.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(error = %e, "watch error");
                    }
                    None => break Err(ControllerError::WatchClosed),
                },
            }
        };

        self.shutdown().await;
        result
    }

    /// Apply one watch notification
    pub fn handle_event(&self, event: WatchEvent) {
        match event {
            WatchEvent::Added(pod) => self.on_pod_added(&pod, DiscoveryMode::Live),
            WatchEvent::Updated(pod) => {
                tracing::trace!(namespace = %pod.namespace, pod = %pod.name, "ignoring pod update");
            }
            WatchEvent::Deleted(pod) => self.on_pod_deleted(&pod),
            WatchEvent::Malformed { kind, reason } => {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(kind = kind.as_str(), %reason, "dropping malformed watch notification");
            }
        }
    }

    /// Stop every tailer and wait for their tasks, up to the shutdown timeout.
    ///
    /// `on_exit` fires for each container that was still registered.
    pub async fn shutdown(&self) {
        let mut tasks = std::mem::take(&mut *self.stopping.lock());

        for (key, entry) in self.registry.drain() {
            entry.stop();
            tracing::debug!(%key, "stopping tailer");
            (self.callbacks.on_exit)(&entry.pod, &entry.container);
            tasks.push(entry.into_task());
        }

        if tasks.is_empty() {
            return;
        }

        let count = tasks.len();
        let aborts: Vec<_> = tasks.iter().map(|t| t.abort_handle()).collect();
        match tokio::time::timeout(self.shutdown_timeout, futures::future::join_all(tasks)).await {
            Ok(_) => tracing::debug!(count, "all tailers stopped"),
            Err(_) => {
                let remaining = aborts.iter().filter(|a| !a.is_finished()).count();
                tracing::warn!(
                    remaining,
                    timeout = ?self.shutdown_timeout,
                    "tailers did not stop in time; aborting"
                );
                for handle in aborts {
                    handle.abort();
                }
            }
        }
    }

    /// Current counters
    pub fn stats(&self) -> ControllerStats {
        ControllerStats {
            admitted: self.counters.admitted.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            evicted: self.counters.evicted.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            malformed: self.counters.malformed.load(Ordering::Relaxed),
            watch_errors: self.counters.watch_errors.load(Ordering::Relaxed),
            active: self.registry.len(),
        }
    }

    /// Keys that currently have a registered tailer
    pub fn active_keys(&self) -> Vec<ContainerKey> {
        self.registry.keys()
    }

    fn in_scope(&self, pod: &PodSnapshot) -> bool {
        let namespace_ok = self.namespace.as_deref().is_none_or(|ns| ns == pod.namespace);
        namespace_ok && self.selector.matches(&pod.labels)
    }

    fn on_pod_added(&self, pod: &PodSnapshot, mode: DiscoveryMode) {
        if !self.in_scope(pod) {
            return;
        }
        for container in &pod.containers {
            self.add_container(pod, container, mode);
        }
    }

    fn on_pod_deleted(&self, pod: &PodSnapshot) {
        for container in &pod.containers {
            self.delete_container(pod, container);
        }
    }

    fn add_container(&self, pod: &PodSnapshot, container: &ContainerSpec, mode: DiscoveryMode) {
        let key = pod.key_for(container);

        // Admission is serialized: the gate, construction and spawn all run
        // under the registry lock.
        let mut registry = self.registry.lock();
        if registry.contains(&key) {
            tracing::trace!(%key, "container already tailed");
            return;
        }

        if !(self.callbacks.on_enter)(pod, container) {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(%key, "container rejected by enter callback");
            return;
        }

        let target_pod = pod.clone();
        let target_container = container.clone();

        let tailer = Arc::new(self.factory.create(
            target_pod.clone(),
            target_container.clone(),
            mode,
            Arc::clone(&self.callbacks.on_event),
        ));
        let task = spawn_tailer(
            Arc::clone(&tailer),
            key.clone(),
            target_pod.clone(),
            target_container.clone(),
            Arc::clone(&self.callbacks.on_error),
            Arc::clone(&self.counters),
        );

        let entry = TailerEntry::new(target_pod, target_container, tailer, task);
        if let Err(duplicate) = registry.try_insert(key.clone(), entry) {
            duplicate.stop();
            tracing::warn!(%key, "duplicate tailer discarded");
            return;
        }

        self.counters.admitted.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(%key, ?mode, "tailer started");
    }

    fn delete_container(&self, pod: &PodSnapshot, container: &ContainerSpec) {
        let key = pod.key_for(container);

        let removed = {
            let mut registry = self.registry.lock();
            let removed = registry.remove(&key);
            if let Some(entry) = &removed {
                entry.stop();
            }
            removed
        };

        let Some(entry) = removed else {
            tracing::trace!(%key, "delete for untracked container");
            return;
        };

        {
            let mut stopping = self.stopping.lock();
            stopping.retain(|task| !task.is_finished());
            stopping.push(entry.into_task());
        }

        self.counters.evicted.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(%key, "tailer stopped");
        (self.callbacks.on_exit)(pod, container);
    }
}

/// Run a tailer on its own task, reporting failures and panics through `on_error`
fn spawn_tailer<T: Tailer>(
    tailer: Arc<T>,
    key: ContainerKey,
    pod: PodSnapshot,
    container: ContainerSpec,
    on_error: OnError,
    counters: Arc<Counters>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let err = match AssertUnwindSafe(tailer.run()).catch_unwind().await {
            Ok(Ok(())) => {
                tracing::debug!(%key, "tailer finished");
                return;
            }
            Ok(Err(e)) => e,
            Err(panic) => TailError::Panicked(panic_message(panic.as_ref())),
        };

        counters.failed.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(%key, error = %err, "tailer failed");
        on_error(&pod, &container, &err);
    })
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::OnEvent;
    use crate::error::WatchError;
    use futures::stream::BoxStream;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use tokio::sync::mpsc;

    type Feed = mpsc::UnboundedSender<Result<WatchEvent, WatchError>>;

    struct ChannelSource {
        listing: Mutex<Option<Result<Vec<PodSnapshot>, WatchError>>>,
        events: Mutex<Option<mpsc::UnboundedReceiver<Result<WatchEvent, WatchError>>>>,
    }

    impl ChannelSource {
        fn new(listing: Result<Vec<PodSnapshot>, WatchError>) -> (Self, Feed) {
            let (tx, rx) = mpsc::unbounded_channel();
            let source = Self {
                listing: Mutex::new(Some(listing)),
                events: Mutex::new(Some(rx)),
            };
            (source, tx)
        }
    }

    impl WatchSource for ChannelSource {
        async fn list(&self) -> Result<Vec<PodSnapshot>, WatchError> {
            self.listing.lock().take().unwrap_or_else(|| Ok(Vec::new()))
        }

        fn watch(&self) -> BoxStream<'static, Result<WatchEvent, WatchError>> {
            let rx = self.events.lock().take().expect("watch called once");
            futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|ev| (ev, rx)) })
                .boxed()
        }
    }

    #[derive(Clone, Copy)]
    enum Behavior {
        UntilStopped,
        Fail,
        Panic,
        /// Never returns and ignores `stop`
        Hang,
    }

    #[derive(Default)]
    struct Control {
        stops: AtomicUsize,
        token: CancellationToken,
        dropped: AtomicBool,
    }

    /// Marks the run future as dropped
    struct DropFlag(Arc<Control>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.dropped.store(true, Ordering::SeqCst);
        }
    }

    struct ScriptedTailer {
        control: Arc<Control>,
        behavior: Behavior,
    }

    impl Tailer for ScriptedTailer {
        async fn run(&self) -> Result<(), TailError> {
            match self.behavior {
                Behavior::UntilStopped => {
                    self.control.token.cancelled().await;
                    Ok(())
                }
                Behavior::Fail => Err(TailError::Read("connection reset".into())),
                Behavior::Panic => panic!("tailer exploded"),
                Behavior::Hang => {
                    let _flag = DropFlag(Arc::clone(&self.control));
                    futures::future::pending::<()>().await;
                    Ok(())
                }
            }
        }

        fn stop(&self) {
            self.control.stops.fetch_add(1, Ordering::SeqCst);
            if !matches!(self.behavior, Behavior::Hang) {
                self.control.token.cancel();
            }
        }
    }

    #[derive(Default)]
    struct ScriptedFactory {
        created: Arc<Mutex<Vec<(ContainerKey, DiscoveryMode, Arc<Control>)>>>,
        failing: HashSet<String>,
        panicking: HashSet<String>,
        hanging: HashSet<String>,
    }

    impl TailerFactory for ScriptedFactory {
        type Tailer = ScriptedTailer;

        fn create(
            &self,
            pod: PodSnapshot,
            container: ContainerSpec,
            mode: DiscoveryMode,
            _on_event: OnEvent,
        ) -> ScriptedTailer {
            let behavior = if self.failing.contains(&container.name) {
                Behavior::Fail
            } else if self.panicking.contains(&container.name) {
                Behavior::Panic
            } else if self.hanging.contains(&container.name) {
                Behavior::Hang
            } else {
                Behavior::UntilStopped
            };
            let control = Arc::new(Control::default());
            self.created
                .lock()
                .push((pod.key_for(&container), mode, Arc::clone(&control)));
            ScriptedTailer { control, behavior }
        }
    }

    #[derive(Default)]
    struct Recorder {
        enters: Mutex<Vec<ContainerKey>>,
        exits: Mutex<Vec<ContainerKey>>,
        errors: Mutex<Vec<(PodSnapshot, ContainerSpec, String)>>,
    }

    fn callbacks(recorder: &Arc<Recorder>, deny: &'static [&'static str]) -> Callbacks {
        let enters = Arc::clone(recorder);
        let exits = Arc::clone(recorder);
        let errors = Arc::clone(recorder);
        Callbacks::new()
            .on_enter(move |pod, container| {
                enters.enters.lock().push(pod.key_for(container));
                !deny.contains(&container.name.as_str())
            })
            .on_exit(move |pod, container| exits.exits.lock().push(pod.key_for(container)))
            .on_error(move |pod, container, err| {
                errors
                    .errors
                    .lock()
                    .push((pod.clone(), container.clone(), err.to_string()))
            })
    }

    fn pod(name: &str, app: &str, containers: &[&str]) -> PodSnapshot {
        let mut pod = PodSnapshot::new("ns", name).with_label("app", app);
        for c in containers {
            pod = pod.with_container(*c);
        }
        pod
    }

    fn key(pod: &str, container: &str) -> ContainerKey {
        ContainerKey::new("ns", pod, container)
    }

    struct Harness {
        controller: Arc<Controller<ChannelSource, ScriptedFactory>>,
        created: Arc<Mutex<Vec<(ContainerKey, DiscoveryMode, Arc<Control>)>>>,
        recorder: Arc<Recorder>,
        feed: Feed,
        shutdown: CancellationToken,
        run: JoinHandle<Result<(), ControllerError>>,
    }

    impl Harness {
        fn start(listing: Vec<PodSnapshot>, factory: ScriptedFactory, deny: &'static [&'static str]) -> Self {
            let (source, feed) = ChannelSource::new(Ok(listing));
            let created = Arc::clone(&factory.created);
            let recorder = Arc::new(Recorder::default());
            let controller = Arc::new(
                Controller::new(
                    source,
                    factory,
                    Some("ns".to_string()),
                    LabelSelector::parse("app=x").unwrap(),
                    callbacks(&recorder, deny),
                )
                .with_shutdown_timeout(Duration::from_secs(1)),
            );
            let shutdown = CancellationToken::new();
            let run = {
                let controller = Arc::clone(&controller);
                let shutdown = shutdown.clone();
                tokio::spawn(async move { controller.run(shutdown).await })
            };
            Self {
                controller,
                created,
                recorder,
                feed,
                shutdown,
                run,
            }
        }

        fn send(&self, event: WatchEvent) {
            self.feed.send(Ok(event)).unwrap();
        }

        /// Push a matching sentinel pod and wait until it is registered, so
        /// every earlier notification has been processed.
        async fn sync(&self, tag: &str) {
            let name = format!("sentinel-{tag}");
            self.send(WatchEvent::Added(pod(&name, "x", &["s"])));
            let sentinel = key(&name, "s");
            eventually(|| self.controller.active_keys().contains(&sentinel)).await;
            self.send(WatchEvent::Deleted(pod(&name, "x", &["s"])));
            eventually(|| !self.controller.active_keys().contains(&sentinel)).await;
        }

        fn control(&self, k: &ContainerKey) -> Arc<Control> {
            self.created
                .lock()
                .iter()
                .find(|(key, _, _)| key == k)
                .map(|(_, _, control)| Arc::clone(control))
                .expect("tailer created")
        }

        fn created_for(&self, k: &ContainerKey) -> usize {
            self.created.lock().iter().filter(|(key, _, _)| key == k).count()
        }

        fn enters_for(&self, k: &ContainerKey) -> usize {
            self.recorder.enters.lock().iter().filter(|key| *key == k).count()
        }

        fn exits_for(&self, k: &ContainerKey) -> usize {
            self.recorder.exits.lock().iter().filter(|key| *key == k).count()
        }

        async fn stop(self) -> Result<(), ControllerError> {
            self.shutdown.cancel();
            self.run.await.unwrap()
        }
    }

    async fn eventually(cond: impl Fn() -> bool) {
        for _ in 0..400 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_initial_listing_admits_all_containers_as_discovered() {
        let h = Harness::start(vec![pod("p1", "x", &["c1", "c2"])], ScriptedFactory::default(), &[]);
        h.sync("a").await;

        assert!(h.controller.active_keys().contains(&key("p1", "c1")));
        assert!(h.controller.active_keys().contains(&key("p1", "c2")));
        assert_eq!(h.enters_for(&key("p1", "c1")), 1);
        assert_eq!(h.enters_for(&key("p1", "c2")), 1);

        let modes: Vec<DiscoveryMode> = h
            .created
            .lock()
            .iter()
            .filter(|(k, _, _)| k.pod == "p1")
            .map(|(_, mode, _)| *mode)
            .collect();
        assert_eq!(modes, vec![DiscoveryMode::Discovered, DiscoveryMode::Discovered]);

        let sentinel_mode = h
            .created
            .lock()
            .iter()
            .find(|(k, _, _)| k.pod == "sentinel-a")
            .map(|(_, mode, _)| *mode);
        assert_eq!(sentinel_mode, Some(DiscoveryMode::Live));

        h.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_add_is_noop() {
        let h = Harness::start(vec![pod("p1", "x", &["c1"])], ScriptedFactory::default(), &[]);
        h.send(WatchEvent::Added(pod("p1", "x", &["c1"])));
        h.send(WatchEvent::Added(pod("p1", "x", &["c1"])));
        h.sync("a").await;

        assert_eq!(h.created_for(&key("p1", "c1")), 1);
        assert_eq!(h.enters_for(&key("p1", "c1")), 1);
        h.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_selector_mismatch_produces_no_callbacks() {
        let h = Harness::start(vec![], ScriptedFactory::default(), &[]);
        h.send(WatchEvent::Added(pod("p2", "y", &["c1", "c2"])));
        h.send(WatchEvent::Deleted(pod("p2", "y", &["c1", "c2"])));
        h.sync("a").await;

        assert_eq!(h.enters_for(&key("p2", "c1")), 0);
        assert_eq!(h.exits_for(&key("p2", "c1")), 0);
        assert_eq!(h.created_for(&key("p2", "c1")), 0);
        h.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_other_namespace_is_out_of_scope() {
        let h = Harness::start(vec![], ScriptedFactory::default(), &[]);
        let mut foreign = pod("p1", "x", &["c1"]);
        foreign.namespace = "other".to_string();
        h.send(WatchEvent::Added(foreign));
        h.sync("a").await;

        assert!(h.recorder.enters.lock().iter().all(|k| k.namespace == "ns"));
        h.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_stops_tailers_and_fires_exit() {
        let h = Harness::start(vec![pod("p1", "x", &["c1", "c2"])], ScriptedFactory::default(), &[]);
        h.sync("a").await;
        let controls = [h.control(&key("p1", "c1")), h.control(&key("p1", "c2"))];

        h.send(WatchEvent::Deleted(pod("p1", "x", &["c1", "c2"])));
        h.sync("b").await;

        assert!(!h.controller.active_keys().contains(&key("p1", "c1")));
        assert!(!h.controller.active_keys().contains(&key("p1", "c2")));
        assert_eq!(h.exits_for(&key("p1", "c1")), 1);
        assert_eq!(h.exits_for(&key("p1", "c2")), 1);
        for control in &controls {
            assert_eq!(control.stops.load(Ordering::SeqCst), 1);
        }
        assert_eq!(h.controller.stats().evicted, 4);
        h.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_of_unknown_key_is_noop() {
        let h = Harness::start(vec![], ScriptedFactory::default(), &[]);
        h.send(WatchEvent::Deleted(pod("ghost", "x", &["c1"])));
        h.sync("a").await;

        assert_eq!(h.exits_for(&key("ghost", "c1")), 0);
        h.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_enter_false_prevents_tailer_and_later_exit() {
        let h = Harness::start(vec![pod("p1", "x", &["app", "istio-proxy"])], ScriptedFactory::default(), &[
            "istio-proxy",
        ]);
        h.sync("a").await;

        assert_eq!(h.enters_for(&key("p1", "istio-proxy")), 1);
        assert_eq!(h.created_for(&key("p1", "istio-proxy")), 0);
        assert!(h.controller.active_keys().contains(&key("p1", "app")));

        h.send(WatchEvent::Deleted(pod("p1", "x", &["app", "istio-proxy"])));
        h.sync("b").await;

        assert_eq!(h.exits_for(&key("p1", "app")), 1);
        assert_eq!(h.exits_for(&key("p1", "istio-proxy")), 0);
        assert_eq!(h.controller.stats().rejected, 1);
        h.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_enter_false_is_retried_on_new_add() {
        let h = Harness::start(vec![pod("p1", "x", &["istio-proxy"])], ScriptedFactory::default(), &[
            "istio-proxy",
        ]);
        h.send(WatchEvent::Added(pod("p1", "x", &["istio-proxy"])));
        h.sync("a").await;

        assert_eq!(h.enters_for(&key("p1", "istio-proxy")), 2);
        h.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_tailer_error_reports_snapshot_and_keeps_entry() {
        let factory = ScriptedFactory {
            failing: HashSet::from(["c1".to_string()]),
            ..Default::default()
        };
        let original = pod("p1", "x", &["c1"]);
        let h = Harness::start(vec![original.clone()], factory, &[]);

        eventually(|| h.recorder.errors.lock().len() == 1).await;
        h.sync("a").await;

        let errors = h.recorder.errors.lock().clone();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, original);
        assert_eq!(errors[0].1, ContainerSpec::new("c1"));
        assert!(errors[0].2.contains("connection reset"));
        assert!(h.controller.active_keys().contains(&key("p1", "c1")));
        assert_eq!(h.controller.stats().failed, 1);

        h.send(WatchEvent::Deleted(pod("p1", "x", &["c1"])));
        h.sync("b").await;
        assert_eq!(h.exits_for(&key("p1", "c1")), 1);
        assert_eq!(h.recorder.errors.lock().len(), 1);
        h.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_panicking_tailer_is_isolated() {
        let factory = ScriptedFactory {
            panicking: HashSet::from(["bad".to_string()]),
            ..Default::default()
        };
        let h = Harness::start(vec![pod("p1", "x", &["bad", "good"])], factory, &[]);

        eventually(|| h.recorder.errors.lock().len() == 1).await;
        h.sync("a").await;

        let errors = h.recorder.errors.lock().clone();
        assert_eq!(errors[0].1.name, "bad");
        assert!(errors[0].2.contains("tailer exploded"));
        assert!(h.controller.active_keys().contains(&key("p1", "good")));
        h.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_readd_after_delete_creates_new_tailer() {
        let h = Harness::start(vec![pod("p1", "x", &["c1"])], ScriptedFactory::default(), &[]);
        h.send(WatchEvent::Deleted(pod("p1", "x", &["c1"])));
        h.send(WatchEvent::Added(pod("p1", "x", &["c1"])));
        h.sync("a").await;

        assert_eq!(h.created_for(&key("p1", "c1")), 2);
        assert_eq!(h.controller.active_keys().iter().filter(|k| **k == key("p1", "c1")).count(), 1);
        h.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_updates_and_malformed_events_are_skipped() {
        let h = Harness::start(vec![], ScriptedFactory::default(), &[]);
        h.send(WatchEvent::Updated(pod("p1", "x", &["c1"])));
        h.send(WatchEvent::Malformed {
            kind: ktail_types::WatchEventKind::Added,
            reason: "missing metadata.name".to_string(),
        });
        h.feed.send(Err(WatchError::Stream("410 gone".into()))).unwrap();
        h.sync("a").await;

        assert_eq!(h.created_for(&key("p1", "c1")), 0);
        let stats = h.controller.stats();
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.watch_errors, 1);
        h.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_stops_all_tailers() {
        let h = Harness::start(vec![pod("p1", "x", &["c1", "c2"])], ScriptedFactory::default(), &[]);
        h.sync("a").await;
        let controls = [h.control(&key("p1", "c1")), h.control(&key("p1", "c2"))];
        let controller = Arc::clone(&h.controller);
        let recorder = Arc::clone(&h.recorder);

        h.stop().await.unwrap();

        assert!(controller.active_keys().is_empty());
        for control in &controls {
            assert_eq!(control.stops.load(Ordering::SeqCst), 1);
        }
        assert_eq!(recorder.exits.lock().iter().filter(|k| k.pod == "p1").count(), 2);
    }

    #[tokio::test]
    async fn test_closed_watch_is_reported() {
        let h = Harness::start(vec![pod("p1", "x", &["c1"])], ScriptedFactory::default(), &[]);
        h.sync("a").await;
        let control = h.control(&key("p1", "c1"));

        let Harness { feed, run, controller, .. } = h;
        drop(feed);

        let result = run.await.unwrap();
        assert!(matches!(result, Err(ControllerError::WatchClosed)));
        assert!(controller.active_keys().is_empty());
        assert_eq!(control.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_initial_list_failure_is_returned() {
        let (source, _feed) = ChannelSource::new(Err(WatchError::List("forbidden".into())));
        let controller = Controller::new(
            source,
            ScriptedFactory::default(),
            None,
            LabelSelector::everything(),
            Callbacks::new(),
        );

        let result = controller.run(CancellationToken::new()).await;
        assert!(matches!(result, Err(ControllerError::InitialList(_))));
    }

    #[tokio::test]
    async fn test_shutdown_aborts_tailers_that_ignore_stop() {
        let (source, _feed) = ChannelSource::new(Ok(vec![]));
        let factory = ScriptedFactory {
            hanging: HashSet::from(["stuck".to_string()]),
            ..Default::default()
        };
        let created = Arc::clone(&factory.created);
        let controller = Controller::new(
            source,
            factory,
            None,
            LabelSelector::everything(),
            Callbacks::new(),
        )
        .with_shutdown_timeout(Duration::from_millis(100));

        controller.handle_event(WatchEvent::Added(pod("p1", "x", &["stuck", "fine"])));
        let stuck = created
            .lock()
            .iter()
            .find(|(k, _, _)| k.container == "stuck")
            .map(|(_, _, control)| Arc::clone(control))
            .unwrap();
        // Let the stuck tailer reach its await point
        tokio::task::yield_now().await;

        let started = tokio::time::Instant::now();
        controller.shutdown().await;
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_millis(100), "returned after {elapsed:?}");
        assert!(elapsed < Duration::from_secs(2), "returned after {elapsed:?}");
        assert!(controller.active_keys().is_empty());
        assert_eq!(stuck.stops.load(Ordering::SeqCst), 1);
        eventually(|| stuck.dropped.load(Ordering::SeqCst)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_adds_register_one_tailer() {
        let (source, _feed) = ChannelSource::new(Ok(vec![]));
        let factory = ScriptedFactory::default();
        let created = Arc::clone(&factory.created);
        let controller = Arc::new(Controller::new(
            source,
            factory,
            None,
            LabelSelector::everything(),
            Callbacks::new(),
        ));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let controller = Arc::clone(&controller);
            handles.push(tokio::spawn(async move {
                controller.handle_event(WatchEvent::Added(pod("p1", "x", &["c1"])));
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(controller.active_keys(), vec![key("p1", "c1")]);
        assert_eq!(created.lock().len(), 1);
        controller.shutdown().await;
    }
}
