//! Node membership watcher
//!
//! Subscribes to Node events and runs one reconciliation cycle per event.
//!
//! ## States
//!
//! ```text
//!            subscribe ok
//! Disconnected ──────────────► Watching ──┐ event: run one cycle
//!   ▲    │ subscribe failed        │  ◄───┘ (cycle errors are logged only)
//!   │    └─ wait backoff, retry    │
//!   └──────────────────────────────┘ stream closed: re-subscribe immediately
//!                                    stream error: wait backoff first
//! ```
//!
//! A shutdown request ends the loop from any state: while subscribing, while
//! waiting for the next event, during the backoff delay, or in the middle of a
//! cycle. The subscription is dropped on the way out.
//!
//! The subscription is never resumed in place. Reconciliation is idempotent
//! and cheap, so a fresh watch (which replays current nodes as `Added`) is
//! always safe.

use crate::apis::metrics::{record_node_event, record_watch_restart};
use crate::error::SyncError;
use crate::reconciler::Reconcile;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, WatchEvent, WatchParams};
use kube::{Client, ResourceExt};
use std::fmt;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Node lifecycle event type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeEventKind {
    Added,
    Modified,
    Deleted,
}

impl NodeEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeEventKind::Added => "Added",
            NodeEventKind::Modified => "Modified",
            NodeEventKind::Deleted => "Deleted",
        }
    }
}

impl fmt::Display for NodeEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A membership change for one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEvent {
    pub kind: NodeEventKind,
    pub node: String,
}

/// Live event stream for one subscription
pub type NodeEventStream = BoxStream<'static, Result<NodeEvent, SyncError>>;

/// Source of node event subscriptions
#[async_trait]
pub trait NodeEventSource: Send + Sync {
    /// Open a new subscription. Each call returns an independent stream.
    async fn subscribe(&self) -> Result<NodeEventStream, SyncError>;
}

/// Raw Node watch against the API server
///
/// Watches all nodes from resource version "0", so every subscription starts
/// by replaying the current nodes as `Added`. The server closes the stream
/// after `timeout_secs`, which the watcher treats as a normal closure.
pub struct KubeNodeEvents {
    api: Api<Node>,
    params: WatchParams,
}

impl KubeNodeEvents {
    pub fn new(client: Client, timeout_secs: u32) -> Self {
        Self {
            api: Api::all(client),
            params: WatchParams::default().timeout(timeout_secs),
        }
    }
}

#[async_trait]
impl NodeEventSource for KubeNodeEvents {
    async fn subscribe(&self) -> Result<NodeEventStream, SyncError> {
        let stream = self
            .api
            .watch(&self.params, "0")
            .await
            .map_err(SyncError::Subscription)?;

        Ok(stream
            .filter_map(|event| futures::future::ready(translate_watch_event(event)))
            .boxed())
    }
}

/// Map a raw watch event; bookmarks carry no membership change and are dropped
fn translate_watch_event(
    event: Result<WatchEvent<Node>, kube::Error>,
) -> Option<Result<NodeEvent, SyncError>> {
    let (kind, node) = match event {
        Ok(WatchEvent::Added(node)) => (NodeEventKind::Added, node),
        Ok(WatchEvent::Modified(node)) => (NodeEventKind::Modified, node),
        Ok(WatchEvent::Deleted(node)) => (NodeEventKind::Deleted, node),
        Ok(WatchEvent::Bookmark(_)) => return None,
        Ok(WatchEvent::Error(status)) => {
            return Some(Err(SyncError::Subscription(kube::Error::Api(status))))
        }
        Err(e) => return Some(Err(SyncError::Subscription(e))),
    };

    Some(Ok(NodeEvent {
        kind,
        node: node.name_any(),
    }))
}

/// Watcher state
enum WatchState {
    /// No subscription; wait `backoff` (if any) before the next attempt
    Disconnected { backoff: Option<Duration> },
    /// Active subscription
    Watching(NodeEventStream),
}

/// Resolves once shutdown has been requested (or the sender is gone)
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Node watcher driving a [`Reconcile`] implementation
pub struct NodeWatcher<S, R> {
    source: S,
    reconciler: R,
    backoff: Duration,
}

impl<S: NodeEventSource, R: Reconcile> NodeWatcher<S, R> {
    pub fn new(source: S, reconciler: R, backoff: Duration) -> Self {
        Self {
            source,
            reconciler,
            backoff,
        }
    }

    /// Run until shutdown is requested
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut state = WatchState::Disconnected { backoff: None };

        loop {
            state = match state {
                WatchState::Disconnected { backoff } => {
                    if let Some(delay) = backoff {
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = shutdown_requested(&mut shutdown) => {
                                info!("Shutdown requested, stopping node watcher");
                                break;
                            }
                        }
                    }

                    tokio::select! {
                        result = self.source.subscribe() => match result {
                            Ok(stream) => {
                                info!("Started watching nodes for changes");
                                WatchState::Watching(stream)
                            }
                            Err(e) => {
                                warn!(
                                    "Failed to start node watcher: {}, retrying in {}s",
                                    e,
                                    self.backoff.as_secs_f64()
                                );
                                record_watch_restart("subscribe_failed");
                                WatchState::Disconnected {
                                    backoff: Some(self.backoff),
                                }
                            }
                        },
                        _ = shutdown_requested(&mut shutdown) => {
                            info!("Shutdown requested, stopping node watcher");
                            break;
                        }
                    }
                }
                WatchState::Watching(mut stream) => {
                    let next = tokio::select! {
                        next = stream.next() => next,
                        _ = shutdown_requested(&mut shutdown) => {
                            info!("Shutdown requested, stopping node watcher");
                            break;
                        }
                    };

                    match next {
                        Some(Ok(event)) => {
                            record_node_event(event.kind.as_str());
                            info!("Node event: {} {}", event.kind, event.node);

                            tokio::select! {
                                result = self.reconciler.reconcile() => {
                                    if let Err(e) = result {
                                        error!("Failed to update upstream config: {}", e);
                                    }
                                }
                                _ = shutdown_requested(&mut shutdown) => {
                                    info!("Shutdown requested during reconciliation, stopping node watcher");
                                    break;
                                }
                            }

                            WatchState::Watching(stream)
                        }
                        Some(Err(e)) => {
                            warn!(
                                "Node watch error: {}, restarting watcher in {}s",
                                e,
                                self.backoff.as_secs_f64()
                            );
                            record_watch_restart("error");
                            WatchState::Disconnected {
                                backoff: Some(self.backoff),
                            }
                        }
                        None => {
                            info!("Node watch channel closed, restarting watcher");
                            record_watch_restart("closed");
                            WatchState::Disconnected { backoff: None }
                        }
                    }
                }
            };
        }

        debug!("Node watcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciler::CycleReport;
    use common::ResolvedPort;
    use futures::stream;
    use kube::core::ErrorResponse;
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    const BACKOFF: Duration = Duration::from_secs(5);
    const WAIT: Duration = Duration::from_secs(30);

    /// What one `subscribe()` call does
    enum Script {
        Fail,
        /// Stream yields these items, then closes
        Events(Vec<Result<NodeEvent, SyncError>>),
        /// Stream yields these items, then stays open
        EventsThenHang(Vec<Result<NodeEvent, SyncError>>),
    }

    struct FakeSource {
        scripts: Mutex<VecDeque<Script>>,
        attempts: Arc<Mutex<Vec<Instant>>>,
        attempt_tx: mpsc::UnboundedSender<()>,
    }

    impl FakeSource {
        fn new(
            scripts: Vec<Script>,
        ) -> (Self, Arc<Mutex<Vec<Instant>>>, mpsc::UnboundedReceiver<()>) {
            let attempts = Arc::new(Mutex::new(Vec::new()));
            let (attempt_tx, attempt_rx) = mpsc::unbounded_channel();
            let source = Self {
                scripts: Mutex::new(scripts.into()),
                attempts: attempts.clone(),
                attempt_tx,
            };
            (source, attempts, attempt_rx)
        }
    }

    #[async_trait]
    impl NodeEventSource for FakeSource {
        async fn subscribe(&self) -> Result<NodeEventStream, SyncError> {
            self.attempts.lock().unwrap().push(Instant::now());
            let _ = self.attempt_tx.send(());

            let script = self.scripts.lock().unwrap().pop_front();
            match script {
                Some(Script::Fail) => Err(subscription_error()),
                Some(Script::Events(events)) => Ok(stream::iter(events).boxed()),
                Some(Script::EventsThenHang(events)) => {
                    Ok(stream::iter(events).chain(stream::pending()).boxed())
                }
                // Out of script: subscription never completes
                None => futures::future::pending().await,
            }
        }
    }

    /// Counts cycles; optionally fails or never finishes
    #[derive(Clone)]
    struct FakeReconciler {
        calls: Arc<AtomicUsize>,
        started_tx: mpsc::UnboundedSender<()>,
        fail: bool,
        hang: bool,
    }

    impl FakeReconciler {
        fn new() -> (Self, mpsc::UnboundedReceiver<()>) {
            let (started_tx, started_rx) = mpsc::unbounded_channel();
            let reconciler = Self {
                calls: Arc::new(AtomicUsize::new(0)),
                started_tx,
                fail: false,
                hang: false,
            };
            (reconciler, started_rx)
        }
    }

    #[async_trait]
    impl Reconcile for FakeReconciler {
        async fn reconcile(&self) -> Result<CycleReport, SyncError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let _ = self.started_tx.send(());
            if self.hang {
                futures::future::pending::<()>().await;
            }
            if self.fail {
                return Err(SyncError::ReloadCommandMissing);
            }
            Ok(CycleReport {
                port: ResolvedPort(8080),
                upstreams: vec!["10.0.0.1:8080".to_string()],
                path: PathBuf::from("/tmp/upstream.conf"),
            })
        }
    }

    fn subscription_error() -> SyncError {
        SyncError::Subscription(kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "too old resource version".to_string(),
            reason: "Expired".to_string(),
            code: 410,
        }))
    }

    fn event(kind: NodeEventKind, node: &str) -> Result<NodeEvent, SyncError> {
        Ok(NodeEvent {
            kind,
            node: node.to_string(),
        })
    }

    async fn recv_n(rx: &mut mpsc::UnboundedReceiver<()>, n: usize) {
        for _ in 0..n {
            tokio::time::timeout(WAIT, rx.recv())
                .await
                .expect("Timed out waiting for watcher")
                .expect("Channel closed");
        }
    }

    #[tokio::test]
    async fn test_resubscribes_after_stream_closure() {
        let (source, attempts, _attempt_rx) = FakeSource::new(vec![
            Script::Events(vec![
                event(NodeEventKind::Added, "a"),
                event(NodeEventKind::Added, "b"),
            ]),
            Script::EventsThenHang(vec![event(NodeEventKind::Deleted, "b")]),
        ]);
        let (reconciler, mut started_rx) = FakeReconciler::new();
        let calls = reconciler.calls.clone();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(NodeWatcher::new(source, reconciler, BACKOFF).run(shutdown_rx));

        recv_n(&mut started_rx, 3).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3, "One cycle per event");
        assert_eq!(attempts.lock().unwrap().len(), 2, "Re-subscribed after closure");

        shutdown_tx.send(true).expect("Watcher alive");
        tokio::time::timeout(WAIT, handle)
            .await
            .expect("Watcher should stop")
            .expect("Watcher task should not panic");
    }

    #[tokio::test]
    async fn test_cycle_failure_keeps_subscription() {
        let (source, attempts, _attempt_rx) = FakeSource::new(vec![Script::EventsThenHang(vec![
            event(NodeEventKind::Modified, "a"),
            event(NodeEventKind::Modified, "a"),
            event(NodeEventKind::Modified, "b"),
        ])]);
        let (mut reconciler, mut started_rx) = FakeReconciler::new();
        reconciler.fail = true;
        let calls = reconciler.calls.clone();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(NodeWatcher::new(source, reconciler, BACKOFF).run(shutdown_rx));

        recv_n(&mut started_rx, 3).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            attempts.lock().unwrap().len(),
            1,
            "Failed cycles must not tear down the subscription"
        );

        shutdown_tx.send(true).expect("Watcher alive");
        tokio::time::timeout(WAIT, handle)
            .await
            .expect("Watcher should stop")
            .expect("Watcher task should not panic");
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscription_failure_retries_after_backoff() {
        let (source, attempts, _attempt_rx) = FakeSource::new(vec![
            Script::Fail,
            Script::EventsThenHang(vec![event(NodeEventKind::Added, "a")]),
        ]);
        let (reconciler, mut started_rx) = FakeReconciler::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(NodeWatcher::new(source, reconciler, BACKOFF).run(shutdown_rx));

        recv_n(&mut started_rx, 1).await;
        {
            let attempts = attempts.lock().unwrap();
            assert_eq!(attempts.len(), 2);
            let gap = attempts[1] - attempts[0];
            assert!(gap >= BACKOFF, "Retry came after {:?}", gap);
            assert!(gap < BACKOFF + Duration::from_secs(1), "Retry came after {:?}", gap);
        }

        shutdown_tx.send(true).expect("Watcher alive");
        handle.await.expect("Watcher task should not panic");
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_closure_resubscribes_immediately() {
        let (source, attempts, _attempt_rx) = FakeSource::new(vec![
            Script::Events(vec![]),
            Script::EventsThenHang(vec![event(NodeEventKind::Added, "a")]),
        ]);
        let (reconciler, mut started_rx) = FakeReconciler::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(NodeWatcher::new(source, reconciler, BACKOFF).run(shutdown_rx));

        recv_n(&mut started_rx, 1).await;
        {
            let attempts = attempts.lock().unwrap();
            assert_eq!(attempts.len(), 2);
            assert_eq!(attempts[1] - attempts[0], Duration::ZERO);
        }

        shutdown_tx.send(true).expect("Watcher alive");
        handle.await.expect("Watcher task should not panic");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_error_resubscribes_after_backoff() {
        let (source, attempts, _attempt_rx) = FakeSource::new(vec![
            Script::EventsThenHang(vec![Err(subscription_error())]),
            Script::EventsThenHang(vec![event(NodeEventKind::Added, "a")]),
        ]);
        let (reconciler, mut started_rx) = FakeReconciler::new();
        let calls = reconciler.calls.clone();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(NodeWatcher::new(source, reconciler, BACKOFF).run(shutdown_rx));

        recv_n(&mut started_rx, 1).await;
        {
            let attempts = attempts.lock().unwrap();
            assert_eq!(attempts.len(), 2);
            let gap = attempts[1] - attempts[0];
            assert!(gap >= BACKOFF, "Re-subscribed after {:?}", gap);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1, "Errors do not trigger cycles");

        shutdown_tx.send(true).expect("Watcher alive");
        handle.await.expect("Watcher task should not panic");
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_preempts_backoff() {
        let (source, attempts, mut attempt_rx) =
            FakeSource::new(vec![Script::Fail, Script::Fail, Script::Fail]);
        let (reconciler, _started_rx) = FakeReconciler::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let start = Instant::now();

        let handle = tokio::spawn(NodeWatcher::new(source, reconciler, BACKOFF).run(shutdown_rx));

        recv_n(&mut attempt_rx, 1).await;
        shutdown_tx.send(true).expect("Watcher alive");
        handle.await.expect("Watcher task should not panic");

        assert!(start.elapsed() < BACKOFF, "Shutdown must not wait out the backoff");
        assert_eq!(attempts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_while_subscribing() {
        // Empty script: subscribe() never completes
        let (source, _attempts, mut attempt_rx) = FakeSource::new(vec![]);
        let (reconciler, _started_rx) = FakeReconciler::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(NodeWatcher::new(source, reconciler, BACKOFF).run(shutdown_rx));

        recv_n(&mut attempt_rx, 1).await;
        shutdown_tx.send(true).expect("Watcher alive");
        tokio::time::timeout(WAIT, handle)
            .await
            .expect("Watcher should stop")
            .expect("Watcher task should not panic");
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_in_flight_cycle() {
        let (source, _attempts, _attempt_rx) =
            FakeSource::new(vec![Script::EventsThenHang(vec![event(NodeEventKind::Added, "a")])]);
        let (mut reconciler, mut started_rx) = FakeReconciler::new();
        reconciler.hang = true;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(NodeWatcher::new(source, reconciler, BACKOFF).run(shutdown_rx));

        recv_n(&mut started_rx, 1).await;
        shutdown_tx.send(true).expect("Watcher alive");
        tokio::time::timeout(WAIT, handle)
            .await
            .expect("Watcher should stop")
            .expect("Watcher task should not panic");
    }

    #[tokio::test]
    async fn test_dropped_shutdown_sender_stops_watcher() {
        let (source, _attempts, _attempt_rx) = FakeSource::new(vec![Script::EventsThenHang(vec![])]);
        let (reconciler, _started_rx) = FakeReconciler::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        drop(shutdown_tx);

        tokio::time::timeout(WAIT, NodeWatcher::new(source, reconciler, BACKOFF).run(shutdown_rx))
            .await
            .expect("Watcher should stop once the shutdown sender is gone");
    }

    #[test]
    fn test_translate_watch_events() {
        let node = Node {
            metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                name: Some("worker-1".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };

        let added = translate_watch_event(Ok(WatchEvent::Added(node.clone())))
            .expect("Added is forwarded")
            .expect("Added is not an error");
        assert_eq!(added.kind, NodeEventKind::Added);
        assert_eq!(added.node, "worker-1");

        let deleted = translate_watch_event(Ok(WatchEvent::Deleted(node)))
            .expect("Deleted is forwarded")
            .expect("Deleted is not an error");
        assert_eq!(deleted.kind, NodeEventKind::Deleted);

        let error = translate_watch_event(Ok(WatchEvent::Error(ErrorResponse {
            status: "Failure".to_string(),
            message: "too old resource version".to_string(),
            reason: "Expired".to_string(),
            code: 410,
        })))
        .expect("Errors are forwarded");
        assert!(matches!(error, Err(SyncError::Subscription(_))));
    }
}
