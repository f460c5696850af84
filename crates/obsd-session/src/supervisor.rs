use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use futures::FutureExt;
use obsd_core::{EventBus, SessionId};
use obsd_telemetry::{ConnectionMetrics, Metric, MetricsSnapshot};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::{AbortHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cache::Caches;
use crate::config::SessionOptions;
use crate::connection::{Connection, ConnectionHandle};
use crate::error::SessionError;
use crate::event_handler::{EventHandler, EventHandlerHandle};
use crate::scenes::{SceneManager, SceneManagerHandle};
use crate::stats::{StatsCollector, StatsCollectorHandle};
use crate::stream::{StreamManager, StreamManagerHandle};
use crate::task_pool::{TaskPool, TaskPoolHandle};
use crate::tracker::{RequestTracker, TrackerHandle};

const SESSION_STREAM_CAPACITY: usize = 256;

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// The seven per-session components.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    Connection,
    RequestTracker,
    EventHandler,
    SceneManager,
    StreamManager,
    StatsCollector,
    TaskPool,
}

impl ComponentKind {
    pub const ALL: [ComponentKind; 7] = [
        Self::Connection,
        Self::RequestTracker,
        Self::EventHandler,
        Self::SceneManager,
        Self::StreamManager,
        Self::StatsCollector,
        Self::TaskPool,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::RequestTracker => "request_tracker",
            Self::EventHandler => "event_handler",
            Self::SceneManager => "scene_manager",
            Self::StreamManager => "stream_manager",
            Self::StatsCollector => "stats_collector",
            Self::TaskPool => "task_pool",
        }
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComponentKind {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| SessionError::ComponentNotFound(s.to_string()))
    }
}

/// A handle to one running component.
#[derive(Clone)]
pub enum Component {
    Connection(ConnectionHandle),
    RequestTracker(TrackerHandle),
    EventHandler(EventHandlerHandle),
    SceneManager(SceneManagerHandle),
    StreamManager(StreamManagerHandle),
    StatsCollector(StatsCollectorHandle),
    TaskPool(TaskPoolHandle),
}

impl Component {
    pub fn kind(&self) -> ComponentKind {
        match self {
            Self::Connection(_) => ComponentKind::Connection,
            Self::RequestTracker(_) => ComponentKind::RequestTracker,
            Self::EventHandler(_) => ComponentKind::EventHandler,
            Self::SceneManager(_) => ComponentKind::SceneManager,
            Self::StreamManager(_) => ComponentKind::StreamManager,
            Self::StatsCollector(_) => ComponentKind::StatsCollector,
            Self::TaskPool(_) => ComponentKind::TaskPool,
        }
    }
}

impl fmt::Debug for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Component").field(&self.kind()).finish()
    }
}

/// Handles of the current group. Absent while the group is being replaced.
struct SessionComponents {
    connection: ConnectionHandle,
    tracker: TrackerHandle,
    events: EventHandlerHandle,
    scenes: SceneManagerHandle,
    stream: StreamManagerHandle,
    stats: StatsCollectorHandle,
    pool: TaskPoolHandle,
    aborts: HashMap<ComponentKind, AbortHandle>,
}

impl SessionComponents {
    fn get(&self, kind: ComponentKind) -> Component {
        match kind {
            ComponentKind::Connection => Component::Connection(self.connection.clone()),
            ComponentKind::RequestTracker => Component::RequestTracker(self.tracker.clone()),
            ComponentKind::EventHandler => Component::EventHandler(self.events.clone()),
            ComponentKind::SceneManager => Component::SceneManager(self.scenes.clone()),
            ComponentKind::StreamManager => Component::StreamManager(self.stream.clone()),
            ComponentKind::StatsCollector => Component::StatsCollector(self.stats.clone()),
            ComponentKind::TaskPool => Component::TaskPool(self.pool.clone()),
        }
    }
}

/// Called once when the supervisor gives up on its session.
pub(crate) type GiveUpHook = Arc<dyn Fn(&SessionId, u64) + Send + Sync>;

struct Inner {
    session_id: SessionId,
    instance: u64,
    options: SessionOptions,
    bus: Arc<dyn EventBus>,
    caches: Caches,
    metrics: Arc<ConnectionMetrics>,
    components: RwLock<Option<SessionComponents>>,
    restarts: AtomicU32,
    cancel: CancellationToken,
    on_give_up: Option<GiveUpHook>,
}

/// Runs one session's components as an all-for-one group.
///
/// When any component exits for any reason other than shutdown, every sibling
/// is cancelled (then aborted after `shutdown_timeout`) and a fresh group is
/// started. More than `max_restarts` restarts inside `restart_window` and the
/// supervisor gives up.
pub struct SessionSupervisor {
    inner: Arc<Inner>,
    monitor: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SessionSupervisor {
    pub fn start(
        session_id: SessionId,
        options: SessionOptions,
        bus: Arc<dyn EventBus>,
        caches: Caches,
    ) -> Arc<Self> {
        Self::start_with_hook(session_id, options, bus, caches, None)
    }

    pub(crate) fn start_with_hook(
        session_id: SessionId,
        options: SessionOptions,
        bus: Arc<dyn EventBus>,
        caches: Caches,
        on_give_up: Option<GiveUpHook>,
    ) -> Arc<Self> {
        let inner = Arc::new(Inner {
            session_id,
            instance: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
            options,
            bus,
            caches,
            metrics: Arc::new(ConnectionMetrics::new()),
            components: RwLock::new(None),
            restarts: AtomicU32::new(0),
            cancel: CancellationToken::new(),
            on_give_up,
        });
        // Components exist before `start` returns.
        let mut set = JoinSet::new();
        let first = inner.start_group(&mut set);
        let monitor = tokio::spawn(Arc::clone(&inner).monitor(set, first));
        Arc::new(Self {
            inner,
            monitor: tokio::sync::Mutex::new(Some(monitor)),
        })
    }

    pub fn session_id(&self) -> &SessionId {
        &self.inner.session_id
    }

    pub(crate) fn instance(&self) -> u64 {
        self.inner.instance
    }

    pub fn options(&self) -> &SessionOptions {
        &self.inner.options
    }

    /// Whether a component group is currently running.
    pub fn is_running(&self) -> bool {
        self.inner.components.read().is_some()
    }

    pub fn restart_count(&self) -> u32 {
        self.inner.restarts.load(Ordering::Relaxed)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn component(&self, kind: ComponentKind) -> Result<Component, SessionError> {
        self.inner
            .components
            .read()
            .as_ref()
            .map(|c| c.get(kind))
            .ok_or_else(|| SessionError::ComponentNotFound(kind.to_string()))
    }

    pub fn connection(&self) -> Result<ConnectionHandle, SessionError> {
        match self.component(ComponentKind::Connection)? {
            Component::Connection(h) => Ok(h),
            other => Err(SessionError::ComponentNotFound(other.kind().to_string())),
        }
    }

    pub fn tracker(&self) -> Result<TrackerHandle, SessionError> {
        match self.component(ComponentKind::RequestTracker)? {
            Component::RequestTracker(h) => Ok(h),
            other => Err(SessionError::ComponentNotFound(other.kind().to_string())),
        }
    }

    pub fn event_handler(&self) -> Result<EventHandlerHandle, SessionError> {
        match self.component(ComponentKind::EventHandler)? {
            Component::EventHandler(h) => Ok(h),
            other => Err(SessionError::ComponentNotFound(other.kind().to_string())),
        }
    }

    pub fn scenes(&self) -> Result<SceneManagerHandle, SessionError> {
        match self.component(ComponentKind::SceneManager)? {
            Component::SceneManager(h) => Ok(h),
            other => Err(SessionError::ComponentNotFound(other.kind().to_string())),
        }
    }

    pub fn stream(&self) -> Result<StreamManagerHandle, SessionError> {
        match self.component(ComponentKind::StreamManager)? {
            Component::StreamManager(h) => Ok(h),
            other => Err(SessionError::ComponentNotFound(other.kind().to_string())),
        }
    }

    pub fn stats(&self) -> Result<StatsCollectorHandle, SessionError> {
        match self.component(ComponentKind::StatsCollector)? {
            Component::StatsCollector(h) => Ok(h),
            other => Err(SessionError::ComponentNotFound(other.kind().to_string())),
        }
    }

    pub fn task_pool(&self) -> Result<TaskPoolHandle, SessionError> {
        match self.component(ComponentKind::TaskPool)? {
            Component::TaskPool(h) => Ok(h),
            other => Err(SessionError::ComponentNotFound(other.kind().to_string())),
        }
    }

    /// Abort one component. The rest of the group follows and restarts.
    pub fn kill(&self, kind: ComponentKind) -> Result<(), SessionError> {
        let components = self.inner.components.read();
        let abort = components
            .as_ref()
            .and_then(|c| c.aborts.get(&kind))
            .ok_or_else(|| SessionError::ComponentNotFound(kind.to_string()))?;
        warn!(session_id = %self.inner.session_id, component = %kind, "killing component");
        abort.abort();
        Ok(())
    }

    /// Stop every component and wait until they are gone.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let monitor = self.monitor.lock().await.take();
        if let Some(monitor) = monitor {
            if let Err(e) = monitor.await {
                error!(session_id = %self.inner.session_id, error = %e, "session monitor failed");
            }
        }
    }
}

impl Drop for SessionSupervisor {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

impl Inner {
    /// Spawn a fresh group into `set`; returns the task-id to kind map and the
    /// group's cancellation token.
    fn start_group(
        &self,
        set: &mut JoinSet<()>,
    ) -> (CancellationToken, HashMap<tokio::task::Id, ComponentKind>) {
        let session_id = &self.session_id;
        let options = &self.options;
        let cancel = self.cancel.child_token();

        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        let (tracker_tx, tracker_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (scenes_tx, scenes_rx) = mpsc::unbounded_channel();
        let (stream_tx, stream_rx) = mpsc::unbounded_channel();
        let (stats_tx, stats_rx) = mpsc::unbounded_channel();
        let (pool_tx, pool_rx) = mpsc::unbounded_channel();
        let (session_events, _) = broadcast::channel(SESSION_STREAM_CAPACITY);

        let connection = ConnectionHandle::new(conn_tx.clone());
        let tracker = TrackerHandle::new(tracker_tx.clone());
        let events = EventHandlerHandle::new(events_tx);
        let scenes = SceneManagerHandle::new(scenes_tx.clone());
        let stream = StreamManagerHandle::new(stream_tx.clone());
        let stats = StatsCollectorHandle::new(stats_tx.clone());
        let pool = TaskPoolHandle::new(pool_tx);

        let actors: Vec<(ComponentKind, BoxFuture<'static, ()>)> = vec![
            (
                ComponentKind::TaskPool,
                TaskPool::new(
                    session_id.clone(),
                    pool_rx,
                    options.task_pool_concurrency,
                    cancel.clone(),
                )
                .run()
                .boxed(),
            ),
            (
                ComponentKind::EventHandler,
                EventHandler::new(
                    session_id.clone(),
                    events_rx,
                    Arc::clone(&self.bus),
                    session_events.clone(),
                    cancel.clone(),
                )
                .run()
                .boxed(),
            ),
            (
                ComponentKind::RequestTracker,
                RequestTracker::new(
                    session_id.clone(),
                    &tracker_tx,
                    tracker_rx,
                    connection.clone(),
                    Arc::clone(&self.metrics),
                    options.request_timeout(),
                    cancel.clone(),
                )
                .run()
                .boxed(),
            ),
            (
                ComponentKind::SceneManager,
                SceneManager::new(
                    session_id.clone(),
                    scenes_tx,
                    scenes_rx,
                    session_events.subscribe(),
                    tracker.clone(),
                    pool.clone(),
                    &self.caches.scenes,
                    cancel.clone(),
                )
                .run()
                .boxed(),
            ),
            (
                ComponentKind::StreamManager,
                StreamManager::new(
                    session_id.clone(),
                    stream_tx,
                    stream_rx,
                    session_events.subscribe(),
                    tracker.clone(),
                    pool.clone(),
                    Arc::clone(&self.bus),
                    &self.caches.outputs,
                    cancel.clone(),
                )
                .run()
                .boxed(),
            ),
            (
                ComponentKind::StatsCollector,
                StatsCollector::new(
                    session_id.clone(),
                    stats_tx,
                    stats_rx,
                    session_events.subscribe(),
                    tracker.clone(),
                    pool.clone(),
                    &self.caches.stats,
                    options.stats_interval(),
                    cancel.clone(),
                )
                .run()
                .boxed(),
            ),
            (
                ComponentKind::Connection,
                Connection::new(
                    session_id.clone(),
                    options.clone(),
                    conn_tx,
                    conn_rx,
                    tracker.clone(),
                    events.clone(),
                    Arc::clone(&self.metrics),
                    cancel.clone(),
                )
                .run()
                .boxed(),
            ),
        ];

        let mut kinds = HashMap::new();
        let mut aborts = HashMap::new();
        for (kind, actor) in actors {
            let abort = set.spawn(actor);
            kinds.insert(abort.id(), kind);
            aborts.insert(kind, abort);
        }
        *self.components.write() = Some(SessionComponents {
            connection,
            tracker,
            events,
            scenes,
            stream,
            stats,
            pool,
            aborts,
        });
        (cancel, kinds)
    }

    async fn monitor(
        self: Arc<Self>,
        mut set: JoinSet<()>,
        first: (CancellationToken, HashMap<tokio::task::Id, ComponentKind>),
    ) {
        let window = self.options.supervisor.restart_window();
        let max_restarts = self.options.supervisor.max_restarts as usize;
        let mut recent: VecDeque<Instant> = VecDeque::new();
        let (mut group_cancel, mut kinds) = first;
        info!(session_id = %self.session_id, "session started");

        loop {
            let exited = tokio::select! {
                _ = self.cancel.cancelled() => None,
                joined = set.join_next_with_id() => joined,
            };
            self.components.write().take();
            self.teardown(&group_cancel, &mut set).await;

            let Some(joined) = exited else {
                info!(session_id = %self.session_id, "session stopped");
                return;
            };
            let (id, how) = match &joined {
                Ok((id, ())) => (*id, "returned"),
                Err(e) if e.is_panic() => (e.id(), "panicked"),
                Err(e) => (e.id(), "was aborted"),
            };
            let component = kinds.get(&id).map_or("unknown", |k| k.as_str());
            warn!(session_id = %self.session_id, component, "component {how}, restarting session");

            let now = Instant::now();
            recent.push_back(now);
            while recent
                .front()
                .is_some_and(|t| now.duration_since(*t) > window)
            {
                recent.pop_front();
            }
            if recent.len() > max_restarts {
                error!(
                    session_id = %self.session_id,
                    restarts = recent.len(),
                    window_ms = window.as_millis() as u64,
                    "restart intensity exceeded, giving up on session"
                );
                if let Some(hook) = &self.on_give_up {
                    hook(&self.session_id, self.instance);
                }
                return;
            }

            self.restarts.fetch_add(1, Ordering::Relaxed);
            self.metrics.record(Metric::ComponentRestart);
            (group_cancel, kinds) = self.start_group(&mut set);
        }
    }

    async fn teardown(&self, group_cancel: &CancellationToken, set: &mut JoinSet<()>) {
        group_cancel.cancel();
        let timeout = self.options.supervisor.shutdown_timeout();
        let drained = tokio::time::timeout(timeout, async {
            while set.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                session_id = %self.session_id,
                remaining = set.len(),
                "components did not stop in time, aborting"
            );
            set.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obsd_core::BroadcastBus;
    use std::time::Duration;

    fn unreachable_options() -> SessionOptions {
        // Nothing listens on port 9 locally; connects fail fast and retry slowly.
        let mut options = SessionOptions::new("ws://127.0.0.1:9");
        options.backoff.base_delay_ms = 60_000;
        options.supervisor.shutdown_timeout_ms = 1_000;
        options
    }

    async fn wait_for_restarts(sup: &SessionSupervisor, n: u32) {
        for _ in 0..300 {
            if sup.restart_count() >= n && sup.is_running() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("supervisor never reached {n} restarts");
    }

    #[test]
    fn component_kind_names_round_trip() {
        for kind in ComponentKind::ALL {
            assert_eq!(kind.as_str().parse::<ComponentKind>().unwrap(), kind);
        }
        assert_eq!(
            "mixer".parse::<ComponentKind>().unwrap_err(),
            SessionError::ComponentNotFound("mixer".into())
        );
    }

    #[tokio::test]
    async fn component_debug_names_its_kind() {
        let sup = SessionSupervisor::start(
            SessionId::from("sup-debug"),
            unreachable_options(),
            Arc::new(BroadcastBus::default()),
            Caches::new(),
        );
        let component = sup.component(ComponentKind::SceneManager).unwrap();
        assert_eq!(format!("{component:?}"), "Component(SceneManager)");
        let lookup: Result<Component, SessionError> = sup.component(ComponentKind::TaskPool);
        assert!(format!("{lookup:?}").contains("TaskPool"));
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn components_are_available_after_start() {
        let caches = Caches::new();
        let sup = SessionSupervisor::start(
            SessionId::from("sup"),
            unreachable_options(),
            Arc::new(BroadcastBus::default()),
            caches.clone(),
        );
        for kind in ComponentKind::ALL {
            assert_eq!(sup.component(kind).unwrap().kind(), kind);
        }
        assert!(caches.scenes.contains(sup.session_id()));
        assert!(caches.outputs.contains(sup.session_id()));
        assert!(caches.stats.contains(sup.session_id()));

        sup.shutdown().await;
        assert!(!sup.is_running());
        assert!(caches.scenes.is_empty());
        assert!(caches.outputs.is_empty());
        assert!(caches.stats.is_empty());
        assert!(matches!(
            sup.tracker(),
            Err(SessionError::ComponentNotFound(_))
        ));
    }

    #[tokio::test]
    async fn killing_any_component_restarts_the_group() {
        let sup = SessionSupervisor::start(
            SessionId::from("sup-kill"),
            unreachable_options(),
            Arc::new(BroadcastBus::default()),
            Caches::new(),
        );
        let old_tracker = sup.tracker().unwrap();
        sup.kill(ComponentKind::StatsCollector).unwrap();
        wait_for_restarts(&sup, 1).await;

        // The sibling from the old group is gone too.
        assert_eq!(
            old_tracker.stats().await.unwrap_err(),
            SessionError::ComponentStopped("request_tracker")
        );
        let stats = sup.tracker().unwrap().stats().await.unwrap();
        assert_eq!(stats.next_id, 1);
        assert_eq!(sup.metrics().component_restarts, 1);
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn gives_up_after_restart_intensity() {
        let gave_up = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&gave_up);
        let mut options = unreachable_options();
        options.supervisor.max_restarts = 1;
        options.supervisor.restart_window_ms = 60_000;
        let sup = SessionSupervisor::start_with_hook(
            SessionId::from("sup-flaky"),
            options,
            Arc::new(BroadcastBus::default()),
            Caches::new(),
            Some(Arc::new(move |_: &SessionId, _: u64| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        );
        sup.kill(ComponentKind::Connection).unwrap();
        wait_for_restarts(&sup, 1).await;
        sup.kill(ComponentKind::Connection).unwrap();
        for _ in 0..300 {
            if gave_up.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(gave_up.load(Ordering::SeqCst), 1);
        assert!(!sup.is_running());
        assert_eq!(sup.restart_count(), 1);
        sup.shutdown().await;
    }
}
