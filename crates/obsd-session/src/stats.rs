use std::pin::Pin;
use std::time::Duration;

use chrono::{DateTime, Utc};
use obsd_core::{ConnectionState, SessionId};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::{CacheEntry, CacheStore};
use crate::error::SessionError;
use crate::event_handler::SessionEvent;
use crate::mailbox;
use crate::task_pool::TaskPoolHandle;
use crate::tracker::TrackerHandle;

const COMPONENT: &str = "stats_collector";

/// Performance counters from `GetStats`. All zero until the first poll.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub active_fps: f64,
    pub average_frame_render_time: f64,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub available_disk_space: f64,
    pub render_total_frames: u64,
    pub render_skipped_frames: u64,
    pub output_total_frames: u64,
    pub output_skipped_frames: u64,
    pub web_socket_session_incoming_messages: u64,
    pub web_socket_session_outgoing_messages: u64,
    pub last_updated: Option<DateTime<Utc>>,
}

impl StatsSnapshot {
    /// Merge a `GetStats` response. Fields missing or of the wrong type keep
    /// their previous value; skipped frame counts are clamped to the totals.
    pub fn apply(&mut self, data: &Value) {
        let f = |key: &str| data.get(key).and_then(Value::as_f64).filter(|v| v.is_finite());
        let u = |key: &str| data.get(key).and_then(Value::as_u64);

        for (field, key) in [
            (&mut self.active_fps, "activeFps"),
            (&mut self.average_frame_render_time, "averageFrameRenderTime"),
            (&mut self.cpu_usage, "cpuUsage"),
            (&mut self.memory_usage, "memoryUsage"),
            (&mut self.available_disk_space, "availableDiskSpace"),
        ] {
            if let Some(v) = f(key) {
                *field = v.max(0.0);
            }
        }
        for (field, key) in [
            (&mut self.render_total_frames, "renderTotalFrames"),
            (&mut self.render_skipped_frames, "renderSkippedFrames"),
            (&mut self.output_total_frames, "outputTotalFrames"),
            (&mut self.output_skipped_frames, "outputSkippedFrames"),
            (&mut self.web_socket_session_incoming_messages, "webSocketSessionIncomingMessages"),
            (&mut self.web_socket_session_outgoing_messages, "webSocketSessionOutgoingMessages"),
        ] {
            if let Some(v) = u(key) {
                *field = v;
            }
        }
        self.render_skipped_frames = self.render_skipped_frames.min(self.render_total_frames);
        self.output_skipped_frames = self.output_skipped_frames.min(self.output_total_frames);
    }
}

pub(crate) enum StatsMsg {
    GetState {
        reply: oneshot::Sender<StatsSnapshot>,
    },
    PollNow,
    Polled(Value),
}

#[derive(Clone)]
pub struct StatsCollectorHandle {
    tx: mpsc::UnboundedSender<StatsMsg>,
}

impl StatsCollectorHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<StatsMsg>) -> Self {
        Self { tx }
    }

    pub async fn get_state(&self) -> Result<StatsSnapshot, SessionError> {
        mailbox::call(&self.tx, COMPONENT, |reply| StatsMsg::GetState { reply }).await
    }

    /// Poll immediately and restart the interval.
    pub fn poll_now(&self) {
        mailbox::cast(&self.tx, COMPONENT, StatsMsg::PollNow);
    }
}

/// Polls `GetStats` while the connection is ready.
pub(crate) struct StatsCollector {
    session_id: SessionId,
    rx: mpsc::UnboundedReceiver<StatsMsg>,
    mailbox: mpsc::UnboundedSender<StatsMsg>,
    events: broadcast::Receiver<SessionEvent>,
    tracker: TrackerHandle,
    pool: TaskPoolHandle,
    cache: CacheEntry<StatsSnapshot>,
    cancel: CancellationToken,
    interval: Duration,
    ready: bool,
    timer: Option<Pin<Box<Sleep>>>,
    snapshot: StatsSnapshot,
}

impl StatsCollector {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        session_id: SessionId,
        mailbox: mpsc::UnboundedSender<StatsMsg>,
        rx: mpsc::UnboundedReceiver<StatsMsg>,
        events: broadcast::Receiver<SessionEvent>,
        tracker: TrackerHandle,
        pool: TaskPoolHandle,
        cache: &CacheStore<StatsSnapshot>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let snapshot = StatsSnapshot::default();
        let cache = cache.register(session_id.clone(), snapshot.clone());
        Self {
            session_id,
            rx,
            mailbox,
            events,
            tracker,
            pool,
            cache,
            cancel,
            interval,
            ready: false,
            timer: None,
            snapshot,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                event = self.events.recv() => match event {
                    Ok(SessionEvent::Connection(state)) => self.on_connection(state),
                    Ok(SessionEvent::Obs(_)) => {}
                    Err(RecvError::Lagged(n)) => {
                        debug!(session_id = %self.session_id, skipped = n, "stats collector lagged");
                    }
                    Err(RecvError::Closed) => break,
                },
                msg = self.rx.recv() => match msg {
                    Some(StatsMsg::GetState { reply }) => {
                        let _ = reply.send(self.snapshot.clone());
                    }
                    Some(StatsMsg::PollNow) => {
                        if self.ready {
                            self.poll();
                        } else {
                            debug!(session_id = %self.session_id, "poll requested while not ready");
                        }
                    }
                    Some(StatsMsg::Polled(data)) => {
                        self.snapshot.apply(&data);
                        self.snapshot.last_updated = Some(Utc::now());
                        self.cache.set(self.snapshot.clone());
                    }
                    None => break,
                },
                _ = tick(&mut self.timer) => self.poll(),
            }
        }
    }

    fn on_connection(&mut self, state: ConnectionState) {
        self.ready = state.is_ready();
        if self.ready {
            self.arm();
        } else {
            self.timer = None;
        }
    }

    fn arm(&mut self) {
        self.timer = Some(Box::pin(tokio::time::sleep(self.interval)));
    }

    fn poll(&mut self) {
        self.arm();
        let tracker = self.tracker.clone();
        let mailbox = self.mailbox.clone();
        let spawned = self.pool.spawn("stats_poll", async move {
            let data = tracker.send_request("GetStats", None).await?;
            let _ = mailbox.send(StatsMsg::Polled(data));
            Ok(())
        });
        if let Err(e) = spawned {
            warn!(session_id = %self.session_id, error = %e, "stats poll not scheduled");
        }
    }
}

async fn tick(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task_pool::PoolMsg;
    use serde_json::json;

    #[test]
    fn fields_update_independently() {
        let mut s = StatsSnapshot::default();
        s.apply(&json!({"activeFps": 60.0, "cpuUsage": 12.5, "renderTotalFrames": 1000}));
        s.apply(&json!({"cpuUsage": 20.0}));
        assert_eq!(s.active_fps, 60.0);
        assert_eq!(s.cpu_usage, 20.0);
        assert_eq!(s.render_total_frames, 1000);
        assert_eq!(s.memory_usage, 0.0);
    }

    #[test]
    fn wrong_types_keep_prior_value() {
        let mut s = StatsSnapshot::default();
        s.apply(&json!({"activeFps": 30.0, "outputTotalFrames": 10}));
        s.apply(&json!({"activeFps": "fast", "outputTotalFrames": -5}));
        assert_eq!(s.active_fps, 30.0);
        assert_eq!(s.output_total_frames, 10);
    }

    #[test]
    fn skipped_is_clamped_to_total() {
        let mut s = StatsSnapshot::default();
        s.apply(&json!({"renderTotalFrames": 100, "renderSkippedFrames": 250}));
        assert_eq!(s.render_skipped_frames, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn polls_only_while_ready() {
        let (stream_tx, _) = broadcast::channel(16);
        let (tracker_tx, _tracker_rx) = mpsc::unbounded_channel();
        let (pool_tx, mut pool_rx) = mpsc::unbounded_channel();
        let (tx, rx) = mpsc::unbounded_channel();
        let store = CacheStore::new();
        let collector = StatsCollector::new(
            SessionId::from("stats"),
            tx.clone(),
            rx,
            stream_tx.subscribe(),
            TrackerHandle::new(tracker_tx),
            TaskPoolHandle::new(pool_tx),
            &store,
            Duration::from_secs(5),
            CancellationToken::new(),
        );
        tokio::spawn(collector.run());
        let handle = StatsCollectorHandle::new(tx);

        // Not ready: nothing is scheduled, even on request.
        handle.poll_now();
        tokio::time::sleep(Duration::from_secs(12)).await;
        assert!(pool_rx.try_recv().is_err());

        stream_tx
            .send(SessionEvent::Connection(ConnectionState::Ready))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5_100)).await;
        assert!(matches!(pool_rx.try_recv(), Ok(PoolMsg::Spawn { label: "stats_poll", .. })));
        assert!(pool_rx.try_recv().is_err());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(pool_rx.try_recv().is_ok());

        stream_tx
            .send(SessionEvent::Connection(ConnectionState::Reconnecting))
            .unwrap();
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(pool_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn polled_data_reaches_cache() {
        let (stream_tx, _) = broadcast::channel(16);
        let (tracker_tx, _tracker_rx) = mpsc::unbounded_channel();
        let (pool_tx, _pool_rx) = mpsc::unbounded_channel();
        let (tx, rx) = mpsc::unbounded_channel();
        let store = CacheStore::new();
        let id = SessionId::from("stats");
        let collector = StatsCollector::new(
            id.clone(),
            tx.clone(),
            rx,
            stream_tx.subscribe(),
            TrackerHandle::new(tracker_tx),
            TaskPoolHandle::new(pool_tx),
            &store,
            Duration::from_secs(5),
            CancellationToken::new(),
        );
        tokio::spawn(collector.run());
        tx.send(StatsMsg::Polled(json!({"activeFps": 59.94}))).unwrap();
        let handle = StatsCollectorHandle::new(tx);
        assert_eq!(handle.get_state().await.unwrap().active_fps, 59.94);
        assert_eq!(store.get(&id).unwrap().active_fps, 59.94);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn skipped_never_exceeds_total(updates in proptest::collection::vec(
                (
                    proptest::option::of(0u64..10_000),
                    proptest::option::of(0u64..10_000),
                    proptest::option::of(0u64..10_000),
                    proptest::option::of(0u64..10_000),
                ),
                1..40,
            )) {
                let mut s = StatsSnapshot::default();
                for (rt, rs, ot, os) in updates {
                    let mut data = serde_json::Map::new();
                    for (key, v) in [
                        ("renderTotalFrames", rt),
                        ("renderSkippedFrames", rs),
                        ("outputTotalFrames", ot),
                        ("outputSkippedFrames", os),
                    ] {
                        if let Some(v) = v {
                            data.insert(key.into(), json!(v));
                        }
                    }
                    s.apply(&Value::Object(data));
                    prop_assert!(s.render_skipped_frames <= s.render_total_frames);
                    prop_assert!(s.output_skipped_frames <= s.output_total_frames);
                }
            }
        }
    }
}
