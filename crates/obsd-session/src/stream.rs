use std::sync::Arc;

use chrono::{DateTime, Utc};
use obsd_core::{BusEvent, ConnectionState, EventBus, OutputKind, SessionId};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, CacheStore};
use crate::error::SessionError;
use crate::event_handler::{ObsEvent, SessionEvent};
use crate::mailbox;
use crate::task_pool::TaskPoolHandle;
use crate::tracker::TrackerHandle;

const COMPONENT: &str = "stream_manager";

const STATE_RECONNECTING: &str = "OBS_WEBSOCKET_OUTPUT_RECONNECTING";
const STATE_PAUSED: &str = "OBS_WEBSOCKET_OUTPUT_PAUSED";

/// Status of the stream, record, virtual-cam and replay-buffer outputs.
///
/// Every field holds the last value OBS reported for it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct OutputSnapshot {
    pub streaming_active: bool,
    pub stream_reconnecting: bool,
    pub stream_timecode: Option<String>,
    pub stream_duration_ms: u64,
    pub stream_bytes: u64,
    pub stream_total_frames: u64,
    pub stream_skipped_frames: u64,
    pub recording_active: bool,
    pub recording_paused: bool,
    pub record_timecode: Option<String>,
    pub record_duration_ms: u64,
    pub record_bytes: u64,
    pub record_path: Option<String>,
    pub virtual_cam_active: bool,
    pub replay_buffer_active: bool,
    pub last_updated: Option<DateTime<Utc>>,
}

/// An output whose active flag flipped.
pub type Transition = (OutputKind, bool);

impl OutputSnapshot {
    pub fn is_active(&self, output: OutputKind) -> bool {
        match output {
            OutputKind::Stream => self.streaming_active,
            OutputKind::Record => self.recording_active,
            OutputKind::VirtualCam => self.virtual_cam_active,
            OutputKind::ReplayBuffer => self.replay_buffer_active,
        }
    }

    fn set_active(&mut self, output: OutputKind, active: bool) -> Option<Transition> {
        if self.is_active(output) == active {
            return None;
        }
        match output {
            OutputKind::Stream => self.streaming_active = active,
            OutputKind::Record => self.recording_active = active,
            OutputKind::VirtualCam => self.virtual_cam_active = active,
            OutputKind::ReplayBuffer => self.replay_buffer_active = active,
        }
        Some((output, active))
    }

    /// Fold an output event in. Returns whether the snapshot changed and the
    /// active-flag transition, if any.
    pub fn apply_event(&mut self, event: &ObsEvent) -> (bool, Option<Transition>) {
        let before = self.clone();
        let output = match event.event_type.as_str() {
            "StreamStateChanged" => OutputKind::Stream,
            "RecordStateChanged" => OutputKind::Record,
            "VirtualcamStateChanged" => OutputKind::VirtualCam,
            "ReplayBufferStateChanged" => OutputKind::ReplayBuffer,
            "RecordFileChanged" => {
                if let Some(path) = event.str_field("newOutputPath") {
                    self.record_path = Some(path.to_string());
                }
                return (*self != before, None);
            }
            _ => return (false, None),
        };
        let Some(active) = event.bool_field("outputActive") else {
            return (false, None);
        };
        let state = event.str_field("outputState").unwrap_or_default();
        match output {
            OutputKind::Stream => self.stream_reconnecting = state == STATE_RECONNECTING,
            OutputKind::Record => {
                self.recording_paused = active && state == STATE_PAUSED;
                if let Some(path) = event.str_field("outputPath") {
                    self.record_path = Some(path.to_string());
                }
            }
            OutputKind::VirtualCam | OutputKind::ReplayBuffer => {}
        }
        let transition = self.set_active(output, active);
        (*self != before, transition)
    }

    /// Apply a `Get*Status` response for `output`.
    pub fn apply_status(&mut self, output: OutputKind, data: &Value) -> Option<Transition> {
        let u = |key: &str| data.get(key).and_then(Value::as_u64);
        let b = |key: &str| data.get(key).and_then(Value::as_bool);
        let s = |key: &str| data.get(key).and_then(Value::as_str).map(str::to_string);
        match output {
            OutputKind::Stream => {
                if let Some(v) = b("outputReconnecting") {
                    self.stream_reconnecting = v;
                }
                if let Some(v) = s("outputTimecode") {
                    self.stream_timecode = Some(v);
                }
                if let Some(v) = u("outputDuration") {
                    self.stream_duration_ms = v;
                }
                if let Some(v) = u("outputBytes") {
                    self.stream_bytes = v;
                }
                if let Some(v) = u("outputTotalFrames") {
                    self.stream_total_frames = v;
                }
                if let Some(v) = u("outputSkippedFrames") {
                    self.stream_skipped_frames = v;
                }
                self.stream_skipped_frames = self.stream_skipped_frames.min(self.stream_total_frames);
            }
            OutputKind::Record => {
                if let Some(v) = b("outputPaused") {
                    self.recording_paused = v;
                }
                if let Some(v) = s("outputTimecode") {
                    self.record_timecode = Some(v);
                }
                if let Some(v) = u("outputDuration") {
                    self.record_duration_ms = v;
                }
                if let Some(v) = u("outputBytes") {
                    self.record_bytes = v;
                }
            }
            OutputKind::VirtualCam | OutputKind::ReplayBuffer => {}
        }
        b("outputActive").and_then(|active| self.set_active(output, active))
    }
}

const STATUS_REQUESTS: [(OutputKind, &str); 4] = [
    (OutputKind::Stream, "GetStreamStatus"),
    (OutputKind::Record, "GetRecordStatus"),
    (OutputKind::VirtualCam, "GetVirtualCamStatus"),
    (OutputKind::ReplayBuffer, "GetReplayBufferStatus"),
];

pub(crate) enum StreamMsg {
    GetState {
        reply: oneshot::Sender<OutputSnapshot>,
    },
    Refresh,
    Status {
        output: OutputKind,
        data: Value,
    },
}

#[derive(Clone)]
pub struct StreamManagerHandle {
    tx: mpsc::UnboundedSender<StreamMsg>,
}

impl StreamManagerHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<StreamMsg>) -> Self {
        Self { tx }
    }

    pub async fn get_state(&self) -> Result<OutputSnapshot, SessionError> {
        mailbox::call(&self.tx, COMPONENT, |reply| StreamMsg::GetState { reply }).await
    }

    pub fn refresh(&self) {
        mailbox::cast(&self.tx, COMPONENT, StreamMsg::Refresh);
    }
}

pub(crate) struct StreamManager {
    session_id: SessionId,
    rx: mpsc::UnboundedReceiver<StreamMsg>,
    mailbox: mpsc::UnboundedSender<StreamMsg>,
    events: broadcast::Receiver<SessionEvent>,
    tracker: TrackerHandle,
    pool: TaskPoolHandle,
    bus: Arc<dyn EventBus>,
    cache: CacheEntry<OutputSnapshot>,
    cancel: CancellationToken,
    snapshot: OutputSnapshot,
}

impl StreamManager {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        session_id: SessionId,
        mailbox: mpsc::UnboundedSender<StreamMsg>,
        rx: mpsc::UnboundedReceiver<StreamMsg>,
        events: broadcast::Receiver<SessionEvent>,
        tracker: TrackerHandle,
        pool: TaskPoolHandle,
        bus: Arc<dyn EventBus>,
        cache: &CacheStore<OutputSnapshot>,
        cancel: CancellationToken,
    ) -> Self {
        let snapshot = OutputSnapshot::default();
        let cache = cache.register(session_id.clone(), snapshot.clone());
        Self {
            session_id,
            rx,
            mailbox,
            events,
            tracker,
            pool,
            bus,
            cache,
            cancel,
            snapshot,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                event = self.events.recv() => match event {
                    Ok(SessionEvent::Obs(event)) => {
                        let (changed, transition) = self.snapshot.apply_event(&event);
                        if changed {
                            self.publish(transition);
                        }
                    }
                    Ok(SessionEvent::Connection(ConnectionState::Ready)) => self.refresh(),
                    Ok(SessionEvent::Connection(_)) => {}
                    Err(RecvError::Lagged(n)) => {
                        warn!(session_id = %self.session_id, skipped = n, "stream manager lagged, refreshing");
                        self.refresh();
                    }
                    Err(RecvError::Closed) => break,
                },
                msg = self.rx.recv() => match msg {
                    Some(StreamMsg::GetState { reply }) => {
                        let _ = reply.send(self.snapshot.clone());
                    }
                    Some(StreamMsg::Refresh) => self.refresh(),
                    Some(StreamMsg::Status { output, data }) => {
                        let transition = self.snapshot.apply_status(output, &data);
                        self.publish(transition);
                    }
                    None => break,
                },
            }
        }
    }

    fn publish(&mut self, transition: Option<Transition>) {
        self.snapshot.last_updated = Some(Utc::now());
        self.cache.set(self.snapshot.clone());
        if let Some((output, active)) = transition {
            info!(session_id = %self.session_id, output = %output, active, "output state changed");
            self.bus.publish(BusEvent::output_transition(
                self.session_id.clone(),
                output,
                active,
            ));
        }
    }

    fn refresh(&self) {
        let tracker = self.tracker.clone();
        let mailbox = self.mailbox.clone();
        let session_id = self.session_id.clone();
        debug!(session_id = %self.session_id, "refreshing output status");
        let spawned = self.pool.spawn("output_refresh", async move {
            for (output, request) in STATUS_REQUESTS {
                match tracker.send_request(request, None).await {
                    Ok(data) => {
                        let _ = mailbox.send(StreamMsg::Status { output, data });
                    }
                    Err(e) => {
                        warn!(session_id = %session_id, request, error = %e, "output status refresh failed");
                    }
                }
            }
            Ok(())
        });
        if let Err(e) = spawned {
            warn!(session_id = %self.session_id, error = %e, "output refresh not scheduled");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obsd_core::BroadcastBus;
    use serde_json::json;

    fn stream_event(active: bool, state: &str) -> ObsEvent {
        ObsEvent::new(
            "StreamStateChanged",
            json!({"outputActive": active, "outputState": state}),
        )
    }

    #[test]
    fn duplicate_start_transitions_once() {
        let mut s = OutputSnapshot::default();
        let (changed, t) = s.apply_event(&stream_event(true, "OBS_WEBSOCKET_OUTPUT_STARTED"));
        assert!(changed);
        assert_eq!(t, Some((OutputKind::Stream, true)));
        let (changed, t) = s.apply_event(&stream_event(true, "OBS_WEBSOCKET_OUTPUT_STARTED"));
        assert!(!changed);
        assert_eq!(t, None);
        assert!(s.streaming_active);
    }

    #[test]
    fn reconnecting_and_paused_states() {
        let mut s = OutputSnapshot::default();
        s.apply_event(&stream_event(true, STATE_RECONNECTING));
        assert!(s.stream_reconnecting);
        s.apply_event(&stream_event(true, "OBS_WEBSOCKET_OUTPUT_RECONNECTED"));
        assert!(!s.stream_reconnecting);

        let (_, t) = s.apply_event(&ObsEvent::new(
            "RecordStateChanged",
            json!({"outputActive": true, "outputState": STATE_PAUSED, "outputPath": null}),
        ));
        assert_eq!(t, Some((OutputKind::Record, true)));
        assert!(s.recording_paused);
        s.apply_event(&ObsEvent::new(
            "RecordStateChanged",
            json!({"outputActive": false, "outputState": "OBS_WEBSOCKET_OUTPUT_STOPPED", "outputPath": "/rec/a.mkv"}),
        ));
        assert!(!s.recording_paused);
        assert_eq!(s.record_path.as_deref(), Some("/rec/a.mkv"));
    }

    #[test]
    fn status_response_updates_counters() {
        let mut s = OutputSnapshot::default();
        let t = s.apply_status(
            OutputKind::Stream,
            &json!({
                "outputActive": true,
                "outputReconnecting": false,
                "outputTimecode": "00:01:00.000",
                "outputDuration": 60000,
                "outputBytes": 1234567,
                "outputTotalFrames": 3600,
                "outputSkippedFrames": 4
            }),
        );
        assert_eq!(t, Some((OutputKind::Stream, true)));
        assert_eq!(s.stream_total_frames, 3600);
        assert_eq!(s.stream_skipped_frames, 4);
        assert_eq!(s.stream_timecode.as_deref(), Some("00:01:00.000"));

        // Negative or missing values never overwrite.
        s.apply_status(OutputKind::Stream, &json!({"outputBytes": -1}));
        assert_eq!(s.stream_bytes, 1234567);
    }

    #[test]
    fn unknown_events_change_nothing() {
        let mut s = OutputSnapshot::default();
        assert_eq!(
            s.apply_event(&ObsEvent::new("SceneCreated", json!({"sceneName": "x"}))),
            (false, None)
        );
        assert_eq!(s, OutputSnapshot::default());
    }

    #[tokio::test]
    async fn manager_publishes_started_once() {
        let bus = BroadcastBus::new(16);
        let mut bus_rx = bus.subscribe();
        let (stream_tx, _) = broadcast::channel(16);
        let (tracker_tx, _tracker_rx) = mpsc::unbounded_channel();
        let (pool_tx, _pool_rx) = mpsc::unbounded_channel();
        let (tx, rx) = mpsc::unbounded_channel();
        let store = CacheStore::new();
        let id = SessionId::from("out");
        let manager = StreamManager::new(
            id.clone(),
            tx.clone(),
            rx,
            stream_tx.subscribe(),
            TrackerHandle::new(tracker_tx),
            TaskPoolHandle::new(pool_tx),
            Arc::new(bus),
            &store,
            CancellationToken::new(),
        );
        tokio::spawn(manager.run());
        let handle = StreamManagerHandle::new(tx);

        for _ in 0..2 {
            stream_tx
                .send(SessionEvent::Obs(Arc::new(stream_event(
                    true,
                    "OBS_WEBSOCKET_OUTPUT_STARTED",
                ))))
                .unwrap();
        }
        let state = handle.get_state().await.unwrap();
        assert!(state.streaming_active);
        assert!(store.get(&id).unwrap().streaming_active);
        assert_eq!(
            bus_rx.recv().await.unwrap(),
            BusEvent::OutputStarted {
                session_id: id.clone(),
                output: OutputKind::Stream,
                active: true
            }
        );
        assert!(bus_rx.try_recv().is_err());
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn last_status_value_wins(updates in proptest::collection::vec(
                (proptest::option::of(0u64..1_000_000), proptest::option::of(any::<bool>())),
                1..50,
            )) {
                let mut s = OutputSnapshot::default();
                let mut last_bytes = 0;
                let mut last_active = false;
                for (bytes, active) in &updates {
                    let mut data = serde_json::Map::new();
                    if let Some(b) = bytes {
                        data.insert("outputBytes".into(), json!(b));
                        last_bytes = *b;
                    }
                    if let Some(a) = active {
                        data.insert("outputActive".into(), json!(a));
                        last_active = *a;
                    }
                    s.apply_status(OutputKind::Record, &Value::Object(data));
                }
                prop_assert_eq!(s.record_bytes, last_bytes);
                prop_assert_eq!(s.recording_active, last_active);
            }
        }
    }
}
