use std::sync::Arc;

use obsd_core::protocol::EventPayload;
use obsd_core::{BusEvent, ConnectionState, EventBus, SessionId};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::SessionError;
use crate::mailbox;

const COMPONENT: &str = "event_handler";

/// A validated OBS event as seen by the cache managers.
#[derive(Clone, Debug, PartialEq)]
pub struct ObsEvent {
    pub event_type: String,
    pub event_intent: Option<u64>,
    pub data: Map<String, Value>,
}

impl ObsEvent {
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        let data = match data {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            event_type: event_type.into(),
            event_intent: None,
            data,
        }
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    pub fn bool_field(&self, key: &str) -> Option<bool> {
        self.data.get(key).and_then(Value::as_bool)
    }
}

/// Per-session stream the managers subscribe to.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    Obs(Arc<ObsEvent>),
    Connection(ConnectionState),
}

/// The little state the event handler keeps for itself.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct EventHandlerState {
    pub current_scene: Option<String>,
    pub stream_active: bool,
    pub record_active: bool,
}

pub(crate) enum EventHandlerMsg {
    Event(Value),
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    GetState {
        reply: oneshot::Sender<EventHandlerState>,
    },
}

#[derive(Clone)]
pub struct EventHandlerHandle {
    tx: mpsc::UnboundedSender<EventHandlerMsg>,
}

impl EventHandlerHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<EventHandlerMsg>) -> Self {
        Self { tx }
    }

    pub(crate) fn dispatch(&self, payload: Value) {
        mailbox::cast(&self.tx, COMPONENT, EventHandlerMsg::Event(payload));
    }

    pub(crate) fn state_changed(&self, from: ConnectionState, to: ConnectionState) {
        mailbox::cast(&self.tx, COMPONENT, EventHandlerMsg::StateChanged { from, to });
    }

    pub async fn get_state(&self) -> Result<EventHandlerState, SessionError> {
        mailbox::call(&self.tx, COMPONENT, |reply| EventHandlerMsg::GetState { reply }).await
    }
}

/// Normalizes raw event payloads, publishes them on the shared bus and fans
/// them out to the session's managers.
pub(crate) struct EventHandler {
    session_id: SessionId,
    rx: mpsc::UnboundedReceiver<EventHandlerMsg>,
    bus: Arc<dyn EventBus>,
    stream: broadcast::Sender<SessionEvent>,
    cancel: CancellationToken,
    state: EventHandlerState,
}

impl EventHandler {
    pub(crate) fn new(
        session_id: SessionId,
        rx: mpsc::UnboundedReceiver<EventHandlerMsg>,
        bus: Arc<dyn EventBus>,
        stream: broadcast::Sender<SessionEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session_id,
            rx,
            bus,
            stream,
            cancel,
            state: EventHandlerState::default(),
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                msg = self.rx.recv() => match msg {
                    Some(msg) => self.handle(msg),
                    None => break,
                },
            }
        }
    }

    fn handle(&mut self, msg: EventHandlerMsg) {
        match msg {
            EventHandlerMsg::Event(payload) => self.on_event(&payload),
            EventHandlerMsg::StateChanged { from, to } => {
                self.bus.publish(BusEvent::ConnectionStateChanged {
                    session_id: self.session_id.clone(),
                    from,
                    to,
                });
                let _ = self.stream.send(SessionEvent::Connection(to));
            }
            EventHandlerMsg::GetState { reply } => {
                let _ = reply.send(self.state.clone());
            }
        }
    }

    fn on_event(&mut self, payload: &Value) {
        let event = match EventPayload::from_value(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(session_id = %self.session_id, error = %e, "dropping malformed event");
                return;
            }
        };
        let obs = ObsEvent {
            data: event.data(),
            event_type: event.event_type,
            event_intent: event.event_intent,
        };
        let Some(bus_event) = self.normalize(&obs) else {
            warn!(
                session_id = %self.session_id,
                event_type = %obs.event_type,
                "dropping event with missing fields"
            );
            return;
        };
        debug!(session_id = %self.session_id, event_type = %obs.event_type, "event received");
        self.bus.publish(bus_event);
        let _ = self.stream.send(SessionEvent::Obs(Arc::new(obs)));
    }

    fn normalize(&mut self, event: &ObsEvent) -> Option<BusEvent> {
        let session_id = self.session_id.clone();
        let normalized = match event.event_type.as_str() {
            "CurrentProgramSceneChanged" => {
                let scene_name = event.str_field("sceneName")?.to_string();
                self.state.current_scene = Some(scene_name.clone());
                BusEvent::SceneChanged {
                    session_id,
                    scene_name,
                }
            }
            "StreamStateChanged" => {
                let active = event.bool_field("outputActive")?;
                self.state.stream_active = active;
                BusEvent::StreamStateChanged {
                    session_id,
                    active,
                    state: event.str_field("outputState").unwrap_or_default().to_string(),
                }
            }
            "RecordStateChanged" => {
                let active = event.bool_field("outputActive")?;
                self.state.record_active = active;
                BusEvent::RecordStateChanged {
                    session_id,
                    active,
                    state: event.str_field("outputState").unwrap_or_default().to_string(),
                    path: event.str_field("outputPath").map(str::to_string),
                }
            }
            _ => BusEvent::Unknown {
                session_id,
                event_type: event.event_type.clone(),
                data: Value::Object(event.data.clone()),
            },
        };
        Some(normalized)
    }
}
