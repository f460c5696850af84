//! In-process OBS WebSocket server for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use obsd_session::{ConnectionStatus, ObsApi, SessionError, SessionId};
use obsd_core::ConnectionState;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;

struct MockState {
    hello_delay: Duration,
    streaming: AtomicBool,
    connections: AtomicUsize,
    pushes: broadcast::Sender<String>,
}

/// Speaks just enough of the protocol for a session to reach ready: Hello
/// without auth, Identified, canned responses for the refresh requests.
pub struct MockObs {
    pub uri: String,
    state: Arc<MockState>,
}

impl MockObs {
    pub async fn start() -> Self {
        Self::with_hello_delay(Duration::ZERO).await
    }

    pub async fn with_hello_delay(hello_delay: Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (pushes, _) = broadcast::channel(64);
        let state = Arc::new(MockState {
            hello_delay,
            streaming: AtomicBool::new(false),
            connections: AtomicUsize::new(0),
            pushes,
        });
        let accept_state = Arc::clone(&state);
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                accept_state.connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(tcp, Arc::clone(&accept_state)));
            }
        });
        Self {
            uri: format!("ws://{addr}"),
            state,
        }
    }

    /// What GetStreamStatus reports from now on.
    pub fn set_streaming(&self, active: bool) {
        self.state.streaming.store(active, Ordering::SeqCst);
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Send an event frame to every connected client.
    pub fn push_event(&self, event_type: &str, data: Value) {
        let frame = json!({
            "op": 5,
            "d": {"eventType": event_type, "eventIntent": 1 << 6, "eventData": data}
        });
        let _ = self.state.pushes.send(frame.to_string());
    }
}

async fn serve(tcp: TcpStream, state: Arc<MockState>) {
    let Ok(ws) = tokio_tungstenite::accept_async(tcp).await else {
        return;
    };
    let (mut sink, mut stream) = ws.split();
    let mut pushes = state.pushes.subscribe();
    tokio::time::sleep(state.hello_delay).await;
    let hello = json!({"op": 0, "d": {"obsWebSocketVersion": "5.5.0", "rpcVersion": 1}});
    if sink.send(Message::text(hello.to_string())).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            incoming = stream.next() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                    Some(Ok(_)) => continue,
                };
                let Ok(frame) = serde_json::from_str::<Value>(text.as_str()) else {
                    continue;
                };
                if let Some(reply) = answer(&frame, &state) {
                    if sink.send(Message::text(reply.to_string())).await.is_err() {
                        return;
                    }
                }
            }
            push = pushes.recv() => match push {
                Ok(text) => {
                    if sink.send(Message::text(text)).await.is_err() {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }
}

fn answer(frame: &Value, state: &MockState) -> Option<Value> {
    let d = &frame["d"];
    match frame["op"].as_i64()? {
        1 | 3 => Some(json!({"op": 2, "d": {"negotiatedRpcVersion": 1}})),
        6 => Some(json!({"op": 7, "d": respond(d, state)})),
        8 => {
            let results: Vec<Value> = d["requests"]
                .as_array()
                .map(|reqs| reqs.iter().map(|r| respond(r, state)).collect())
                .unwrap_or_default();
            Some(json!({"op": 9, "d": {"requestId": d["requestId"], "results": results}}))
        }
        _ => None,
    }
}

fn respond(request: &Value, state: &MockState) -> Value {
    let request_type = request["requestType"].as_str().unwrap_or_default();
    let mut d = json!({
        "requestType": request_type,
        "requestStatus": {"result": true, "code": 100},
    });
    if let Some(id) = request.get("requestId") {
        d["requestId"] = id.clone();
    }
    let data = canned(request_type, state);
    if !data.is_null() {
        d["responseData"] = data;
    }
    d
}

fn canned(request_type: &str, state: &MockState) -> Value {
    match request_type {
        "GetVersion" => json!({"obsVersion": "31.0.0", "obsWebSocketVersion": "5.5.0", "rpcVersion": 1}),
        "GetSceneList" => json!({
            "currentProgramSceneName": "Main",
            "currentPreviewSceneName": null,
            "scenes": [{"sceneIndex": 0, "sceneName": "Main"}]
        }),
        "GetStudioModeEnabled" => json!({"studioModeEnabled": false}),
        "GetStreamStatus" => json!({
            "outputActive": state.streaming.load(Ordering::SeqCst),
            "outputReconnecting": false,
            "outputTimecode": "00:00:00.000",
            "outputDuration": 0,
            "outputBytes": 0,
            "outputSkippedFrames": 0,
            "outputTotalFrames": 0
        }),
        "GetRecordStatus" => json!({
            "outputActive": false,
            "outputPaused": false,
            "outputTimecode": "00:00:00.000",
            "outputDuration": 0,
            "outputBytes": 0
        }),
        "GetVirtualCamStatus" | "GetReplayBufferStatus" => json!({"outputActive": false}),
        "GetStats" => json!({
            "cpuUsage": 1.5,
            "memoryUsage": 256.0,
            "availableDiskSpace": 100000.0,
            "activeFps": 60.0,
            "averageFrameRenderTime": 0.5,
            "renderSkippedFrames": 0,
            "renderTotalFrames": 600,
            "outputSkippedFrames": 0,
            "outputTotalFrames": 600,
            "webSocketSessionIncomingMessages": 10,
            "webSocketSessionOutgoingMessages": 10
        }),
        _ => Value::Null,
    }
}

pub async fn eventually<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

pub async fn wait_for_state(
    api: &ObsApi,
    session_id: &SessionId,
    want: ConnectionState,
) -> ConnectionStatus {
    for _ in 0..500 {
        match api.get_status(session_id).await {
            Ok(status) if status.state == want => return status,
            Ok(_) | Err(SessionError::ComponentNotFound(_)) | Err(SessionError::ComponentStopped(_)) => {}
            Err(e) => panic!("status failed: {e}"),
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("session {session_id} never reached {want}");
}
