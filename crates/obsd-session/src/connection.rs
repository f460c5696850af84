use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use obsd_core::protocol::{
    self, close_code_name, is_unrecoverable_close_code, opcode_name, EventSubscription, Frame,
    HelloPayload, IdentifiedPayload, OpCode,
};
use obsd_core::{auth, ConnectionState, ProtocolError, SessionId};
use obsd_telemetry::{ConnectionMetrics, Metric};
use secrecy::ExposeSecret;
use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Sleep;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::backoff::Backoff;
use crate::config::SessionOptions;
use crate::error::SessionError;
use crate::event_handler::EventHandlerHandle;
use crate::mailbox;
use crate::tracker::{OutboundRequest, TrackerHandle};

const COMPONENT: &str = "connection";
const CLOSE_GRACE: Duration = Duration::from_millis(250);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Snapshot of the connection actor for operators.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub negotiated_rpc_version: Option<u32>,
    pub authenticated: bool,
    pub halted: bool,
    pub last_error: Option<String>,
    pub queued_requests: usize,
    pub reconnect_attempts: u32,
}

pub(crate) enum ConnectionMsg {
    SendRequest {
        request_id: u64,
        request: OutboundRequest,
    },
    Reidentify {
        subscriptions: EventSubscription,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    /// The tracker gave up on this id; drop it if it is still queued.
    Forget {
        request_id: u64,
    },
    Reconnect,
    GetState {
        reply: oneshot::Sender<ConnectionState>,
    },
    Status {
        reply: oneshot::Sender<ConnectionStatus>,
    },
    Upgraded {
        epoch: u64,
        result: Result<WsStream, String>,
    },
    Inbound {
        epoch: u64,
        frame: Result<Frame, ProtocolError>,
    },
    Closed {
        epoch: u64,
        code: Option<u16>,
        reason: String,
    },
    WriteFailed {
        epoch: u64,
        request_id: Option<u64>,
        error: String,
    },
}

struct Outbound {
    message: Message,
    request_id: Option<u64>,
}

struct Writer {
    tx: mpsc::UnboundedSender<Outbound>,
    task: JoinHandle<()>,
}

/// Handle to a session's connection actor.
#[derive(Clone)]
pub struct ConnectionHandle {
    tx: mpsc::UnboundedSender<ConnectionMsg>,
}

impl ConnectionHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<ConnectionMsg>) -> Self {
        Self { tx }
    }

    /// Hand a tracked request to the connection. The outcome comes back
    /// through the tracker.
    pub(crate) fn send_request(
        &self,
        request_id: u64,
        request: OutboundRequest,
    ) -> Result<(), SessionError> {
        self.tx
            .send(ConnectionMsg::SendRequest {
                request_id,
                request,
            })
            .map_err(|_| SessionError::ComponentStopped(COMPONENT))
    }

    pub(crate) fn forget(&self, request_id: u64) {
        mailbox::cast(&self.tx, COMPONENT, ConnectionMsg::Forget { request_id });
    }

    pub async fn get_state(&self) -> Result<ConnectionState, SessionError> {
        mailbox::call(&self.tx, COMPONENT, |reply| ConnectionMsg::GetState { reply }).await
    }

    pub async fn status(&self) -> Result<ConnectionStatus, SessionError> {
        mailbox::call(&self.tx, COMPONENT, |reply| ConnectionMsg::Status { reply }).await
    }

    /// Change event subscriptions on a ready connection.
    pub async fn reidentify(&self, subscriptions: EventSubscription) -> Result<(), SessionError> {
        mailbox::call(&self.tx, COMPONENT, |reply| ConnectionMsg::Reidentify {
            subscriptions,
            reply,
        })
        .await?
    }

    /// Drop the current transport and connect again. Also clears a halt
    /// caused by an unrecoverable close code.
    pub fn reconnect(&self) -> Result<(), SessionError> {
        self.tx
            .send(ConnectionMsg::Reconnect)
            .map_err(|_| SessionError::ComponentStopped(COMPONENT))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TimerKind {
    Connect,
    Auth,
    Backoff,
}

struct StateTimer {
    kind: TimerKind,
    sleep: Pin<Box<Sleep>>,
}

/// Owns the socket and drives the protocol state machine.
///
/// Socket I/O (the connect handshake, reading and writing frames) runs in
/// sub-tasks that report back through the mailbox tagged with `epoch`; any
/// message carrying an older epoch belongs to a dropped transport and is
/// ignored. The actor itself never awaits the socket.
pub(crate) struct Connection {
    session_id: SessionId,
    options: SessionOptions,
    rx: mpsc::UnboundedReceiver<ConnectionMsg>,
    mailbox: mpsc::UnboundedSender<ConnectionMsg>,
    tracker: TrackerHandle,
    events: EventHandlerHandle,
    metrics: Arc<ConnectionMetrics>,
    cancel: CancellationToken,

    state: ConnectionState,
    epoch: u64,
    writer: Option<Writer>,
    reader: Option<JoinHandle<()>>,
    attempt: Option<JoinHandle<()>>,
    timer: Option<StateTimer>,
    backoff: Backoff,
    queue: VecDeque<u64>,
    negotiated_rpc_version: Option<u32>,
    authenticated: bool,
    halted: bool,
    last_error: Option<SessionError>,
}

impl Connection {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        session_id: SessionId,
        options: SessionOptions,
        mailbox: mpsc::UnboundedSender<ConnectionMsg>,
        rx: mpsc::UnboundedReceiver<ConnectionMsg>,
        tracker: TrackerHandle,
        events: EventHandlerHandle,
        metrics: Arc<ConnectionMetrics>,
        cancel: CancellationToken,
    ) -> Self {
        let backoff = Backoff::new(options.backoff.clone());
        Self {
            session_id,
            options,
            rx,
            mailbox,
            tracker,
            events,
            metrics,
            cancel,
            state: ConnectionState::Disconnected,
            epoch: 0,
            writer: None,
            reader: None,
            attempt: None,
            timer: None,
            backoff,
            queue: VecDeque::new(),
            negotiated_rpc_version: None,
            authenticated: false,
            halted: false,
            last_error: None,
        }
    }

    pub(crate) async fn run(mut self) {
        info!(session_id = %self.session_id, uri = %self.options.uri, "connection started");
        self.connect();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                msg = self.rx.recv() => match msg {
                    Some(msg) => self.handle(msg),
                    None => break,
                },
                kind = expired(&mut self.timer) => {
                    self.timer = None;
                    self.on_timer(kind);
                }
            }
        }
        self.shutdown().await;
    }

    fn handle(&mut self, msg: ConnectionMsg) {
        match msg {
            ConnectionMsg::SendRequest {
                request_id,
                request,
            } => self.send_request(request_id, request),
            ConnectionMsg::Reidentify {
                subscriptions,
                reply,
            } => {
                let result = self.reidentify(subscriptions);
                let _ = reply.send(result);
            }
            ConnectionMsg::Forget { request_id } => {
                self.queue.retain(|&id| id != request_id);
            }
            ConnectionMsg::Reconnect => self.reconnect(),
            ConnectionMsg::GetState { reply } => {
                let _ = reply.send(self.state);
            }
            ConnectionMsg::Status { reply } => {
                let _ = reply.send(self.status());
            }
            ConnectionMsg::Upgraded { epoch, result } => self.on_upgraded(epoch, result),
            ConnectionMsg::Inbound { epoch, frame } => self.on_frame(epoch, frame),
            ConnectionMsg::Closed {
                epoch,
                code,
                reason,
            } => self.on_closed(epoch, code, reason),
            ConnectionMsg::WriteFailed {
                epoch,
                request_id,
                error,
            } => {
                if let Some(id) = request_id {
                    self.tracker.fail(id, SessionError::NotConnected);
                }
                if epoch == self.epoch {
                    warn!(session_id = %self.session_id, error = %error, "write failed");
                }
                self.on_closed(epoch, None, error);
            }
        }
    }

    // ── State machine ───────────────────────────────────────────────────────

    fn transition(&mut self, to: ConnectionState) {
        let from = self.state;
        if from == to {
            return;
        }
        self.timer = None;
        self.state = to;
        info!(session_id = %self.session_id, from = %from, to = %to, "connection state changed");
        self.events.state_changed(from, to);
    }

    fn arm(&mut self, kind: TimerKind, after: Duration) {
        self.timer = Some(StateTimer {
            kind,
            sleep: Box::pin(tokio::time::sleep(after)),
        });
    }

    fn connect(&mut self) {
        self.drop_transport();
        self.transition(ConnectionState::Connecting);
        self.metrics.record(Metric::ConnectAttempt);

        let epoch = self.epoch;
        let uri = self.options.uri.clone();
        let mailbox = self.mailbox.clone();
        self.attempt = Some(tokio::spawn(async move {
            let result = connect_async(uri.as_str())
                .await
                .map(|(ws, _)| ws)
                .map_err(|e| e.to_string());
            let _ = mailbox.send(ConnectionMsg::Upgraded { epoch, result });
        }));
        self.arm(TimerKind::Connect, self.options.connect_timeout());
    }

    fn on_upgraded(&mut self, epoch: u64, result: Result<WsStream, String>) {
        if epoch != self.epoch || self.state != ConnectionState::Connecting {
            debug!(session_id = %self.session_id, "discarding stale connect result");
            return;
        }
        self.attempt = None;
        match result {
            Ok(ws) => {
                self.metrics.record(Metric::ConnectSucceeded);
                let (sink, stream) = ws.split();
                self.writer = Some(spawn_writer(
                    sink,
                    epoch,
                    self.mailbox.clone(),
                    Arc::clone(&self.metrics),
                ));
                self.reader = Some(spawn_reader(stream, epoch, self.mailbox.clone()));
                self.transition(ConnectionState::Authenticating);
                self.arm(TimerKind::Auth, self.options.auth_timeout());
            }
            Err(e) => {
                self.metrics.record(Metric::ConnectFailed);
                warn!(session_id = %self.session_id, error = %e, "connect failed");
                self.fail_attempt(SessionError::Transport(e));
            }
        }
    }

    fn on_timer(&mut self, kind: TimerKind) {
        match (kind, self.state) {
            (TimerKind::Connect, ConnectionState::Connecting) => {
                self.metrics.record(Metric::ConnectFailed);
                warn!(session_id = %self.session_id, "connect timed out");
                self.fail_attempt(SessionError::ConnectTimeout);
            }
            (TimerKind::Auth, ConnectionState::Authenticating) => {
                warn!(session_id = %self.session_id, "authentication timed out");
                self.fail_attempt(SessionError::AuthTimeout);
            }
            (
                TimerKind::Backoff,
                ConnectionState::Disconnected | ConnectionState::Reconnecting,
            ) => {
                self.metrics.record(Metric::Reconnect);
                self.transition(ConnectionState::Disconnected);
                self.connect();
            }
            (kind, state) => {
                debug!(session_id = %self.session_id, ?kind, state = %state, "ignoring stray timer");
            }
        }
    }

    /// A connect or handshake attempt failed: back to disconnected and retry.
    fn fail_attempt(&mut self, error: SessionError) {
        self.last_error = Some(error);
        self.drop_transport();
        self.transition(ConnectionState::Disconnected);
        self.schedule_retry();
    }

    fn schedule_retry(&mut self) {
        if self.halted {
            return;
        }
        match self.backoff.next_delay() {
            Some(delay) => {
                info!(
                    session_id = %self.session_id,
                    attempt = self.backoff.attempts(),
                    delay_ms = delay.as_millis() as u64,
                    "reconnect scheduled"
                );
                self.arm(TimerKind::Backoff, delay);
            }
            None => {
                error!(
                    session_id = %self.session_id,
                    attempts = self.backoff.attempts(),
                    "reconnect attempts exhausted, staying disconnected"
                );
            }
        }
    }

    fn enter_ready(&mut self) {
        self.transition(ConnectionState::Ready);
        self.backoff.reset();
        self.last_error = None;
        if !self.queue.is_empty() {
            debug!(session_id = %self.session_id, expired = self.queue.len(), "expiring requests queued before ready");
        }
        self.fail_queue(SessionError::RequestExpired);
    }

    fn fail_queue(&mut self, error: SessionError) {
        for id in self.queue.drain(..) {
            self.tracker.fail(id, error.clone());
        }
    }

    fn reconnect(&mut self) {
        info!(session_id = %self.session_id, state = %self.state, "reconnect requested");
        self.halted = false;
        self.backoff.reset();
        self.drop_transport();
        self.transition(ConnectionState::Disconnected);
        self.connect();
    }

    fn drop_transport(&mut self) {
        self.epoch += 1;
        if let Some(Writer { tx, mut task }) = self.writer.take() {
            // Closing the channel lets the writer flush and send a close frame.
            drop(tx);
            tokio::spawn(async move {
                if tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err() {
                    task.abort();
                }
            });
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(attempt) = self.attempt.take() {
            attempt.abort();
        }
        self.authenticated = false;
    }

    // ── Inbound ─────────────────────────────────────────────────────────────

    fn on_frame(&mut self, epoch: u64, frame: Result<Frame, ProtocolError>) {
        if epoch != self.epoch {
            return;
        }
        self.metrics.record(Metric::FrameReceived);
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                self.metrics.record(Metric::DecodeError);
                warn!(session_id = %self.session_id, error = %e, kind = e.error_kind(), "dropping malformed frame");
                return;
            }
        };
        trace!(session_id = %self.session_id, op = %opcode_name(frame.op), "frame received");
        match frame.opcode() {
            Some(OpCode::Hello) => self.on_hello(&frame.d),
            Some(OpCode::Identified) => self.on_identified(&frame.d),
            Some(OpCode::Event) if self.state.is_ready() => self.events.dispatch(frame.d),
            Some(OpCode::RequestResponse) if self.state.is_ready() => {
                self.tracker.response(frame.d, false)
            }
            Some(OpCode::RequestBatchResponse) if self.state.is_ready() => {
                self.tracker.response(frame.d, true)
            }
            _ => {
                debug!(
                    session_id = %self.session_id,
                    op = %opcode_name(frame.op),
                    state = %self.state,
                    "ignoring frame"
                );
            }
        }
    }

    fn on_hello(&mut self, d: &Value) {
        if self.state != ConnectionState::Authenticating {
            debug!(session_id = %self.session_id, state = %self.state, "unexpected hello");
            return;
        }
        let hello = match HelloPayload::from_value(d) {
            Ok(hello) => hello,
            Err(e) => {
                self.metrics.record(Metric::DecodeError);
                warn!(session_id = %self.session_id, error = %e, "malformed hello");
                return;
            }
        };
        debug!(
            session_id = %self.session_id,
            obs_websocket_version = hello.obs_web_socket_version.as_deref().unwrap_or("unknown"),
            rpc_version = hello.rpc_version,
            auth_required = hello.authentication.is_some(),
            "hello received"
        );
        self.negotiated_rpc_version = Some(hello.rpc_version.min(self.options.rpc_version));

        let credential = match (&hello.authentication, &self.options.password) {
            (None, _) => Ok(None),
            (Some(challenge), Some(password)) => {
                Ok(Some(auth::respond_to(password.expose_secret(), challenge)))
            }
            (Some(_), None) => Err(SessionError::AuthenticationNotConfigured),
        };
        let credential = match credential {
            Ok(credential) => credential,
            Err(e) => {
                warn!(session_id = %self.session_id, "obs requires a password but none is configured");
                self.fail_attempt(e);
                return;
            }
        };
        let identify = protocol::encode_identify(
            self.options.rpc_version,
            credential.as_deref(),
            Some(self.options.event_subscriptions),
        );
        let sent = match identify {
            Ok(text) => self.write(text, None),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = sent {
            warn!(session_id = %self.session_id, error = %e, "failed to send identify");
            self.fail_attempt(e);
            return;
        }
        self.authenticated = credential.is_some();
        self.enter_ready();
    }

    fn on_identified(&mut self, d: &Value) {
        match IdentifiedPayload::from_value(d) {
            Ok(identified) => {
                self.negotiated_rpc_version = Some(identified.negotiated_rpc_version);
            }
            Err(e) => {
                warn!(session_id = %self.session_id, error = %e, "malformed identified");
            }
        }
        if self.state == ConnectionState::Authenticating {
            self.enter_ready();
        }
    }

    fn on_closed(&mut self, epoch: u64, code: Option<u16>, reason: String) {
        if epoch != self.epoch {
            return;
        }
        self.drop_transport();
        if let Some(code) = code.filter(|c| is_unrecoverable_close_code(*c)) {
            error!(
                session_id = %self.session_id,
                code,
                name = close_code_name(code),
                reason = %reason,
                "connection closed with unrecoverable code, not reconnecting"
            );
            self.halted = true;
            self.last_error = Some(SessionError::UnrecoverableCloseCode { code });
            self.transition(ConnectionState::Disconnected);
            self.fail_queue(SessionError::RequestExpired);
            return;
        }
        let error = SessionError::Transport(match code {
            Some(code) => format!("closed with {code} ({}): {reason}", close_code_name(code)),
            None => format!("transport lost: {reason}"),
        });
        match self.state {
            ConnectionState::Ready => {
                warn!(session_id = %self.session_id, error = %error, "connection lost");
                self.last_error = Some(error);
                self.transition(ConnectionState::Reconnecting);
                self.schedule_retry();
            }
            ConnectionState::Connecting | ConnectionState::Authenticating => {
                warn!(session_id = %self.session_id, error = %error, "connection closed during handshake");
                self.fail_attempt(error);
            }
            ConnectionState::Disconnected | ConnectionState::Reconnecting => {}
        }
    }

    // ── Outbound ────────────────────────────────────────────────────────────

    fn send_request(&mut self, request_id: u64, request: OutboundRequest) {
        if self.halted {
            self.tracker.fail(request_id, SessionError::NotConnected);
            return;
        }
        if !self.state.is_ready() {
            debug!(session_id = %self.session_id, request_id, state = %self.state, "request queued");
            self.queue.push_back(request_id);
            return;
        }
        let text = match request.encode(&request_id.to_string()) {
            Ok(text) => text,
            Err(e) => {
                self.tracker.fail(request_id, e.into());
                return;
            }
        };
        match self.write(text, Some(request_id)) {
            Ok(()) => self.metrics.record(Metric::RequestSent),
            Err(e) => {
                warn!(session_id = %self.session_id, request_id, error = %e, "request write failed");
                self.tracker.fail(request_id, SessionError::NotConnected);
            }
        }
    }

    fn reidentify(&mut self, subscriptions: EventSubscription) -> Result<(), SessionError> {
        if !self.state.is_ready() {
            return Err(SessionError::NotConnected);
        }
        let text = protocol::encode_reidentify(Some(subscriptions))?;
        self.write(text, None)?;
        self.options.event_subscriptions = subscriptions;
        info!(session_id = %self.session_id, subscriptions = %subscriptions, "event subscriptions updated");
        Ok(())
    }

    /// Queue a frame on the writer. Fails only when there is no transport.
    fn write(&self, text: String, request_id: Option<u64>) -> Result<(), SessionError> {
        let writer = self.writer.as_ref().ok_or(SessionError::NotConnected)?;
        writer
            .tx
            .send(Outbound {
                message: Message::Text(text.into()),
                request_id,
            })
            .map_err(|_| SessionError::NotConnected)
    }

    fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            state: self.state,
            negotiated_rpc_version: self.negotiated_rpc_version,
            authenticated: self.authenticated,
            halted: self.halted,
            last_error: self.last_error.as_ref().map(ToString::to_string),
            queued_requests: self.queue.len(),
            reconnect_attempts: self.backoff.attempts(),
        }
    }

    async fn shutdown(&mut self) {
        self.fail_queue(SessionError::RequestExpired);
        if let Some(Writer { tx, mut task }) = self.writer.take() {
            drop(tx);
            if tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }
        self.drop_transport();
        debug!(session_id = %self.session_id, "connection stopped");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            writer.task.abort();
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(attempt) = self.attempt.take() {
            attempt.abort();
        }
    }
}

async fn expired(timer: &mut Option<StateTimer>) -> TimerKind {
    match timer {
        Some(t) => {
            t.sleep.as_mut().await;
            t.kind
        }
        None => std::future::pending().await,
    }
}

/// Drain queued frames into the write half. A failed send is reported once and
/// ends the task; a closed channel flushes and closes the socket.
fn spawn_writer(
    mut sink: WsSink,
    epoch: u64,
    mailbox: mpsc::UnboundedSender<ConnectionMsg>,
    metrics: Arc<ConnectionMetrics>,
) -> Writer {
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let task = tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            if let Err(e) = sink.send(out.message).await {
                let _ = mailbox.send(ConnectionMsg::WriteFailed {
                    epoch,
                    request_id: out.request_id,
                    error: e.to_string(),
                });
                return;
            }
            metrics.record(Metric::FrameSent);
        }
        let _ = tokio::time::timeout(CLOSE_GRACE, sink.close()).await;
    });
    Writer { tx, task }
}

/// Forward decoded frames from the read half until the transport closes.
fn spawn_reader(
    mut stream: SplitStream<WsStream>,
    epoch: u64,
    mailbox: mpsc::UnboundedSender<ConnectionMsg>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let (code, reason) = loop {
            let frame = match stream.next().await {
                Some(Ok(Message::Text(text))) => protocol::decode(text.as_str()),
                Some(Ok(Message::Binary(bytes))) => protocol::decode_bytes(&bytes),
                Some(Ok(Message::Close(frame))) => match frame {
                    Some(f) => break (Some(u16::from(f.code)), f.reason.to_string()),
                    None => break (None, "closed without a close frame".to_string()),
                },
                Some(Ok(_)) => continue,
                Some(Err(e)) => break (None, e.to_string()),
                None => break (None, "stream ended".to_string()),
            };
            if mailbox.send(ConnectionMsg::Inbound { epoch, frame }).is_err() {
                return;
            }
        };
        let _ = mailbox.send(ConnectionMsg::Closed {
            epoch,
            code,
            reason,
        });
    })
}
