use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use obsd_core::protocol::{
    self, BatchExecution, BatchRequest, RequestBatchResponse, RequestResponse,
};
use obsd_core::{ProtocolError, SessionId};
use obsd_telemetry::{ConnectionMetrics, Metric};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::connection::ConnectionHandle;
use crate::error::SessionError;
use crate::mailbox;

const COMPONENT: &str = "request_tracker";

/// A request on its way to OBS.
#[derive(Clone, Debug, PartialEq)]
pub enum OutboundRequest {
    Single {
        request_type: String,
        request_data: Option<Value>,
    },
    Batch {
        requests: Vec<BatchRequest>,
        halt_on_failure: Option<bool>,
        execution_type: Option<BatchExecution>,
    },
}

impl OutboundRequest {
    pub fn single(request_type: impl Into<String>, request_data: Option<Value>) -> Self {
        Self::Single {
            request_type: request_type.into(),
            request_data,
        }
    }

    /// Wire frame for this request under `request_id`.
    pub fn encode(&self, request_id: &str) -> Result<String, ProtocolError> {
        match self {
            Self::Single {
                request_type,
                request_data,
            } => protocol::encode_request(request_type, request_id, request_data.as_ref()),
            Self::Batch {
                requests,
                halt_on_failure,
                execution_type,
            } => protocol::encode_request_batch(
                request_id,
                requests,
                *halt_on_failure,
                *execution_type,
            ),
        }
    }

    /// Short name for logs.
    pub fn label(&self) -> &str {
        match self {
            Self::Single { request_type, .. } => request_type,
            Self::Batch { .. } => "RequestBatch",
        }
    }
}

/// Id allocation and bookkeeping for in-flight requests.
///
/// Ids start at 1 and only grow; an id is never handed out twice.
#[derive(Debug)]
pub struct RequestTable<C> {
    next_id: u64,
    entries: HashMap<u64, C>,
}

impl<C> Default for RequestTable<C> {
    fn default() -> Self {
        Self {
            next_id: 1,
            entries: HashMap::new(),
        }
    }
}

impl<C> RequestTable<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next id and store the entry built for it.
    pub fn track_with(&mut self, make: impl FnOnce(u64) -> C) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(id, make(id));
        id
    }

    pub fn track(&mut self, caller: C) -> u64 {
        self.track_with(|_| caller)
    }

    /// Remove and return the entry for `id`. Unknown ids leave the table as is.
    pub fn resolve(&mut self, id: u64) -> Option<C> {
        self.entries.remove(&id)
    }

    pub fn is_tracked(&self, id: u64) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn pending(&self) -> usize {
        self.entries.len()
    }

    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    pub fn drain(&mut self) -> Vec<(u64, C)> {
        self.entries.drain().collect()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TrackerStats {
    pub next_id: u64,
    pub pending: usize,
}

type Reply = oneshot::Sender<Result<Value, SessionError>>;

pub(crate) enum TrackerMsg {
    Track { request: OutboundRequest, reply: Reply },
    Response { payload: Value, batch: bool },
    Timeout { id: u64 },
    Fail { id: u64, error: SessionError },
    Stats { reply: oneshot::Sender<TrackerStats> },
}

/// Handle to a session's request tracker.
#[derive(Clone)]
pub struct TrackerHandle {
    tx: mpsc::UnboundedSender<TrackerMsg>,
}

impl TrackerHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<TrackerMsg>) -> Self {
        Self { tx }
    }

    /// Track `request`, hand it to the connection and wait for the matching
    /// response, a timeout, or a failure.
    pub async fn track_and_send(&self, request: OutboundRequest) -> Result<Value, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(TrackerMsg::Track { request, reply })
            .map_err(|_| SessionError::ComponentStopped(COMPONENT))?;
        rx.await.map_err(|_| SessionError::RequestExpired)?
    }

    pub async fn send_request(
        &self,
        request_type: &str,
        request_data: Option<Value>,
    ) -> Result<Value, SessionError> {
        self.track_and_send(OutboundRequest::single(request_type, request_data))
            .await
    }

    /// Send a batch; resolves with the per-request results in order.
    pub async fn send_batch(
        &self,
        requests: Vec<BatchRequest>,
        halt_on_failure: Option<bool>,
        execution_type: Option<BatchExecution>,
    ) -> Result<Vec<Value>, SessionError> {
        let value = self
            .track_and_send(OutboundRequest::Batch {
                requests,
                halt_on_failure,
                execution_type,
            })
            .await?;
        match value {
            Value::Array(results) => Ok(results),
            other => Ok(vec![other]),
        }
    }

    pub async fn stats(&self) -> Result<TrackerStats, SessionError> {
        mailbox::call(&self.tx, COMPONENT, |reply| TrackerMsg::Stats { reply }).await
    }

    pub(crate) fn response(&self, payload: Value, batch: bool) {
        mailbox::cast(&self.tx, COMPONENT, TrackerMsg::Response { payload, batch });
    }

    pub(crate) fn fail(&self, id: u64, error: SessionError) {
        mailbox::cast(&self.tx, COMPONENT, TrackerMsg::Fail { id, error });
    }
}

struct Pending {
    reply: Reply,
    timer: JoinHandle<()>,
    label: String,
}

/// Correlates outbound requests with responses by id.
pub(crate) struct RequestTracker {
    session_id: SessionId,
    rx: mpsc::UnboundedReceiver<TrackerMsg>,
    mailbox: mpsc::WeakUnboundedSender<TrackerMsg>,
    connection: ConnectionHandle,
    metrics: Arc<ConnectionMetrics>,
    timeout: Duration,
    cancel: CancellationToken,
    table: RequestTable<Pending>,
}

impl RequestTracker {
    pub(crate) fn new(
        session_id: SessionId,
        mailbox: &mpsc::UnboundedSender<TrackerMsg>,
        rx: mpsc::UnboundedReceiver<TrackerMsg>,
        connection: ConnectionHandle,
        metrics: Arc<ConnectionMetrics>,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session_id,
            rx,
            mailbox: mailbox.downgrade(),
            connection,
            metrics,
            timeout,
            cancel,
            table: RequestTable::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        debug!(session_id = %self.session_id, "request tracker started");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                msg = self.rx.recv() => match msg {
                    Some(msg) => self.handle(msg),
                    None => break,
                },
            }
        }
        self.expire_all();
    }

    fn handle(&mut self, msg: TrackerMsg) {
        match msg {
            TrackerMsg::Track { request, reply } => self.track(request, reply),
            TrackerMsg::Response { payload, batch } => self.on_response(payload, batch),
            TrackerMsg::Timeout { id } => self.on_timeout(id),
            TrackerMsg::Fail { id, error } => self.finish(id, Err(error)),
            TrackerMsg::Stats { reply } => {
                let _ = reply.send(TrackerStats {
                    next_id: self.table.next_id(),
                    pending: self.table.pending(),
                });
            }
        }
    }

    fn track(&mut self, request: OutboundRequest, reply: Reply) {
        let mailbox = self.mailbox.clone();
        let timeout = self.timeout;
        let label = request.label().to_string();
        let id = self.table.track_with(|id| Pending {
            reply,
            timer: arm_timeout(mailbox, timeout, id),
            label,
        });
        debug!(session_id = %self.session_id, request_id = id, request = request.label(), "tracking request");
        if self.connection.send_request(id, request).is_err() {
            self.finish(id, Err(SessionError::NotConnected));
        }
    }

    fn on_response(&mut self, payload: Value, batch: bool) {
        let (request_id, outcome) = if batch {
            match RequestBatchResponse::from_value(&payload) {
                Ok(r) => (r.request_id, Ok(Value::Array(r.results))),
                Err(e) => {
                    warn!(session_id = %self.session_id, error = %e, "malformed batch response");
                    return;
                }
            }
        } else {
            match RequestResponse::from_value(&payload) {
                Ok(r) => {
                    let outcome = if r.request_status.result {
                        Ok(r.response_data.unwrap_or(Value::Null))
                    } else {
                        Err(SessionError::RequestFailed {
                            code: r.request_status.code,
                            comment: r.request_status.comment,
                        })
                    };
                    (r.request_id, outcome)
                }
                Err(e) => {
                    warn!(session_id = %self.session_id, error = %e, "malformed request response");
                    return;
                }
            }
        };
        let Ok(id) = request_id.parse::<u64>() else {
            debug!(session_id = %self.session_id, request_id = %request_id, "response for foreign request id ignored");
            return;
        };
        if !self.table.is_tracked(id) {
            debug!(session_id = %self.session_id, request_id = id, "response for untracked request ignored");
            return;
        }
        self.finish(id, outcome);
    }

    fn on_timeout(&mut self, id: u64) {
        if let Some(pending) = self.table.resolve(id) {
            self.metrics.record(Metric::RequestTimeout);
            warn!(session_id = %self.session_id, request_id = id, request = %pending.label, "request timed out");
            let _ = pending.reply.send(Err(SessionError::RequestTimeout));
            self.connection.forget(id);
        }
    }

    fn finish(&mut self, id: u64, outcome: Result<Value, SessionError>) {
        if let Some(pending) = self.table.resolve(id) {
            pending.timer.abort();
            let _ = pending.reply.send(outcome);
        }
    }

    fn expire_all(&mut self) {
        for (_, pending) in self.table.drain() {
            pending.timer.abort();
            let _ = pending.reply.send(Err(SessionError::RequestExpired));
        }
    }
}

fn arm_timeout(
    mailbox: mpsc::WeakUnboundedSender<TrackerMsg>,
    timeout: Duration,
    id: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        if let Some(tx) = mailbox.upgrade() {
            let _ = tx.send(TrackerMsg::Timeout { id });
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionMsg;
    use serde_json::json;

    struct Harness {
        handle: TrackerHandle,
        conn_rx: mpsc::UnboundedReceiver<ConnectionMsg>,
        metrics: Arc<ConnectionMetrics>,
        cancel: CancellationToken,
        task: JoinHandle<()>,
    }

    fn spawn_tracker(timeout: Duration) -> Harness {
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        let (tx, rx) = mpsc::unbounded_channel();
        let metrics = Arc::new(ConnectionMetrics::new());
        let cancel = CancellationToken::new();
        let tracker = RequestTracker::new(
            SessionId::from("t"),
            &tx,
            rx,
            ConnectionHandle::new(conn_tx),
            Arc::clone(&metrics),
            timeout,
            cancel.clone(),
        );
        let task = tokio::spawn(tracker.run());
        Harness {
            handle: TrackerHandle::new(tx),
            conn_rx,
            metrics,
            cancel,
            task,
        }
    }

    async fn next_request(rx: &mut mpsc::UnboundedReceiver<ConnectionMsg>) -> (u64, OutboundRequest) {
        match rx.recv().await {
            Some(ConnectionMsg::SendRequest {
                request_id,
                request,
            }) => (request_id, request),
            _ => panic!("expected a request for the connection"),
        }
    }

    fn ok_response(id: u64, data: Value) -> Value {
        json!({
            "requestType": "GetVersion",
            "requestId": id.to_string(),
            "requestStatus": { "result": true, "code": 100 },
            "responseData": data,
        })
    }

    #[tokio::test]
    async fn response_resolves_caller() {
        let mut h = spawn_tracker(Duration::from_secs(10));
        let handle = h.handle.clone();
        let call = tokio::spawn(async move { handle.send_request("GetVersion", None).await });

        let (id, request) = next_request(&mut h.conn_rx).await;
        assert_eq!(id, 1);
        assert_eq!(request.label(), "GetVersion");
        h.handle
            .response(ok_response(id, json!({"obsVersion": "30.1.2"})), false);

        let value = call.await.unwrap().unwrap();
        assert_eq!(value["obsVersion"], "30.1.2");
        let stats = h.handle.stats().await.unwrap();
        assert_eq!(stats, TrackerStats { next_id: 2, pending: 0 });
    }

    #[tokio::test]
    async fn failed_status_maps_to_request_failed() {
        let mut h = spawn_tracker(Duration::from_secs(10));
        let handle = h.handle.clone();
        let call = tokio::spawn(async move {
            handle
                .send_request("SetCurrentProgramScene", Some(json!({"sceneName": "Nope"})))
                .await
        });
        let (id, _) = next_request(&mut h.conn_rx).await;
        h.handle.response(
            json!({
                "requestType": "SetCurrentProgramScene",
                "requestId": id.to_string(),
                "requestStatus": { "result": false, "code": 600, "comment": "No source was found by the name of `Nope`." }
            }),
            false,
        );
        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::RequestFailed { code: 600, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_request_times_out() {
        let mut h = spawn_tracker(Duration::from_millis(500));
        let handle = h.handle.clone();
        let call = tokio::spawn(async move { handle.send_request("GetStats", None).await });
        let (id, _) = next_request(&mut h.conn_rx).await;

        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err, SessionError::RequestTimeout);
        assert_eq!(h.metrics.get(Metric::RequestTimeout), 1);
        match h.conn_rx.recv().await {
            Some(ConnectionMsg::Forget { request_id }) => assert_eq!(request_id, id),
            _ => panic!("expected the connection to be told to forget the request"),
        }

        // A late response for the expired id changes nothing.
        h.handle.response(ok_response(id, json!({})), false);
        let stats = h.handle.stats().await.unwrap();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.next_id, 2);
    }

    #[tokio::test]
    async fn untracked_response_is_ignored() {
        let h = spawn_tracker(Duration::from_secs(10));
        h.handle.response(ok_response(42, json!({})), false);
        h.handle.response(json!({"requestId": "not-ours"}), false);
        let stats = h.handle.stats().await.unwrap();
        assert_eq!(stats, TrackerStats { next_id: 1, pending: 0 });
    }

    #[tokio::test]
    async fn transmit_failure_reports_not_connected() {
        let mut h = spawn_tracker(Duration::from_secs(10));
        let handle = h.handle.clone();
        let call = tokio::spawn(async move { handle.send_request("GetVersion", None).await });
        let (id, _) = next_request(&mut h.conn_rx).await;
        h.handle.fail(id, SessionError::NotConnected);
        assert_eq!(call.await.unwrap().unwrap_err(), SessionError::NotConnected);
    }

    #[tokio::test]
    async fn batch_resolves_with_results() {
        let mut h = spawn_tracker(Duration::from_secs(10));
        let handle = h.handle.clone();
        let call = tokio::spawn(async move {
            handle
                .send_batch(
                    vec![
                        BatchRequest::new("GetVersion", None),
                        BatchRequest::new("GetStats", None),
                    ],
                    Some(true),
                    Some(BatchExecution::SerialRealtime),
                )
                .await
        });
        let (id, request) = next_request(&mut h.conn_rx).await;
        assert!(matches!(request, OutboundRequest::Batch { .. }));
        h.handle.response(
            json!({
                "requestId": id.to_string(),
                "results": [
                    {"requestType": "GetVersion", "requestStatus": {"result": true, "code": 100}},
                    {"requestType": "GetStats", "requestStatus": {"result": true, "code": 100}}
                ]
            }),
            true,
        );
        let results = call.await.unwrap().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[1]["requestType"], "GetStats");
    }

    #[tokio::test]
    async fn shutdown_expires_pending_callers() {
        let mut h = spawn_tracker(Duration::from_secs(10));
        let handle = h.handle.clone();
        let call = tokio::spawn(async move { handle.send_request("GetVersion", None).await });
        let _ = next_request(&mut h.conn_rx).await;
        h.cancel.cancel();
        h.task.await.unwrap();
        assert_eq!(call.await.unwrap().unwrap_err(), SessionError::RequestExpired);
        assert_eq!(
            h.handle.stats().await.unwrap_err(),
            SessionError::ComponentStopped("request_tracker")
        );
    }

    #[test]
    fn outbound_request_encodes_id_as_string() {
        let req = OutboundRequest::single("GetVersion", None);
        let frame = protocol::decode(&req.encode("7").unwrap()).unwrap();
        assert_eq!(frame.op, 6);
        assert_eq!(frame.d["requestId"], "7");
        assert!(frame.d.get("requestData").is_none());
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        #[derive(Clone, Debug)]
        enum Op {
            Track,
            Resolve(u64),
        }

        fn op() -> impl Strategy<Value = Op> {
            prop_oneof![Just(Op::Track), (0u64..40).prop_map(Op::Resolve)]
        }

        proptest! {
            #[test]
            fn ids_grow_and_untracked_resolves_are_noops(ops in proptest::collection::vec(op(), 0..200)) {
                let mut table: RequestTable<()> = RequestTable::new();
                let mut seen = std::collections::HashSet::new();
                let mut last_next = table.next_id();
                for op in ops {
                    match op {
                        Op::Track => {
                            let id = table.track(());
                            prop_assert!(seen.insert(id));
                        }
                        Op::Resolve(id) => {
                            let before = table.pending();
                            let tracked = table.is_tracked(id);
                            let removed = table.resolve(id).is_some();
                            prop_assert_eq!(removed, tracked);
                            if !tracked {
                                prop_assert_eq!(table.pending(), before);
                            }
                        }
                    }
                    prop_assert!(table.next_id() >= last_next);
                    last_next = table.next_id();
                }
            }
        }
    }
}
