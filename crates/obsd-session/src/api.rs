//! Inbound surface used by the gateway and the CLI.

use std::sync::Arc;

use obsd_core::protocol::{self, BatchExecution, BatchRequest};
use obsd_core::{ConnectionState, SessionId};
use serde_json::Value;
use tracing::debug;

use crate::connection::ConnectionStatus;
use crate::error::SessionError;
use crate::registry::SessionRegistry;
use crate::scenes::SceneSnapshot;
use crate::stats::StatsSnapshot;
use crate::stream::OutputSnapshot;
use crate::tracker::TrackerHandle;

#[derive(Clone)]
pub struct ObsApi {
    registry: Arc<SessionRegistry>,
}

impl ObsApi {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Send one request. `name` must be a JSON string; a null payload sends no
    /// `requestData`.
    pub async fn send_request(
        &self,
        session_id: &SessionId,
        name: &Value,
        payload: &Value,
    ) -> Result<Value, SessionError> {
        let request_type = protocol::validate_request(name, payload)?;
        let tracker = self.tracker(session_id)?;
        let request_data = (!payload.is_null()).then(|| payload.clone());
        debug!(session_id = %session_id, request_type, "api request");
        tracker.send_request(request_type, request_data).await
    }

    pub async fn send_batch(
        &self,
        session_id: &SessionId,
        requests: Vec<BatchRequest>,
        halt_on_failure: Option<bool>,
        execution_type: Option<BatchExecution>,
    ) -> Result<Vec<Value>, SessionError> {
        let tracker = self.tracker(session_id)?;
        tracker
            .send_batch(requests, halt_on_failure, execution_type)
            .await
    }

    pub async fn get_state(&self, session_id: &SessionId) -> Result<ConnectionState, SessionError> {
        self.registry.lookup(session_id)?.connection()?.get_state().await
    }

    pub async fn get_status(&self, session_id: &SessionId) -> Result<ConnectionStatus, SessionError> {
        self.registry.lookup(session_id)?.connection()?.status().await
    }

    pub fn get_scenes_cached(&self, session_id: &SessionId) -> Result<SceneSnapshot, SessionError> {
        self.registry.caches().scenes(session_id)
    }

    pub fn get_stats_cached(&self, session_id: &SessionId) -> Result<StatsSnapshot, SessionError> {
        self.registry.caches().stats(session_id)
    }

    pub fn get_stream_info(&self, session_id: &SessionId) -> Result<OutputSnapshot, SessionError> {
        self.registry.caches().outputs(session_id)
    }

    fn tracker(&self, session_id: &SessionId) -> Result<TrackerHandle, SessionError> {
        let supervisor = self.registry.lookup(session_id)?;
        supervisor
            .tracker()
            .map_err(|_| SessionError::TrackerNotFound(session_id.clone()))
    }
}
