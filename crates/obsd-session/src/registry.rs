use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use obsd_core::{EventBus, SessionId};
use tracing::{info, warn};

use crate::cache::Caches;
use crate::config::SessionOptions;
use crate::error::SessionError;
use crate::supervisor::{Component, ComponentKind, GiveUpHook, SessionSupervisor};

type SessionMap = DashMap<SessionId, Arc<SessionSupervisor>>;

/// Process-wide map of running sessions.
pub struct SessionRegistry {
    sessions: Arc<SessionMap>,
    bus: Arc<dyn EventBus>,
    caches: Caches,
}

impl SessionRegistry {
    pub fn new(bus: Arc<dyn EventBus>) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            bus,
            caches: Caches::new(),
        }
    }

    pub fn caches(&self) -> &Caches {
        &self.caches
    }

    /// Start a session, or return the one already registered under `session_id`.
    pub fn start_session(
        &self,
        session_id: SessionId,
        options: SessionOptions,
    ) -> Arc<SessionSupervisor> {
        match self.sessions.entry(session_id.clone()) {
            Entry::Occupied(existing) => {
                info!(session_id = %session_id, "session already running");
                Arc::clone(existing.get())
            }
            Entry::Vacant(slot) => {
                let supervisor = SessionSupervisor::start_with_hook(
                    session_id.clone(),
                    options,
                    Arc::clone(&self.bus),
                    self.caches.clone(),
                    Some(self.deregister_hook()),
                );
                info!(session_id = %session_id, uri = %supervisor.options().uri, "session registered");
                Arc::clone(slot.insert(supervisor).value())
            }
        }
    }

    /// Stop a session and wait for its components to exit.
    pub async fn stop_session(&self, session_id: &SessionId) -> Result<(), SessionError> {
        let (_, supervisor) = self
            .sessions
            .remove(session_id)
            .ok_or_else(|| SessionError::SessionNotFound(session_id.clone()))?;
        supervisor.shutdown().await;
        info!(session_id = %session_id, "session deregistered");
        Ok(())
    }

    pub async fn stop_all(&self) {
        for session_id in self.list_sessions() {
            if let Err(e) = self.stop_session(&session_id).await {
                warn!(session_id = %session_id, error = %e, "session vanished during shutdown");
            }
        }
    }

    /// Registered session ids, sorted.
    pub fn list_sessions(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn lookup(&self, session_id: &SessionId) -> Result<Arc<SessionSupervisor>, SessionError> {
        self.sessions
            .get(session_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| SessionError::SessionNotFound(session_id.clone()))
    }

    pub fn lookup_component(
        &self,
        session_id: &SessionId,
        kind: ComponentKind,
    ) -> Result<Component, SessionError> {
        self.lookup(session_id)?.component(kind)
    }

    /// Look a component up by its registered name, e.g. `"stream_manager"`.
    pub fn lookup_by_name(
        &self,
        session_id: &SessionId,
        name: &str,
    ) -> Result<Component, SessionError> {
        let supervisor = self.lookup(session_id)?;
        supervisor.component(name.parse()?)
    }

    // Drops the entry only if it still belongs to the supervisor giving up.
    fn deregister_hook(&self) -> GiveUpHook {
        let sessions: Weak<SessionMap> = Arc::downgrade(&self.sessions);
        Arc::new(move |session_id: &SessionId, instance: u64| {
            if let Some(sessions) = sessions.upgrade() {
                let removed = sessions.remove_if(session_id, |_, sup| sup.instance() == instance);
                if removed.is_some() {
                    warn!(session_id = %session_id, "session deregistered after repeated failures");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obsd_core::BroadcastBus;
    use std::time::Duration;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(Arc::new(BroadcastBus::default()))
    }

    fn options() -> SessionOptions {
        let mut options = SessionOptions::new("ws://127.0.0.1:9");
        options.backoff.base_delay_ms = 60_000;
        options
    }

    #[tokio::test]
    async fn start_session_is_idempotent() {
        let reg = registry();
        let a = reg.start_session(SessionId::from("studio"), options());
        let b = reg.start_session(SessionId::from("studio"), options());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(reg.list_sessions(), vec![SessionId::from("studio")]);
        reg.stop_all().await;
    }

    #[tokio::test]
    async fn stop_unknown_session_is_not_found() {
        let reg = registry();
        let err = reg.stop_session(&SessionId::from("ghost")).await.unwrap_err();
        assert_eq!(err, SessionError::SessionNotFound(SessionId::from("ghost")));
    }

    #[tokio::test]
    async fn stop_session_removes_entry_and_caches() {
        let reg = registry();
        let id = SessionId::from("s1");
        reg.start_session(id.clone(), options());
        assert!(reg.caches().outputs(&id).is_ok());

        reg.stop_session(&id).await.unwrap();
        assert!(reg.list_sessions().is_empty());
        assert_eq!(
            reg.caches().outputs(&id).unwrap_err(),
            SessionError::CacheNotFound(id.clone())
        );
        assert!(matches!(reg.lookup(&id), Err(SessionError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn lookup_by_name_resolves_components() {
        let reg = registry();
        let id = SessionId::from("s2");
        reg.start_session(id.clone(), options());

        let component = reg.lookup_by_name(&id, "stream_manager").unwrap();
        assert_eq!(component.kind(), ComponentKind::StreamManager);
        assert_eq!(
            reg.lookup_by_name(&id, "mixer").unwrap_err(),
            SessionError::ComponentNotFound("mixer".into())
        );
        assert_eq!(
            reg.lookup_component(&SessionId::from("nope"), ComponentKind::Connection)
                .unwrap_err(),
            SessionError::SessionNotFound(SessionId::from("nope"))
        );
        reg.stop_all().await;
    }

    #[tokio::test]
    async fn supervisor_that_gives_up_is_deregistered() {
        let reg = registry();
        let id = SessionId::from("flaky");
        let mut opts = options();
        opts.supervisor.max_restarts = 0;
        let sup = reg.start_session(id.clone(), opts);
        sup.kill(ComponentKind::TaskPool).unwrap();

        for _ in 0..300 {
            if reg.list_sessions().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(reg.list_sessions().is_empty());
    }
}
