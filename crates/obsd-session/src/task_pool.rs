use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use obsd_core::SessionId;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::SessionError;
use crate::mailbox;

const COMPONENT: &str = "task_pool";

pub type PoolJob = Pin<Box<dyn Future<Output = Result<(), SessionError>> + Send>>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub running: usize,
    pub completed: u64,
    pub failed: u64,
}

pub(crate) enum PoolMsg {
    Spawn { label: &'static str, job: PoolJob },
    Stats { reply: oneshot::Sender<PoolStats> },
}

/// Handle for running short-lived background jobs on behalf of a session.
#[derive(Clone)]
pub struct TaskPoolHandle {
    tx: mpsc::UnboundedSender<PoolMsg>,
}

impl TaskPoolHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<PoolMsg>) -> Self {
        Self { tx }
    }

    pub fn spawn<F>(&self, label: &'static str, job: F) -> Result<(), SessionError>
    where
        F: Future<Output = Result<(), SessionError>> + Send + 'static,
    {
        self.tx
            .send(PoolMsg::Spawn {
                label,
                job: Box::pin(job),
            })
            .map_err(|_| SessionError::ComponentStopped(COMPONENT))
    }

    pub async fn stats(&self) -> Result<PoolStats, SessionError> {
        mailbox::call(&self.tx, COMPONENT, |reply| PoolMsg::Stats { reply }).await
    }
}

/// Bounded runner: at most `concurrency` jobs execute at once, the rest wait
/// for a permit. A failing job is logged and never takes the pool down.
pub(crate) struct TaskPool {
    session_id: SessionId,
    rx: mpsc::UnboundedReceiver<PoolMsg>,
    cancel: CancellationToken,
    permits: Arc<Semaphore>,
    tasks: JoinSet<(&'static str, Result<(), SessionError>)>,
    completed: u64,
    failed: u64,
}

impl TaskPool {
    pub(crate) fn new(
        session_id: SessionId,
        rx: mpsc::UnboundedReceiver<PoolMsg>,
        concurrency: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session_id,
            rx,
            cancel,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            tasks: JoinSet::new(),
            completed: 0,
            failed: 0,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                msg = self.rx.recv() => match msg {
                    Some(PoolMsg::Spawn { label, job }) => self.spawn(label, job),
                    Some(PoolMsg::Stats { reply }) => {
                        let _ = reply.send(PoolStats {
                            running: self.tasks.len(),
                            completed: self.completed,
                            failed: self.failed,
                        });
                    }
                    None => break,
                },
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    self.reap(joined);
                }
            }
        }
        if !self.tasks.is_empty() {
            debug!(session_id = %self.session_id, running = self.tasks.len(), "aborting pooled tasks");
        }
        self.tasks.shutdown().await;
    }

    fn spawn(&mut self, label: &'static str, job: PoolJob) {
        let permits = Arc::clone(&self.permits);
        self.tasks.spawn(async move {
            let _permit = permits.acquire_owned().await.ok();
            (label, job.await)
        });
    }

    fn reap(&mut self, joined: Result<(&'static str, Result<(), SessionError>), tokio::task::JoinError>) {
        match joined {
            Ok((_, Ok(()))) => self.completed += 1,
            Ok((label, Err(e))) => {
                self.failed += 1;
                warn!(session_id = %self.session_id, job = label, error = %e, "pooled task failed");
            }
            Err(e) if e.is_panic() => {
                self.failed += 1;
                error!(session_id = %self.session_id, "pooled task panicked");
            }
            Err(_) => {}
        }
    }
}
