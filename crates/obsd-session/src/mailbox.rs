use tokio::sync::{mpsc, oneshot};

use crate::error::SessionError;

/// Send a request carrying a reply channel and wait for the answer.
pub(crate) async fn call<M, T>(
    tx: &mpsc::UnboundedSender<M>,
    component: &'static str,
    make: impl FnOnce(oneshot::Sender<T>) -> M,
) -> Result<T, SessionError> {
    let (reply, rx) = oneshot::channel();
    tx.send(make(reply))
        .map_err(|_| SessionError::ComponentStopped(component))?;
    rx.await.map_err(|_| SessionError::ComponentStopped(component))
}

/// Fire-and-forget send; a closed mailbox means the group is being torn down.
pub(crate) fn cast<M>(tx: &mpsc::UnboundedSender<M>, component: &'static str, msg: M) {
    if tx.send(msg).is_err() {
        tracing::debug!(component, "mailbox closed, message dropped");
    }
}
