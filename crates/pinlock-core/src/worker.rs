//! Channel front-end for callers that cannot block on storage.
//!
//! The engine is moved onto the blocking pool and serves requests one at a
//! time, so every handle observes the same single-actor ordering.

use crate::engine::{LockPolicyEngine, UnlockOutcome};
use crate::error::{PinlockError, PinlockResult};
use crate::store::CredentialStore;
use log::debug;
use tokio::sync::{mpsc, oneshot};
use zeroize::Zeroizing;

const QUEUE_DEPTH: usize = 32;

enum Request {
    Attempt {
        secret: Zeroizing<String>,
        reply: oneshot::Sender<PinlockResult<UnlockOutcome>>,
    },
    ExternalSuccess {
        reply: oneshot::Sender<PinlockResult<()>>,
    },
    IsLockedOut {
        reply: oneshot::Sender<PinlockResult<bool>>,
    },
    RequiresUnlock {
        reply: oneshot::Sender<PinlockResult<bool>>,
    },
    Shutdown,
}

/// Cloneable handle to an engine running on its own worker.
#[derive(Clone)]
pub struct GateHandle {
    tx: mpsc::Sender<Request>,
}

/// Move `engine` onto a worker and return a handle to it. The worker stops
/// on [`GateHandle::shutdown`] or once every handle is dropped.
///
/// Must be called from within a tokio runtime.
pub fn spawn_gate<S>(mut engine: LockPolicyEngine<S>) -> GateHandle
where
    S: CredentialStore + 'static,
{
    let (tx, mut rx) = mpsc::channel(QUEUE_DEPTH);
    tokio::task::spawn_blocking(move || {
        while let Some(request) = rx.blocking_recv() {
            // A dropped receiver only means the caller stopped waiting.
            match request {
                Request::Attempt { secret, reply } => {
                    let _ = reply.send(engine.attempt_unlock(&secret));
                }
                Request::ExternalSuccess { reply } => {
                    let _ = reply.send(engine.record_external_success());
                }
                Request::IsLockedOut { reply } => {
                    let _ = reply.send(engine.is_locked_out());
                }
                Request::RequiresUnlock { reply } => {
                    let _ = reply.send(engine.requires_unlock());
                }
                Request::Shutdown => break,
            }
        }
        debug!("unlock worker stopped");
    });
    GateHandle { tx }
}

impl GateHandle {
    pub async fn attempt_unlock(&self, secret: impl Into<String>) -> PinlockResult<UnlockOutcome> {
        let secret = Zeroizing::new(secret.into());
        self.call(|reply| Request::Attempt { secret, reply }).await
    }

    pub async fn record_external_success(&self) -> PinlockResult<()> {
        self.call(|reply| Request::ExternalSuccess { reply }).await
    }

    pub async fn is_locked_out(&self) -> PinlockResult<bool> {
        self.call(|reply| Request::IsLockedOut { reply }).await
    }

    pub async fn requires_unlock(&self) -> PinlockResult<bool> {
        self.call(|reply| Request::RequiresUnlock { reply }).await
    }

    /// Ask the worker to stop after the requests already queued.
    pub async fn shutdown(&self) -> PinlockResult<()> {
        self.tx
            .send(Request::Shutdown)
            .await
            .map_err(|_| PinlockError::WorkerGone)
    }

    async fn call<T, F>(&self, build: F) -> PinlockResult<T>
    where
        F: FnOnce(oneshot::Sender<PinlockResult<T>>) -> Request,
    {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| PinlockError::WorkerGone)?;
        rx.await.map_err(|_| PinlockError::WorkerGone)?
    }
}
