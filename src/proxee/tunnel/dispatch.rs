use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use tokio::{sync::Semaphore, task::JoinSet};

use crate::proxee::telemetry;
use crate::proxee::tunnel::{slot::ActiveSession, transport::BoxedStream};

/// Application seam: called once per inbound virtual stream.
#[async_trait]
pub trait StreamHandler: Send + Sync {
    async fn handle(&self, stream: BoxedStream) -> anyhow::Result<()>;
}

/// Accept loop handing each inbound stream to the handler on its own task.
pub struct Dispatcher {
    handler: Arc<dyn StreamHandler>,
    limit: Option<Arc<Semaphore>>,
    seq: AtomicU64,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("limit", &self.limit.as_ref().map(|s| s.available_permits()))
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// `max_concurrent == 0` leaves handler fan-out unbounded.
    pub fn new(handler: Arc<dyn StreamHandler>, max_concurrent: usize) -> Self {
        let limit = (max_concurrent > 0).then(|| Arc::new(Semaphore::new(max_concurrent)));
        Self {
            handler,
            limit,
            seq: AtomicU64::new(1),
        }
    }

    /// Accept until the session fails. Only returns with the accept error.
    ///
    /// With a concurrency cap, accepted streams queue for a permit on their own
    /// task; the loop itself never waits for a handler. Handler tasks belong to
    /// this call: they are aborted when it returns or is dropped, so a session
    /// never outlives its teardown through a stuck handler.
    pub async fn run(&self, active: &ActiveSession) -> anyhow::Result<()> {
        let mut handlers = JoinSet::new();
        let res = loop {
            tokio::select! {
                accepted = active.session.accept_stream() => {
                    let st = match accepted {
                        Ok(st) => st,
                        Err(err) => break Err(err),
                    };
                    self.spawn_handler(&mut handlers, active.id, st);
                }
                Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
            }
        };

        if !handlers.is_empty() {
            tracing::debug!(session = active.id, handlers = handlers.len(), "tunnel: aborting stream handlers");
        }
        handlers.shutdown().await;
        res
    }

    fn spawn_handler(&self, handlers: &mut JoinSet<()>, session: u64, st: BoxedStream) {
        let n = self.seq.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(telemetry::STREAMS_ACCEPTED).increment(1);
        tracing::trace!(session, stream = n, "tunnel: stream accepted");

        let handler = self.handler.clone();
        let limit = self.limit.clone();
        handlers.spawn(async move {
            let _permit = match limit {
                Some(sem) => match sem.acquire_owned().await {
                    Ok(p) => Some(p),
                    Err(_) => return,
                },
                None => None,
            };
            if let Err(err) = handler.handle(st).await {
                metrics::counter!(telemetry::STREAM_ERRORS).increment(1);
                tracing::debug!(session, stream = n, err=%err, "tunnel: stream ended");
            }
        });
    }
}
