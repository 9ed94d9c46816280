use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use serde::Serialize;
use tokio::sync::watch;

use crate::proxee::telemetry;
use crate::proxee::tunnel::{
    backoff::Backoff,
    dispatch::{Dispatcher, StreamHandler},
    establish::Establish,
    heartbeat::{Heartbeat, HeartbeatExit, HeartbeatOptions},
    register,
    slot::{ActiveSession, SessionSlot},
};

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Name announced to the proxy during registration.
    pub hostname: String,
    pub dial_timeout: Duration,
    /// Bound on the registration exchange. `None` waits indefinitely.
    pub register_timeout: Option<Duration>,
    pub backoff: Backoff,
    pub heartbeat: HeartbeatOptions,
    /// Zero leaves inbound stream handling unbounded.
    pub max_concurrent_streams: usize,
}

impl ClientOptions {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            dial_timeout: Duration::from_secs(5),
            register_timeout: None,
            backoff: Backoff::default(),
            heartbeat: HeartbeatOptions::default(),
            max_concurrent_streams: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TunnelStatus {
    pub hostname: String,
    pub target: String,
    pub connected: bool,
    pub session_id: Option<u64>,
    pub remote: Option<String>,
    pub connected_since_unix_ms: Option<u64>,
}

#[derive(Debug)]
enum SessionEnd {
    Shutdown,
    DialFailed(anyhow::Error),
    RegisterFailed(anyhow::Error),
    Lost(anyhow::Error),
}

/// Keeps one registered session to the proxy alive, forever.
pub struct TunnelClient {
    opts: ClientOptions,
    establish: Arc<dyn Establish>,
    slot: Arc<SessionSlot>,
    dispatcher: Dispatcher,
    registered: AtomicU64,
}

impl std::fmt::Debug for TunnelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelClient")
            .field("hostname", &self.opts.hostname)
            .field("target", &self.establish.describe())
            .field("slot", &self.slot)
            .finish_non_exhaustive()
    }
}

impl TunnelClient {
    pub fn new(
        opts: ClientOptions,
        establish: Arc<dyn Establish>,
        handler: Arc<dyn StreamHandler>,
    ) -> anyhow::Result<Self> {
        if opts.hostname.trim().is_empty() {
            anyhow::bail!("tunnel: hostname is required");
        }
        if opts.hostname.contains(['\n', '\r']) {
            anyhow::bail!("tunnel: hostname must be a single line");
        }

        let dispatcher = Dispatcher::new(handler, opts.max_concurrent_streams);
        Ok(Self {
            opts,
            establish,
            slot: Arc::new(SessionSlot::new()),
            dispatcher,
            registered: AtomicU64::new(0),
        })
    }

    pub fn status(&self) -> TunnelStatus {
        let active = self.slot.active();
        let registered = self.registered.load(Ordering::Acquire);
        let connected = active.as_ref().is_some_and(|a| a.id == registered);
        TunnelStatus {
            hostname: self.opts.hostname.clone(),
            target: self.establish.describe(),
            connected,
            session_id: active.as_ref().map(|a| a.id),
            remote: active
                .as_ref()
                .and_then(|a| a.session.remote_addr())
                .map(|a| a.to_string()),
            connected_since_unix_ms: active
                .as_ref()
                .filter(|_| connected)
                .map(|a| a.established_at_unix_ms),
        }
    }

    /// Dial, register, serve; on any failure tear down and go again after a
    /// backoff delay. Returns only once `shutdown` flips (or its sender is gone).
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut backoff = self.opts.backoff.clone();
        backoff.reset();

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let (phase, err) = match self.run_once(&mut backoff, shutdown.clone()).await {
                SessionEnd::Shutdown => return Ok(()),
                SessionEnd::DialFailed(err) => ("dial", err),
                SessionEnd::RegisterFailed(err) => ("register", err),
                SessionEnd::Lost(err) => ("serve", err),
            };

            let delay = backoff.fail();
            tracing::warn!(
                target_addr=%self.establish.describe(),
                phase,
                err=%format!("{err:#}"),
                attempts = backoff.attempts(),
                backoff=%humantime::format_duration(delay),
                "tunnel: disconnected; retrying"
            );

            let mut shutdown = shutdown.clone();
            tokio::select! {
                _ = stopped(&mut shutdown) => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn run_once(&self, backoff: &mut Backoff, mut shutdown: watch::Receiver<bool>) -> SessionEnd {
        metrics::counter!(telemetry::DIAL_ATTEMPTS).increment(1);
        tracing::info!(target_addr=%self.establish.describe(), "tunnel: dialing");

        let dial = tokio::time::timeout(self.opts.dial_timeout, self.establish.establish());
        let sess = tokio::select! {
            _ = stopped(&mut shutdown) => return SessionEnd::Shutdown,
            res = dial => match res {
                Ok(Ok(sess)) => sess,
                Ok(Err(err)) => {
                    metrics::counter!(telemetry::DIAL_FAILURES).increment(1);
                    return SessionEnd::DialFailed(err);
                }
                Err(_) => {
                    metrics::counter!(telemetry::DIAL_FAILURES).increment(1);
                    return SessionEnd::DialFailed(anyhow::anyhow!(
                        "timed out after {}",
                        humantime::format_duration(self.opts.dial_timeout)
                    ));
                }
            },
        };

        let active = self.slot.publish(sess);

        let reg = tokio::select! {
            _ = stopped(&mut shutdown) => {
                self.teardown(&active).await;
                return SessionEnd::Shutdown;
            }
            res = register::register(active.session.as_ref(), &self.opts.hostname, self.opts.register_timeout) => res,
        };
        if let Err(err) = reg {
            metrics::counter!(telemetry::REGISTRATION_FAILURES).increment(1);
            self.teardown(&active).await;
            return SessionEnd::RegisterFailed(err.context("register"));
        }

        backoff.reset();
        self.registered.store(active.id, Ordering::Release);
        metrics::counter!(telemetry::REGISTRATIONS).increment(1);
        metrics::gauge!(telemetry::CONNECTED).set(1.0);
        tracing::info!(
            session = active.id,
            hostname=%self.opts.hostname,
            remote=?active.session.remote_addr(),
            local=?active.session.local_addr(),
            "tunnel: registered"
        );

        let (hb_stop_tx, hb_stop_rx) = watch::channel(false);
        let mut hb = tokio::spawn(
            Heartbeat::new(self.slot.clone(), self.opts.heartbeat.clone()).run(hb_stop_rx),
        );
        let mut hb_done = false;

        let end = tokio::select! {
            _ = stopped(&mut shutdown) => SessionEnd::Shutdown,
            res = self.dispatcher.run(&active) => SessionEnd::Lost(match res {
                Ok(()) => anyhow::anyhow!("accept loop ended"),
                Err(err) => err.context("accept"),
            }),
            exit = &mut hb => {
                hb_done = true;
                match exit {
                    Ok(HeartbeatExit::SessionDead { failures }) => SessionEnd::Lost(anyhow::anyhow!(
                        "heartbeat: {failures} consecutive probes failed"
                    )),
                    Ok(HeartbeatExit::Stopped) => SessionEnd::Lost(anyhow::anyhow!("heartbeat stopped")),
                    Err(err) => SessionEnd::Lost(anyhow::anyhow!("heartbeat task: {err}")),
                }
            }
        };

        let _ = hb_stop_tx.send(true);
        if !hb_done && tokio::time::timeout(Duration::from_secs(1), &mut hb).await.is_err() {
            hb.abort();
        }

        self.teardown(&active).await;
        end
    }

    /// Unpublish first so no new snapshot can pick up a closing session.
    async fn teardown(&self, active: &Arc<ActiveSession>) {
        let _ = self
            .registered
            .compare_exchange(active.id, 0, Ordering::AcqRel, Ordering::Acquire);
        if self.slot.clear(active) {
            tracing::debug!(session = active.id, "tunnel: session unpublished");
        }
        active.session.close().await;
        metrics::gauge!(telemetry::CONNECTED).set(0.0);
    }
}

/// Resolves once shutdown is requested or nobody can request it anymore.
async fn stopped(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}
