use std::{sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{io::AsyncWriteExt, sync::watch, task::JoinSet, time::MissedTickBehavior};

use crate::proxee::telemetry;
use crate::proxee::tunnel::{
    protocol::{self, PING, PONG, SELECTOR_PING},
    select,
    slot::SessionSlot,
};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct HeartbeatOptions {
    pub interval: Duration,
    /// Bound on each probe's exchange. `None` waits for the peer indefinitely.
    pub timeout: Option<Duration>,
    /// Consecutive failed probes after which the session is declared dead.
    /// Zero never gives up on a session.
    pub max_failures: u32,
}

impl Default for HeartbeatOptions {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            timeout: None,
            max_failures: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Pong,
    /// Nothing published; the tick was skipped.
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatExit {
    Stopped,
    SessionDead { failures: u32 },
}

/// Periodic liveness probe against whatever session the slot holds.
pub struct Heartbeat {
    slot: Arc<SessionSlot>,
    opts: HeartbeatOptions,
}

impl Heartbeat {
    pub fn new(slot: Arc<SessionSlot>, opts: HeartbeatOptions) -> Self {
        Self { slot, opts }
    }

    /// Tick until `stop` flips (or its sender goes away), or until the failure
    /// threshold is reached.
    ///
    /// At most one ping is in flight. It runs on its own task so `stop` stays
    /// responsive; a tick that finds the previous ping still waiting on the
    /// peer counts as a failure and starts nothing. An outstanding ping is
    /// aborted on exit.
    pub async fn run(self, mut stop: watch::Receiver<bool>) -> HeartbeatExit {
        let interval = self.opts.interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut probes: JoinSet<anyhow::Result<ProbeOutcome>> = JoinSet::new();
        let mut failures: u32 = 0;

        loop {
            if *stop.borrow() {
                return HeartbeatExit::Stopped;
            }

            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        return HeartbeatExit::Stopped;
                    }
                }
                _ = ticker.tick() => {
                    if !probes.is_empty() {
                        let err = anyhow::anyhow!("previous ping still unanswered");
                        if let Some(exit) = self.failed(&mut failures, &err) {
                            return exit;
                        }
                        continue;
                    }
                    let slot = self.slot.clone();
                    let limit = self.opts.timeout;
                    probes.spawn(async move { probe(&slot, limit).await });
                }
                Some(res) = probes.join_next(), if !probes.is_empty() => {
                    let res = match res {
                        Ok(r) => r,
                        Err(err) => Err(anyhow::anyhow!("probe task: {err}")),
                    };
                    match res {
                        Ok(ProbeOutcome::Pong) => {
                            metrics::counter!(telemetry::HEARTBEATS).increment(1);
                            if failures > 0 {
                                tracing::info!(after_failures = failures, "heartbeat: recovered");
                            }
                            failures = 0;
                        }
                        Ok(ProbeOutcome::Idle) => {
                            tracing::debug!("heartbeat: no active session; tick skipped");
                        }
                        Err(err) => {
                            if let Some(exit) = self.failed(&mut failures, &err) {
                                return exit;
                            }
                        }
                    }
                }
            }
        }
    }

    fn failed(&self, failures: &mut u32, err: &anyhow::Error) -> Option<HeartbeatExit> {
        *failures = failures.saturating_add(1);
        metrics::counter!(telemetry::HEARTBEAT_FAILURES).increment(1);
        tracing::warn!(err = %err, failures = *failures, "heartbeat: probe failed");
        if self.opts.max_failures > 0 && *failures >= self.opts.max_failures {
            tracing::warn!(
                failures = *failures,
                max_failures = self.opts.max_failures,
                "heartbeat: session declared dead"
            );
            return Some(HeartbeatExit::SessionDead { failures: *failures });
        }
        None
    }
}

/// One `/ping` exchange on a fresh stream of the currently published session.
pub async fn probe(slot: &SessionSlot, limit: Option<Duration>) -> anyhow::Result<ProbeOutcome> {
    let Some(active) = slot.active() else {
        return Ok(ProbeOutcome::Idle);
    };

    let mut st = active
        .session
        .open_stream()
        .await
        .with_context(|| format!("open ping stream on session {}", active.id))?;

    let res = protocol::with_timeout(limit, async {
        select::select(&mut st, SELECTOR_PING).await?;
        protocol::write_line(&mut st, PING).await?;
        protocol::expect_line(&mut st, PONG).await
    })
    .await;

    let _ = tokio::time::timeout(Duration::from_secs(1), st.shutdown()).await;
    res.with_context(|| format!("ping on session {}", active.id))?;
    Ok(ProbeOutcome::Pong)
}
