use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use arc_swap::ArcSwapOption;

use crate::proxee::telemetry;
use crate::proxee::tunnel::transport::TransportSession;

/// A published session. Immutable once built; replaced wholesale.
pub struct ActiveSession {
    pub id: u64,
    pub session: Arc<dyn TransportSession>,
    pub established_at_unix_ms: u64,
}

impl std::fmt::Debug for ActiveSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveSession")
            .field("id", &self.id)
            .field("remote", &self.session.remote_addr())
            .finish_non_exhaustive()
    }
}

/// Holder of the tunnel's current session.
///
/// Readers get a snapshot that stays valid as an object for as long as they
/// hold it; whether the connection behind it is still alive is only known by
/// trying an operation on it.
pub struct SessionSlot {
    current: ArcSwapOption<ActiveSession>,
    seq: AtomicU64,
}

impl std::fmt::Debug for SessionSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSlot")
            .field("current", &self.active().map(|a| a.id))
            .finish()
    }
}

impl Default for SessionSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionSlot {
    pub fn new() -> Self {
        Self {
            current: ArcSwapOption::empty(),
            seq: AtomicU64::new(1),
        }
    }

    pub fn active(&self) -> Option<Arc<ActiveSession>> {
        self.current.load_full()
    }

    pub fn publish(&self, session: Arc<dyn TransportSession>) -> Arc<ActiveSession> {
        let active = Arc::new(ActiveSession {
            id: self.seq.fetch_add(1, Ordering::Relaxed),
            session,
            established_at_unix_ms: telemetry::now_unix_ms(),
        });
        self.current.store(Some(active.clone()));
        active
    }

    /// Empty the slot if it still holds `expected`. Returns whether it did.
    pub fn clear(&self, expected: &Arc<ActiveSession>) -> bool {
        let prev = self.current.compare_and_swap(expected, None);
        match &*prev {
            Some(p) => Arc::ptr_eq(p, expected),
            None => false,
        }
    }
}
