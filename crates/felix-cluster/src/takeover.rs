// Bounded bookkeeping of surrendered store sessions.
use felix_common::ids::{SessionId, StoreSessionId};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const DEFAULT_MAX_TAKEOVER_SESSIONS: usize = 10;
pub const MIN_TAKEOVER_RETENTION: Duration = Duration::from_secs(1800);

/// Session ids this broker has seen or given up, kept in insertion order.
///
/// A timestamp of zero marks an entry as surrendered and evictable right away.
/// Each surrender evicts at most one entry once the tracker is over capacity;
/// there is no full sweep.
#[derive(Debug)]
pub struct TakeoverRetention {
    max_sessions: usize,
    retention: Duration,
    entries: Mutex<Vec<(StoreSessionId, u64)>>,
}

impl TakeoverRetention {
    /// Retention windows below thirty minutes are raised to thirty minutes.
    pub fn new(max_sessions: usize, retention: Duration) -> Self {
        Self {
            max_sessions,
            retention: retention.max(MIN_TAKEOVER_RETENTION),
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn record(&self, id: StoreSessionId) {
        self.record_at(id, now_millis());
    }

    pub fn record_at(&self, id: StoreSessionId, now_ms: u64) {
        let mut entries = self.entries.lock();
        // Upsert keeps the original insertion position.
        match entries.iter_mut().find(|(existing, _)| *existing == id) {
            Some(entry) => entry.1 = now_ms,
            None => entries.push((id, now_ms)),
        }
    }

    pub fn mark_surrendered(&self, id: StoreSessionId) {
        self.mark_surrendered_at(id, now_millis());
    }

    /// Flag `id` as surrendered and, when over capacity, evict the first entry
    /// in insertion order that is surrendered or older than the retention
    /// window. Unknown ids are ignored apart from the capacity check.
    pub fn mark_surrendered_at(&self, id: StoreSessionId, now_ms: u64) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.iter_mut().find(|(existing, _)| *existing == id) {
            entry.1 = 0;
        }
        if entries.len() <= self.max_sessions {
            return;
        }
        let retention_ms = u64::try_from(self.retention.as_millis()).unwrap_or(u64::MAX);
        let expired = entries
            .iter()
            .position(|(_, seen)| *seen == 0 || now_ms.saturating_sub(*seen) > retention_ms);
        if let Some(index) = expired {
            let (evicted, _) = entries.remove(index);
            tracing::debug!(session = %evicted, "evicted retained takeover session");
        }
    }

    pub fn contains(&self, id: StoreSessionId) -> bool {
        self.entries.lock().iter().any(|(existing, _)| *existing == id)
    }

    /// Retained ids plus the local broker's current session.
    pub fn supported_session_ids(&self, local: Option<SessionId>) -> BTreeSet<String> {
        let mut ids: BTreeSet<String> = self
            .entries
            .lock()
            .iter()
            .map(|(id, _)| id.to_string())
            .collect();
        if let Some(local) = local {
            ids.insert(local.to_string());
        }
        ids
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
