use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use crate::launch::LaunchRecord;
use crate::middleware::SessionId;

/// How long a session's record survives without being read or replaced.
pub const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(12 * 60 * 60);

struct Entry {
    record: LaunchRecord,
    touched: Instant,
}

/// Holds the current launch of every browser session.
///
/// A new launch in the same session replaces the previous record. Records
/// idle for longer than the TTL are evicted, lazily on access and whenever a
/// record is stored.
#[derive(Clone)]
pub struct SessionStore {
    records: Arc<RwLock<HashMap<String, Entry>>>,
    idle_ttl: Duration,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::with_ttl(DEFAULT_IDLE_TTL)
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(idle_ttl: Duration) -> Self {
        SessionStore {
            records: Arc::default(),
            idle_ttl,
        }
    }

    pub fn get_current(&self, session: &SessionId) -> Option<LaunchRecord> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        match records.get_mut(session.as_str()) {
            Some(entry) if entry.touched.elapsed() < self.idle_ttl => {
                entry.touched = Instant::now();
                return Some(entry.record.clone());
            }
            Some(_) => {}
            None => return None,
        }

        log::debug!("Session {} expired", session.as_str());
        records.remove(session.as_str());
        None
    }

    pub fn set_current(&self, session: &SessionId, record: LaunchRecord) {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let idle_ttl = self.idle_ttl;
        records.retain(|_, entry| entry.touched.elapsed() < idle_ttl);
        records.insert(
            session.as_str().to_string(),
            Entry {
                record,
                touched: Instant::now(),
            },
        );
    }

    pub fn clear(&self, session: &SessionId) -> Option<LaunchRecord> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        records.remove(session.as_str()).map(|entry| entry.record)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
