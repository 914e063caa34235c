//! Lock bookkeeping (§4.B). Two families: a legacy global lock and
//! per-workflow locks keyed by `WorkflowId`, each with a TTL past which a
//! stale holder may be stolen (with a warning left to the caller to emit
//! on the bus).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_LOCK_TTL_SECS: i64 = 300;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockHandle {
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LockHandle {
    pub fn new(holder: impl Into<String>, ttl_secs: i64) -> Self {
        let now = Utc::now();
        Self {
            holder: holder.into(),
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(ttl_secs),
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    pub fn refresh(&mut self, ttl_secs: i64) {
        self.expires_at = Utc::now() + chrono::Duration::seconds(ttl_secs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_lock_not_expired() {
        let lock = LockHandle::new("runner-1", DEFAULT_LOCK_TTL_SECS);
        assert!(!lock.is_expired());
    }

    #[test]
    fn zero_ttl_lock_is_immediately_expired() {
        let lock = LockHandle::new("runner-1", -1);
        assert!(lock.is_expired());
    }
}
