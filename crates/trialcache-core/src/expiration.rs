//! TTL-based staleness.
//!
//! A row is expired only when it is clean, the device is online, and it was
//! last synced longer ago than the table's TTL. Dirty rows, and every row
//! while offline, never expire.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Process-wide connectivity flag, shared by every table.
#[derive(Debug, Clone)]
pub struct NetworkStatus {
    online: Arc<AtomicBool>,
}

impl NetworkStatus {
    pub fn new(online: bool) -> Self {
        Self {
            online: Arc::new(AtomicBool::new(online)),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
    }
}

impl Default for NetworkStatus {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Snapshot of the inputs to the expiration rule for one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpirationPolicy {
    pub ttl: Duration,
    pub online: bool,
}

impl ExpirationPolicy {
    pub fn new(ttl: Duration, online: bool) -> Self {
        Self { ttl, online }
    }

    /// Never expires anything; used for maintenance reads.
    pub fn never() -> Self {
        Self {
            ttl: Duration::MAX,
            online: false,
        }
    }

    pub fn is_expired(&self, is_dirty: bool, last_synced_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        if is_dirty || !self.online {
            return false;
        }
        match self.cutoff(now) {
            Some(cutoff) => last_synced_at < cutoff,
            None => false,
        }
    }

    /// Rows synced before this instant are stale. `None` when the TTL reaches
    /// back past the representable range, in which case nothing is stale.
    pub fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let ttl = chrono::Duration::from_std(self.ttl).ok()?;
        now.checked_sub_signed(ttl)
    }
}
