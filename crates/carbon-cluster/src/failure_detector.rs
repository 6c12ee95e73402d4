//! Heartbeat-timeout failure detection

use crate::member::MemberId;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Tracks when each remote member was last heard from
#[derive(Debug)]
pub struct FailureDetector {
    last_seen: DashMap<MemberId, Instant>,
    timeout: Duration,
}

impl FailureDetector {
    pub fn new(timeout: Duration) -> Self {
        Self {
            last_seen: DashMap::new(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Record a sign of life
    pub fn heartbeat(&self, id: MemberId) {
        self.last_seen.insert(id, Instant::now());
    }

    pub fn forget(&self, id: &MemberId) {
        self.last_seen.remove(id);
    }

    pub fn is_tracked(&self, id: &MemberId) -> bool {
        self.last_seen.contains_key(id)
    }

    /// Members silent for longer than the timeout
    pub fn expired(&self) -> Vec<MemberId> {
        let now = Instant::now();
        self.last_seen
            .iter()
            .filter(|entry| now.duration_since(*entry.value()) > self.timeout)
            .map(|entry| *entry.key())
            .collect()
    }

    pub fn clear(&self) {
        self.last_seen.clear();
    }
}
