//! Short-window duplicate suppression.
//!
//! Platforms deliver the same user message more than once (webhook retries,
//! reconnect replays). The filter fingerprints `(text, user, channel)` and
//! suppresses repeats seen within the window. Entries expire lazily on
//! access and in bulk via [`DedupFilter::sweep`]; nothing persists across
//! restarts, the TTL is the only guarantee.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::envelope::Envelope;

pub const DEFAULT_WINDOW: Duration = Duration::from_secs(300);

pub struct DedupFilter {
    window: Duration,
    seen: Mutex<HashMap<String, Instant>>,
}

impl Default for DedupFilter {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl DedupFilter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn fingerprint(envelope: &Envelope) -> String {
        let mut hasher = Sha256::new();
        hasher.update(envelope.body.text.as_bytes());
        hasher.update(b":");
        hasher.update(envelope.head.source.user_id.as_bytes());
        hasher.update(b":");
        hasher.update(envelope.head.source.channel_id.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Record the envelope and report whether it is a duplicate of one seen
    /// inside the window.
    pub fn observe(&self, envelope: &Envelope) -> bool {
        let fingerprint = Self::fingerprint(envelope);
        let now = Instant::now();
        let mut seen = self.seen.lock().expect("dedup lock");

        match seen.get(&fingerprint) {
            Some(inserted) if now.duration_since(*inserted) < self.window => {
                debug!(
                    envelope_id = %envelope.head.id,
                    channel = %envelope.head.source.channel_id,
                    "Duplicate envelope suppressed"
                );
                true
            }
            _ => {
                seen.insert(fingerprint, now);
                false
            }
        }
    }

    /// Bulk-evict expired entries; run periodically so the map stays bounded
    /// even when fingerprints never repeat.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut seen = self.seen.lock().expect("dedup lock");
        let before = seen.len();
        seen.retain(|_, inserted| now.duration_since(*inserted) < self.window);
        let evicted = before - seen.len();
        if evicted > 0 {
            debug!(evicted, remaining = seen.len(), "Dedup sweep");
        }
    }

    pub fn len(&self) -> usize {
        self.seen.lock().expect("dedup lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{EnvelopeParams, SourceRef};

    fn envelope(text: &str, user: &str, channel: &str) -> Envelope {
        let mut source = SourceRef::new("discord", channel);
        source.user_id = user.to_string();
        Envelope::new(EnvelopeParams {
            source,
            text: text.to_string(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn suppresses_repeat_within_window() {
        let filter = DedupFilter::default();
        let first = envelope("ping", "u1", "c1");
        let second = envelope("ping", "u1", "c1");

        assert!(!filter.observe(&first));
        assert!(filter.observe(&second));
    }

    #[test]
    fn distinct_tuples_pass() {
        let filter = DedupFilter::default();
        assert!(!filter.observe(&envelope("ping", "u1", "c1")));
        assert!(!filter.observe(&envelope("ping", "u2", "c1")));
        assert!(!filter.observe(&envelope("ping", "u1", "c2")));
        assert!(!filter.observe(&envelope("pong", "u1", "c1")));
    }

    #[test]
    fn expired_entry_routes_again() {
        let filter = DedupFilter::new(Duration::from_millis(0));
        assert!(!filter.observe(&envelope("ping", "u1", "c1")));
        // Zero window: the earlier sighting is already expired.
        assert!(!filter.observe(&envelope("ping", "u1", "c1")));
    }

    #[test]
    fn sweep_evicts_expired() {
        let filter = DedupFilter::new(Duration::from_millis(0));
        filter.observe(&envelope("a", "u1", "c1"));
        filter.observe(&envelope("b", "u1", "c1"));
        assert_eq!(filter.len(), 2);
        filter.sweep();
        assert!(filter.is_empty());
    }

    #[test]
    fn fingerprint_is_stable() {
        let a = DedupFilter::fingerprint(&envelope("ping", "u1", "c1"));
        let b = DedupFilter::fingerprint(&envelope("ping", "u1", "c1"));
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }
}
