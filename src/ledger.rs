use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::types::OpenRequest;

/// Entries are purged once their attempt count exceeds this.
pub const MAX_RETRIES: u32 = 3;

/// How long an open request waits before it is resent.
pub const RETRY_AFTER: Duration = Duration::from_secs(60 * 60);

/// A request picked for resending, already bumped in the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retry {
    pub hostname: String,
    pub request: OpenRequest,
}

/// In-flight probes keyed by candidate hostname.
///
/// Every operation takes the single lock once, so each one is atomic on its
/// own. Sequences spanning the ledger and another structure are not.
#[derive(Debug)]
pub struct RetryLedger {
    entries: Mutex<HashMap<String, OpenRequest>>,
    max_retries: u32,
    retry_after: Duration,
}

impl Default for RetryLedger {
    fn default() -> Self {
        Self::new(MAX_RETRIES, RETRY_AFTER)
    }
}

impl RetryLedger {
    pub fn new(max_retries: u32, retry_after: Duration) -> Self {
        log::debug!("[ledger] new: max_retries={} retry_after={}s", max_retries, retry_after.as_secs());
        Self {
            entries: Mutex::new(HashMap::new()),
            max_retries,
            retry_after,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, OpenRequest>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a freshly dispatched probe, replacing any previous entry.
    pub fn open(&self, hostname: &str, request: OpenRequest) {
        log::trace!("[ledger] open: hostname={} source={} attempts={}",
            hostname, request.source, request.attempts);
        self.lock().insert(hostname.to_string(), request);
    }

    /// Purge exhausted entries, then claim the most overdue one for resending.
    ///
    /// The claimed entry has its attempt count incremented and `last_tried`
    /// set to `now` before the lock is released.
    pub fn claim_due(&self, now: Instant) -> Option<Retry> {
        let mut entries = self.lock();

        let before = entries.len();
        entries.retain(|hostname, request| {
            let keep = request.attempts <= self.max_retries;
            if !keep {
                log::info!("[ledger] purged: hostname={} source={} attempts={}",
                    hostname, request.source, request.attempts);
            }
            keep
        });
        if entries.len() != before {
            log::debug!("[ledger] purge_complete: removed={} remaining={}", before - entries.len(), entries.len());
        }

        let (hostname, request) = entries
            .iter_mut()
            .filter(|(_, request)| match request.last_tried {
                None => true,
                Some(at) => now.saturating_duration_since(at) > self.retry_after,
            })
            .min_by_key(|(_, request)| request.last_tried)?;

        request.attempts += 1;
        request.last_tried = Some(now);
        log::debug!("[ledger] claimed: hostname={} attempts={}", hostname, request.attempts);

        Some(Retry {
            hostname: hostname.clone(),
            request: request.clone(),
        })
    }

    /// Remove the entry for a terminal response.
    pub fn complete(&self, hostname: &str) -> Option<OpenRequest> {
        let removed = self.lock().remove(hostname);
        log::trace!("[ledger] complete: hostname={} found={}", hostname, removed.is_some());
        removed
    }

    /// Move an entry to a new hostname as a provider redirect.
    ///
    /// The new entry counts as one more attempt and is due immediately. When
    /// no entry exists for `from` the new one starts from an empty request.
    pub fn redirect(&self, from: &str, to: &str) -> OpenRequest {
        let mut entries = self.lock();
        let original = entries.remove(from).unwrap_or_else(|| {
            log::warn!("[ledger] redirect_without_entry: from={} to={}", from, to);
            OpenRequest {
                provider: String::new(),
                source: String::new(),
                attempts: 0,
                last_tried: None,
            }
        });

        let moved = OpenRequest {
            provider: original.provider,
            source: original.source,
            attempts: original.attempts + 1,
            last_tried: None,
        };
        log::debug!("[ledger] redirect: from={} to={} attempts={}", from, to, moved.attempts);
        entries.insert(to.to_string(), moved.clone());
        moved
    }

    pub fn get(&self, hostname: &str) -> Option<OpenRequest> {
        self.lock().get(hostname).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
