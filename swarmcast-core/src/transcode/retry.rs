//! Per-index retry bookkeeping for one job run.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy)]
struct RetryEntry {
    failures: u32,
    last_attempt: Instant,
}

#[derive(Debug, Default)]
struct LedgerState {
    entries: HashMap<u32, RetryEntry>,
    failed: BTreeSet<u32>,
}

/// Counted failures and cool-downs per segment index (not per rendition).
///
/// Shared by the live loop and catch-up workers of one job; lives only in
/// memory.
#[derive(Debug)]
pub struct RetryLedger {
    max_retries: u32,
    cooldown: Duration,
    state: Mutex<LedgerState>,
}

impl RetryLedger {
    pub fn new(max_retries: u32, cooldown: Duration) -> Self {
        Self {
            max_retries: max_retries.max(1),
            cooldown,
            state: Mutex::new(LedgerState::default()),
        }
    }

    /// Time left before `index` may be attempted again, `None` once it is
    /// permanently failed.
    pub fn wait_before_attempt(&self, index: u32, now: Instant) -> Option<Duration> {
        let state = self.state.lock();
        if state.failed.contains(&index) {
            return None;
        }
        let wait = state
            .entries
            .get(&index)
            .map(|entry| {
                let ready_at = entry.last_attempt + self.cooldown;
                ready_at.saturating_duration_since(now)
            })
            .unwrap_or(Duration::ZERO);
        Some(wait)
    }

    /// Whether `index` may be attempted at `now`.
    pub fn can_attempt(&self, index: u32, now: Instant) -> bool {
        self.wait_before_attempt(index, now)
            .is_some_and(|wait| wait.is_zero())
    }

    /// Counts one failure. Returns `true` when this failure exhausts the
    /// budget and the index becomes permanently failed.
    pub fn record_failure(&self, index: u32, now: Instant) -> bool {
        let mut state = self.state.lock();
        let entry = state.entries.entry(index).or_insert(RetryEntry {
            failures: 0,
            last_attempt: now,
        });
        entry.failures += 1;
        entry.last_attempt = now;

        if entry.failures >= self.max_retries {
            state.failed.insert(index);
            true
        } else {
            false
        }
    }

    pub fn failures(&self, index: u32) -> u32 {
        self.state
            .lock()
            .entries
            .get(&index)
            .map_or(0, |entry| entry.failures)
    }

    pub fn is_failed(&self, index: u32) -> bool {
        self.state.lock().failed.contains(&index)
    }

    /// Permanently failed indices, ascending.
    pub fn failed_indices(&self) -> Vec<u32> {
        self.state.lock().failed.iter().copied().collect()
    }
}
