//! Backoff bookkeeping for failing transactions and the in-flight lease that
//! keeps a workspace from being settled twice at once.

use crate::transaction::TransactionId;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Consecutive failures after which a transaction is reported as stuck
    pub stuck_threshold: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(30),
            max: Duration::from_secs(900),
            stuck_threshold: 10,
        }
    }
}

impl RetryPolicy {
    /// Backoff after `failures` consecutive failures: `base * 2^(failures-1)`
    /// capped at `max`.
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(failures - 1);
        self.base.saturating_mul(factor).min(self.max)
    }

    pub fn is_stuck_at(&self, failures: u32) -> bool {
        self.stuck_threshold > 0 && failures > 0 && failures % self.stuck_threshold == 0
    }
}

#[derive(Debug, Clone, Copy)]
struct RetryState {
    failures: u32,
    next_attempt: Instant,
}

/// What happened to the failure count after a recorded failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureRecord {
    pub failures: u32,
    pub delay: Duration,
    pub stuck: bool,
}

type RetryKey = (String, TransactionId);

/// Consecutive failure counts per workspace and transaction.
#[derive(Debug, Default)]
pub struct RetryTracker {
    policy: RetryPolicy,
    entries: Mutex<HashMap<RetryKey, RetryState>>,
}

impl RetryTracker {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RetryKey, RetryState>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether the transaction is still backing off from its last failure
    pub fn is_backing_off(&self, workspace_id: &str, transaction: TransactionId) -> bool {
        self.lock()
            .get(&(workspace_id.to_string(), transaction))
            .is_some_and(|state| Instant::now() < state.next_attempt)
    }

    pub fn failures(&self, workspace_id: &str, transaction: TransactionId) -> u32 {
        self.lock()
            .get(&(workspace_id.to_string(), transaction))
            .map_or(0, |state| state.failures)
    }

    pub fn record_failure(&self, workspace_id: &str, transaction: TransactionId) -> FailureRecord {
        let mut entries = self.lock();
        let state = entries
            .entry((workspace_id.to_string(), transaction))
            .or_insert(RetryState {
                failures: 0,
                next_attempt: Instant::now(),
            });

        state.failures = state.failures.saturating_add(1);
        let delay = self.policy.delay_for(state.failures);
        state.next_attempt = Instant::now() + delay;

        FailureRecord {
            failures: state.failures,
            delay,
            stuck: self.policy.is_stuck_at(state.failures),
        }
    }

    /// Any non-failed outcome resets the count
    pub fn record_progress(&self, workspace_id: &str, transaction: TransactionId) {
        self.lock().remove(&(workspace_id.to_string(), transaction));
    }

    /// Drop every entry of a workspace, used once it is swept
    pub fn forget_workspace(&self, workspace_id: &str) {
        self.lock().retain(|(id, _), _| id != workspace_id);
    }
}

/// Workspaces currently being settled.
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    ids: Arc<Mutex<HashSet<String>>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.ids.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Lease a workspace; `None` if someone else holds it
    pub fn try_acquire(&self, workspace_id: &str) -> Option<InFlightGuard> {
        if !self.lock().insert(workspace_id.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            ids: self.ids.clone(),
            workspace_id: workspace_id.to_string(),
        })
    }

    pub fn contains(&self, workspace_id: &str) -> bool {
        self.lock().contains(workspace_id)
    }
}

/// Releases the lease on drop, including while unwinding.
#[derive(Debug)]
pub struct InFlightGuard {
    ids: Arc<Mutex<HashSet<String>>>,
    workspace_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.ids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.workspace_id);
    }
}
