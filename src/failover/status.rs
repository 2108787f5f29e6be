//! Per-intent orchestration state

use crate::ledger::Intent;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use ethers::types::H256;
use serde::Serialize;
use uuid::Uuid;

/// Orchestration lifecycle state for one intent.
///
/// `Pending -> Executing -> {Completed | FailoverTriggered}`;
/// `FailoverTriggered -> Bridging -> Retrying -> {Completed | Failed}`;
/// any state may move to `Failed` on unrecoverable error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IntentState {
    Pending,
    Executing,
    Completed,
    FailoverTriggered,
    Bridging,
    Retrying,
    Failed,
}

impl IntentState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, IntentState::Completed | IntentState::Failed)
    }

    /// States in which an attempt is currently in flight
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            IntentState::Executing
                | IntentState::FailoverTriggered
                | IntentState::Bridging
                | IntentState::Retrying
        )
    }
}

/// Mutable orchestration state owned by the failover engine, keyed by intent
/// id. Mutated only while the intent's lock is held; removed on terminal
/// states.
#[derive(Debug, Clone, Serialize)]
pub struct IntentStatus {
    pub intent_id: H256,
    pub state: IntentState,
    pub execution_attempts: u32,
    pub failover_attempts: u32,
    /// Starts as the primary chain, updated on each successful bridge
    pub current_chain_id: u64,
    /// Set only while a bridge is in flight
    pub active_bridge: Option<Uuid>,
    pub last_checked: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// In-memory tracking map for monitored intents
pub struct StatusTracker {
    statuses: DashMap<H256, IntentStatus>,
    /// Terminally failed intent ids. FAILED is monotonic: the ledger may keep
    /// reporting these as pending, but they are never re-tracked.
    retired: DashSet<H256>,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self {
            statuses: DashMap::new(),
            retired: DashSet::new(),
        }
    }

    /// Start tracking an intent. Returns false if it was already tracked or
    /// has terminally failed.
    pub fn track(&self, intent: &Intent) -> bool {
        if self.retired.contains(&intent.id) || self.statuses.contains_key(&intent.id) {
            return false;
        }
        let now = Utc::now();
        self.statuses.insert(
            intent.id,
            IntentStatus {
                intent_id: intent.id,
                state: IntentState::Pending,
                execution_attempts: 0,
                failover_attempts: 0,
                current_chain_id: intent.primary_chain_id,
                active_bridge: None,
                last_checked: now,
                created_at: now,
            },
        );
        true
    }

    pub fn contains(&self, id: &H256) -> bool {
        self.statuses.contains_key(id)
    }

    pub fn get(&self, id: &H256) -> Option<IntentStatus> {
        self.statuses.get(id).map(|s| s.clone())
    }

    /// Mutate a tracked status in place, returning the closure's result
    pub fn update<R>(&self, id: &H256, f: impl FnOnce(&mut IntentStatus) -> R) -> Option<R> {
        self.statuses.get_mut(id).map(|mut s| f(&mut s))
    }

    pub fn remove(&self, id: &H256) {
        self.statuses.remove(id);
    }

    /// Mark an intent terminally failed and drop its entry
    pub fn retire(&self, id: &H256) {
        self.retired.insert(*id);
        self.statuses.remove(id);
    }

    pub fn is_retired(&self, id: &H256) -> bool {
        self.retired.contains(id)
    }

    pub fn snapshot(&self) -> Vec<IntentStatus> {
        self.statuses.iter().map(|s| s.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::IntentAction;
    use ethers::types::{Address, U256};

    fn intent(id: u8) -> Intent {
        Intent {
            id: H256::repeat_byte(id),
            creator: Address::zero(),
            action: IntentAction::Transfer,
            token: Address::zero(),
            amount: U256::from(1u64),
            recipient: Address::zero(),
            primary_chain_id: 11155111,
            failover_chains: vec![84532],
            max_gas_price_gwei: 50,
            created_at: 0,
            deadline: 0,
        }
    }

    #[test]
    fn test_track_is_idempotent() {
        let tracker = StatusTracker::new();
        assert!(tracker.track(&intent(1)));
        assert!(!tracker.track(&intent(1)));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_retired_intents_are_never_retracked() {
        let tracker = StatusTracker::new();
        tracker.track(&intent(1));
        tracker.retire(&H256::repeat_byte(1));

        assert!(!tracker.contains(&H256::repeat_byte(1)));
        assert!(tracker.is_retired(&H256::repeat_byte(1)));
        assert!(!tracker.track(&intent(1)));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_new_status_starts_pending_on_primary() {
        let tracker = StatusTracker::new();
        tracker.track(&intent(1));
        let status = tracker.get(&H256::repeat_byte(1)).unwrap();
        assert_eq!(status.state, IntentState::Pending);
        assert_eq!(status.current_chain_id, 11155111);
        assert_eq!(status.execution_attempts, 0);
        assert!(status.active_bridge.is_none());
    }

    #[test]
    fn test_update_and_remove() {
        let tracker = StatusTracker::new();
        tracker.track(&intent(1));
        let id = H256::repeat_byte(1);

        let attempts = tracker.update(&id, |s| {
            s.execution_attempts += 1;
            s.execution_attempts
        });
        assert_eq!(attempts, Some(1));

        tracker.remove(&id);
        assert!(!tracker.contains(&id));
        assert_eq!(tracker.update(&id, |_| ()), None);
    }

    #[test]
    fn test_terminal_and_in_flight_classification() {
        assert!(IntentState::Completed.is_terminal());
        assert!(IntentState::Failed.is_terminal());
        assert!(!IntentState::Pending.is_terminal());
        assert!(IntentState::Bridging.is_in_flight());
        assert!(!IntentState::Pending.is_in_flight());
    }
}
