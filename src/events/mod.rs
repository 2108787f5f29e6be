//! Monitoring event types and the in-process event bus
//!
//! Every lifecycle transition in the failover engine is announced as a
//! `MonitoringEvent`. Observers (API, journal, metrics) register handlers on
//! the `EventBus`; the engine never depends on any of them.

use chrono::{DateTime, Utc};
use ethers::types::{Address, H256};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::error;
use uuid::Uuid;

/// Event kinds, one per taxonomy entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventKind {
    MonitoringStarted,
    MonitoringStopped,
    MonitoringError,
    IntentDetected,
    IntentExecuting,
    IntentExecuted,
    IntentFailed,
    IntentError,
    IntentMaxAttempts,
    FailoverTriggered,
    AnalyzingChains,
    BackupSelected,
    Bridging,
    BridgeInitiated,
    BridgeWaiting,
    BridgeCompleted,
    RetryingOnBackup,
    FailoverSuccess,
    FailoverFailed,
    ConfigUpdated,
}

impl EventKind {
    pub const ALL: [EventKind; 20] = [
        EventKind::MonitoringStarted,
        EventKind::MonitoringStopped,
        EventKind::MonitoringError,
        EventKind::IntentDetected,
        EventKind::IntentExecuting,
        EventKind::IntentExecuted,
        EventKind::IntentFailed,
        EventKind::IntentError,
        EventKind::IntentMaxAttempts,
        EventKind::FailoverTriggered,
        EventKind::AnalyzingChains,
        EventKind::BackupSelected,
        EventKind::Bridging,
        EventKind::BridgeInitiated,
        EventKind::BridgeWaiting,
        EventKind::BridgeCompleted,
        EventKind::RetryingOnBackup,
        EventKind::FailoverSuccess,
        EventKind::FailoverFailed,
        EventKind::ConfigUpdated,
    ];

    /// Wire name of the event kind
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::MonitoringStarted => "monitoring:started",
            EventKind::MonitoringStopped => "monitoring:stopped",
            EventKind::MonitoringError => "monitoring:error",
            EventKind::IntentDetected => "intent:detected",
            EventKind::IntentExecuting => "intent:executing",
            EventKind::IntentExecuted => "intent:executed",
            EventKind::IntentFailed => "intent:failed",
            EventKind::IntentError => "intent:error",
            EventKind::IntentMaxAttempts => "intent:max_attempts",
            EventKind::FailoverTriggered => "intent:failover_triggered",
            EventKind::AnalyzingChains => "intent:analyzing_chains",
            EventKind::BackupSelected => "intent:backup_selected",
            EventKind::Bridging => "intent:bridging",
            EventKind::BridgeInitiated => "intent:bridge_initiated",
            EventKind::BridgeWaiting => "intent:bridge_waiting",
            EventKind::BridgeCompleted => "intent:bridge_completed",
            EventKind::RetryingOnBackup => "intent:retrying_on_backup",
            EventKind::FailoverSuccess => "intent:failover_success",
            EventKind::FailoverFailed => "intent:failover_failed",
            EventKind::ConfigUpdated => "config:updated",
        }
    }
}

/// Lifecycle events emitted by the failover engine
#[derive(Debug, Clone, Serialize)]
pub enum MonitoringEvent {
    MonitoringStarted {
        user: Address,
        at: DateTime<Utc>,
    },

    MonitoringStopped {
        at: DateTime<Utc>,
    },

    /// Unexpected error outside any individual intent's processing
    MonitoringError {
        error: String,
        at: DateTime<Utc>,
    },

    IntentDetected {
        intent_id: H256,
        chain_id: u64,
        at: DateTime<Utc>,
    },

    IntentExecuting {
        intent_id: H256,
        chain_id: u64,
        attempt: u32,
        at: DateTime<Utc>,
    },

    IntentExecuted {
        intent_id: H256,
        chain_id: u64,
        tx_hash: Option<H256>,
        /// True when the ledger reported the intent as already executed
        reconciled: bool,
        at: DateTime<Utc>,
    },

    IntentFailed {
        intent_id: H256,
        error: String,
        at: DateTime<Utc>,
    },

    /// Transient error on one attempt; the intent stays tracked
    IntentError {
        intent_id: H256,
        error: String,
        at: DateTime<Utc>,
    },

    IntentMaxAttempts {
        intent_id: H256,
        attempts: u32,
        at: DateTime<Utc>,
    },

    FailoverTriggered {
        intent_id: H256,
        from_chain: u64,
        attempt: u32,
        at: DateTime<Utc>,
    },

    AnalyzingChains {
        intent_id: H256,
        excluded: Vec<u64>,
        at: DateTime<Utc>,
    },

    BackupSelected {
        intent_id: H256,
        chain_id: u64,
        score: f64,
        at: DateTime<Utc>,
    },

    Bridging {
        intent_id: H256,
        from_chain: u64,
        to_chain: u64,
        at: DateTime<Utc>,
    },

    BridgeInitiated {
        intent_id: H256,
        bridge_id: Uuid,
        estimated_secs: u64,
        at: DateTime<Utc>,
    },

    BridgeWaiting {
        intent_id: H256,
        bridge_id: Uuid,
        timeout_secs: u64,
        at: DateTime<Utc>,
    },

    BridgeCompleted {
        intent_id: H256,
        bridge_id: Uuid,
        at: DateTime<Utc>,
    },

    RetryingOnBackup {
        intent_id: H256,
        chain_id: u64,
        at: DateTime<Utc>,
    },

    FailoverSuccess {
        intent_id: H256,
        chain_id: u64,
        at: DateTime<Utc>,
    },

    FailoverFailed {
        intent_id: H256,
        error: String,
        at: DateTime<Utc>,
    },

    ConfigUpdated {
        at: DateTime<Utc>,
    },
}

impl MonitoringEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            MonitoringEvent::MonitoringStarted { .. } => EventKind::MonitoringStarted,
            MonitoringEvent::MonitoringStopped { .. } => EventKind::MonitoringStopped,
            MonitoringEvent::MonitoringError { .. } => EventKind::MonitoringError,
            MonitoringEvent::IntentDetected { .. } => EventKind::IntentDetected,
            MonitoringEvent::IntentExecuting { .. } => EventKind::IntentExecuting,
            MonitoringEvent::IntentExecuted { .. } => EventKind::IntentExecuted,
            MonitoringEvent::IntentFailed { .. } => EventKind::IntentFailed,
            MonitoringEvent::IntentError { .. } => EventKind::IntentError,
            MonitoringEvent::IntentMaxAttempts { .. } => EventKind::IntentMaxAttempts,
            MonitoringEvent::FailoverTriggered { .. } => EventKind::FailoverTriggered,
            MonitoringEvent::AnalyzingChains { .. } => EventKind::AnalyzingChains,
            MonitoringEvent::BackupSelected { .. } => EventKind::BackupSelected,
            MonitoringEvent::Bridging { .. } => EventKind::Bridging,
            MonitoringEvent::BridgeInitiated { .. } => EventKind::BridgeInitiated,
            MonitoringEvent::BridgeWaiting { .. } => EventKind::BridgeWaiting,
            MonitoringEvent::BridgeCompleted { .. } => EventKind::BridgeCompleted,
            MonitoringEvent::RetryingOnBackup { .. } => EventKind::RetryingOnBackup,
            MonitoringEvent::FailoverSuccess { .. } => EventKind::FailoverSuccess,
            MonitoringEvent::FailoverFailed { .. } => EventKind::FailoverFailed,
            MonitoringEvent::ConfigUpdated { .. } => EventKind::ConfigUpdated,
        }
    }

    /// Wire name, e.g. "intent:executed"
    pub fn name(&self) -> &'static str {
        self.kind().as_str()
    }

    /// Intent this event concerns, if any
    pub fn intent_id(&self) -> Option<H256> {
        match self {
            MonitoringEvent::IntentDetected { intent_id, .. }
            | MonitoringEvent::IntentExecuting { intent_id, .. }
            | MonitoringEvent::IntentExecuted { intent_id, .. }
            | MonitoringEvent::IntentFailed { intent_id, .. }
            | MonitoringEvent::IntentError { intent_id, .. }
            | MonitoringEvent::IntentMaxAttempts { intent_id, .. }
            | MonitoringEvent::FailoverTriggered { intent_id, .. }
            | MonitoringEvent::AnalyzingChains { intent_id, .. }
            | MonitoringEvent::BackupSelected { intent_id, .. }
            | MonitoringEvent::Bridging { intent_id, .. }
            | MonitoringEvent::BridgeInitiated { intent_id, .. }
            | MonitoringEvent::BridgeWaiting { intent_id, .. }
            | MonitoringEvent::BridgeCompleted { intent_id, .. }
            | MonitoringEvent::RetryingOnBackup { intent_id, .. }
            | MonitoringEvent::FailoverSuccess { intent_id, .. }
            | MonitoringEvent::FailoverFailed { intent_id, .. } => Some(*intent_id),
            _ => None,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            MonitoringEvent::MonitoringStarted { at, .. }
            | MonitoringEvent::MonitoringStopped { at }
            | MonitoringEvent::MonitoringError { at, .. }
            | MonitoringEvent::IntentDetected { at, .. }
            | MonitoringEvent::IntentExecuting { at, .. }
            | MonitoringEvent::IntentExecuted { at, .. }
            | MonitoringEvent::IntentFailed { at, .. }
            | MonitoringEvent::IntentError { at, .. }
            | MonitoringEvent::IntentMaxAttempts { at, .. }
            | MonitoringEvent::FailoverTriggered { at, .. }
            | MonitoringEvent::AnalyzingChains { at, .. }
            | MonitoringEvent::BackupSelected { at, .. }
            | MonitoringEvent::Bridging { at, .. }
            | MonitoringEvent::BridgeInitiated { at, .. }
            | MonitoringEvent::BridgeWaiting { at, .. }
            | MonitoringEvent::BridgeCompleted { at, .. }
            | MonitoringEvent::RetryingOnBackup { at, .. }
            | MonitoringEvent::FailoverSuccess { at, .. }
            | MonitoringEvent::FailoverFailed { at, .. }
            | MonitoringEvent::ConfigUpdated { at } => *at,
        }
    }
}

pub type HandlerId = u64;

type Handler = Arc<dyn Fn(&MonitoringEvent) + Send + Sync>;

/// Number of recent events retained for the `/events` surface
const HISTORY_LIMIT: usize = 256;

/// Synchronous publish/subscribe bus with a bounded recent-event window.
///
/// Handlers for a kind run in registration order; a panicking handler is
/// caught and logged without aborting the emitter or the remaining handlers.
pub struct EventBus {
    handlers: RwLock<HashMap<EventKind, Vec<(HandlerId, Handler)>>>,
    next_id: AtomicU64,
    history: Mutex<VecDeque<MonitoringEvent>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            history: Mutex::new(VecDeque::with_capacity(HISTORY_LIMIT)),
        }
    }

    /// Register a handler for one event kind. Returns an id usable with `off`.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&MonitoringEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .write()
            .unwrap()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a previously registered handler. Returns false if unknown.
    pub fn off(&self, kind: EventKind, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write().unwrap();
        if let Some(list) = handlers.get_mut(&kind) {
            let before = list.len();
            list.retain(|(hid, _)| *hid != id);
            return list.len() < before;
        }
        false
    }

    /// Emit an event to all handlers registered for its kind.
    pub fn emit(&self, event: MonitoringEvent) {
        {
            let mut history = self.history.lock().unwrap();
            if history.len() == HISTORY_LIMIT {
                history.pop_front();
            }
            history.push_back(event.clone());
        }

        let to_run: Vec<Handler> = {
            let handlers = self.handlers.read().unwrap();
            handlers
                .get(&event.kind())
                .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
                .unwrap_or_default()
        };

        for handler in to_run {
            if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                error!("Event handler panicked for {}", event.name());
            }
        }
    }

    /// Most recent events, oldest first
    pub fn recent(&self) -> Vec<MonitoringEvent> {
        self.history.lock().unwrap().iter().cloned().collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stopped() -> MonitoringEvent {
        MonitoringEvent::MonitoringStopped { at: Utc::now() }
    }

    #[test]
    fn test_handlers_run_in_registration_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let seen = seen.clone();
            bus.on(EventKind::MonitoringStopped, move |_| {
                seen.lock().unwrap().push(tag);
            });
        }

        bus.emit(stopped());
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_off_removes_handler() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicU64::new(0));

        let c = count.clone();
        let id = bus.on(EventKind::MonitoringStopped, move |_| {
            c.fetch_add(1, Ordering::Relaxed);
        });

        bus.emit(stopped());
        assert!(bus.off(EventKind::MonitoringStopped, id));
        bus.emit(stopped());

        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert!(!bus.off(EventKind::MonitoringStopped, id));
    }

    #[test]
    fn test_panicking_handler_does_not_abort_remaining() {
        let bus = EventBus::new();
        let reached = Arc::new(AtomicU64::new(0));

        bus.on(EventKind::MonitoringStopped, |_| {
            panic!("handler blew up");
        });
        let r = reached.clone();
        bus.on(EventKind::MonitoringStopped, move |_| {
            r.fetch_add(1, Ordering::Relaxed);
        });

        bus.emit(stopped());
        assert_eq!(reached.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_history_window_is_bounded() {
        let bus = EventBus::new();
        for _ in 0..(HISTORY_LIMIT + 10) {
            bus.emit(stopped());
        }
        assert_eq!(bus.recent().len(), HISTORY_LIMIT);
    }

    #[test]
    fn test_event_names_match_taxonomy() {
        assert_eq!(
            MonitoringEvent::FailoverTriggered {
                intent_id: H256::zero(),
                from_chain: 1,
                attempt: 1,
                at: Utc::now(),
            }
            .name(),
            "intent:failover_triggered"
        );
        assert_eq!(EventKind::ConfigUpdated.as_str(), "config:updated");
        assert_eq!(EventKind::ALL.len(), 20);
    }
}
