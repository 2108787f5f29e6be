//! Engine scenario tests driven by scripted ledger and bridge doubles

use super::engine::FailoverEngine;
use crate::bridge::{BridgeAdapter, BridgeRequest, BridgeResult, BridgeStatus, MockBridgeAdapter};
use crate::config::{MonitorConfig, SelectionConfig};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::events::{EventBus, EventKind, MonitoringEvent};
use crate::ledger::{
    ExecutionReceipt, Intent, IntentAction, IntentLedger, IntentRecord, LedgerIntentStatus,
    MockIntentLedger,
};
use crate::selector::{ChainMetrics, ChainProfile, ChainSelector, StaticMetrics};

use tokio_test::assert_err;

use ethers::types::{Address, H256, U256};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

const USER: Address = Address::repeat_byte(0x07);
const PRIMARY_CHAIN: u64 = 11155111;
const BACKUP_CHAIN: u64 = 84532;
const THIRD_CHAIN: u64 = 421614;

fn test_intent() -> Intent {
    Intent {
        id: H256::repeat_byte(0xAA),
        creator: USER,
        action: IntentAction::Transfer,
        token: Address::repeat_byte(0x20),
        amount: U256::from(1_000_000u64),
        recipient: Address::repeat_byte(0x30),
        primary_chain_id: PRIMARY_CHAIN,
        failover_chains: vec![BACKUP_CHAIN, THIRD_CHAIN],
        max_gas_price_gwei: 50,
        created_at: 1_700_000_000,
        deadline: 1_700_003_600,
    }
}

fn test_config() -> MonitorConfig {
    MonitorConfig {
        poll_interval_ms: 25,
        bridge_poll_interval_ms: 10,
        ..Default::default()
    }
}

/// Ledger double replaying a scripted sequence of execution outcomes
struct ScriptedLedger {
    records: Mutex<Vec<IntentRecord>>,
    script: Mutex<VecDeque<OrchestratorResult<ExecutionReceipt>>>,
    executed_on: Mutex<Vec<u64>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    execution_delay_ms: u64,
}

impl ScriptedLedger {
    fn new(
        intents: Vec<Intent>,
        script: Vec<OrchestratorResult<ExecutionReceipt>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(
                intents
                    .into_iter()
                    .map(|intent| IntentRecord {
                        intent,
                        status: LedgerIntentStatus::Pending,
                    })
                    .collect(),
            ),
            script: Mutex::new(script.into_iter().collect()),
            executed_on: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            execution_delay_ms: 0,
        })
    }

    fn with_delay(mut self: Arc<Self>, delay_ms: u64) -> Arc<Self> {
        Arc::get_mut(&mut self).unwrap().execution_delay_ms = delay_ms;
        self
    }

    fn executed_on(&self) -> Vec<u64> {
        self.executed_on.lock().unwrap().clone()
    }

    fn max_concurrent_executions(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl IntentLedger for ScriptedLedger {
    async fn get_user_intents(&self, _user: Address) -> OrchestratorResult<Vec<IntentRecord>> {
        Ok(self.records.lock().unwrap().clone())
    }

    async fn get_intent(&self, id: H256) -> OrchestratorResult<Intent> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.intent.id == id)
            .map(|r| r.intent.clone())
            .ok_or(OrchestratorError::IntentNotFound {
                intent_id: format!("{:?}", id),
            })
    }

    async fn execute_intent(
        &self,
        id: H256,
        chain_id: u64,
    ) -> OrchestratorResult<ExecutionReceipt> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if self.execution_delay_ms > 0 {
            tokio::time::sleep(tokio::time::Duration::from_millis(self.execution_delay_ms)).await;
        }

        self.executed_on.lock().unwrap().push(chain_id);
        let result = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(OrchestratorError::Internal("script exhausted".to_string())));

        if result.is_ok() {
            // Mirror the real ledger: a successful execution flips the status
            let mut records = self.records.lock().unwrap();
            if let Some(record) = records.iter_mut().find(|r| r.intent.id == id) {
                record.status = LedgerIntentStatus::Completed;
            }
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn cancel_intent(&self, _id: H256) -> OrchestratorResult<()> {
        Ok(())
    }
}

enum BridgeBehavior {
    /// Accept and complete on the first completion check
    Complete { estimated_secs: u64 },
    /// Reject the bridge request itself
    Reject { error: &'static str },
    /// Accept but never complete
    Stall { estimated_secs: u64 },
}

/// Bridge double with deterministic behavior
struct ScriptedBridge {
    behavior: BridgeBehavior,
    completion_checks: AtomicUsize,
}

impl ScriptedBridge {
    fn new(behavior: BridgeBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            completion_checks: AtomicUsize::new(0),
        })
    }

    fn completion_checks(&self) -> usize {
        self.completion_checks.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl BridgeAdapter for ScriptedBridge {
    async fn bridge(&self, _request: BridgeRequest) -> OrchestratorResult<BridgeResult> {
        match &self.behavior {
            BridgeBehavior::Complete { estimated_secs }
            | BridgeBehavior::Stall { estimated_secs } => {
                Ok(BridgeResult::accepted(Uuid::new_v4(), *estimated_secs))
            }
            BridgeBehavior::Reject { error } => Ok(BridgeResult::rejected(*error)),
        }
    }

    async fn check_completion(&self, _bridge_id: Uuid) -> OrchestratorResult<bool> {
        self.completion_checks.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            BridgeBehavior::Complete { .. } => Ok(true),
            BridgeBehavior::Stall { .. } => Ok(false),
            BridgeBehavior::Reject { .. } => Ok(false),
        }
    }

    async fn status(&self, _bridge_id: Uuid) -> Option<BridgeStatus> {
        None
    }

    fn estimate_time(&self, _from_chain: u64, _to_chain: u64) -> u64 {
        match self.behavior {
            BridgeBehavior::Complete { estimated_secs }
            | BridgeBehavior::Stall { estimated_secs } => estimated_secs,
            BridgeBehavior::Reject { .. } => 0,
        }
    }
}

type EventLog = Arc<Mutex<Vec<MonitoringEvent>>>;

fn capture_events(bus: &EventBus) -> EventLog {
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    for kind in EventKind::ALL {
        let log = log.clone();
        bus.on(kind, move |event| {
            log.lock().unwrap().push(event.clone());
        });
    }
    log
}

fn event_names(log: &EventLog) -> Vec<&'static str> {
    log.lock().unwrap().iter().map(|e| e.name()).collect()
}

fn count(log: &EventLog, name: &str) -> usize {
    event_names(log).iter().filter(|&&n| n == name).count()
}

/// Selector over chains differing only in gas price
fn test_selector(gas_gwei: &[(u64, f64)]) -> Arc<ChainSelector> {
    let profiles = gas_gwei
        .iter()
        .map(|&(chain_id, _)| ChainProfile {
            chain_id,
            name: format!("chain-{}", chain_id),
            avg_block_time_secs: 2.0,
            reliability: 0.9,
        })
        .collect();

    let metrics: HashMap<u64, ChainMetrics> = gas_gwei
        .iter()
        .map(|&(chain_id, gas)| {
            (
                chain_id,
                ChainMetrics {
                    gas_price_gwei: gas,
                    congestion: 20,
                },
            )
        })
        .collect();

    Arc::new(ChainSelector::new(
        profiles,
        Arc::new(StaticMetrics::new(metrics)),
        SelectionConfig::default(),
    ))
}

fn test_engine(
    ledger: Arc<dyn IntentLedger>,
    bridge: Arc<dyn BridgeAdapter>,
    gas_gwei: &[(u64, f64)],
    config: MonitorConfig,
) -> (Arc<FailoverEngine>, EventLog) {
    let bus = Arc::new(EventBus::new());
    let log = capture_events(&bus);
    let engine = Arc::new(FailoverEngine::new(
        ledger,
        test_selector(gas_gwei),
        bridge,
        bus,
    ));
    engine.update_config(config);
    // Drop the config:updated emitted during setup
    log.lock().unwrap().clear();
    (engine, log)
}

const STANDARD_GAS: &[(u64, f64)] = &[(PRIMARY_CHAIN, 20.0), (BACKUP_CHAIN, 1.0), (THIRD_CHAIN, 5.0)];

fn receipt(byte: u8) -> OrchestratorResult<ExecutionReceipt> {
    Ok(ExecutionReceipt {
        tx_hash: H256::repeat_byte(byte),
    })
}

fn reverted(reason: &str) -> OrchestratorResult<ExecutionReceipt> {
    Err(OrchestratorError::ExecutionReverted(reason.to_string()))
}

#[tokio::test]
async fn test_failover_recovers_on_backup_chain() {
    let ledger = ScriptedLedger::new(vec![test_intent()], vec![reverted("gas spike"), receipt(1)]);
    let bridge = ScriptedBridge::new(BridgeBehavior::Complete { estimated_secs: 0 });
    let (engine, log) = test_engine(ledger.clone(), bridge, STANDARD_GAS, test_config());

    engine.poll_cycle(USER).await;

    assert_eq!(
        event_names(&log),
        vec![
            "intent:detected",
            "intent:executing",
            "intent:failover_triggered",
            "intent:analyzing_chains",
            "intent:backup_selected",
            "intent:bridging",
            "intent:bridge_initiated",
            "intent:bridge_waiting",
            "intent:bridge_completed",
            "intent:retrying_on_backup",
            "intent:executed",
            "intent:failover_success",
        ]
    );

    // Executed once on the primary, retried on the recommended backup
    assert_eq!(ledger.executed_on(), vec![PRIMARY_CHAIN, BACKUP_CHAIN]);

    // The retry landed on the backup chain and the entry is gone
    let events = log.lock().unwrap();
    assert!(events.iter().any(|e| matches!(
        e,
        MonitoringEvent::FailoverSuccess { chain_id, .. } if *chain_id == BACKUP_CHAIN
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        MonitoringEvent::IntentExecuted { chain_id, tx_hash, .. }
            if *chain_id == BACKUP_CHAIN && tx_hash.is_some()
    )));
    drop(events);

    assert!(engine.status(&test_intent().id).is_none());
}

#[tokio::test]
async fn test_bridge_rejection_is_terminal_without_retry() {
    let ledger = ScriptedLedger::new(vec![test_intent()], vec![reverted("gas spike")]);
    let bridge = ScriptedBridge::new(BridgeBehavior::Reject { error: "liquidity" });
    let (engine, log) = test_engine(ledger.clone(), bridge, STANDARD_GAS, test_config());

    engine.poll_cycle(USER).await;

    assert_eq!(count(&log, "intent:failover_failed"), 1);
    assert_eq!(count(&log, "intent:retrying_on_backup"), 0);
    assert_eq!(count(&log, "intent:failover_triggered"), 1);

    let events = log.lock().unwrap();
    assert!(events.iter().any(|e| matches!(
        e,
        MonitoringEvent::FailoverFailed { error, .. } if error == "liquidity"
    )));
    drop(events);

    // One execution attempt, no bridge retry
    assert_eq!(ledger.executed_on(), vec![PRIMARY_CHAIN]);
    assert!(engine.status(&test_intent().id).is_none());
}

#[tokio::test]
async fn test_failover_disabled_fails_after_single_attempt() {
    let ledger = ScriptedLedger::new(vec![test_intent()], vec![reverted("out of gas")]);
    let bridge = ScriptedBridge::new(BridgeBehavior::Complete { estimated_secs: 0 });
    let config = MonitorConfig {
        max_execution_attempts: 1,
        enable_failover: false,
        ..test_config()
    };
    let (engine, log) = test_engine(ledger.clone(), bridge, STANDARD_GAS, config);

    engine.poll_cycle(USER).await;

    assert_eq!(
        event_names(&log),
        vec!["intent:detected", "intent:executing", "intent:failed"]
    );
    assert!(event_names(&log).iter().all(|n| !n.contains("failover")));
    assert_eq!(ledger.executed_on(), vec![PRIMARY_CHAIN]);

    // FAILED is monotonic: the next cycle neither re-detects nor re-executes
    engine.poll_cycle(USER).await;
    assert_eq!(
        event_names(&log),
        vec!["intent:detected", "intent:executing", "intent:failed"]
    );
    assert_eq!(ledger.executed_on(), vec![PRIMARY_CHAIN]);
}

#[tokio::test(start_paused = true)]
async fn test_bridge_timeout_fails_after_bounded_polls() {
    let ledger = ScriptedLedger::new(vec![test_intent()], vec![reverted("gas spike")]);
    let bridge = ScriptedBridge::new(BridgeBehavior::Stall { estimated_secs: 1 });
    let config = MonitorConfig {
        bridge_poll_interval_ms: 100,
        ..test_config()
    };
    let (engine, log) = test_engine(ledger.clone(), bridge.clone(), STANDARD_GAS, config);

    engine.poll_cycle(USER).await;

    let events = log.lock().unwrap();
    assert!(events.iter().any(|e| matches!(
        e,
        MonitoringEvent::FailoverFailed { error, .. } if error.contains("timed out")
    )));
    drop(events);

    // Bounded by 2x estimated time at a fixed poll interval
    let checks = bridge.completion_checks();
    assert!(checks >= 2, "expected repeated polls, saw {}", checks);
    assert!(checks <= 30, "poll count not bounded: {}", checks);

    assert_eq!(count(&log, "intent:bridge_completed"), 0);
    assert!(engine.status(&test_intent().id).is_none());
}

#[tokio::test]
async fn test_cheapest_viable_backup_is_selected() {
    // Scenario E shape at the engine level: three chains, gas 20/1/5, the
    // 1 gwei chain must win the failover selection
    let ledger = ScriptedLedger::new(vec![test_intent()], vec![reverted("congested"), receipt(2)]);
    let bridge = ScriptedBridge::new(BridgeBehavior::Complete { estimated_secs: 0 });
    let (engine, log) = test_engine(ledger, bridge, STANDARD_GAS, test_config());

    engine.poll_cycle(USER).await;

    let events = log.lock().unwrap();
    assert!(events.iter().any(|e| matches!(
        e,
        MonitoringEvent::BackupSelected { chain_id, .. } if *chain_id == BACKUP_CHAIN
    )));
}

#[tokio::test]
async fn test_transient_errors_exhaust_attempts_monotonically() {
    let unavailable =
        || Err(OrchestratorError::LedgerUnavailable("rpc down".to_string()));
    let ledger = ScriptedLedger::new(vec![test_intent()], vec![unavailable(), unavailable()]);
    let bridge = ScriptedBridge::new(BridgeBehavior::Complete { estimated_secs: 0 });
    let config = MonitorConfig {
        max_execution_attempts: 2,
        enable_failover: false,
        ..test_config()
    };
    let (engine, log) = test_engine(ledger.clone(), bridge, STANDARD_GAS, config);

    // Two cycles consume the two allowed attempts without failing the intent
    engine.poll_cycle(USER).await;
    engine.poll_cycle(USER).await;
    assert_eq!(count(&log, "intent:error"), 2);
    assert_eq!(count(&log, "intent:max_attempts"), 0);
    assert!(engine.status(&test_intent().id).is_some());

    // The third cycle hits the cap: terminal FAILED, no further executions
    engine.poll_cycle(USER).await;
    assert_eq!(count(&log, "intent:max_attempts"), 1);
    assert_eq!(ledger.executed_on().len(), 2);
    assert!(engine.status(&test_intent().id).is_none());

    engine.poll_cycle(USER).await;
    assert_eq!(ledger.executed_on().len(), 2);
    assert_eq!(count(&log, "intent:max_attempts"), 1);
}

#[tokio::test]
async fn test_failover_attempts_are_capped_with_chain_exclusion() {
    let ledger = ScriptedLedger::new(
        vec![test_intent()],
        vec![
            reverted("primary down"),
            reverted("backup down"),
            reverted("third down"),
        ],
    );
    let bridge = ScriptedBridge::new(BridgeBehavior::Complete { estimated_secs: 0 });
    let (engine, log) = test_engine(ledger.clone(), bridge, STANDARD_GAS, test_config());

    engine.poll_cycle(USER).await;

    // Two failover rounds (the cap), each trying a chain not yet attempted
    assert_eq!(count(&log, "intent:failover_triggered"), 2);
    assert_eq!(
        ledger.executed_on(),
        vec![PRIMARY_CHAIN, BACKUP_CHAIN, THIRD_CHAIN]
    );
    assert_eq!(count(&log, "intent:failover_failed"), 1);
    assert_eq!(count(&log, "intent:failover_success"), 0);

    let events = log.lock().unwrap();
    let max_attempt = events
        .iter()
        .filter_map(|e| match e {
            MonitoringEvent::FailoverTriggered { attempt, .. } => Some(*attempt),
            _ => None,
        })
        .max();
    assert_eq!(max_attempt, Some(2));
}

#[tokio::test]
async fn test_completed_intent_poll_is_idempotent() {
    let ledger = ScriptedLedger::new(vec![test_intent()], vec![receipt(3)]);
    let bridge = ScriptedBridge::new(BridgeBehavior::Complete { estimated_secs: 0 });
    let (engine, log) = test_engine(ledger.clone(), bridge, STANDARD_GAS, test_config());

    engine.poll_cycle(USER).await;
    assert_eq!(count(&log, "intent:executed"), 1);
    assert!(engine.status(&test_intent().id).is_none());

    let events_after_first = event_names(&log).len();
    engine.poll_cycle(USER).await;

    assert_eq!(event_names(&log).len(), events_after_first);
    assert_eq!(ledger.executed_on().len(), 1);
}

#[tokio::test]
async fn test_concurrent_triggers_are_serialized_by_the_intent_lock() {
    let ledger = ScriptedLedger::new(vec![test_intent()], vec![receipt(4)]).with_delay(50);
    let bridge = ScriptedBridge::new(BridgeBehavior::Complete { estimated_secs: 0 });
    let config = MonitorConfig {
        auto_execute: false,
        ..test_config()
    };
    let (engine, _log) = test_engine(ledger.clone(), bridge, STANDARD_GAS, config);

    // Track without executing, then race two manual triggers and a poll
    engine.poll_cycle(USER).await;
    assert!(engine.status(&test_intent().id).is_some());

    let id = test_intent().id;
    let (r1, r2, _) = tokio::join!(
        engine.trigger_execution(id),
        engine.trigger_execution(id),
        engine.poll_cycle(USER),
    );

    // Exactly one trigger wins; the other observes the terminal removal
    assert_eq!([&r1, &r2].iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(ledger.executed_on().len(), 1);
    assert_eq!(ledger.max_concurrent_executions(), 1);
    assert!(engine.status(&id).is_none());
}

#[tokio::test]
async fn test_trigger_execution_on_unknown_intent() {
    let ledger = Arc::new(MockIntentLedger::new());
    let bridge = Arc::new(MockBridgeAdapter::new());
    let (engine, _log) = test_engine(ledger, bridge, STANDARD_GAS, test_config());

    let err = assert_err!(engine.trigger_execution(H256::zero()).await);
    assert!(matches!(err, OrchestratorError::NotMonitored { .. }));
}

#[tokio::test]
async fn test_ledger_fetch_failure_surfaces_as_monitoring_error() {
    let mut ledger = MockIntentLedger::new();
    ledger.expect_get_user_intents().returning(|_| {
        Err(OrchestratorError::LedgerUnavailable(
            "connection refused".to_string(),
        ))
    });
    let bridge = Arc::new(MockBridgeAdapter::new());
    let (engine, log) = test_engine(Arc::new(ledger), bridge, STANDARD_GAS, test_config());

    engine.poll_cycle(USER).await;

    assert_eq!(event_names(&log), vec!["monitoring:error"]);
    assert!(engine.tracked_intents().is_empty());
}

#[tokio::test]
async fn test_auto_execute_disabled_tracks_without_executing() {
    let ledger = ScriptedLedger::new(vec![test_intent()], vec![receipt(5)]);
    let bridge = ScriptedBridge::new(BridgeBehavior::Complete { estimated_secs: 0 });
    let config = MonitorConfig {
        auto_execute: false,
        ..test_config()
    };
    let (engine, log) = test_engine(ledger.clone(), bridge, STANDARD_GAS, config);

    engine.poll_cycle(USER).await;
    engine.poll_cycle(USER).await;

    assert_eq!(event_names(&log), vec!["intent:detected"]);
    assert!(ledger.executed_on().is_empty());
    assert_eq!(
        engine.status(&test_intent().id).unwrap().execution_attempts,
        0
    );
}

#[tokio::test]
async fn test_start_monitoring_is_idempotent_and_stop_retains_state() {
    let ledger = ScriptedLedger::new(vec![test_intent()], vec![]);
    let bridge = ScriptedBridge::new(BridgeBehavior::Complete { estimated_secs: 0 });
    let config = MonitorConfig {
        auto_execute: false,
        poll_interval_ms: 60_000,
        ..test_config()
    };
    let (engine, log) = test_engine(ledger, bridge, STANDARD_GAS, config.clone());

    // Seed the tracker before the scheduling loop exists
    engine.poll_cycle(USER).await;
    assert_eq!(engine.tracked_intents().len(), 1);

    engine.start_monitoring(USER, config.clone());
    assert!(engine.is_monitoring());
    engine.start_monitoring(USER, config);
    assert_eq!(count(&log, "monitoring:started"), 1);

    engine.stop_monitoring();
    assert!(!engine.is_monitoring());
    assert_eq!(count(&log, "monitoring:stopped"), 1);

    // Stopping does not clear tracked intents
    assert_eq!(engine.tracked_intents().len(), 1);
}
