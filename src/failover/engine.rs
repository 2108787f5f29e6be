//! Failover orchestration engine
//!
//! Polls the intent ledger for a user's pending intents, attempts execution,
//! and on execution failure drives the bridge-and-retry sequence. All state
//! transitions are serialized per intent by a keyed lock and announced on the
//! event bus.

use super::status::{IntentState, IntentStatus, StatusTracker};
use crate::bridge::{BridgeAdapter, BridgeRequest};
use crate::config::MonitorConfig;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::events::{EventBus, MonitoringEvent};
use crate::ledger::{Intent, IntentLedger, IntentRecord, LedgerIntentStatus};
use crate::metrics;
use crate::selector::{ChainScore, ChainSelection, ChainSelector, SelectionContext, Urgency};

use chrono::Utc;
use dashmap::DashMap;
use ethers::types::{Address, H256};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

struct MonitorTask {
    stop: watch::Sender<bool>,
    #[allow(dead_code)]
    handle: JoinHandle<()>,
}

/// Orchestrates intent execution and cross-chain failover.
///
/// Collaborators are injected; the status map and lock set are instance
/// scoped, so independent engines never share state.
pub struct FailoverEngine {
    ledger: Arc<dyn IntentLedger>,
    selector: Arc<ChainSelector>,
    bridge: Arc<dyn BridgeAdapter>,
    bus: Arc<EventBus>,
    tracker: StatusTracker,
    /// Per-intent execution locks; one attempt in flight per intent id
    locks: DashMap<H256, Arc<tokio::sync::Mutex<()>>>,
    config: RwLock<MonitorConfig>,
    monitor: Mutex<Option<MonitorTask>>,
}

impl FailoverEngine {
    pub fn new(
        ledger: Arc<dyn IntentLedger>,
        selector: Arc<ChainSelector>,
        bridge: Arc<dyn BridgeAdapter>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            ledger,
            selector,
            bridge,
            bus,
            tracker: StatusTracker::new(),
            locks: DashMap::new(),
            config: RwLock::new(MonitorConfig::default()),
            monitor: Mutex::new(None),
        }
    }

    /// Begin periodic polling for the user's pending intents. Calling while
    /// already monitoring is a no-op.
    pub fn start_monitoring(self: &Arc<Self>, user: Address, config: MonitorConfig) {
        let mut slot = self.monitor.lock().unwrap();
        if slot.is_some() {
            warn!("Monitoring already active; ignoring start request");
            return;
        }

        let poll_interval = Duration::from_millis(config.poll_interval_ms.max(1));
        *self.config.write().unwrap() = config;

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let engine = self.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval(poll_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        // Fire-and-forget: a slow cycle must not delay the
                        // next tick; per-intent locks prevent overlap
                        let engine = engine.clone();
                        tokio::spawn(async move {
                            engine.poll_cycle(user).await;
                        });
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Poll scheduling loop exited");
        });

        *slot = Some(MonitorTask {
            stop: stop_tx,
            handle,
        });

        info!("Monitoring started for {:?}", user);
        metrics::set_monitoring(true);
        self.emit(MonitoringEvent::MonitoringStarted {
            user,
            at: Utc::now(),
        });
    }

    /// Halt scheduling of new poll cycles. In-flight failover sequences run
    /// to their own terminal state; tracked intents are retained.
    pub fn stop_monitoring(&self) {
        let task = self.monitor.lock().unwrap().take();
        let Some(task) = task else {
            debug!("Stop requested but monitoring is not active");
            return;
        };

        let _ = task.stop.send(true);

        info!("Monitoring stopped");
        metrics::set_monitoring(false);
        self.emit(MonitoringEvent::MonitoringStopped { at: Utc::now() });
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor.lock().unwrap().is_some()
    }

    /// Replace the live monitoring options
    pub fn update_config(&self, config: MonitorConfig) {
        *self.config.write().unwrap() = config;
        self.emit(MonitoringEvent::ConfigUpdated { at: Utc::now() });
    }

    pub fn status(&self, intent_id: &H256) -> Option<IntentStatus> {
        self.tracker.get(intent_id)
    }

    pub fn tracked_intents(&self) -> Vec<IntentStatus> {
        self.tracker.snapshot()
    }

    /// Manually force an execution attempt for a tracked intent. Serializes
    /// with the poll loop through the per-intent lock.
    pub async fn trigger_execution(&self, intent_id: H256) -> OrchestratorResult<()> {
        if !self.tracker.contains(&intent_id) {
            return Err(OrchestratorError::NotMonitored {
                intent_id: format!("{:?}", intent_id),
            });
        }

        let cfg = self.config.read().unwrap().clone();
        let intent = self.ledger.get_intent(intent_id).await?;

        let lock = self.lock_for(&intent_id);
        let _guard = lock.lock().await;

        // The entry may have reached a terminal state while we waited
        let Some(status) = self.tracker.get(&intent_id) else {
            return Err(OrchestratorError::NotMonitored {
                intent_id: format!("{:?}", intent_id),
            });
        };

        if status.execution_attempts >= cfg.max_execution_attempts {
            return Err(OrchestratorError::AttemptsExhausted {
                intent_id: format!("{:?}", intent_id),
            });
        }

        self.attempt_execution(&intent, &cfg).await;
        Ok(())
    }

    /// One poll cycle: fetch the user's pending intents, track new ones, and
    /// process everything that is ready for an attempt. Errors inside one
    /// intent's processing never escape the cycle.
    pub(crate) async fn poll_cycle(&self, user: Address) {
        metrics::record_poll_cycle();
        let cfg = self.config.read().unwrap().clone();

        let records = match self.ledger.get_user_intents(user).await {
            Ok(records) => records,
            Err(e) => {
                warn!("Failed to fetch intents for {:?}: {}", user, e);
                self.emit(MonitoringEvent::MonitoringError {
                    error: e.to_string(),
                    at: Utc::now(),
                });
                return;
            }
        };

        let pending: Vec<IntentRecord> = records
            .into_iter()
            .filter(|r| r.status == LedgerIntentStatus::Pending)
            .collect();

        for record in &pending {
            if self.tracker.track(&record.intent) {
                debug!(
                    "Detected intent {} on chain {}",
                    hex::encode(record.intent.id.as_bytes()),
                    record.intent.primary_chain_id
                );
                metrics::record_intent_detected();
                self.emit(MonitoringEvent::IntentDetected {
                    intent_id: record.intent.id,
                    chain_id: record.intent.primary_chain_id,
                    at: Utc::now(),
                });
            }
        }

        // Intents are independent: process them concurrently. The per-intent
        // locks serialize attempts for any single id.
        futures::future::join_all(
            pending
                .iter()
                .map(|record| self.process_record(&record.intent, &cfg)),
        )
        .await;

        metrics::set_tracked_intents(self.tracker.len());
    }

    async fn process_record(&self, intent: &Intent, cfg: &MonitorConfig) {
        let id = intent.id;
        let Some(status) = self.tracker.get(&id) else {
            return;
        };

        match status.state {
            // Replaying a completed intent is a no-op beyond cleanup
            IntentState::Completed => {
                self.forget(&id);
                return;
            }
            IntentState::Failed => {
                self.retire(&id);
                return;
            }
            s if s.is_in_flight() => return,
            _ => {}
        }

        let lock = self.lock_for(&id);
        let Ok(_guard) = lock.try_lock() else {
            // Another attempt holds the lock; skip this cycle
            return;
        };

        self.tracker.update(&id, |s| s.last_checked = Utc::now());

        if !cfg.auto_execute {
            return;
        }

        // Re-read under the lock
        let Some(status) = self.tracker.get(&id) else {
            return;
        };
        if status.state != IntentState::Pending {
            return;
        }

        if status.execution_attempts >= cfg.max_execution_attempts {
            self.tracker.update(&id, |s| s.state = IntentState::Failed);
            metrics::record_execution_outcome("max_attempts");
            self.emit(MonitoringEvent::IntentMaxAttempts {
                intent_id: id,
                attempts: status.execution_attempts,
                at: Utc::now(),
            });
            self.retire(&id);
            return;
        }

        self.attempt_execution(intent, cfg).await;
    }

    /// One execution attempt. Caller holds the intent's lock.
    async fn attempt_execution(&self, intent: &Intent, cfg: &MonitorConfig) {
        let id = intent.id;
        let Some((attempt, chain_id)) = self.tracker.update(&id, |s| {
            s.state = IntentState::Executing;
            s.execution_attempts += 1;
            s.last_checked = Utc::now();
            (s.execution_attempts, s.current_chain_id)
        }) else {
            return;
        };

        metrics::record_execution_attempt(chain_id);
        self.emit(MonitoringEvent::IntentExecuting {
            intent_id: id,
            chain_id,
            attempt,
            at: Utc::now(),
        });

        match self.ledger.execute_intent(id, chain_id).await {
            Ok(receipt) => {
                self.complete(id, chain_id, Some(receipt.tx_hash), false, false);
            }
            Err(OrchestratorError::AlreadyExecuted) => {
                // Another actor executed it; reconcile as success
                info!(
                    "Intent {} already executed; reconciling",
                    hex::encode(id.as_bytes())
                );
                self.complete(id, chain_id, None, true, false);
            }
            Err(e) if e.is_retryable() => {
                warn!(
                    "Transient failure executing intent {}: {}",
                    hex::encode(id.as_bytes()),
                    e
                );
                metrics::record_execution_outcome("transient_error");
                self.tracker.update(&id, |s| s.state = IntentState::Pending);
                self.emit(MonitoringEvent::IntentError {
                    intent_id: id,
                    error: e.to_string(),
                    at: Utc::now(),
                });
            }
            Err(e) => {
                let failover_attempts = self
                    .tracker
                    .get(&id)
                    .map(|s| s.failover_attempts)
                    .unwrap_or(0);

                if e.is_failover_eligible()
                    && cfg.enable_failover
                    && failover_attempts < cfg.max_failover_attempts
                {
                    metrics::record_execution_outcome("failover");
                    self.run_failover(intent, cfg, e.to_string()).await;
                } else {
                    error!(
                        "Intent {} failed: {}",
                        hex::encode(id.as_bytes()),
                        e
                    );
                    self.fail(id, e.to_string());
                }
            }
        }
    }

    /// Bridge-and-retry sequence. Caller holds the intent's lock; the bridge
    /// wait suspends only this intent, never the poll loop or other intents.
    async fn run_failover(&self, intent: &Intent, cfg: &MonitorConfig, cause: String) {
        let id = intent.id;
        debug!(
            "Starting failover for intent {}: {}",
            hex::encode(id.as_bytes()),
            cause
        );

        // Chains attempted within this failover cycle
        let mut tried: Vec<u64> = Vec::new();

        loop {
            let Some(current_chain) = self.tracker.get(&id).map(|s| s.current_chain_id) else {
                return;
            };
            if !tried.contains(&current_chain) {
                tried.push(current_chain);
            }

            let Some(attempt) = self.tracker.update(&id, |s| {
                s.state = IntentState::FailoverTriggered;
                s.failover_attempts += 1;
                s.failover_attempts
            }) else {
                return;
            };

            metrics::record_failover_attempt();
            self.emit(MonitoringEvent::FailoverTriggered {
                intent_id: id,
                from_chain: current_chain,
                attempt,
                at: Utc::now(),
            });

            self.emit(MonitoringEvent::AnalyzingChains {
                intent_id: id,
                excluded: tried.clone(),
                at: Utc::now(),
            });

            let selection = match self
                .selector
                .select_optimal_chain(&self.failover_context(intent, &tried), None)
                .await
            {
                Ok(selection) => selection,
                Err(e) => {
                    self.fail_failover(id, e.to_string());
                    return;
                }
            };

            let backup = self.pick_backup(&selection, current_chain);
            self.emit(MonitoringEvent::BackupSelected {
                intent_id: id,
                chain_id: backup.chain_id,
                score: backup.score,
                at: Utc::now(),
            });

            self.tracker.update(&id, |s| s.state = IntentState::Bridging);
            self.emit(MonitoringEvent::Bridging {
                intent_id: id,
                from_chain: current_chain,
                to_chain: backup.chain_id,
                at: Utc::now(),
            });

            let request = BridgeRequest {
                intent_id: id,
                from_chain: current_chain,
                to_chain: backup.chain_id,
                token: intent.token,
                amount: intent.amount,
                recipient: intent.recipient,
            };

            let result = match self.bridge.bridge(request).await {
                Ok(result) => result,
                Err(e) => {
                    self.fail_failover(id, e.to_string());
                    return;
                }
            };

            if !result.success {
                let reason = result
                    .error
                    .unwrap_or_else(|| "bridge rejected request".to_string());
                self.fail_failover(id, reason);
                return;
            }

            let Some(bridge_id) = result.bridge_id else {
                self.fail_failover(id, "bridge reported success without an id".to_string());
                return;
            };

            metrics::record_bridge_initiated();
            self.tracker
                .update(&id, |s| s.active_bridge = Some(bridge_id));
            self.emit(MonitoringEvent::BridgeInitiated {
                intent_id: id,
                bridge_id,
                estimated_secs: result.estimated_secs,
                at: Utc::now(),
            });

            let timeout_secs = result.estimated_secs * 2;
            self.emit(MonitoringEvent::BridgeWaiting {
                intent_id: id,
                bridge_id,
                timeout_secs,
                at: Utc::now(),
            });

            match self
                .wait_for_bridge(bridge_id, timeout_secs, cfg.bridge_poll_interval_ms)
                .await
            {
                Ok(()) => {
                    metrics::record_bridge_completed();
                    self.tracker.update(&id, |s| s.active_bridge = None);
                    self.emit(MonitoringEvent::BridgeCompleted {
                        intent_id: id,
                        bridge_id,
                        at: Utc::now(),
                    });
                }
                Err(e) => {
                    self.tracker.update(&id, |s| s.active_bridge = None);
                    self.fail_failover(id, e.to_string());
                    return;
                }
            }

            self.tracker.update(&id, |s| {
                s.state = IntentState::Retrying;
                s.current_chain_id = backup.chain_id;
            });
            self.emit(MonitoringEvent::RetryingOnBackup {
                intent_id: id,
                chain_id: backup.chain_id,
                at: Utc::now(),
            });

            match self.ledger.execute_intent(id, backup.chain_id).await {
                Ok(receipt) => {
                    self.complete(id, backup.chain_id, Some(receipt.tx_hash), false, true);
                    return;
                }
                Err(OrchestratorError::AlreadyExecuted) => {
                    self.complete(id, backup.chain_id, None, true, true);
                    return;
                }
                Err(e) => {
                    warn!(
                        "Retry on chain {} failed for intent {}: {}",
                        backup.chain_id,
                        hex::encode(id.as_bytes()),
                        e
                    );
                    tried.push(backup.chain_id);

                    let attempts = self
                        .tracker
                        .get(&id)
                        .map(|s| s.failover_attempts)
                        .unwrap_or(u32::MAX);
                    if attempts < cfg.max_failover_attempts {
                        continue;
                    }

                    self.fail_failover(id, e.to_string());
                    return;
                }
            }
        }
    }

    fn failover_context(&self, intent: &Intent, tried: &[u64]) -> SelectionContext {
        let mut exclude = tried.to_vec();

        // Restrict candidates to the intent's declared failover chains; an
        // empty declaration leaves every known chain eligible
        if !intent.failover_chains.is_empty() {
            for chain_id in self.selector.known_chains() {
                if !intent.failover_chains.contains(&chain_id) && !exclude.contains(&chain_id) {
                    exclude.push(chain_id);
                }
            }
        }

        SelectionContext {
            kind: intent.action.into(),
            urgency: Urgency::High,
            amount: Some(intent.amount),
            max_gas_price_gwei: (intent.max_gas_price_gwei > 0)
                .then_some(intent.max_gas_price_gwei as f64),
            exclude,
        }
    }

    /// Resolve score ties among top candidates: lowest estimated bridge time
    /// first, then lowest gas price.
    fn pick_backup(&self, selection: &ChainSelection, current_chain: u64) -> ChainScore {
        let top_score = selection.recommended.score;
        let mut best = selection.recommended.clone();

        for alt in &selection.alternatives {
            if (top_score - alt.score).abs() > f64::EPSILON {
                break;
            }
            let best_time = self.bridge.estimate_time(current_chain, best.chain_id);
            let alt_time = self.bridge.estimate_time(current_chain, alt.chain_id);
            if alt_time < best_time
                || (alt_time == best_time && alt.gas_price_gwei < best.gas_price_gwei)
            {
                best = alt.clone();
            }
        }

        best
    }

    /// Poll the bridge until completion or until 2x the estimated time has
    /// elapsed.
    async fn wait_for_bridge(
        &self,
        bridge_id: Uuid,
        timeout_secs: u64,
        poll_interval_ms: u64,
    ) -> OrchestratorResult<()> {
        let started = Instant::now();
        let deadline = started + Duration::from_secs(timeout_secs);

        loop {
            match self.bridge.check_completion(bridge_id).await {
                Ok(true) => {
                    metrics::record_bridge_wait_secs(started.elapsed().as_secs_f64());
                    return Ok(());
                }
                Ok(false) => {}
                Err(e) => return Err(e),
            }

            if Instant::now() >= deadline {
                return Err(OrchestratorError::BridgeTimeout {
                    bridge_id,
                    waited_secs: timeout_secs,
                });
            }

            sleep(Duration::from_millis(poll_interval_ms.max(1))).await;
        }
    }

    fn complete(
        &self,
        id: H256,
        chain_id: u64,
        tx_hash: Option<H256>,
        reconciled: bool,
        via_failover: bool,
    ) {
        self.tracker
            .update(&id, |s| s.state = IntentState::Completed);

        metrics::record_execution_outcome("completed");
        self.emit(MonitoringEvent::IntentExecuted {
            intent_id: id,
            chain_id,
            tx_hash,
            reconciled,
            at: Utc::now(),
        });

        if via_failover {
            metrics::record_failover_outcome("success");
            self.emit(MonitoringEvent::FailoverSuccess {
                intent_id: id,
                chain_id,
                at: Utc::now(),
            });
        }

        info!(
            "Intent {} completed on chain {}",
            hex::encode(id.as_bytes()),
            chain_id
        );
        self.forget(&id);
    }

    fn fail(&self, id: H256, error: String) {
        self.tracker.update(&id, |s| s.state = IntentState::Failed);
        metrics::record_execution_outcome("failed");
        self.emit(MonitoringEvent::IntentFailed {
            intent_id: id,
            error,
            at: Utc::now(),
        });
        self.retire(&id);
    }

    fn fail_failover(&self, id: H256, error: String) {
        error!(
            "Failover failed for intent {}: {}",
            hex::encode(id.as_bytes()),
            error
        );
        self.tracker.update(&id, |s| s.state = IntentState::Failed);
        metrics::record_failover_outcome("failed");
        self.emit(MonitoringEvent::FailoverFailed {
            intent_id: id,
            error,
            at: Utc::now(),
        });
        self.retire(&id);
    }

    /// Drop a completed intent from the tracking map and the lock set
    fn forget(&self, id: &H256) {
        self.tracker.remove(id);
        self.locks.remove(id);
    }

    /// Drop a terminally failed intent; it is never re-tracked
    fn retire(&self, id: &H256) {
        self.tracker.retire(id);
        self.locks.remove(id);
    }

    fn lock_for(&self, id: &H256) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(*id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn emit(&self, event: MonitoringEvent) {
        metrics::record_event(event.name());
        self.bus.emit(event);
    }
}
