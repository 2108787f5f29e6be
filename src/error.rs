//! Error types for the failover orchestrator

use thiserror::Error;

/// Main error type for the orchestrator
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Chain connection error for chain {chain_id}: {message}")]
    ChainConnection { chain_id: u64, message: String },

    #[error("Intent ledger unavailable: {0}")]
    LedgerUnavailable(String),

    #[error("Execution reverted: {0}")]
    ExecutionReverted(String),

    #[error("Intent already executed")]
    AlreadyExecuted,

    #[error("Intent {intent_id} not found on the ledger")]
    IntentNotFound { intent_id: String },

    #[error("Intent {intent_id} is not monitored")]
    NotMonitored { intent_id: String },

    #[error("Intent {intent_id} exhausted its execution attempts")]
    AttemptsExhausted { intent_id: String },

    #[error("No viable backup chain: {0}")]
    NoViableChain(String),

    #[error("Bridge failed: {0}")]
    BridgeFailed(String),

    #[error("Bridge {bridge_id} timed out after {waited_secs}s")]
    BridgeTimeout {
        bridge_id: uuid::Uuid,
        waited_secs: u64,
    },

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Chain {chain_id} not found")]
    ChainNotFound { chain_id: u64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// Transient errors: the intent stays tracked and is retried next cycle.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::LedgerUnavailable(_)
                | OrchestratorError::ChainConnection { .. }
                | OrchestratorError::Timeout { .. }
        )
    }

    /// Execution failures that qualify for the bridge-and-retry path.
    pub fn is_failover_eligible(&self) -> bool {
        matches!(self, OrchestratorError::ExecutionReverted(_))
    }
}

/// Result type for orchestrator operations
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
