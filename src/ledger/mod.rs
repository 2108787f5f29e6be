//! Intent ledger abstraction
//!
//! The on-chain contract is an opaque intent ledger; the orchestrator only
//! talks to it through the `IntentLedger` trait. `rpc` provides the
//! production client; tests substitute their own implementations.

pub mod rpc;

use crate::error::OrchestratorResult;
use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};

/// Action kind declared by an intent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentAction {
    Transfer,
    Swap,
}

/// Ledger-side intent status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LedgerIntentStatus {
    Pending,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl LedgerIntentStatus {
    /// Decode the contract's status code
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(LedgerIntentStatus::Pending),
            1 => Some(LedgerIntentStatus::Executing),
            2 => Some(LedgerIntentStatus::Completed),
            3 => Some(LedgerIntentStatus::Failed),
            4 => Some(LedgerIntentStatus::Cancelled),
            _ => None,
        }
    }
}

/// A user's declared transaction. Immutable once created; the ledger is the
/// source of truth and the orchestrator only reads it.
#[derive(Debug, Clone, Serialize)]
pub struct Intent {
    pub id: H256,
    pub creator: Address,
    pub action: IntentAction,
    pub token: Address,
    pub amount: U256,
    pub recipient: Address,
    pub primary_chain_id: u64,
    /// Ordered candidate failover chains declared by the creator
    pub failover_chains: Vec<u64>,
    pub max_gas_price_gwei: u64,
    pub created_at: u64,
    pub deadline: u64,
}

/// An intent together with its ledger status at fetch time
#[derive(Debug, Clone, Serialize)]
pub struct IntentRecord {
    pub intent: Intent,
    pub status: LedgerIntentStatus,
}

/// Result of a successful ledger execution
#[derive(Debug, Clone)]
pub struct ExecutionReceipt {
    pub tx_hash: H256,
}

/// RPC-like interface over the on-chain intent ledger.
///
/// `execute_intent` fails with `ExecutionReverted` on on-chain failure and
/// with the typed `AlreadyExecuted` when another actor beat us to it;
/// transport problems surface as `LedgerUnavailable`.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait IntentLedger: Send + Sync {
    async fn get_user_intents(&self, user: Address) -> OrchestratorResult<Vec<IntentRecord>>;

    async fn get_intent(&self, id: H256) -> OrchestratorResult<Intent>;

    async fn execute_intent(&self, id: H256, chain_id: u64) -> OrchestratorResult<ExecutionReceipt>;

    async fn cancel_intent(&self, id: H256) -> OrchestratorResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_round_trip() {
        assert_eq!(
            LedgerIntentStatus::from_code(0),
            Some(LedgerIntentStatus::Pending)
        );
        assert_eq!(
            LedgerIntentStatus::from_code(2),
            Some(LedgerIntentStatus::Completed)
        );
        assert_eq!(
            LedgerIntentStatus::from_code(4),
            Some(LedgerIntentStatus::Cancelled)
        );
        assert_eq!(LedgerIntentStatus::from_code(5), None);
    }
}
