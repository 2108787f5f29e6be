//! Intent ledger client over JSON-RPC
//!
//! Talks to the intent ledger contract on each configured chain with manually
//! encoded calldata. Executions are simulated first so revert reasons arrive
//! as typed errors; the contract's `AlreadyExecuted()` custom error maps to
//! the typed reconciliation condition, never to message matching.

use super::{ExecutionReceipt, Intent, IntentAction, IntentLedger, IntentRecord, LedgerIntentStatus};
use crate::chain::{ChainRpc, RpcCallError};
use crate::error::{OrchestratorError, OrchestratorResult};

use ethers::abi::{decode, encode, ParamType, Token};
use ethers::prelude::*;
use lazy_static::lazy_static;
use sha3::{Digest, Keccak256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const EXECUTION_RECEIPT_TIMEOUT: Duration = Duration::from_secs(120);

lazy_static! {
    static ref SEL_GET_USER_INTENTS: [u8; 4] = selector("getUserIntents(address)");
    static ref SEL_GET_INTENT: [u8; 4] = selector("getIntent(bytes32)");
    static ref SEL_EXECUTE_INTENT: [u8; 4] = selector("executeIntent(bytes32)");
    static ref SEL_CANCEL_INTENT: [u8; 4] = selector("cancelIntent(bytes32)");
    // Custom contract errors
    static ref ERR_ALREADY_EXECUTED: [u8; 4] = selector("AlreadyExecuted()");
    static ref ERR_UNKNOWN_INTENT: [u8; 4] = selector("UnknownIntent()");
    // Solidity Error(string)
    static ref ERR_STRING: [u8; 4] = selector("Error(string)");
}

fn selector(signature: &str) -> [u8; 4] {
    let digest = Keccak256::digest(signature.as_bytes());
    [digest[0], digest[1], digest[2], digest[3]]
}

/// How ledger executions are signed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningMode {
    /// Relayer-local wallet
    Local,
    /// Delegated custodian key signing on the user's behalf
    Delegated,
}

/// Production `IntentLedger` implementation
pub struct RpcIntentLedger {
    chains: HashMap<u64, Arc<ChainRpc>>,
    wallet: LocalWallet,
    delegated_wallet: Option<LocalWallet>,
}

impl RpcIntentLedger {
    pub fn new(
        chains: HashMap<u64, Arc<ChainRpc>>,
        wallet: LocalWallet,
        delegated_wallet: Option<LocalWallet>,
    ) -> Self {
        Self {
            chains,
            wallet,
            delegated_wallet,
        }
    }

    pub fn signing_mode(&self) -> SigningMode {
        if self.delegated_wallet.is_some() {
            SigningMode::Delegated
        } else {
            SigningMode::Local
        }
    }

    fn execution_wallet(&self) -> &LocalWallet {
        self.delegated_wallet.as_ref().unwrap_or(&self.wallet)
    }

    fn chain(&self, chain_id: u64) -> OrchestratorResult<&Arc<ChainRpc>> {
        self.chains
            .get(&chain_id)
            .ok_or(OrchestratorError::ChainNotFound { chain_id })
    }

    fn intent_param_types() -> Vec<ParamType> {
        vec![
            ParamType::FixedBytes(32),              // id
            ParamType::Address,                     // creator
            ParamType::Uint(8),                     // action
            ParamType::Address,                     // token
            ParamType::Uint(256),                   // amount
            ParamType::Address,                     // recipient
            ParamType::Uint(64),                    // primary chain
            ParamType::Array(Box::new(ParamType::Uint(64))), // failover chains
            ParamType::Uint(64),                    // max gas price (gwei)
            ParamType::Uint(64),                    // created at
            ParamType::Uint(64),                    // deadline
            ParamType::Uint(8),                     // status
        ]
    }

    fn decode_record(tokens: Vec<Token>) -> OrchestratorResult<IntentRecord> {
        let bad = |what: &str| OrchestratorError::Internal(format!("malformed intent {}", what));

        let mut it = tokens.into_iter();
        let id = match it.next() {
            Some(Token::FixedBytes(bytes)) if bytes.len() == 32 => H256::from_slice(&bytes),
            _ => return Err(bad("id")),
        };
        let creator = match it.next() {
            Some(Token::Address(a)) => a,
            _ => return Err(bad("creator")),
        };
        let action = match it.next() {
            Some(Token::Uint(v)) if v == U256::zero() => IntentAction::Transfer,
            Some(Token::Uint(v)) if v == U256::one() => IntentAction::Swap,
            _ => return Err(bad("action")),
        };
        let token = match it.next() {
            Some(Token::Address(a)) => a,
            _ => return Err(bad("token")),
        };
        let amount = match it.next() {
            Some(Token::Uint(v)) => v,
            _ => return Err(bad("amount")),
        };
        let recipient = match it.next() {
            Some(Token::Address(a)) => a,
            _ => return Err(bad("recipient")),
        };
        let primary_chain_id = match it.next() {
            Some(Token::Uint(v)) => v.as_u64(),
            _ => return Err(bad("primary chain")),
        };
        let failover_chains = match it.next() {
            Some(Token::Array(items)) => items
                .into_iter()
                .map(|t| match t {
                    Token::Uint(v) => Ok(v.as_u64()),
                    _ => Err(bad("failover chain")),
                })
                .collect::<Result<Vec<_>, _>>()?,
            _ => return Err(bad("failover chains")),
        };
        let max_gas_price_gwei = match it.next() {
            Some(Token::Uint(v)) => v.as_u64(),
            _ => return Err(bad("max gas price")),
        };
        let created_at = match it.next() {
            Some(Token::Uint(v)) => v.as_u64(),
            _ => return Err(bad("created at")),
        };
        let deadline = match it.next() {
            Some(Token::Uint(v)) => v.as_u64(),
            _ => return Err(bad("deadline")),
        };
        let status = match it.next() {
            Some(Token::Uint(v)) => LedgerIntentStatus::from_code(v.as_u64() as u8)
                .ok_or_else(|| bad("status code"))?,
            _ => return Err(bad("status")),
        };

        Ok(IntentRecord {
            intent: Intent {
                id,
                creator,
                action,
                token,
                amount,
                recipient,
                primary_chain_id,
                failover_chains,
                max_gas_price_gwei,
                created_at,
                deadline,
            },
            status,
        })
    }

    /// Map revert data from the ledger to the typed error taxonomy
    fn classify_revert(data: Vec<u8>) -> OrchestratorError {
        if data.len() >= 4 {
            let sel = &data[..4];
            if sel == &ERR_ALREADY_EXECUTED[..] {
                return OrchestratorError::AlreadyExecuted;
            }
            if sel == &ERR_STRING[..] {
                if let Ok(tokens) = decode(&[ParamType::String], &data[4..]) {
                    if let Some(Token::String(reason)) = tokens.into_iter().next() {
                        return OrchestratorError::ExecutionReverted(reason);
                    }
                }
            }
            return OrchestratorError::ExecutionReverted(format!("0x{}", hex::encode(sel)));
        }
        OrchestratorError::ExecutionReverted("reverted without data".to_string())
    }
}

#[async_trait::async_trait]
impl IntentLedger for RpcIntentLedger {
    async fn get_user_intents(&self, user: Address) -> OrchestratorResult<Vec<IntentRecord>> {
        let mut calldata = SEL_GET_USER_INTENTS.to_vec();
        calldata.extend(encode(&[Token::Address(user)]));

        let mut records = Vec::new();
        let mut failures = 0usize;
        let mut last_error = String::new();

        for chain in self.chains.values() {
            match chain.call(chain.ledger_address()?, calldata.clone()).await {
                Ok(bytes) => {
                    let tuple = ParamType::Tuple(Self::intent_param_types());
                    let decoded = decode(&[ParamType::Array(Box::new(tuple))], &bytes)
                        .map_err(|e| {
                            OrchestratorError::Internal(format!("intent list decode: {}", e))
                        })?;
                    if let Some(Token::Array(items)) = decoded.into_iter().next() {
                        for item in items {
                            if let Token::Tuple(tokens) = item {
                                records.push(Self::decode_record(tokens)?);
                            }
                        }
                    }
                }
                Err(RpcCallError::Reverted(data)) => {
                    failures += 1;
                    last_error = format!("0x{}", hex::encode(&data[..data.len().min(4)]));
                }
                Err(RpcCallError::Transport(message)) => {
                    warn!(
                        "Ledger fetch failed on chain {}: {}",
                        chain.chain_id(),
                        message
                    );
                    failures += 1;
                    last_error = message;
                }
            }
        }

        if failures == self.chains.len() && !self.chains.is_empty() {
            return Err(OrchestratorError::LedgerUnavailable(last_error));
        }

        debug!("Fetched {} intents for {:?}", records.len(), user);
        Ok(records)
    }

    async fn get_intent(&self, id: H256) -> OrchestratorResult<Intent> {
        let mut calldata = SEL_GET_INTENT.to_vec();
        calldata.extend(encode(&[Token::FixedBytes(id.as_bytes().to_vec())]));

        for chain in self.chains.values() {
            match chain.call(chain.ledger_address()?, calldata.clone()).await {
                Ok(bytes) => {
                    let tuple = ParamType::Tuple(Self::intent_param_types());
                    let decoded = decode(&[tuple], &bytes).map_err(|e| {
                        OrchestratorError::Internal(format!("intent decode: {}", e))
                    })?;
                    if let Some(Token::Tuple(tokens)) = decoded.into_iter().next() {
                        return Ok(Self::decode_record(tokens)?.intent);
                    }
                }
                Err(RpcCallError::Reverted(data)) => {
                    // Unknown on this chain; try the next one
                    if data.len() < 4 || data[..4] != ERR_UNKNOWN_INTENT[..] {
                        warn!(
                            "Unexpected revert looking up intent on chain {}: 0x{}",
                            chain.chain_id(),
                            hex::encode(&data[..data.len().min(4)])
                        );
                    }
                    continue;
                }
                Err(RpcCallError::Transport(message)) => {
                    warn!(
                        "Intent lookup failed on chain {}: {}",
                        chain.chain_id(),
                        message
                    );
                }
            }
        }

        Err(OrchestratorError::IntentNotFound {
            intent_id: format!("{:?}", id),
        })
    }

    async fn execute_intent(
        &self,
        id: H256,
        chain_id: u64,
    ) -> OrchestratorResult<ExecutionReceipt> {
        let chain = self.chain(chain_id)?;
        let ledger = chain.ledger_address()?;
        let wallet = self.execution_wallet();

        let mut calldata = SEL_EXECUTE_INTENT.to_vec();
        calldata.extend(encode(&[Token::FixedBytes(id.as_bytes().to_vec())]));

        // Simulate first so reverts come back with typed reasons
        if let Err(e) = chain.call(ledger, calldata.clone()).await {
            return Err(match e {
                RpcCallError::Reverted(data) => Self::classify_revert(data),
                RpcCallError::Transport(message) => {
                    OrchestratorError::LedgerUnavailable(message)
                }
            });
        }

        let tx_hash = chain
            .send_transaction(wallet, ledger, calldata)
            .await
            .map_err(|e| match e {
                RpcCallError::Reverted(data) => Self::classify_revert(data),
                RpcCallError::Transport(message) => {
                    OrchestratorError::LedgerUnavailable(message)
                }
            })?;

        let succeeded = chain
            .wait_for_receipt(tx_hash, 1, EXECUTION_RECEIPT_TIMEOUT)
            .await?;

        if !succeeded {
            return Err(OrchestratorError::ExecutionReverted(format!(
                "execution transaction {:?} reverted on-chain",
                tx_hash
            )));
        }

        info!(
            "Intent {} executed on chain {} ({:?}, {:?} signing)",
            hex::encode(id.as_bytes()),
            chain_id,
            tx_hash,
            self.signing_mode()
        );

        Ok(ExecutionReceipt { tx_hash })
    }

    async fn cancel_intent(&self, id: H256) -> OrchestratorResult<()> {
        let intent = self.get_intent(id).await?;
        let chain = self.chain(intent.primary_chain_id)?;
        let ledger = chain.ledger_address()?;

        let mut calldata = SEL_CANCEL_INTENT.to_vec();
        calldata.extend(encode(&[Token::FixedBytes(id.as_bytes().to_vec())]));

        let tx_hash = chain
            .send_transaction(&self.wallet, ledger, calldata)
            .await
            .map_err(|e| match e {
                RpcCallError::Reverted(data) => Self::classify_revert(data),
                RpcCallError::Transport(message) => {
                    OrchestratorError::LedgerUnavailable(message)
                }
            })?;

        let succeeded = chain
            .wait_for_receipt(tx_hash, 1, EXECUTION_RECEIPT_TIMEOUT)
            .await?;
        if !succeeded {
            return Err(OrchestratorError::ExecutionReverted(format!(
                "cancel transaction {:?} reverted on-chain",
                tx_hash
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tokens() -> Vec<Token> {
        vec![
            Token::FixedBytes(vec![0xab; 32]),
            Token::Address(Address::repeat_byte(0x01)),
            Token::Uint(U256::zero()),
            Token::Address(Address::repeat_byte(0x02)),
            Token::Uint(U256::from(5_000u64)),
            Token::Address(Address::repeat_byte(0x03)),
            Token::Uint(U256::from(11155111u64)),
            Token::Array(vec![
                Token::Uint(U256::from(84532u64)),
                Token::Uint(U256::from(421614u64)),
            ]),
            Token::Uint(U256::from(50u64)),
            Token::Uint(U256::from(1_700_000_000u64)),
            Token::Uint(U256::from(1_700_003_600u64)),
            Token::Uint(U256::zero()),
        ]
    }

    #[test]
    fn test_decode_record() {
        let record = RpcIntentLedger::decode_record(sample_tokens()).unwrap();
        assert_eq!(record.intent.id, H256::from_slice(&[0xab; 32]));
        assert_eq!(record.intent.action, IntentAction::Transfer);
        assert_eq!(record.intent.primary_chain_id, 11155111);
        assert_eq!(record.intent.failover_chains, vec![84532, 421614]);
        assert_eq!(record.intent.max_gas_price_gwei, 50);
        assert_eq!(record.status, LedgerIntentStatus::Pending);
    }

    #[test]
    fn test_decode_record_rejects_bad_action() {
        let mut tokens = sample_tokens();
        tokens[2] = Token::Uint(U256::from(9u64));
        assert!(RpcIntentLedger::decode_record(tokens).is_err());
    }

    #[test]
    fn test_classify_revert_already_executed() {
        let err = RpcIntentLedger::classify_revert(ERR_ALREADY_EXECUTED.to_vec());
        assert!(matches!(err, OrchestratorError::AlreadyExecuted));
    }

    #[test]
    fn test_classify_revert_error_string() {
        let mut data = ERR_STRING.to_vec();
        data.extend(encode(&[Token::String("gas too low".to_string())]));

        let err = RpcIntentLedger::classify_revert(data);
        match err {
            OrchestratorError::ExecutionReverted(reason) => assert_eq!(reason, "gas too low"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_classify_revert_unknown_selector() {
        let err = RpcIntentLedger::classify_revert(vec![0xde, 0xad, 0xbe, 0xef]);
        assert!(matches!(err, OrchestratorError::ExecutionReverted(_)));
    }
}
