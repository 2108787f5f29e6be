//! Per-chain RPC access with multi-provider failover
//!
//! Wraps a set of HTTP providers per chain, rotating to the next provider on
//! transport failure, and offers the call/send/receipt primitives the ledger
//! and bridge clients build on.

use crate::config::{ChainConfig, Settings};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::selector::{ChainMetrics, ChainMetricsSource};

use ethers::prelude::*;
use ethers::providers::RpcError;
use ethers::types::transaction::eip2718::TypedTransaction;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

const SEND_ATTEMPTS: usize = 3;
const SEND_TIMEOUT: Duration = Duration::from_secs(30);
const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const GAS_PRICE_BUFFER_PERCENT: u64 = 10;
const GAS_LIMIT_BUFFER_PERCENT: u64 = 20;
const FALLBACK_GAS_LIMIT: u64 = 200_000;

/// Failure modes of a raw RPC interaction. Callers classify the revert data
/// themselves; transport problems carry the underlying message.
#[derive(Debug)]
pub enum RpcCallError {
    /// The node returned revert data (custom error or Error(string))
    Reverted(Vec<u8>),
    Transport(String),
}

/// Multi-provider wrapper for one chain
pub struct ChainRpc {
    config: ChainConfig,
    http_providers: Vec<Provider<Http>>,
    current_provider: AtomicUsize,
}

impl ChainRpc {
    pub fn new(config: ChainConfig) -> OrchestratorResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(100));
                    http_providers.push(provider);
                    debug!("Added HTTP provider for chain {}: {}", config.chain_id, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(OrchestratorError::ChainConnection {
                chain_id: config.chain_id,
                message: "No valid RPC providers".to_string(),
            });
        }

        Ok(Self {
            config,
            http_providers,
            current_provider: AtomicUsize::new(0),
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!(
            "Chain {} failover to provider {}",
            self.config.chain_id, next
        );
    }

    pub fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    pub fn congestion_score(&self) -> u8 {
        self.config.congestion_score
    }

    pub fn confirmation_blocks(&self) -> u64 {
        self.config.confirmation_blocks
    }

    pub fn ledger_address(&self) -> OrchestratorResult<Address> {
        self.config
            .ledger_address
            .parse()
            .map_err(|e| OrchestratorError::Config(format!("Invalid ledger address: {}", e)))
    }

    pub fn bridge_address(&self) -> OrchestratorResult<Address> {
        self.config
            .bridge_address
            .parse()
            .map_err(|e| OrchestratorError::Config(format!("Invalid bridge address: {}", e)))
    }

    fn connection_error(&self, message: impl Into<String>) -> OrchestratorError {
        OrchestratorError::ChainConnection {
            chain_id: self.config.chain_id,
            message: message.into(),
        }
    }

    /// Get current block number with failover
    pub async fn get_block_number(&self) -> OrchestratorResult<u64> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_block_number().await {
                Ok(block) => return Ok(block.as_u64()),
                Err(e) => {
                    warn!(
                        "Failed to get block number from chain {}: {}",
                        self.config.chain_id, e
                    );
                    self.failover();
                }
            }
        }

        Err(self.connection_error("All providers failed"))
    }

    /// Current gas price in gwei, capped at the configured per-chain maximum
    pub async fn gas_price_gwei(&self) -> OrchestratorResult<f64> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_gas_price().await {
                Ok(price) => {
                    let gwei = wei_to_gwei(price);
                    return Ok(gwei.min(self.config.max_gas_price_gwei as f64));
                }
                Err(e) => {
                    warn!(
                        "Failed to get gas price from chain {}: {}",
                        self.config.chain_id, e
                    );
                    self.failover();
                }
            }
        }

        Err(self.connection_error("All providers failed to get gas price"))
    }

    /// Read-only contract call with raw calldata
    pub async fn call(&self, to: Address, data: Vec<u8>) -> Result<Bytes, RpcCallError> {
        let tx: TypedTransaction = TransactionRequest::new()
            .to(to)
            .data(data)
            .into();

        let mut last_error = String::new();
        for _ in 0..self.http_providers.len() {
            match self.http().call(&tx, None).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) => {
                    if let Some(revert) = extract_revert_data(&e) {
                        return Err(RpcCallError::Reverted(revert));
                    }
                    last_error = e.to_string();
                    self.failover();
                }
            }
        }

        Err(RpcCallError::Transport(last_error))
    }

    /// Sign and submit a transaction, returning its hash.
    ///
    /// Nonce, gas limit, and gas price are resolved per attempt so a retry
    /// after a transport failure picks up fresh chain state.
    pub async fn send_transaction(
        &self,
        wallet: &LocalWallet,
        to: Address,
        data: Vec<u8>,
    ) -> Result<H256, RpcCallError> {
        let wallet = wallet.clone().with_chain_id(self.config.chain_id);
        let from = wallet.address();

        let mut last_error = String::new();
        for attempt in 1..=SEND_ATTEMPTS {
            let nonce = match self.http().get_transaction_count(from, None).await {
                Ok(n) => n,
                Err(e) => {
                    last_error = e.to_string();
                    self.failover();
                    continue;
                }
            };

            let gas_price = match self.http().get_gas_price().await {
                Ok(p) => p + p * GAS_PRICE_BUFFER_PERCENT / 100,
                Err(e) => {
                    last_error = e.to_string();
                    self.failover();
                    continue;
                }
            };

            let mut tx: TypedTransaction = TransactionRequest::new()
                .from(from)
                .to(to)
                .data(data.clone())
                .nonce(nonce)
                .gas_price(gas_price)
                .chain_id(self.config.chain_id)
                .into();

            let gas_limit = match self.http().estimate_gas(&tx, None).await {
                Ok(g) => g,
                Err(e) => {
                    // A revert during estimation is a real contract rejection
                    if let Some(revert) = extract_revert_data(&e) {
                        return Err(RpcCallError::Reverted(revert));
                    }
                    U256::from(FALLBACK_GAS_LIMIT)
                }
            };
            tx.set_gas(gas_limit + gas_limit * GAS_LIMIT_BUFFER_PERCENT / 100);

            let signature = wallet
                .sign_transaction(&tx)
                .await
                .map_err(|e| RpcCallError::Transport(format!("signing failed: {}", e)))?;
            let raw = tx.rlp_signed(&signature);

            match timeout(SEND_TIMEOUT, self.http().send_raw_transaction(raw)).await {
                Ok(Ok(pending)) => {
                    let tx_hash = pending.tx_hash();
                    debug!(
                        "Transaction sent on chain {}: {:?} (attempt {}/{})",
                        self.config.chain_id, tx_hash, attempt, SEND_ATTEMPTS
                    );
                    return Ok(tx_hash);
                }
                Ok(Err(e)) => {
                    if let Some(revert) = extract_revert_data(&e) {
                        return Err(RpcCallError::Reverted(revert));
                    }
                    last_error = e.to_string();
                    self.failover();
                }
                Err(_) => {
                    warn!(
                        "Transaction send timeout on chain {} (attempt {})",
                        self.config.chain_id, attempt
                    );
                    last_error = "send timeout".to_string();
                    self.failover();
                }
            }
        }

        Err(RpcCallError::Transport(last_error))
    }

    /// Confirmations and success flag for a mined transaction, or None while
    /// it is still pending
    pub async fn receipt_confirmations(
        &self,
        tx_hash: H256,
    ) -> OrchestratorResult<Option<(u64, bool)>> {
        let receipt = self
            .http()
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| self.connection_error(e.to_string()))?;

        let Some(receipt) = receipt else {
            return Ok(None);
        };
        let Some(block_number) = receipt.block_number else {
            return Ok(None);
        };

        let current_block = self.get_block_number().await?;
        let confirmations = current_block.saturating_sub(block_number.as_u64()) + 1;
        let succeeded = receipt.status == Some(1.into());

        Ok(Some((confirmations, succeeded)))
    }

    /// Wait until a transaction is mined with the requested confirmation
    /// depth. Returns the on-chain success flag.
    pub async fn wait_for_receipt(
        &self,
        tx_hash: H256,
        confirmations: u64,
        wait_timeout: Duration,
    ) -> OrchestratorResult<bool> {
        let deadline = tokio::time::Instant::now() + wait_timeout;

        loop {
            if let Some((confs, succeeded)) = self.receipt_confirmations(tx_hash).await? {
                if !succeeded {
                    return Ok(false);
                }
                if confs >= confirmations {
                    return Ok(true);
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(OrchestratorError::Timeout {
                    operation: format!("receipt for {:?}", tx_hash),
                });
            }

            tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
        }
    }
}

/// Build the per-chain RPC set from configuration
pub fn build_chains(settings: &Settings) -> OrchestratorResult<HashMap<u64, Arc<ChainRpc>>> {
    let mut chains = HashMap::new();
    for (_, chain_config) in settings.enabled_chains() {
        let rpc = ChainRpc::new(chain_config.clone())?;
        chains.insert(chain_config.chain_id, Arc::new(rpc));
    }
    Ok(chains)
}

fn wei_to_gwei(wei: U256) -> f64 {
    // Gas prices fit comfortably in u128
    wei.as_u128() as f64 / 1e9
}

/// Extract ABI-encoded revert data from a provider error, if present
fn extract_revert_data<E: RpcError>(err: &E) -> Option<Vec<u8>> {
    let rpc_err = err.as_error_response()?;
    let data = rpc_err.data.as_ref()?.as_str()?;
    hex::decode(data.trim_start_matches("0x")).ok()
}

/// Live chain metrics sampled over RPC; congestion falls back to the
/// configured per-chain index.
pub struct RpcChainMetrics {
    chains: HashMap<u64, Arc<ChainRpc>>,
}

impl RpcChainMetrics {
    pub fn new(chains: HashMap<u64, Arc<ChainRpc>>) -> Self {
        Self { chains }
    }
}

#[async_trait::async_trait]
impl ChainMetricsSource for RpcChainMetrics {
    async fn sample(&self, chain_id: u64) -> OrchestratorResult<ChainMetrics> {
        let chain = self
            .chains
            .get(&chain_id)
            .ok_or(OrchestratorError::ChainNotFound { chain_id })?;

        let gas_price_gwei = chain.gas_price_gwei().await?;

        Ok(ChainMetrics {
            gas_price_gwei,
            congestion: chain.congestion_score(),
        })
    }
}
