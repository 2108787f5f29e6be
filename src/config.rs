//! Configuration management for the failover relayer
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub monitor: MonitorConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub selection: SelectionConfig,
    pub chains: HashMap<String, ChainConfig>,
    pub wallet: WalletConfig,
}

/// Monitoring options recognized by the failover engine.
///
/// All fields have serde defaults so a partial `[monitor]` section works.
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// Address whose intents are monitored by the binary
    #[serde(default)]
    pub user_address: Option<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_execution_attempts")]
    pub max_execution_attempts: u32,
    #[serde(default = "default_true")]
    pub auto_execute: bool,
    #[serde(default = "default_true")]
    pub enable_failover: bool,
    #[serde(default = "default_max_failover_attempts")]
    pub max_failover_attempts: u32,
    /// Fixed short interval used while waiting for a bridge to complete
    #[serde(default = "default_bridge_poll_interval_ms")]
    pub bridge_poll_interval_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    10_000
}

fn default_max_execution_attempts() -> u32 {
    3
}

fn default_max_failover_attempts() -> u32 {
    2
}

fn default_bridge_poll_interval_ms() -> u64 {
    500
}

fn default_true() -> bool {
    true
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            user_address: None,
            poll_interval_ms: default_poll_interval_ms(),
            max_execution_attempts: default_max_execution_attempts(),
            auto_execute: true,
            enable_failover: true,
            max_failover_attempts: default_max_failover_attempts(),
            bridge_poll_interval_ms: default_bridge_poll_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

/// Chain-selection tuning
#[derive(Debug, Clone, Deserialize)]
pub struct SelectionConfig {
    /// Gas price (gwei) at which the cost sub-score bottoms out at zero
    #[serde(default = "default_reference_max_gas_gwei")]
    pub reference_max_gas_gwei: f64,
}

fn default_reference_max_gas_gwei() -> f64 {
    100.0
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            reference_max_gas_gwei: default_reference_max_gas_gwei(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    pub rpc_urls: Vec<String>,
    /// Intent ledger contract address
    pub ledger_address: String,
    /// Bridge router contract address
    pub bridge_address: String,
    /// Average block time used as the speed prior
    pub avg_block_time_secs: f64,
    /// Static congestion index 0-100, used when no live sample is available
    #[serde(default = "default_congestion_score")]
    pub congestion_score: u8,
    /// Reliability prior in [0,1]
    #[serde(default = "default_reliability")]
    pub reliability: f64,
    pub confirmation_blocks: u64,
    pub max_gas_price_gwei: u64,
    pub enabled: bool,
}

fn default_congestion_score() -> u8 {
    30
}

fn default_reliability() -> f64 {
    0.9
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    /// Env var holding the relayer signing key
    pub private_key_env: Option<String>,
    /// Env var holding the delegated-custodian signing key; when set,
    /// ledger executions are signed with this key instead of the local one
    pub delegated_key_env: Option<String>,
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("FAILOVER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        // Substitute environment variables
        let config_str = substitute_env_vars(&config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        // At least one chain must be enabled
        if self.enabled_chains().is_empty() {
            anyhow::bail!("At least one chain must be enabled");
        }

        for (name, chain) in &self.chains {
            if chain.enabled {
                if chain.rpc_urls.is_empty() {
                    anyhow::bail!("Chain {} has no RPC URLs configured", name);
                }
                if chain.ledger_address.is_empty() {
                    anyhow::bail!("Chain {} has no ledger address configured", name);
                }
                if chain.avg_block_time_secs <= 0.0 {
                    anyhow::bail!("Chain {} has a non-positive block time", name);
                }
            }
        }

        if self.monitor.max_execution_attempts == 0 {
            anyhow::bail!("monitor.max_execution_attempts must be at least 1");
        }

        Ok(())
    }

    /// Get list of enabled chains
    pub fn enabled_chains(&self) -> Vec<(&String, &ChainConfig)> {
        self.chains.iter().filter(|(_, c)| c.enabled).collect()
    }

    /// Get chain config by chain ID
    pub fn get_chain_by_id(&self, chain_id: u64) -> Option<&ChainConfig> {
        self.chains.values().find(|c| c.chain_id == chain_id)
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("TEST_VAR", "test_value");
        let input = "url = \"https://api.example.com/${TEST_VAR}/endpoint\"";
        let result = substitute_env_vars(input);
        assert_eq!(
            result,
            "url = \"https://api.example.com/test_value/endpoint\""
        );
    }

    #[test]
    fn test_monitor_defaults() {
        let cfg: MonitorConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.poll_interval_ms, 10_000);
        assert_eq!(cfg.max_execution_attempts, 3);
        assert!(cfg.auto_execute);
        assert!(cfg.enable_failover);
        assert_eq!(cfg.max_failover_attempts, 2);
    }

    #[test]
    fn test_monitor_overrides() {
        let cfg: MonitorConfig = toml::from_str(
            r#"
            poll_interval_ms = 250
            auto_execute = false
            max_failover_attempts = 5
            "#,
        )
        .unwrap();
        assert_eq!(cfg.poll_interval_ms, 250);
        assert!(!cfg.auto_execute);
        assert_eq!(cfg.max_failover_attempts, 5);
        // untouched fields keep their defaults
        assert_eq!(cfg.max_execution_attempts, 3);
    }
}
