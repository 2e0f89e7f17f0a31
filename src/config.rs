//! Configuration management for the orchestrator
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub multisig: MultisigConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub services: ServicesConfig,
    #[serde(default)]
    pub chains: HashMap<String, ChainConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    pub instance_id: String,
    /// Proofs stuck in_progress longer than this are failed
    #[serde(default = "default_proof_timeout_secs")]
    pub proof_timeout_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Retry budget for payout, hook and fallback transfer
    #[serde(default = "default_stage_retry_limit")]
    pub stage_retry_limit: u32,
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollingConfig {
    pub tick_interval_ms: u64,
    pub batch_size: usize,
    pub default_poll_interval_secs: u64,
    pub default_max_retries: u32,
    pub initial_delay_secs: u64,
    /// How long a claimed task stays invisible to other ticks
    pub claim_lease_secs: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            batch_size: 10,
            default_poll_interval_secs: 10,
            default_max_retries: 180,
            initial_delay_secs: 3,
            claim_lease_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MultisigConfig {
    pub sweep_interval_secs: u64,
    pub default_ttl_secs: i64,
    pub default_required_signatures: u32,
    /// Rejections needed to reject a proposal. Defaults to its required signatures.
    pub rejection_threshold: Option<u32>,
}

impl Default for MultisigConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 60,
            default_ttl_secs: 7 * 24 * 3600,
            default_required_signatures: 2,
            rejection_threshold: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL URL, or "memory" for the in-process store
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

impl DatabaseConfig {
    pub fn is_memory(&self) -> bool {
        self.url == "memory"
    }
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

#[derive(Debug, Clone, Deserialize)]
pub struct ServicesConfig {
    pub proof_generator_url: String,
    pub payout_worker_url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub default_fee_bps: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    pub rpc_urls: Vec<String>,
    /// Settlement contract receiving commitments and withdrawals
    pub settlement_address: String,
    /// Treasury contract paying fallback transfers and hooks
    pub treasury_address: String,
    #[serde(default)]
    pub multisig_address: Option<String>,
    /// Overrides `services.default_fee_bps` for this chain
    #[serde(default)]
    pub fee_bps: Option<u32>,
    pub confirmation_blocks: u64,
    pub enabled: bool,
}

fn default_proof_timeout_secs() -> u64 {
    300
}

fn default_sweep_interval_secs() -> u64 {
    30
}

fn default_stage_retry_limit() -> u32 {
    5
}

fn default_health_check_interval_secs() -> u64 {
    30
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Settings {
    /// Load settings from the file named by `ZKPAY_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = env::var("ZKPAY_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from an explicit path
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
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
        if self.polling.batch_size == 0 {
            anyhow::bail!("polling.batch_size must be at least 1");
        }
        if self.polling.default_max_retries == 0 {
            anyhow::bail!("polling.default_max_retries must be at least 1");
        }
        if self.multisig.default_required_signatures == 0 {
            anyhow::bail!("multisig.default_required_signatures must be at least 1");
        }
        if self.multisig.rejection_threshold == Some(0) {
            anyhow::bail!("multisig.rejection_threshold must be at least 1");
        }

        for (name, chain) in &self.chains {
            if chain.enabled {
                if chain.rpc_urls.is_empty() {
                    anyhow::bail!("Chain {} has no RPC URLs configured", name);
                }
                if chain.settlement_address.is_empty() {
                    anyhow::bail!("Chain {} has no settlement contract configured", name);
                }
                if chain.multisig_address.is_none() {
                    tracing::warn!("Chain {} has no multisig address - proposals cannot execute there", name);
                }
            }
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
    lazy_static::lazy_static! {
        static ref ENV_VAR: regex::Regex =
            regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("static pattern");
    }

    ENV_VAR
        .replace_all(input, |cap: &regex::Captures<'_>| {
            env::var(&cap[1]).unwrap_or_default()
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[orchestrator]
instance_id = "test-1"

[database]
url = "memory"
max_connections = 5
min_connections = 1

[api]
host = "127.0.0.1"
port = 8080

[metrics]
enabled = false
port = 9090

[services]
proof_generator_url = "http://zkvm:${ZKPAY_TEST_PORT}"
payout_worker_url = "http://worker:8000"

[chains.bsc]
chain_id = 56
name = "BSC"
rpc_urls = ["https://bsc.example"]
settlement_address = "0x0000000000000000000000000000000000000001"
treasury_address = "0x0000000000000000000000000000000000000002"
confirmation_blocks = 15
enabled = true
"#;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("TEST_VAR", "test_value");
        let input = "url = \"https://api.example.com/${TEST_VAR}/endpoint\"";
        let result = substitute_env_vars(input);
        assert_eq!(result, "url = \"https://api.example.com/test_value/endpoint\"");
    }

    #[test]
    fn loads_file_with_defaults() {
        env::set_var("ZKPAY_TEST_PORT", "3001");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.services.proof_generator_url, "http://zkvm:3001");
        assert_eq!(settings.polling.default_max_retries, 180);
        assert_eq!(settings.polling.default_poll_interval_secs, 10);
        assert_eq!(settings.orchestrator.proof_timeout_secs, 300);
        assert_eq!(settings.orchestrator.stage_retry_limit, 5);
        assert!(settings.database.is_memory());
        assert_eq!(settings.get_chain_by_id(56).map(|c| c.name.as_str()), Some("BSC"));
    }

    #[test]
    fn rejects_zero_rejection_threshold() {
        let broken = format!("{SAMPLE}\n[multisig]\nsweep_interval_secs = 60\ndefault_ttl_secs = 60\ndefault_required_signatures = 2\nrejection_threshold = 0\n");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(broken.as_bytes()).unwrap();

        assert!(Settings::load_from(file.path()).is_err());
    }
}
