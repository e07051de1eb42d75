//! Configuration management for the exchange client
//!
//! Loads configuration from TOML files with environment variable substitution.
//! The `[networks]` table doubles as the contract directory: one entry per
//! supported network identifier.

use anyhow::{Context, Result};
use ethers::types::Address;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub agent: AgentConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Contract addresses keyed by network identifier
    #[serde(default)]
    pub networks: HashMap<String, NetworkContracts>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub rpc_url: String,
    /// Name of the environment variable holding a signing key
    pub private_key_env: Option<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_port() -> u16 {
    9090
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

/// Contracts deployed on one network
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NetworkContracts {
    pub token_a: ContractEntry,
    pub token_b: ContractEntry,
    pub exchange: ContractEntry,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ContractEntry {
    pub address: Address,
}

/// Read-only lookup of contract addresses by network identifier.
///
/// `None` means the network is unsupported; no contract interaction should
/// be attempted.
#[cfg_attr(test, mockall::automock)]
pub trait ContractDirectory: Send + Sync {
    fn lookup(&self, chain_id: u64) -> Option<NetworkContracts>;
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("EXCHANGE_CLIENT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::from_path(&config_path)
    }

    /// Load settings from a specific file
    pub fn from_path(path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        Self::from_toml(&config_str)
    }

    pub fn from_toml(config_str: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.agent.rpc_url.is_empty() {
            anyhow::bail!("agent.rpc_url must be set");
        }
        if self.agent.poll_interval_ms == 0 {
            anyhow::bail!("agent.poll_interval_ms must be positive");
        }

        for (name, network) in &self.networks {
            name.parse::<u64>()
                .with_context(|| format!("Network key {:?} is not a chain id", name))?;

            if network.token_a.address == network.token_b.address {
                anyhow::bail!("Network {} uses the same address for both tokens", name);
            }
            if network.exchange.address.is_zero() {
                tracing::warn!("Network {} has a zero exchange address", name);
            }
        }

        if self.networks.is_empty() {
            tracing::warn!("No networks configured - every network will be treated as unsupported");
        }

        Ok(())
    }

    /// Chain ids with a configured deployment
    pub fn supported_networks(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .networks
            .keys()
            .filter_map(|k| k.parse().ok())
            .collect();
        ids.sort_unstable();
        ids
    }
}

impl ContractDirectory for Settings {
    fn lookup(&self, chain_id: u64) -> Option<NetworkContracts> {
        self.networks.get(&chain_id.to_string()).cloned()
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();
    let re = match regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}") {
        Ok(re) => re,
        Err(_) => return result,
    };

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
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"
[agent]
rpc_url = "http://127.0.0.1:8545"

[metrics]
enabled = true
port = 9200

[networks.31337]
token_a = { address = "0x5FbDB2315678afecb367f032d93F642f64180aa3" }
token_b = { address = "0xe7f1725E7734CE288F8367e1Bb143E90bb3F0512" }
exchange = { address = "0x9fE46736679d2D9a65F0992F2272dE9f3c7fa6e0" }
"#;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("EXCHANGE_CLIENT_TEST_VAR", "test_value");
        let input = "url = \"https://api.example.com/${EXCHANGE_CLIENT_TEST_VAR}/endpoint\"";
        let result = substitute_env_vars(input);
        assert_eq!(result, "url = \"https://api.example.com/test_value/endpoint\"");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let settings = Settings::from_path(file.path()).unwrap();
        assert_eq!(settings.agent.poll_interval_ms, 1000);
        assert!(settings.metrics.enabled);
        assert_eq!(settings.metrics.port, 9200);
        assert!(!settings.logging.json);
        assert_eq!(settings.supported_networks(), vec![31337]);
    }

    #[test]
    fn test_lookup_by_network() {
        let settings = Settings::from_toml(SAMPLE).unwrap();

        let contracts = settings.lookup(31337).unwrap();
        assert_eq!(
            contracts.exchange.address,
            "0x9fE46736679d2D9a65F0992F2272dE9f3c7fa6e0".parse::<Address>().unwrap()
        );
        assert!(settings.lookup(1).is_none());
    }

    #[test]
    fn test_rejects_non_numeric_network_key() {
        let bad = SAMPLE.replace("[networks.31337]", "[networks.mainnet]");
        assert!(Settings::from_toml(&bad).is_err());
    }

    #[test]
    fn test_rejects_duplicate_token_address() {
        let bad = SAMPLE.replace(
            "0xe7f1725E7734CE288F8367e1Bb143E90bb3F0512",
            "0x5FbDB2315678afecb367f032d93F642f64180aa3",
        );
        assert!(Settings::from_toml(&bad).is_err());
    }

    #[test]
    fn test_shipped_config_covers_local_chain() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/default.toml");
        let settings = Settings::from_path(&path).unwrap();
        assert!(settings.lookup(31337).is_some());
        assert!(settings.agent.private_key_env.is_none());
    }

    #[test]
    fn test_missing_file_is_error() {
        assert!(Settings::from_path(Path::new("/nonexistent/exchange-client.toml")).is_err());
    }
}
