//! Configuration management for the transaction relayer
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub relayer: RelayerConfig,
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub signers: Vec<SignerConfig>,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    pub database: Option<DatabaseConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayerConfig {
    pub instance_id: String,
    /// Submission workers; defaults to one per signer
    pub workers: Option<usize>,
    pub queue_capacity: usize,
    /// Confirmation polling interval
    pub update_period_ms: u64,
    /// Age at which an unconfirmed submission is abandoned; set equal to
    /// `update_period_ms` to give up after a single period
    pub staleness_timeout_ms: u64,
    pub retry_limit: u32,
    pub retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub rpc_timeout_ms: u64,
    /// Consecutive failures before a signer is taken out of rotation (0 = never)
    pub max_account_failures: u32,
    pub history_retention_secs: u64,
    pub cleanup_interval_secs: u64,
}

impl Default for RelayerConfig {
    fn default() -> Self {
        Self {
            instance_id: "relayer-0".to_string(),
            workers: None,
            queue_capacity: 1024,
            update_period_ms: 6_000,
            staleness_timeout_ms: 60_000,
            retry_limit: 3,
            retry_delay_ms: 500,
            max_retry_delay_ms: 60_000,
            rpc_timeout_ms: 10_000,
            max_account_failures: 0,
            history_retention_secs: 86_400,
            cleanup_interval_secs: 300,
        }
    }
}

impl RelayerConfig {
    pub fn update_period(&self) -> Duration {
        Duration::from_millis(self.update_period_ms)
    }

    pub fn staleness_timeout(&self) -> Duration {
        Duration::from_millis(self.staleness_timeout_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn history_retention(&self) -> Duration {
        Duration::from_secs(self.history_retention_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    /// Validate timing and capacity settings
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            anyhow::bail!("queue_capacity must be greater than zero");
        }
        if self.workers == Some(0) {
            anyhow::bail!("workers must be greater than zero when set");
        }
        if self.update_period_ms == 0 {
            anyhow::bail!("update_period_ms must be greater than zero");
        }
        if self.staleness_timeout_ms < self.update_period_ms {
            anyhow::bail!(
                "staleness_timeout_ms ({}) must not be shorter than update_period_ms ({})",
                self.staleness_timeout_ms,
                self.update_period_ms
            );
        }
        if self.retry_delay_ms == 0 {
            anyhow::bail!("retry_delay_ms must be greater than zero");
        }
        if self.max_retry_delay_ms < self.retry_delay_ms {
            anyhow::bail!("max_retry_delay_ms must be at least retry_delay_ms");
        }
        if self.rpc_timeout_ms == 0 {
            anyhow::bail!("rpc_timeout_ms must be greater than zero");
        }
        if self.cleanup_interval_secs == 0 {
            anyhow::bail!("cleanup_interval_secs must be greater than zero");
        }
        Ok(())
    }
}

/// Ledger JSON-RPC endpoint and the method names it speaks
#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    /// Endpoints in failover order
    pub rpc_urls: Vec<String>,
    #[serde(default = "default_next_nonce_method")]
    pub next_nonce_method: String,
    #[serde(default = "default_submit_method")]
    pub submit_method: String,
    #[serde(default = "default_status_method")]
    pub status_method: String,
}

fn default_next_nonce_method() -> String {
    "ledger_getNextNonce".to_string()
}

fn default_submit_method() -> String {
    "ledger_submitTransaction".to_string()
}

fn default_status_method() -> String {
    "ledger_getTransactionStatus".to_string()
}

/// A signing identity, given inline or through an environment variable
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SignerConfig {
    pub private_key: Option<String>,
    pub private_key_env: Option<String>,
}

impl SignerConfig {
    /// Resolve the private key material
    pub fn resolve(&self) -> Result<String> {
        if let Some(ref key) = self.private_key {
            if !key.trim().is_empty() {
                return Ok(key.trim().to_string());
            }
        }
        if let Some(ref var) = self.private_key_env {
            let key = env::var(var)
                .with_context(|| format!("Signer key variable {} is not set", var))?;
            return Ok(key.trim().to_string());
        }
        anyhow::bail!("Signer has neither private_key nor private_key_env")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9090,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

impl Settings {
    /// Load settings from the file named by `RELAYER_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = env::var("RELAYER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from an explicit path
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::from_toml_str(&config_str)
    }

    /// Parse settings from TOML text, substituting `${VAR}` references first
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config_str = substitute_env_vars(input);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.signers.is_empty() {
            anyhow::bail!("At least one signer must be configured");
        }

        if self.ledger.rpc_urls.is_empty() {
            anyhow::bail!("Ledger has no RPC URLs configured");
        }

        self.relayer.validate()
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    lazy_static::lazy_static! {
        static ref ENV_VAR: regex::Regex =
            regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("static pattern");
    }

    ENV_VAR
        .replace_all(input, |caps: &regex::Captures| {
            env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
        [ledger]
        rpc_urls = ["http://127.0.0.1:9933"]

        [[signers]]
        private_key = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80"
    "#;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("TX_RELAYER_TEST_VAR", "test_value");
        let input = "url = \"https://api.example.com/${TX_RELAYER_TEST_VAR}/endpoint\"";
        let result = substitute_env_vars(input);
        assert_eq!(result, "url = \"https://api.example.com/test_value/endpoint\"");
    }

    #[test]
    fn test_defaults_applied() {
        let settings = Settings::from_toml_str(MINIMAL).unwrap();
        assert_eq!(settings.relayer.retry_limit, 3);
        assert_eq!(settings.relayer.retry_delay_ms, 500);
        assert_eq!(settings.ledger.submit_method, "ledger_submitTransaction");
        assert!(settings.database.is_none());
        assert!(!settings.metrics.enabled);
    }

    #[test]
    fn test_rejects_missing_signers() {
        let input = r#"
            [ledger]
            rpc_urls = ["http://127.0.0.1:9933"]
        "#;
        let err = Settings::from_toml_str(input).unwrap_err();
        assert!(err.to_string().contains("signer"));
    }

    #[test]
    fn test_rejects_staleness_below_update_period() {
        let input = format!(
            "{}\n[relayer]\nupdate_period_ms = 1000\nstaleness_timeout_ms = 500\n",
            MINIMAL
        );
        assert!(Settings::from_toml_str(&input).is_err());
    }

    #[test]
    fn test_staleness_may_equal_update_period() {
        let input = format!(
            "{}\n[relayer]\nupdate_period_ms = 1000\nstaleness_timeout_ms = 1000\n",
            MINIMAL
        );
        let settings = Settings::from_toml_str(&input).unwrap();
        assert_eq!(
            settings.relayer.staleness_timeout(),
            settings.relayer.update_period()
        );
    }

    #[test]
    fn test_signer_key_from_env() {
        env::set_var("TX_RELAYER_TEST_SIGNER", "  0xabc  ");
        let signer = SignerConfig {
            private_key: None,
            private_key_env: Some("TX_RELAYER_TEST_SIGNER".to_string()),
        };
        assert_eq!(signer.resolve().unwrap(), "0xabc");
        assert!(SignerConfig::default().resolve().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "{}\n[relayer]\nqueue_capacity = 8\nworkers = 2\n",
            MINIMAL
        )
        .unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.relayer.queue_capacity, 8);
        assert_eq!(settings.relayer.workers, Some(2));
        assert_eq!(settings.signers.len(), 1);
    }
}
