//! JSON-RPC ledger client with multi-endpoint failover

use super::{LedgerClient, LedgerError, LedgerStatus, TxHandle};
use crate::config::LedgerConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::tx::SignedTransaction;

use async_trait::async_trait;
use ethers::providers::{Http, Provider, ProviderError, RpcError};
use ethers::types::Address;
use serde::Serialize;
use serde_json::Value;
use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};

/// Ledger client speaking plain JSON-RPC over HTTP
pub struct JsonRpcLedger {
    config: LedgerConfig,
    /// HTTP providers (multiple for failover)
    providers: Vec<Provider<Http>>,
    /// Current active provider index
    current: AtomicUsize,
}

impl JsonRpcLedger {
    pub fn new(config: LedgerConfig) -> RelayerResult<Self> {
        let mut providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    debug!("Added ledger RPC endpoint: {}", url);
                    providers.push(provider);
                }
                Err(e) => warn!("Failed to create ledger provider for {}: {}", url, e),
            }
        }

        if providers.is_empty() {
            return Err(RelayerError::Config(
                "No valid ledger RPC endpoints".to_string(),
            ));
        }

        Ok(Self {
            config,
            providers,
            current: AtomicUsize::new(0),
        })
    }

    fn provider(&self) -> &Provider<Http> {
        let idx = self.current.load(Ordering::Relaxed);
        &self.providers[idx % self.providers.len()]
    }

    fn failover(&self) {
        let current = self.current.load(Ordering::Relaxed);
        let next = (current + 1) % self.providers.len();
        self.current.store(next, Ordering::Relaxed);
        warn!("Ledger RPC failover to endpoint {}", next);
    }

    /// Issue a request, rotating endpoints on transport failures.
    /// JSON-RPC error responses are returned without failover.
    async fn call<P>(&self, method: &str, params: P) -> Result<Value, ProviderError>
    where
        P: Debug + Serialize + Send + Sync + Clone,
    {
        let mut last_error = None;

        for _ in 0..self.providers.len() {
            match self.provider().request::<P, Value>(method, params.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) if e.as_error_response().is_some() => return Err(e),
                Err(e) => {
                    warn!("Ledger call {} failed: {}", method, e);
                    last_error = Some(e);
                    self.failover();
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            ProviderError::CustomError("no ledger endpoints available".to_string())
        }))
    }
}

#[async_trait]
impl LedgerClient for JsonRpcLedger {
    async fn next_nonce(&self, address: Address) -> Result<u64, LedgerError> {
        let value = self
            .call(&self.config.next_nonce_method, [address])
            .await
            .map_err(|e| transport_error(&self.config.next_nonce_method, e))?;

        parse_quantity(&value)
    }

    async fn submit(&self, tx: &SignedTransaction) -> Result<TxHandle, LedgerError> {
        let value = self
            .call(&self.config.submit_method, [tx])
            .await
            .map_err(|e| match e.as_error_response() {
                Some(resp) => {
                    LedgerError::Rejected(format!("{} (code {})", resp.message, resp.code))
                }
                None => transport_error(&self.config.submit_method, e),
            })?;

        match value {
            Value::String(hash) if !hash.is_empty() => Ok(TxHandle(hash)),
            other => Err(LedgerError::Malformed(format!(
                "expected transaction hash, got {}",
                other
            ))),
        }
    }

    async fn status(&self, handle: &TxHandle) -> Result<LedgerStatus, LedgerError> {
        let value = self
            .call(&self.config.status_method, [handle.as_str()])
            .await
            .map_err(|e| transport_error(&self.config.status_method, e))?;

        serde_json::from_value(value).map_err(|e| LedgerError::Malformed(e.to_string()))
    }
}

fn transport_error(method: &str, e: ProviderError) -> LedgerError {
    LedgerError::Transport(format!("{}: {}", method, e))
}

/// Parse a nonce returned either as a JSON number, a `0x` hex quantity or a decimal string
fn parse_quantity(value: &Value) -> Result<u64, LedgerError> {
    let parsed = match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => match s.strip_prefix("0x") {
            Some(hex) => u64::from_str_radix(hex, 16).ok(),
            None => s.parse().ok(),
        },
        _ => None,
    };

    parsed.ok_or_else(|| LedgerError::Malformed(format!("expected nonce quantity, got {}", value)))
}
