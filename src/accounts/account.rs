//! Signing identities

use crate::config::SignerConfig;
use crate::error::{RelayerError, RelayerResult};

use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Signature, H256};
use std::collections::HashSet;
use std::fmt;

/// A signing identity owned by the account pool
#[derive(Clone)]
pub struct Account {
    address: Address,
    wallet: LocalWallet,
}

impl Account {
    /// Build an account from a hex-encoded secp256k1 private key
    pub fn from_private_key(key: &str) -> RelayerResult<Self> {
        let wallet = key
            .trim()
            .parse::<LocalWallet>()
            .map_err(|e| RelayerError::Wallet(format!("Invalid private key: {}", e)))?;

        Ok(Self {
            address: wallet.address(),
            wallet,
        })
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Sign a 32-byte digest with this account's key
    pub fn sign_digest(&self, digest: [u8; 32]) -> RelayerResult<Signature> {
        self.wallet
            .sign_hash(H256::from(digest))
            .map_err(|e| RelayerError::Wallet(e.to_string()))
    }
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// Load the fixed signer set from configuration
pub fn load_accounts(signers: &[SignerConfig]) -> RelayerResult<Vec<Account>> {
    let mut seen = HashSet::new();
    let mut accounts = Vec::with_capacity(signers.len());

    for (idx, signer) in signers.iter().enumerate() {
        let key = signer
            .resolve()
            .map_err(|e| RelayerError::Config(format!("signer {}: {}", idx, e)))?;
        let account = Account::from_private_key(&key)?;

        if !seen.insert(account.address()) {
            return Err(RelayerError::Config(format!(
                "signer {} duplicates address {:?}",
                idx,
                account.address()
            )));
        }
        accounts.push(account);
    }

    Ok(accounts)
}
