//! [`ChainSession`] backed by a local private key
//!
//! A key can sign for any chain, so "switching" only changes which RPC the
//! next transaction goes to. The switch is refused when the node behind the
//! URL reports a different chain id.

use alloy::network::{EthereumWallet, TransactionBuilder};
use alloy::primitives::{Address, B256};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::TransactionRequest;
use alloy::signers::local::PrivateKeySigner;
use alloy::transports::TransportError;
use async_trait::async_trait;
use eyre::{eyre, Result};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{ChainSession, SessionError, TxRequest};
use crate::chains::{ChainDescriptor, ChainRegistry};

pub struct LocalKeySession {
    signer: PrivateKeySigner,
    address: Address,
    /// Primary RPC per chain the session can sign for
    rpc_urls: RwLock<HashMap<u64, String>>,
    active: RwLock<u64>,
}

impl LocalKeySession {
    /// `initial_chain` is the chain active before any switch
    pub fn new(private_key: &str, registry: &ChainRegistry, initial_chain: u64) -> Result<Self> {
        let signer: PrivateKeySigner = private_key
            .trim()
            .parse()
            .map_err(|e| eyre!("Invalid private key: {}", e))?;
        let address = signer.address();

        let rpc_urls: HashMap<u64, String> = registry
            .enabled()
            .filter_map(|c| c.rpc_urls.first().map(|url| (c.chain_id, url.clone())))
            .collect();

        info!(address = %address, chains = rpc_urls.len(), "Local key session initialized");

        Ok(Self {
            signer,
            address,
            rpc_urls: RwLock::new(rpc_urls),
            active: RwLock::new(initial_chain),
        })
    }

    async fn rpc_url(&self, chain_id: u64) -> Result<String, SessionError> {
        self.rpc_urls
            .read()
            .await
            .get(&chain_id)
            .cloned()
            .ok_or(SessionError::UnknownChain(chain_id))
    }
}

/// Flatten an alloy error, keeping revert data visible to the classifier
pub(crate) fn describe_error(error: &TransportError) -> String {
    match error.as_error_resp() {
        Some(payload) => match payload.as_revert_data() {
            Some(data) => format!("{} (revert data {})", payload.message, data),
            None => payload.message.to_string(),
        },
        None => error.to_string(),
    }
}

#[async_trait]
impl ChainSession for LocalKeySession {
    async fn current_chain(&self) -> Result<u64, SessionError> {
        Ok(*self.active.read().await)
    }

    async fn address(&self) -> Result<Address, SessionError> {
        Ok(self.address)
    }

    async fn request_switch(&self, chain_id: u64) -> Result<(), SessionError> {
        let url = self.rpc_url(chain_id).await?;
        let parsed = url
            .parse()
            .map_err(|e| SessionError::Rpc(format!("invalid RPC URL {}: {}", url, e)))?;
        let provider = ProviderBuilder::new().on_http(parsed);
        let remote = provider
            .get_chain_id()
            .await
            .map_err(|e| SessionError::Rpc(describe_error(&e)))?;
        if remote != chain_id {
            return Err(SessionError::WrongChain {
                expected: chain_id,
                actual: remote,
            });
        }
        *self.active.write().await = chain_id;
        debug!(chain_id, "Local session switched chain");
        Ok(())
    }

    async fn add_chain(&self, chain: &ChainDescriptor) -> Result<(), SessionError> {
        let url = chain
            .rpc_urls
            .first()
            .ok_or_else(|| SessionError::Rpc(format!("no RPC URL for {}", chain.name)))?;
        self.rpc_urls
            .write()
            .await
            .insert(chain.chain_id, url.clone());
        Ok(())
    }

    async fn send_transaction(&self, tx: TxRequest) -> Result<B256, SessionError> {
        let active = *self.active.read().await;
        if active != tx.chain_id {
            return Err(SessionError::WrongChain {
                expected: tx.chain_id,
                actual: active,
            });
        }

        let url = self.rpc_url(tx.chain_id).await?;
        let parsed = url
            .parse()
            .map_err(|e| SessionError::Rpc(format!("invalid RPC URL {}: {}", url, e)))?;
        let wallet = EthereumWallet::from(self.signer.clone());
        let provider = ProviderBuilder::new()
            .with_recommended_fillers()
            .wallet(wallet)
            .on_http(parsed);

        let mut request = TransactionRequest::default()
            .with_from(self.address)
            .with_chain_id(tx.chain_id)
            .with_value(tx.value);
        request = match tx.to {
            Some(to) => request.with_to(to).with_input(tx.input),
            None => request.with_deploy_code(tx.input),
        };

        let pending = provider
            .send_transaction(request)
            .await
            .map_err(|e| SessionError::Rpc(describe_error(&e)))?;
        Ok(*pending.tx_hash())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // anvil's first dev account
    const DEV_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    fn registry() -> ChainRegistry {
        ChainRegistry::new(vec![
            ChainDescriptor::from_known(1, vec!["http://127.0.0.1:1".to_string()]).unwrap(),
        ])
        .unwrap()
    }

    #[tokio::test]
    async fn test_address_from_key() {
        let session = LocalKeySession::new(DEV_KEY, &registry(), 1).unwrap();
        assert_eq!(
            session.address().await.unwrap().to_string(),
            "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266"
        );
        assert_eq!(session.current_chain().await.unwrap(), 1);
    }

    #[test]
    fn test_invalid_key_rejected() {
        assert!(LocalKeySession::new("not-a-key", &registry(), 1).is_err());
    }

    #[tokio::test]
    async fn test_switch_to_unknown_chain() {
        let session = LocalKeySession::new(DEV_KEY, &registry(), 1).unwrap();
        assert_eq!(
            session.request_switch(56).await,
            Err(SessionError::UnknownChain(56))
        );
    }

    #[tokio::test]
    async fn test_send_on_inactive_chain_is_refused() {
        let session = LocalKeySession::new(DEV_KEY, &registry(), 1).unwrap();
        let tx = TxRequest::deploy(56, vec![0x60].into());
        assert!(matches!(
            session.send_transaction(tx).await,
            Err(SessionError::WrongChain {
                expected: 56,
                actual: 1
            })
        ));
    }
}
