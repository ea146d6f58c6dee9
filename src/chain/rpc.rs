//! [`ChainRpc`] over alloy HTTP providers
//!
//! Each chain gets one provider per configured URL. Requests go to the
//! primary first and fall through to the next URL on transport failures.
//! A JSON-RPC error response (reverts included) is an answer, not an outage,
//! and is returned without trying the fallbacks.

use alloy::network::{ReceiptResponse, TransactionBuilder};
use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::rpc::types::{TransactionReceipt, TransactionRequest};
use alloy::transports::http::{Client, Http};
use alloy::transports::{RpcError as TransportRpcError, TransportErrorKind};
use async_trait::async_trait;
use eyre::{eyre, Result, WrapErr};
use std::collections::HashMap;
use std::future::Future;
use tracing::{debug, info, warn};

use super::{ChainRpc, ReceiptInfo, RpcError};
use crate::chains::ChainRegistry;

type HttpProvider = RootProvider<Http<Client>>;
type TransportError = TransportRpcError<TransportErrorKind>;

/// Create alloy HTTP providers for each RPC URL.
pub fn create_providers(urls: &[String]) -> Result<Vec<HttpProvider>> {
    if urls.is_empty() {
        return Err(eyre!("At least one RPC URL is required"));
    }
    urls.iter()
        .map(|url| {
            let parsed = url
                .parse()
                .wrap_err_with(|| format!("Invalid RPC URL: {}", url))?;
            Ok(ProviderBuilder::new().on_http(parsed))
        })
        .collect()
}

/// Map an alloy transport error to the engine's view of it
fn convert_error(chain_id: u64, error: TransportError) -> RpcError {
    if let Some(payload) = error.as_error_resp() {
        return RpcError::Revert {
            chain_id,
            data: payload.as_revert_data().unwrap_or_default(),
            message: payload.message.to_string(),
        };
    }
    RpcError::Transport {
        chain_id,
        message: error.to_string(),
    }
}

fn receipt_info(receipt: &TransactionReceipt) -> ReceiptInfo {
    ReceiptInfo {
        tx_hash: receipt.transaction_hash,
        block_number: receipt.block_number.unwrap_or_default(),
        success: receipt.status(),
        contract_address: receipt.contract_address,
    }
}

/// Read-only RPC across every enabled chain
pub struct EvmRpc {
    providers: HashMap<u64, Vec<HttpProvider>>,
}

impl EvmRpc {
    pub fn new(registry: &ChainRegistry) -> Result<Self> {
        let mut providers = HashMap::new();
        for chain in registry.enabled() {
            let chain_providers = create_providers(&chain.rpc_urls)
                .wrap_err_with(|| format!("Failed to create providers for {}", chain.name))?;
            info!(
                chain_id = chain.chain_id,
                name = %chain.name,
                rpc_urls = chain_providers.len(),
                "Created RPC providers"
            );
            providers.insert(chain.chain_id, chain_providers);
        }
        Ok(Self { providers })
    }

    fn providers(&self, chain_id: u64) -> Result<&[HttpProvider], RpcError> {
        self.providers
            .get(&chain_id)
            .map(Vec::as_slice)
            .ok_or(RpcError::UnknownChain(chain_id))
    }

    /// Run `request` against each provider in order until one answers
    async fn with_fallback<'a, T, F, Fut>(&'a self, chain_id: u64, request: F) -> Result<T, RpcError>
    where
        F: Fn(&'a HttpProvider) -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let providers = self.providers(chain_id)?;
        let mut last_error = None;
        for (index, provider) in providers.iter().enumerate() {
            match request(provider).await {
                Ok(value) => {
                    if index > 0 {
                        debug!(chain_id, rpc_index = index, "Served by fallback RPC");
                    }
                    return Ok(value);
                }
                Err(e) => {
                    let converted = convert_error(chain_id, e);
                    if matches!(converted, RpcError::Revert { .. }) {
                        return Err(converted);
                    }
                    warn!(chain_id, rpc_index = index, error = %converted, "RPC request failed");
                    last_error = Some(converted);
                }
            }
        }
        Err(last_error.unwrap_or(RpcError::UnknownChain(chain_id)))
    }

    /// Chain id reported by the primary RPC
    pub async fn remote_chain_id(&self, chain_id: u64) -> Result<u64, RpcError> {
        self.with_fallback(chain_id, |p| async move { p.get_chain_id().await })
            .await
    }
}

#[async_trait]
impl ChainRpc for EvmRpc {
    async fn block_number(&self, chain_id: u64) -> Result<u64, RpcError> {
        self.with_fallback(chain_id, |p| async move { p.get_block_number().await })
            .await
    }

    async fn transaction_receipt(
        &self,
        chain_id: u64,
        tx_hash: B256,
    ) -> Result<Option<ReceiptInfo>, RpcError> {
        let receipt = self
            .with_fallback(chain_id, |p| async move {
                p.get_transaction_receipt(tx_hash).await
            })
            .await?;
        Ok(receipt.as_ref().map(receipt_info))
    }

    async fn code_at(&self, chain_id: u64, address: Address) -> Result<Bytes, RpcError> {
        self.with_fallback(chain_id, |p| async move { p.get_code_at(address).await })
            .await
    }

    async fn balance(&self, chain_id: u64, address: Address) -> Result<U256, RpcError> {
        self.with_fallback(chain_id, |p| async move { p.get_balance(address).await })
            .await
    }

    async fn call(&self, chain_id: u64, to: Address, input: Bytes) -> Result<Bytes, RpcError> {
        let tx = TransactionRequest::default()
            .with_to(to)
            .with_input(input);
        self.with_fallback(chain_id, |p| {
            let tx = tx.clone();
            async move { p.call(&tx).await }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chains::ChainDescriptor;

    #[test]
    fn test_create_providers_multiple() {
        let providers = create_providers(&[
            "http://localhost:8545".to_string(),
            "http://localhost:8546".to_string(),
        ])
        .unwrap();
        assert_eq!(providers.len(), 2);
    }

    #[test]
    fn test_create_providers_empty_fails() {
        assert!(create_providers(&[]).is_err());
    }

    #[tokio::test]
    async fn test_unknown_chain() {
        let chain = ChainDescriptor::from_known(1, vec!["http://localhost:8545".to_string()]).unwrap();
        let registry = ChainRegistry::new(vec![chain]).unwrap();
        let rpc = EvmRpc::new(&registry).unwrap();
        assert_eq!(
            rpc.block_number(56).await,
            Err(RpcError::UnknownChain(56))
        );
    }

    #[tokio::test]
    async fn test_unreachable_rpc_is_transport_error() {
        let chain = ChainDescriptor::from_known(
            1,
            vec![
                "http://127.0.0.1:1".to_string(),
                "http://127.0.0.1:2".to_string(),
            ],
        )
        .unwrap();
        let registry = ChainRegistry::new(vec![chain]).unwrap();
        let rpc = EvmRpc::new(&registry).unwrap();
        assert!(matches!(
            rpc.block_number(1).await,
            Err(RpcError::Transport { chain_id: 1, .. })
        ));
    }

    /// Requires a running node, e.g. anvil on 8545
    #[tokio::test]
    #[ignore]
    async fn test_live_block_number() {
        let url = std::env::var("EVM_RPC_URL").unwrap_or_else(|_| "http://localhost:8545".to_string());
        let chain_id: u64 = std::env::var("EVM_CHAIN_ID")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(31337);
        let chain = ChainDescriptor {
            name: "local".to_string(),
            chain_id,
            eid: 1,
            rpc_urls: vec![url],
            endpoint: Address::repeat_byte(1),
            executor: None,
            native_symbol: "ETH".to_string(),
            enabled: true,
        };
        let rpc = EvmRpc::new(&ChainRegistry::new(vec![chain]).unwrap()).unwrap();
        assert!(rpc.block_number(chain_id).await.unwrap() > 0);
        assert_eq!(rpc.remote_chain_id(chain_id).await.unwrap(), chain_id);
    }
}
