//! [`ChainSession`] backed by an external wallet speaking JSON-RPC
//!
//! The wallet owns the key and the active network. Switching uses EIP-3326
//! (`wallet_switchEthereumChain`), registration EIP-3085
//! (`wallet_addEthereumChain`). Error codes follow EIP-1193: 4001 is a user
//! rejection, 4902 an unrecognised chain.

use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use eyre::{Result, WrapErr};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

use super::{ChainSession, SessionError, TxRequest};
use crate::chains::ChainDescriptor;

const USER_REJECTED: i64 = 4001;
const UNRECOGNIZED_CHAIN: i64 = 4902;

/// JSON-RPC response wrapper
#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

pub struct RemoteWalletSession {
    url: String,
    client: Client,
    next_id: AtomicU64,
}

impl RemoteWalletSession {
    pub fn new(url: &str) -> Result<Self> {
        url::Url::parse(url).wrap_err_with(|| format!("Invalid wallet URL: {}", url))?;
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self {
            url: url.to_string(),
            client,
            next_id: AtomicU64::new(1),
        })
    }

    async fn request<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<Option<T>, SessionError> {
        let body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
        });
        debug!(method, "Wallet request");

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| SessionError::Rpc(format!("error sending request: {}", e)))?
            .json::<RpcResponse<T>>()
            .await
            .map_err(|e| SessionError::Rpc(format!("invalid wallet response: {}", e)))?;

        if let Some(error) = response.error {
            return Err(map_wallet_error(method, &params, error));
        }
        Ok(response.result)
    }
}

fn map_wallet_error(method: &str, params: &Value, error: RpcErrorBody) -> SessionError {
    match error.code {
        USER_REJECTED => SessionError::UserRejected(error.message),
        UNRECOGNIZED_CHAIN => {
            let chain_id = params
                .get(0)
                .and_then(|p| p.get("chainId"))
                .and_then(Value::as_str)
                .and_then(|hex| u64::from_str_radix(hex.trim_start_matches("0x"), 16).ok())
                .unwrap_or_default();
            SessionError::UnknownChain(chain_id)
        }
        // Method not found / unsupported method
        -32601 | 4200 => SessionError::Unsupported(method.to_string()),
        _ => {
            let data = error
                .data
                .as_ref()
                .and_then(Value::as_str)
                .map(|d| format!(" (revert data {})", d))
                .unwrap_or_default();
            SessionError::Rpc(format!("{}{}", error.message, data))
        }
    }
}

fn parse_quantity(raw: &str) -> Result<u64, SessionError> {
    u64::from_str_radix(raw.trim_start_matches("0x"), 16)
        .map_err(|e| SessionError::Rpc(format!("invalid quantity {}: {}", raw, e)))
}

/// EIP-3085 parameters for a chain
fn add_chain_params(chain: &ChainDescriptor) -> Value {
    json!([{
        "chainId": format!("0x{:x}", chain.chain_id),
        "chainName": chain.name,
        "nativeCurrency": {
            "name": chain.native_symbol,
            "symbol": chain.native_symbol,
            "decimals": 18,
        },
        "rpcUrls": chain.rpc_urls,
    }])
}

fn send_params(from: Address, tx: &TxRequest) -> Value {
    let mut object = json!({
        "from": from,
        "data": tx.input,
        "value": format!("0x{:x}", tx.value),
        "chainId": format!("0x{:x}", tx.chain_id),
    });
    if let Some(to) = tx.to {
        object["to"] = json!(to);
    }
    json!([object])
}

#[async_trait]
impl ChainSession for RemoteWalletSession {
    async fn current_chain(&self) -> Result<u64, SessionError> {
        let raw: String = self
            .request("eth_chainId", json!([]))
            .await?
            .ok_or_else(|| SessionError::Rpc("wallet returned no chain id".to_string()))?;
        parse_quantity(&raw)
    }

    async fn address(&self) -> Result<Address, SessionError> {
        let accounts: Vec<Address> = self
            .request("eth_accounts", json!([]))
            .await?
            .unwrap_or_default();
        accounts
            .first()
            .copied()
            .ok_or_else(|| SessionError::Rpc("wallet exposes no accounts".to_string()))
    }

    async fn request_switch(&self, chain_id: u64) -> Result<(), SessionError> {
        self.request::<Value>(
            "wallet_switchEthereumChain",
            json!([{ "chainId": format!("0x{:x}", chain_id) }]),
        )
        .await?;
        Ok(())
    }

    async fn add_chain(&self, chain: &ChainDescriptor) -> Result<(), SessionError> {
        self.request::<Value>("wallet_addEthereumChain", add_chain_params(chain))
            .await?;
        Ok(())
    }

    async fn send_transaction(&self, tx: TxRequest) -> Result<B256, SessionError> {
        let from = self.address().await?;
        self.request::<B256>("eth_sendTransaction", send_params(from, &tx))
            .await?
            .ok_or_else(|| SessionError::Rpc("wallet returned no transaction hash".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{Bytes, U256};

    fn error(code: i64, message: &str) -> RpcErrorBody {
        RpcErrorBody {
            code,
            message: message.to_string(),
            data: None,
        }
    }

    #[test]
    fn test_wallet_error_codes() {
        let params = json!([{ "chainId": "0x38" }]);
        assert_eq!(
            map_wallet_error("wallet_switchEthereumChain", &params, error(4902, "Unrecognized chain")),
            SessionError::UnknownChain(56)
        );
        assert!(matches!(
            map_wallet_error("eth_sendTransaction", &json!([]), error(4001, "User rejected")),
            SessionError::UserRejected(_)
        ));
        assert_eq!(
            map_wallet_error("wallet_addEthereumChain", &json!([]), error(-32601, "not found")),
            SessionError::Unsupported("wallet_addEthereumChain".to_string())
        );
    }

    #[test]
    fn test_revert_data_kept_for_classifier() {
        let mut body = error(3, "execution reverted");
        body.data = Some(json!("0xf6ff4fb7"));
        let SessionError::Rpc(message) = map_wallet_error("eth_sendTransaction", &json!([]), body) else {
            panic!("expected rpc error");
        };
        assert!(message.contains("0xf6ff4fb7"));
    }

    #[test]
    fn test_add_chain_params_shape() {
        let chain = ChainDescriptor::from_known(56, vec!["https://bsc.publicnode.com".to_string()]).unwrap();
        let params = add_chain_params(&chain);
        assert_eq!(params[0]["chainId"], "0x38");
        assert_eq!(params[0]["nativeCurrency"]["symbol"], "BNB");
        assert_eq!(params[0]["rpcUrls"][0], "https://bsc.publicnode.com");
    }

    #[test]
    fn test_send_params_for_deploy_omit_to() {
        let tx = TxRequest::deploy(1, Bytes::from(vec![0x60, 0x80]));
        let params = send_params(Address::repeat_byte(1), &tx);
        assert!(params[0].get("to").is_none());
        assert_eq!(params[0]["data"], "0x6080");

        let call = TxRequest {
            value: U256::from(16u64),
            ..TxRequest::call(1, Address::repeat_byte(2), Bytes::new())
        };
        let params = send_params(Address::repeat_byte(1), &call);
        assert!(params[0].get("to").is_some());
        assert_eq!(params[0]["value"], "0x10");
    }

    #[test]
    fn test_invalid_url_rejected() {
        assert!(RemoteWalletSession::new("not a url").is_err());
    }
}
