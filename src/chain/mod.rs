//! Chain access: read-only RPC, the signing wallet session, and the
//! send-and-confirm path every chain-mutating step goes through.
//!
//! - `contracts` - sol! bindings for OApp, EndpointV2, ULN and ERC20 metadata
//! - `rpc` - [`ChainRpc`] over alloy HTTP providers with fallback URLs
//! - `local` - [`ChainSession`] backed by a local private key
//! - `remote` - [`ChainSession`] backed by an external wallet speaking JSON-RPC

pub mod contracts;
pub mod local;
pub mod remote;
pub mod rpc;

use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::sol_types::SolCall;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::chains::{ChainDescriptor, ChainRegistry};
use crate::network_switch::NetworkSwitchCoordinator;
use crate::poll::{poll_until, PollError, PollPolicy};
use crate::retry::{classify, classify_revert_data, ClassifiedError, ErrorKind};

/// Receipt fields the engine relies on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptInfo {
    pub tx_hash: B256,
    pub block_number: u64,
    pub success: bool,
    /// Set for contract-creation transactions
    pub contract_address: Option<Address>,
}

/// A transaction to be signed by the active wallet
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TxRequest {
    pub chain_id: u64,
    /// `None` deploys `input` as init code
    pub to: Option<Address>,
    pub input: Bytes,
    pub value: U256,
}

impl TxRequest {
    pub fn call(chain_id: u64, to: Address, input: Bytes) -> Self {
        Self {
            chain_id,
            to: Some(to),
            input,
            value: U256::ZERO,
        }
    }

    pub fn deploy(chain_id: u64, init_code: Bytes) -> Self {
        Self {
            chain_id,
            to: None,
            input: init_code,
            value: U256::ZERO,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RpcError {
    #[error("chain {0} is not configured")]
    UnknownChain(u64),
    #[error("rpc request on chain {chain_id} failed: {message}")]
    Transport { chain_id: u64, message: String },
    #[error("call reverted on chain {chain_id}: {message}")]
    Revert {
        chain_id: u64,
        data: Bytes,
        message: String,
    },
}

impl RpcError {
    pub fn classify(&self) -> ClassifiedError {
        match self {
            RpcError::UnknownChain(chain_id) => ClassifiedError::new(
                ErrorKind::NetworkError,
                format!("no RPC configured for chain {}", chain_id),
            ),
            RpcError::Transport { message, .. } => {
                let classified = classify(message);
                match classified.kind {
                    ErrorKind::Unknown => ClassifiedError::new(ErrorKind::NetworkError, message),
                    _ => classified,
                }
            }
            RpcError::Revert { data, message, .. } => classify_revert_data(data)
                .unwrap_or_else(|| match classify(message) {
                    c if c.kind == ErrorKind::Unknown => {
                        ClassifiedError::new(ErrorKind::ContractRevert, message)
                    }
                    c => c,
                }),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SessionError {
    /// The wallet does not know the chain and it must be registered first
    #[error("wallet does not recognise chain {0}")]
    UnknownChain(u64),
    #[error("user rejected the request: {0}")]
    UserRejected(String),
    #[error("wallet is on chain {actual}, expected {expected}")]
    WrongChain { expected: u64, actual: u64 },
    #[error("wallet does not support {0}")]
    Unsupported(String),
    #[error("wallet request failed: {0}")]
    Rpc(String),
}

impl SessionError {
    pub fn classify(&self) -> ClassifiedError {
        match self {
            SessionError::UserRejected(message) => {
                ClassifiedError::new(ErrorKind::UserRejected, message)
            }
            SessionError::UnknownChain(_) | SessionError::WrongChain { .. } => {
                ClassifiedError::new(ErrorKind::NetworkError, self.to_string())
            }
            SessionError::Unsupported(_) => ClassifiedError::new(ErrorKind::Unknown, self.to_string()),
            SessionError::Rpc(message) => classify(message),
        }
    }
}

/// Read-only chain access, keyed by native chain id
#[async_trait]
pub trait ChainRpc: Send + Sync {
    async fn block_number(&self, chain_id: u64) -> Result<u64, RpcError>;

    /// `Ok(None)` when the node does not know the transaction
    async fn transaction_receipt(
        &self,
        chain_id: u64,
        tx_hash: B256,
    ) -> Result<Option<ReceiptInfo>, RpcError>;

    async fn code_at(&self, chain_id: u64, address: Address) -> Result<Bytes, RpcError>;

    async fn balance(&self, chain_id: u64, address: Address) -> Result<U256, RpcError>;

    async fn call(&self, chain_id: u64, to: Address, input: Bytes) -> Result<Bytes, RpcError>;
}

/// The signing wallet: one active chain at a time
#[async_trait]
pub trait ChainSession: Send + Sync {
    async fn current_chain(&self) -> Result<u64, SessionError>;

    async fn address(&self) -> Result<Address, SessionError>;

    /// Ask the wallet to make `chain_id` active (EIP-3326)
    async fn request_switch(&self, chain_id: u64) -> Result<(), SessionError>;

    /// Register a chain the wallet does not know yet (EIP-3085)
    async fn add_chain(&self, chain: &ChainDescriptor) -> Result<(), SessionError>;

    /// Sign and broadcast; returns the transaction hash
    async fn send_transaction(&self, tx: TxRequest) -> Result<B256, SessionError>;
}

/// Confirmations of a transaction mined at `tx_block` when the head is `head`
pub fn confirmations(head: u64, tx_block: u64) -> u64 {
    if head < tx_block {
        0
    } else {
        head - tx_block + 1
    }
}

/// Limits applied to every submitted transaction
#[derive(Debug, Clone)]
pub struct TxSettings {
    /// Confirmations required before a step counts as done
    pub confirmations: u64,
    pub receipt_poll: PollPolicy,
}

impl Default for TxSettings {
    fn default() -> Self {
        Self {
            confirmations: 1,
            receipt_poll: PollPolicy::transaction_confirmation(Duration::from_secs(60)),
        }
    }
}

/// Receipt waits a timed-out submission gets before it counts as dropped
const MAX_RECHECKS: u32 = 2;

/// A submitted transaction whose receipt did not show up in time
#[derive(Debug, Clone, Copy)]
struct Unconfirmed {
    tx_hash: B256,
    rechecks: u32,
}

/// Everything needed to read from and write to the configured chains
pub struct ChainAccess {
    rpc: Arc<dyn ChainRpc>,
    session: Arc<dyn ChainSession>,
    registry: Arc<ChainRegistry>,
    switcher: NetworkSwitchCoordinator,
    settings: TxSettings,
    unconfirmed: Mutex<HashMap<TxRequest, Unconfirmed>>,
}

impl ChainAccess {
    pub fn new(
        rpc: Arc<dyn ChainRpc>,
        session: Arc<dyn ChainSession>,
        registry: Arc<ChainRegistry>,
        switcher: NetworkSwitchCoordinator,
        settings: TxSettings,
    ) -> Self {
        Self {
            rpc,
            session,
            registry,
            switcher,
            settings,
            unconfirmed: Mutex::new(HashMap::new()),
        }
    }

    pub fn rpc(&self) -> &Arc<dyn ChainRpc> {
        &self.rpc
    }

    pub fn session(&self) -> &Arc<dyn ChainSession> {
        &self.session
    }

    pub fn registry(&self) -> &ChainRegistry {
        &self.registry
    }

    pub fn switcher(&self) -> &NetworkSwitchCoordinator {
        &self.switcher
    }

    pub fn settings(&self) -> &TxSettings {
        &self.settings
    }

    /// Typed `eth_call`
    pub async fn read<C: SolCall>(
        &self,
        chain_id: u64,
        to: Address,
        call: C,
    ) -> Result<C::Return, ClassifiedError> {
        let output = self
            .rpc
            .call(chain_id, to, call.abi_encode().into())
            .await
            .map_err(|e| e.classify())?;
        C::abi_decode_returns(&output, true).map_err(|e| {
            ClassifiedError::new(
                ErrorKind::ContractRevert,
                format!("failed to decode {} output from {}", C::SIGNATURE, to),
            )
            .with_detail(e.to_string())
        })
    }

    fn unconfirmed(&self) -> std::sync::MutexGuard<'_, HashMap<TxRequest, Unconfirmed>> {
        self.unconfirmed.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Switch to the chain if needed, submit, and wait for a confirmed,
    /// successful receipt.
    ///
    /// When an identical request timed out waiting for its receipt, the
    /// earlier hash is polled again instead of signing a second transaction.
    pub async fn transact(&self, tx: TxRequest) -> Result<ReceiptInfo, ClassifiedError> {
        let chain_id = tx.chain_id;
        let earlier = self.unconfirmed().get(&tx).copied();
        let (tx_hash, rechecks) = match earlier {
            Some(earlier) => {
                info!(
                    chain_id,
                    tx_hash = %earlier.tx_hash,
                    recheck = earlier.rechecks + 1,
                    "Re-checking earlier submission"
                );
                (earlier.tx_hash, earlier.rechecks + 1)
            }
            None => {
                self.switcher
                    .ensure_chain(chain_id)
                    .await
                    .map_err(|e| e.classify())?;
                let tx_hash = self
                    .session
                    .send_transaction(tx.clone())
                    .await
                    .map_err(|e| e.classify())?;
                info!(chain_id, tx_hash = %tx_hash, "Transaction submitted");
                (tx_hash, 0)
            }
        };

        let receipt = match self.wait_for_receipt(chain_id, tx_hash).await {
            Ok(receipt) => {
                self.unconfirmed().remove(&tx);
                receipt
            }
            Err(e) if e.kind == ErrorKind::NetworkError && rechecks < MAX_RECHECKS => {
                self.unconfirmed()
                    .insert(tx, Unconfirmed { tx_hash, rechecks });
                return Err(e.with_detail(format!("submitted as {}", tx_hash)));
            }
            Err(e) => {
                if self.unconfirmed().remove(&tx).is_some() {
                    warn!(chain_id, tx_hash = %tx_hash, "No receipt after re-checks, next attempt resubmits");
                }
                return Err(e);
            }
        };
        if !receipt.success {
            return Err(ClassifiedError::new(
                ErrorKind::ContractRevert,
                format!("transaction {} reverted on chain {}", tx_hash, chain_id),
            ));
        }

        self.wait_for_confirmations(chain_id, &receipt).await?;
        Ok(receipt)
    }

    /// Poll for the receipt within the configured bound
    pub async fn wait_for_receipt(
        &self,
        chain_id: u64,
        tx_hash: B256,
    ) -> Result<ReceiptInfo, ClassifiedError> {
        let rpc = &self.rpc;
        let result = poll_until(&self.settings.receipt_poll, |attempt| async move {
            match rpc.transaction_receipt(chain_id, tx_hash).await {
                Ok(receipt) => Ok(receipt),
                Err(e) => {
                    let classified = e.classify();
                    if classified.kind == ErrorKind::NetworkError {
                        debug!(chain_id, attempt, error = %e, "Receipt poll failed, will retry");
                        Ok(None)
                    } else {
                        Err(classified)
                    }
                }
            }
        })
        .await;

        match result {
            Ok(receipt) => Ok(receipt),
            Err(PollError::Failed(e)) => Err(e),
            Err(PollError::Exhausted { .. }) | Err(PollError::TimedOut(_)) => {
                Err(ClassifiedError::new(
                    ErrorKind::NetworkError,
                    format!(
                        "transaction {} not confirmed on chain {} in time",
                        tx_hash, chain_id
                    ),
                ))
            }
        }
    }

    async fn wait_for_confirmations(
        &self,
        chain_id: u64,
        receipt: &ReceiptInfo,
    ) -> Result<(), ClassifiedError> {
        let required = self.settings.confirmations;
        if required <= 1 {
            return Ok(());
        }
        let rpc = &self.rpc;
        let tx_block = receipt.block_number;
        let result: Result<(), PollError<ClassifiedError>> = poll_until(&self.settings.receipt_poll, |_| async move {
            match rpc.block_number(chain_id).await {
                Ok(head) if confirmations(head, tx_block) >= required => Ok(Some(())),
                Ok(_) => Ok(None),
                Err(_) => Ok(None),
            }
        })
        .await;

        result.map_err(|_| {
            ClassifiedError::new(
                ErrorKind::NetworkError,
                format!(
                    "transaction {} did not reach {} confirmations on chain {}",
                    receipt.tx_hash, required, chain_id
                ),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::selector;
    use crate::testing::MockChains;

    #[test]
    fn test_confirmations_convention() {
        assert_eq!(confirmations(100, 100), 1);
        assert_eq!(confirmations(109, 100), 10);
        assert_eq!(confirmations(99, 100), 0);
    }

    #[test]
    fn test_transport_error_defaults_to_network() {
        let e = RpcError::Transport {
            chain_id: 1,
            message: "error sending request".to_string(),
        };
        assert_eq!(e.classify().kind, ErrorKind::NetworkError);
    }

    #[test]
    fn test_revert_error_uses_selector() {
        let e = RpcError::Revert {
            chain_id: 1,
            data: Bytes::from(selector("LZ_ULN_Unsorted()").to_vec()),
            message: "execution reverted".to_string(),
        };
        assert_eq!(e.classify().kind, ErrorKind::DuplicateVerifier);
    }

    #[test]
    fn test_session_rejection_classification() {
        let e = SessionError::UserRejected("User denied transaction signature".to_string());
        assert_eq!(e.classify().kind, ErrorKind::UserRejected);
        let e = SessionError::WrongChain {
            expected: 56,
            actual: 1,
        };
        assert_eq!(e.classify().kind, ErrorKind::NetworkError);
    }

    #[tokio::test]
    async fn test_lagging_receipt_is_rechecked_not_resent() {
        let mock = Arc::new(MockChains::new(&[1]));
        let access = mock.access();
        mock.lag_receipts(1, 3);
        let tx = TxRequest::deploy(1, Bytes::from(vec![0x60, 0x80]));

        let err = access.transact(tx.clone()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NetworkError);

        let receipt = access.transact(tx).await.unwrap();
        assert!(receipt.success);
        assert!(receipt.contract_address.is_some());
        assert_eq!(mock.sent_transactions().len(), 1);
    }

    #[tokio::test]
    async fn test_dropped_transaction_resubmitted_after_rechecks() {
        let mock = Arc::new(MockChains::new(&[1]));
        let access = mock.access();
        mock.drop_next_transaction();
        let tx = TxRequest::deploy(1, Bytes::from(vec![0x60, 0x80]));

        for _ in 0..=MAX_RECHECKS {
            let err = access.transact(tx.clone()).await.unwrap_err();
            assert_eq!(err.kind, ErrorKind::NetworkError);
            assert_eq!(mock.sent_transactions().len(), 1);
        }

        let receipt = access.transact(tx).await.unwrap();
        assert!(receipt.contract_address.is_some());
        assert_eq!(mock.sent_transactions().len(), 2);
    }
}
