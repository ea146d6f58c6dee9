//! Peer linking between deployed contracts
//!
//! Every contract must point at every other contract of the deployment via
//! `setPeer(remoteEid, bytes32(remoteAddress))`. Each direction is read
//! first and only written when it differs, so re-running a partially linked
//! mesh only sends the missing transactions.

use alloy::primitives::{Address, B256};
use alloy::sol_types::SolCall;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::chain::contracts::IOApp;
use crate::chain::{ChainAccess, TxRequest};
use crate::hash::{address_to_bytes32, bytes32_to_address};
use crate::retry::{ClassifiedError, ErrorKind};

/// A deployed contract on a specific chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractRef {
    pub chain_id: u64,
    pub address: Address,
}

impl ContractRef {
    pub fn new(chain_id: u64, address: Address) -> Self {
        Self { chain_id, address }
    }
}

/// Two contracts that must point at each other
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractPair {
    pub a: ContractRef,
    pub b: ContractRef,
}

impl ContractPair {
    pub fn new(a: ContractRef, b: ContractRef) -> Self {
        Self { a, b }
    }

    pub fn reversed(&self) -> Self {
        Self {
            a: self.b,
            b: self.a,
        }
    }
}

/// One direction of a peer link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerLink {
    pub local_contract: Address,
    pub local_chain: u64,
    pub remote_eid: u32,
    pub remote_contract: Address,
}

impl PeerLink {
    pub fn expected_peer(&self) -> B256 {
        address_to_bytes32(&self.remote_contract)
    }
}

/// State of one direction as read from chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectionStatus {
    pub is_set: bool,
    pub peer: Option<Address>,
    pub matches: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerLinkReport {
    pub a_to_b: DirectionStatus,
    pub b_to_a: DirectionStatus,
}

impl PeerLinkReport {
    pub fn is_linked(&self) -> bool {
        self.a_to_b.matches && self.b_to_a.matches
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    AlreadyLinked,
    Linked { tx_hash: B256 },
}

impl LinkOutcome {
    pub fn tx_hash(&self) -> Option<B256> {
        match self {
            LinkOutcome::AlreadyLinked => None,
            LinkOutcome::Linked { tx_hash } => Some(*tx_hash),
        }
    }
}

pub struct PeerLinker {
    chains: Arc<ChainAccess>,
}

impl PeerLinker {
    pub fn new(chains: Arc<ChainAccess>) -> Self {
        Self { chains }
    }

    /// Describe the `local -> remote` direction
    pub fn link_for(&self, local: &ContractRef, remote: &ContractRef) -> Result<PeerLink, ClassifiedError> {
        let remote_chain = self.chains.registry().get(remote.chain_id).ok_or_else(|| {
            ClassifiedError::new(
                ErrorKind::InvalidPeer,
                format!("no endpoint id known for chain {}", remote.chain_id),
            )
        })?;
        Ok(PeerLink {
            local_contract: local.address,
            local_chain: local.chain_id,
            remote_eid: remote_chain.eid,
            remote_contract: remote.address,
        })
    }

    pub async fn read_peer(&self, link: &PeerLink) -> Result<B256, ClassifiedError> {
        let result = self
            .chains
            .read(
                link.local_chain,
                link.local_contract,
                IOApp::peersCall {
                    eid: link.remote_eid,
                },
            )
            .await?;
        Ok(result.peer)
    }

    /// Set `local`'s peer for `remote`'s endpoint id, skipping when already set
    pub async fn link_direction(
        &self,
        local: &ContractRef,
        remote: &ContractRef,
    ) -> Result<LinkOutcome, ClassifiedError> {
        let link = self.link_for(local, remote)?;
        let expected = link.expected_peer();

        let current = self.read_peer(&link).await?;
        if current == expected {
            debug!(
                chain_id = link.local_chain,
                remote_eid = link.remote_eid,
                "Peer already set"
            );
            return Ok(LinkOutcome::AlreadyLinked);
        }
        if !current.is_zero() {
            warn!(
                chain_id = link.local_chain,
                remote_eid = link.remote_eid,
                current = %current,
                expected = %expected,
                "Replacing existing peer"
            );
        }

        let call = IOApp::setPeerCall {
            eid: link.remote_eid,
            peer: expected,
        };
        let receipt = self
            .chains
            .transact(TxRequest::call(
                link.local_chain,
                link.local_contract,
                call.abi_encode().into(),
            ))
            .await?;

        let after = self.read_peer(&link).await?;
        if after != expected {
            return Err(ClassifiedError::new(
                ErrorKind::InvalidPeer,
                format!(
                    "peer for eid {} on chain {} reads {} after setPeer",
                    link.remote_eid, link.local_chain, after
                ),
            ));
        }

        info!(
            chain_id = link.local_chain,
            remote_eid = link.remote_eid,
            tx_hash = %receipt.tx_hash,
            "Peer linked"
        );
        Ok(LinkOutcome::Linked {
            tx_hash: receipt.tx_hash,
        })
    }

    /// Link both directions of a pair
    pub async fn link_pair(&self, pair: &ContractPair) -> Result<[LinkOutcome; 2], ClassifiedError> {
        let forward = self.link_direction(&pair.a, &pair.b).await?;
        let backward = self.link_direction(&pair.b, &pair.a).await?;
        Ok([forward, backward])
    }

    /// Link every contract to every other, grouped by local chain so the
    /// wallet switches networks once per contract.
    ///
    /// Returns the chain and hash of the last transaction sent, if any.
    pub async fn link_all(&self, contracts: &[ContractRef]) -> Result<Option<(u64, B256)>, ClassifiedError> {
        let mut last_tx = None;
        for local in contracts {
            for remote in contracts.iter().filter(|r| r.chain_id != local.chain_id) {
                if let Some(tx_hash) = self.link_direction(local, remote).await?.tx_hash() {
                    last_tx = Some((local.chain_id, tx_hash));
                }
            }
        }
        Ok(last_tx)
    }

    /// Read both directions of a pair without writing
    pub async fn check(&self, pair: &ContractPair) -> Result<PeerLinkReport, ClassifiedError> {
        Ok(PeerLinkReport {
            a_to_b: self.check_direction(&pair.a, &pair.b).await?,
            b_to_a: self.check_direction(&pair.b, &pair.a).await?,
        })
    }

    async fn check_direction(
        &self,
        local: &ContractRef,
        remote: &ContractRef,
    ) -> Result<DirectionStatus, ClassifiedError> {
        let link = self.link_for(local, remote)?;
        let current = self.read_peer(&link).await?;
        Ok(DirectionStatus {
            is_set: !current.is_zero(),
            peer: bytes32_to_address(&current),
            matches: current == link.expected_peer(),
        })
    }
}
