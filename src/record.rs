//! Deployment records: the aggregate persisted per deployment request
//!
//! A record is mutated by exactly two writers: the orchestrator appends
//! completed steps, and the step verifier removes steps that no longer hold on
//! chain. `result_addresses` is always recomputed from `completed_steps` and
//! never written directly.

use alloy::primitives::{Address, B256};
use chrono::{DateTime, Utc};
use eyre::{eyre, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::retry::StepFailure;
use crate::security::SecurityPolicy;
use crate::steps::{StepAction, StepId};

/// Current record schema version
pub const RECORD_VERSION: u32 = 1;

fn record_version() -> u32 {
    RECORD_VERSION
}

/// What kind of bridge is being deployed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeploymentKind {
    /// Wrap an existing token on a source chain and mint mirrors elsewhere
    Adapter,
    /// Fresh mirrored contracts on every chain, no single source
    NewCollection,
}

impl DeploymentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentKind::Adapter => "adapter",
            DeploymentKind::NewCollection => "new_collection",
        }
    }
}

impl fmt::Display for DeploymentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Chain layout of a deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum DeploymentConfig {
    #[serde(rename_all = "camelCase")]
    Adapter {
        source_chain: u64,
        token: Address,
        destination_chains: Vec<u64>,
        name: String,
        symbol: String,
    },
    #[serde(rename_all = "camelCase")]
    NewCollection {
        chains: Vec<u64>,
        name: String,
        symbol: String,
    },
}

/// A request to deploy and wire a bridge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRequest {
    pub requester: Address,
    pub config: DeploymentConfig,
    /// Verifier/executor policy applied to every channel after peers are linked.
    /// Not part of the deployment id: adding a policy later resumes the same record.
    #[serde(default)]
    pub security: Option<SecurityPolicy>,
}

impl DeploymentRequest {
    pub fn kind(&self) -> DeploymentKind {
        match self.config {
            DeploymentConfig::Adapter { .. } => DeploymentKind::Adapter,
            DeploymentConfig::NewCollection { .. } => DeploymentKind::NewCollection,
        }
    }

    /// Canonical form used for hashing and planning.
    pub fn normalized(&self) -> Self {
        let config = match &self.config {
            DeploymentConfig::Adapter {
                source_chain,
                token,
                destination_chains,
                name,
                symbol,
            } => {
                let mut destinations: Vec<u64> = destination_chains
                    .iter()
                    .copied()
                    .filter(|c| c != source_chain)
                    .collect();
                destinations.sort_unstable();
                destinations.dedup();
                DeploymentConfig::Adapter {
                    source_chain: *source_chain,
                    token: *token,
                    destination_chains: destinations,
                    name: name.trim().to_string(),
                    symbol: symbol.trim().to_string(),
                }
            }
            DeploymentConfig::NewCollection {
                chains,
                name,
                symbol,
            } => {
                let mut chains = chains.clone();
                chains.sort_unstable();
                chains.dedup();
                DeploymentConfig::NewCollection {
                    chains,
                    name: name.trim().to_string(),
                    symbol: symbol.trim().to_string(),
                }
            }
        };

        Self {
            requester: self.requester,
            config,
            security: self.security.as_ref().map(SecurityPolicy::normalized),
        }
    }

    /// Reject requests that cannot produce a working bridge
    pub fn validate(&self) -> Result<()> {
        let normalized = self.normalized();
        if normalized.requester == Address::ZERO {
            return Err(eyre!("requester cannot be the zero address"));
        }
        let (name, symbol) = match &normalized.config {
            DeploymentConfig::Adapter {
                token,
                destination_chains,
                name,
                symbol,
                ..
            } => {
                if *token == Address::ZERO {
                    return Err(eyre!("adapter token cannot be the zero address"));
                }
                if destination_chains.is_empty() {
                    return Err(eyre!(
                        "adapter deployment needs at least one destination chain other than the source"
                    ));
                }
                (name, symbol)
            }
            DeploymentConfig::NewCollection {
                chains,
                name,
                symbol,
            } => {
                if chains.len() < 2 {
                    return Err(eyre!(
                        "new collection needs at least two distinct chains, got {}",
                        chains.len()
                    ));
                }
                (name, symbol)
            }
        };
        if name.is_empty() || symbol.is_empty() {
            return Err(eyre!("token name and symbol cannot be empty"));
        }
        Ok(())
    }

    /// The adapter's source chain, if any
    pub fn source_chain(&self) -> Option<u64> {
        match self.config {
            DeploymentConfig::Adapter { source_chain, .. } => Some(source_chain),
            DeploymentConfig::NewCollection { .. } => None,
        }
    }

    /// Chains that receive a mirror contract
    pub fn mirror_chains(&self) -> Vec<u64> {
        match &self.normalized().config {
            DeploymentConfig::Adapter {
                destination_chains, ..
            } => destination_chains.clone(),
            DeploymentConfig::NewCollection { chains, .. } => chains.clone(),
        }
    }

    /// Every chain touched by the deployment
    pub fn all_chains(&self) -> Vec<u64> {
        let mut chains = self.mirror_chains();
        if let Some(source) = self.source_chain() {
            chains.insert(0, source);
        }
        chains
    }
}

/// Global lifecycle of a deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeploymentState {
    NotStarted,
    Running,
    Completed,
    Failed,
}

/// Lifecycle of a single step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepState {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// Ground-truth evidence that a step finished
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedStep {
    /// Transaction that completed the step; `None` for read-only steps
    pub tx_hash: Option<B256>,
    pub chain_id: u64,
    /// Contract deployed (or verified) by the step
    pub contract_address: Option<Address>,
    pub block_number: u64,
    pub timestamp: DateTime<Utc>,
}

/// Addresses produced by the deployment, derived from completed steps
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultAddresses {
    pub source: Option<Address>,
    pub mirrors: BTreeMap<u64, Address>,
}

/// UI-facing projection of a step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDisplay {
    pub state: StepState,
    pub verified: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// Persisted state of one deployment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRecord {
    #[serde(default = "record_version")]
    pub version: u32,
    pub id: String,
    pub kind: DeploymentKind,
    pub requester: Address,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub request: DeploymentRequest,
    pub status: DeploymentState,
    #[serde(default)]
    pub completed_steps: BTreeMap<String, CompletedStep>,
    #[serde(default)]
    pub result_addresses: ResultAddresses,
    #[serde(default)]
    pub display_status: BTreeMap<String, StepDisplay>,
    #[serde(default)]
    pub last_error: Option<StepFailure>,
}

impl DeploymentRecord {
    /// Create a fresh record for a normalized request
    pub fn new(id: String, request: DeploymentRequest) -> Self {
        let now = Utc::now();
        let request = request.normalized();
        Self {
            version: RECORD_VERSION,
            id,
            kind: request.kind(),
            requester: request.requester,
            created_at: now,
            updated_at: now,
            request,
            status: DeploymentState::NotStarted,
            completed_steps: BTreeMap::new(),
            result_addresses: ResultAddresses::default(),
            display_status: BTreeMap::new(),
            last_error: None,
        }
    }

    pub fn is_step_complete(&self, step: &StepId) -> bool {
        self.completed_steps.contains_key(step.as_str())
    }

    /// Append a completed step and refresh derived views
    pub fn record_step(&mut self, step: &StepId, completion: CompletedStep) {
        self.completed_steps
            .insert(step.as_str().to_string(), completion);
        self.display_status.insert(
            step.as_str().to_string(),
            StepDisplay {
                state: StepState::Completed,
                verified: true,
                error: None,
            },
        );
        self.touch();
        self.recompute_result_addresses();
    }

    /// Drop steps the verifier found invalid; returns how many were removed
    pub fn remove_steps(&mut self, steps: &[String]) -> usize {
        let mut removed = 0;
        for step in steps {
            if self.completed_steps.remove(step).is_some() {
                removed += 1;
                self.display_status.insert(
                    step.clone(),
                    StepDisplay {
                        state: StepState::Pending,
                        verified: false,
                        error: Some("invalidated by on-chain verification".to_string()),
                    },
                );
            }
        }
        if removed > 0 {
            self.touch();
            self.recompute_result_addresses();
        }
        removed
    }

    pub fn set_step_display(&mut self, step: &StepId, state: StepState, error: Option<String>) {
        let verified = state == StepState::Completed;
        self.display_status.insert(
            step.as_str().to_string(),
            StepDisplay {
                state,
                verified,
                error,
            },
        );
        self.touch();
    }

    /// Rebuild `result_addresses` from `completed_steps`
    pub fn recompute_result_addresses(&mut self) {
        let mut addresses = ResultAddresses::default();
        for (step, completion) in &self.completed_steps {
            let Some(address) = completion.contract_address else {
                continue;
            };
            match StepId::from(step.as_str()).action() {
                Some(StepAction::DeploySourceAdapter) => addresses.source = Some(address),
                Some(StepAction::DeployMirror { chain_id }) => {
                    addresses.mirrors.insert(chain_id, address);
                }
                _ => {}
            }
        }
        self.result_addresses = addresses;
    }

    /// Merge another copy of the same record into this one.
    ///
    /// Step and display maps are append-only (entries already present here
    /// win), timestamps take the max (`updated_at`) or min (`created_at`).
    pub fn merge(&mut self, other: &DeploymentRecord) {
        if other.id != self.id {
            return;
        }
        for (step, completion) in &other.completed_steps {
            self.completed_steps
                .entry(step.clone())
                .or_insert_with(|| completion.clone());
        }
        for (step, display) in &other.display_status {
            self.display_status
                .entry(step.clone())
                .or_insert_with(|| display.clone());
        }
        self.created_at = self.created_at.min(other.created_at);
        self.updated_at = self.updated_at.max(other.updated_at);
        self.version = self.version.max(other.version);
        self.recompute_result_addresses();
    }

    fn touch(&mut self) {
        self.updated_at = self.updated_at.max(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> DeploymentRequest {
        DeploymentRequest {
            requester: Address::repeat_byte(0x01),
            config: DeploymentConfig::Adapter {
                source_chain: 1,
                token: Address::repeat_byte(0x02),
                destination_chains: vec![137, 56, 1],
                name: " Token ".to_string(),
                symbol: "TKN".to_string(),
            },
            security: None,
        }
    }

    fn completion(chain_id: u64, contract: Option<Address>) -> CompletedStep {
        CompletedStep {
            tx_hash: Some(B256::repeat_byte(0x09)),
            chain_id,
            contract_address: contract,
            block_number: 10,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_normalized_drops_source_and_sorts() {
        let normalized = request().normalized();
        match normalized.config {
            DeploymentConfig::Adapter {
                destination_chains,
                name,
                ..
            } => {
                assert_eq!(destination_chains, vec![56, 137]);
                assert_eq!(name, "Token");
            }
            _ => panic!("expected adapter config"),
        }
    }

    #[test]
    fn test_validate_rejects_single_chain_collection() {
        let req = DeploymentRequest {
            requester: Address::repeat_byte(0x01),
            config: DeploymentConfig::NewCollection {
                chains: vec![1, 1],
                name: "A".to_string(),
                symbol: "A".to_string(),
            },
            security: None,
        };
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_adapter_without_destinations() {
        let mut req = request();
        req.config = DeploymentConfig::Adapter {
            source_chain: 1,
            token: Address::repeat_byte(0x02),
            destination_chains: vec![1],
            name: "T".to_string(),
            symbol: "T".to_string(),
        };
        assert!(req.validate().is_err());
        assert!(request().validate().is_ok());
    }

    #[test]
    fn test_result_addresses_follow_completed_steps() {
        let mut record = DeploymentRecord::new("0xabc".to_string(), request());
        record.record_step(
            &StepId::deploy_source_adapter(),
            completion(1, Some(Address::repeat_byte(0xaa))),
        );
        record.record_step(
            &StepId::deploy_mirror(56),
            completion(56, Some(Address::repeat_byte(0xbb))),
        );
        assert_eq!(
            record.result_addresses.source,
            Some(Address::repeat_byte(0xaa))
        );
        assert_eq!(
            record.result_addresses.mirrors.get(&56),
            Some(&Address::repeat_byte(0xbb))
        );

        let removed = record.remove_steps(&["deploy-mirror-56".to_string()]);
        assert_eq!(removed, 1);
        assert!(record.result_addresses.mirrors.is_empty());
        assert!(!record.display_status["deploy-mirror-56"].verified);
    }

    #[test]
    fn test_merge_is_append_only() {
        let mut a = DeploymentRecord::new("0xabc".to_string(), request());
        let mut b = a.clone();
        a.record_step(&StepId::verify_source_contract(), completion(1, None));
        b.record_step(
            &StepId::deploy_mirror(56),
            completion(56, Some(Address::repeat_byte(0xbb))),
        );
        b.updated_at = a.updated_at + chrono::Duration::seconds(30);

        a.merge(&b);
        assert_eq!(a.completed_steps.len(), 2);
        assert_eq!(a.updated_at, b.updated_at);
        assert_eq!(a.result_addresses.mirrors.len(), 1);
    }

    #[test]
    fn test_merge_ignores_other_ids() {
        let mut a = DeploymentRecord::new("0xabc".to_string(), request());
        let mut b = DeploymentRecord::new("0xdef".to_string(), request());
        b.record_step(&StepId::verify_source_contract(), completion(1, None));
        a.merge(&b);
        assert!(a.completed_steps.is_empty());
    }

    #[test]
    fn test_record_json_uses_camel_case() {
        let record = DeploymentRecord::new("0xabc".to_string(), request());
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("completedSteps").is_some());
        assert!(json.get("resultAddresses").is_some());
        assert_eq!(json["request"]["config"]["kind"], "adapter");
    }
}
