//! Step identifiers and deterministic plan expansion
//!
//! Step ids are stable strings derived from the action and its chain, so a
//! persisted `completedSteps` map can be matched against a freshly expanded
//! plan on resume.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::record::{DeploymentConfig, DeploymentRequest};

const VERIFY_SOURCE_CONTRACT: &str = "verify-source-contract";
const DEPLOY_SOURCE_ADAPTER: &str = "deploy-source-adapter";
const DEPLOY_MIRROR_PREFIX: &str = "deploy-mirror-";
const LINK_PEERS: &str = "link-peers";
const CONFIGURE_SECURITY: &str = "configure-security";

/// Stable step identifier, e.g. `deploy-mirror-56`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(String);

impl StepId {
    pub fn verify_source_contract() -> Self {
        StepId(VERIFY_SOURCE_CONTRACT.to_string())
    }

    pub fn deploy_source_adapter() -> Self {
        StepId(DEPLOY_SOURCE_ADAPTER.to_string())
    }

    pub fn deploy_mirror(chain_id: u64) -> Self {
        StepId(format!("{}{}", DEPLOY_MIRROR_PREFIX, chain_id))
    }

    pub fn link_peers() -> Self {
        StepId(LINK_PEERS.to_string())
    }

    pub fn configure_security() -> Self {
        StepId(CONFIGURE_SECURITY.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse the action back out of the id. `None` for ids this version
    /// does not know (e.g. imported from a newer snapshot).
    pub fn action(&self) -> Option<StepAction> {
        match self.0.as_str() {
            VERIFY_SOURCE_CONTRACT => Some(StepAction::VerifySourceContract),
            DEPLOY_SOURCE_ADAPTER => Some(StepAction::DeploySourceAdapter),
            LINK_PEERS => Some(StepAction::LinkPeers),
            CONFIGURE_SECURITY => Some(StepAction::ConfigureSecurity),
            other => other
                .strip_prefix(DEPLOY_MIRROR_PREFIX)
                .and_then(|c| c.parse().ok())
                .map(|chain_id| StepAction::DeployMirror { chain_id }),
        }
    }
}

impl From<&str> for StepId {
    fn from(s: &str) -> Self {
        StepId(s.to_string())
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a step does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepAction {
    /// Confirm the token to wrap exists on the source chain
    VerifySourceContract,
    /// Deploy the lock adapter on the source chain
    DeploySourceAdapter,
    /// Deploy a mint/burn mirror on one chain
    DeployMirror { chain_id: u64 },
    /// Set peers in both directions between every contract pair
    LinkPeers,
    /// Apply the verifier/executor policy on every channel
    ConfigureSecurity,
}

impl StepAction {
    /// Short label for logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            StepAction::VerifySourceContract => "verify_source",
            StepAction::DeploySourceAdapter => "deploy_adapter",
            StepAction::DeployMirror { .. } => "deploy_mirror",
            StepAction::LinkPeers => "link_peers",
            StepAction::ConfigureSecurity => "configure_security",
        }
    }

    /// Whether executing the action submits transactions
    pub fn mutates_chain(&self) -> bool {
        !matches!(self, StepAction::VerifySourceContract)
    }
}

/// One unit of work in a deployment plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub id: StepId,
    pub position: usize,
    /// Chain the wallet must be on; `None` for steps spanning several chains
    pub chain_id: Option<u64>,
    pub action: StepAction,
}

/// Expand a request into its ordered step list.
///
/// Adapter: verify source, deploy adapter, one mirror per destination, link.
/// NewCollection: one mirror per chain, link. A trailing security step is
/// added only when the request carries a policy.
pub fn plan(request: &DeploymentRequest) -> Vec<Step> {
    let request = request.normalized();
    let mut actions: Vec<(Option<u64>, StepAction)> = Vec::new();

    match &request.config {
        DeploymentConfig::Adapter {
            source_chain,
            destination_chains,
            ..
        } => {
            actions.push((Some(*source_chain), StepAction::VerifySourceContract));
            actions.push((Some(*source_chain), StepAction::DeploySourceAdapter));
            for chain_id in destination_chains {
                actions.push((
                    Some(*chain_id),
                    StepAction::DeployMirror {
                        chain_id: *chain_id,
                    },
                ));
            }
        }
        DeploymentConfig::NewCollection { chains, .. } => {
            for chain_id in chains {
                actions.push((
                    Some(*chain_id),
                    StepAction::DeployMirror {
                        chain_id: *chain_id,
                    },
                ));
            }
        }
    }

    actions.push((None, StepAction::LinkPeers));
    if request.security.is_some() {
        actions.push((None, StepAction::ConfigureSecurity));
    }

    actions
        .into_iter()
        .enumerate()
        .map(|(position, (chain_id, action))| Step {
            id: step_id_for(&action),
            position,
            chain_id,
            action,
        })
        .collect()
}

fn step_id_for(action: &StepAction) -> StepId {
    match action {
        StepAction::VerifySourceContract => StepId::verify_source_contract(),
        StepAction::DeploySourceAdapter => StepId::deploy_source_adapter(),
        StepAction::DeployMirror { chain_id } => StepId::deploy_mirror(*chain_id),
        StepAction::LinkPeers => StepId::link_peers(),
        StepAction::ConfigureSecurity => StepId::configure_security(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::SecurityPolicy;
    use alloy::primitives::Address;

    fn adapter(destinations: Vec<u64>) -> DeploymentRequest {
        DeploymentRequest {
            requester: Address::repeat_byte(1),
            config: DeploymentConfig::Adapter {
                source_chain: 1,
                token: Address::repeat_byte(2),
                destination_chains: destinations,
                name: "T".to_string(),
                symbol: "T".to_string(),
            },
            security: None,
        }
    }

    #[test]
    fn test_adapter_with_two_destinations_has_five_steps() {
        let steps = plan(&adapter(vec![137, 56]));
        let ids: Vec<&str> = steps.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "verify-source-contract",
                "deploy-source-adapter",
                "deploy-mirror-56",
                "deploy-mirror-137",
                "link-peers",
            ]
        );
        assert_eq!(steps[2].chain_id, Some(56));
        assert_eq!(steps[4].chain_id, None);
        assert_eq!(steps[4].position, 4);
    }

    #[test]
    fn test_new_collection_plan() {
        let request = DeploymentRequest {
            requester: Address::repeat_byte(1),
            config: DeploymentConfig::NewCollection {
                chains: vec![10, 8453],
                name: "C".to_string(),
                symbol: "C".to_string(),
            },
            security: None,
        };
        let ids: Vec<String> = plan(&request).iter().map(|s| s.id.to_string()).collect();
        assert_eq!(ids, vec!["deploy-mirror-10", "deploy-mirror-8453", "link-peers"]);
    }

    #[test]
    fn test_security_policy_appends_step() {
        let mut request = adapter(vec![56]);
        request.security = Some(SecurityPolicy {
            confirmations: 15,
            required_verifiers: vec![Address::repeat_byte(9)],
            optional_verifiers: vec![],
            optional_threshold: 0,
            executor: None,
            overwrite_existing: false,
        });
        let steps = plan(&request);
        assert_eq!(steps.last().unwrap().action, StepAction::ConfigureSecurity);
    }

    #[test]
    fn test_step_id_parses_back() {
        assert_eq!(
            StepId::deploy_mirror(42161).action(),
            Some(StepAction::DeployMirror { chain_id: 42161 })
        );
        assert_eq!(StepId::from("deploy-mirror-x").action(), None);
        assert_eq!(StepId::link_peers().action(), Some(StepAction::LinkPeers));
    }
}
