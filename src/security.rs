//! Security-channel configuration: verifier sets, thresholds, confirmation
//! depth and executor per remote chain and direction.
//!
//! Send config on A for B and receive config on B for A must agree on
//! confirmations and the required verifier set, otherwise messages between
//! the two contracts can never be verified.

use alloy::primitives::{Address, Bytes, B256};
use alloy::sol_types::{SolCall, SolType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::chain::contracts::{
    ExecutorConfig, IEndpointV2, IUln302, SetConfigParam, UlnConfig, CONFIG_TYPE_EXECUTOR,
    CONFIG_TYPE_ULN,
};
use crate::chain::{ChainAccess, TxRequest};
use crate::peers::{ContractPair, ContractRef};
use crate::retry::{ClassifiedError, ErrorKind};

/// Executor message size limit written alongside the executor address
const DEFAULT_MAX_MESSAGE_SIZE: u32 = 10_000;

/// Verifier/executor policy applied to every channel of a deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityPolicy {
    /// Block confirmations before verifiers attest
    pub confirmations: u64,
    pub required_verifiers: Vec<Address>,
    #[serde(default)]
    pub optional_verifiers: Vec<Address>,
    #[serde(default)]
    pub optional_threshold: u8,
    /// Executor for the send direction; the chain's configured executor when unset
    #[serde(default)]
    pub executor: Option<Address>,
    /// Replace app-specific configs that differ from this policy
    #[serde(default)]
    pub overwrite_existing: bool,
}

impl SecurityPolicy {
    /// Sorted verifier lists. Duplicates are kept so `validate` can reject them.
    pub fn normalized(&self) -> Self {
        let mut policy = self.clone();
        policy.required_verifiers.sort_unstable();
        policy.optional_verifiers.sort_unstable();
        policy
    }

    pub fn validate(&self) -> Result<(), ClassifiedError> {
        let all: Vec<&Address> = self
            .required_verifiers
            .iter()
            .chain(self.optional_verifiers.iter())
            .collect();
        let unique: BTreeSet<&Address> = all.iter().copied().collect();
        if unique.len() != all.len() {
            return Err(ClassifiedError::new(
                ErrorKind::DuplicateVerifier,
                "security policy lists the same verifier more than once",
            ));
        }
        if self.required_verifiers.is_empty() && self.optional_threshold == 0 {
            return Err(ClassifiedError::new(
                ErrorKind::ContractRevert,
                "security policy needs at least one required verifier or an optional threshold",
            ));
        }
        if self.optional_threshold as usize > self.optional_verifiers.len() {
            return Err(ClassifiedError::new(
                ErrorKind::ContractRevert,
                format!(
                    "optional threshold {} exceeds {} optional verifiers",
                    self.optional_threshold,
                    self.optional_verifiers.len()
                ),
            ));
        }
        if self.required_verifiers.len() > u8::MAX as usize - 1
            || self.optional_verifiers.len() > u8::MAX as usize - 1
        {
            return Err(ClassifiedError::new(
                ErrorKind::ContractRevert,
                "too many verifiers",
            ));
        }
        Ok(())
    }

    /// The channel config this policy produces for one direction
    pub fn channel_config(&self, direction: Direction, default_executor: Option<Address>) -> SecurityChannelConfig {
        let policy = self.normalized();
        SecurityChannelConfig {
            confirmations: policy.confirmations,
            required_verifiers: policy.required_verifiers,
            optional_verifiers: policy.optional_verifiers,
            optional_threshold: policy.optional_threshold,
            executor: match direction {
                Direction::Send => policy.executor.or(default_executor),
                Direction::Receive => None,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Send,
    Receive,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Send => f.write_str("send"),
            Direction::Receive => f.write_str("receive"),
        }
    }
}

/// Effective security settings of one channel end
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityChannelConfig {
    pub confirmations: u64,
    pub required_verifiers: Vec<Address>,
    pub optional_verifiers: Vec<Address>,
    pub optional_threshold: u8,
    /// Send direction only
    pub executor: Option<Address>,
}

impl SecurityChannelConfig {
    pub fn from_uln(uln: &UlnConfig, executor: Option<Address>) -> Self {
        let mut required = uln.requiredDVNs.clone();
        let mut optional = uln.optionalDVNs.clone();
        required.sort_unstable();
        optional.sort_unstable();
        Self {
            confirmations: uln.confirmations,
            required_verifiers: required,
            optional_verifiers: optional,
            optional_threshold: uln.optionalDVNThreshold,
            executor,
        }
    }

    pub fn to_uln(&self) -> UlnConfig {
        UlnConfig {
            confirmations: self.confirmations,
            requiredDVNCount: self.required_verifiers.len() as u8,
            optionalDVNCount: self.optional_verifiers.len() as u8,
            optionalDVNThreshold: self.optional_threshold,
            requiredDVNs: self.required_verifiers.clone(),
            optionalDVNs: self.optional_verifiers.clone(),
        }
    }

    /// An app config left at library defaults reads back as all zeros
    fn is_unset(&self) -> bool {
        self.confirmations == 0
            && self.required_verifiers.is_empty()
            && self.optional_verifiers.is_empty()
            && self.optional_threshold == 0
    }

    /// Whether this existing config already provides `desired`. An unset
    /// desired executor accepts whatever executor is configured.
    fn satisfies(&self, desired: &SecurityChannelConfig) -> bool {
        self.confirmations == desired.confirmations
            && self.required_verifiers == desired.required_verifiers
            && self.optional_verifiers == desired.optional_verifiers
            && self.optional_threshold == desired.optional_threshold
            && (desired.executor.is_none() || self.executor == desired.executor)
    }
}

/// How to treat an existing app-specific config that differs from the policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfigureMode {
    #[default]
    PreserveExisting,
    Overwrite,
}

impl From<bool> for ConfigureMode {
    fn from(overwrite: bool) -> Self {
        if overwrite {
            ConfigureMode::Overwrite
        } else {
            ConfigureMode::PreserveExisting
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigureOutcome {
    Applied { tx_hash: B256 },
    AlreadyConfigured,
    /// A differing config was found and left in place
    Preserved { existing: SecurityChannelConfig },
}

impl ConfigureOutcome {
    pub fn tx_hash(&self) -> Option<B256> {
        match self {
            ConfigureOutcome::Applied { tx_hash } => Some(*tx_hash),
            _ => None,
        }
    }
}

/// One disagreement between a send config and its matching receive config
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMismatch {
    pub field: String,
    pub send_value: String,
    pub receive_value: String,
}

impl fmt::Display for ConfigMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: send={} receive={}",
            self.field, self.send_value, self.receive_value
        )
    }
}

fn format_addresses(addresses: &[Address]) -> String {
    let joined: Vec<String> = addresses.iter().map(|a| a.to_string()).collect();
    format!("[{}]", joined.join(","))
}

/// Compare a send config with the receive config on the other side
pub fn validate_match(
    send: &SecurityChannelConfig,
    receive: &SecurityChannelConfig,
) -> Vec<ConfigMismatch> {
    let mut problems = Vec::new();
    if send.confirmations != receive.confirmations {
        problems.push(ConfigMismatch {
            field: "confirmations".to_string(),
            send_value: send.confirmations.to_string(),
            receive_value: receive.confirmations.to_string(),
        });
    }
    if send.required_verifiers.len() != receive.required_verifiers.len() {
        problems.push(ConfigMismatch {
            field: "required_verifier_count".to_string(),
            send_value: send.required_verifiers.len().to_string(),
            receive_value: receive.required_verifiers.len().to_string(),
        });
    }

    let send_set: BTreeSet<&Address> = send.required_verifiers.iter().collect();
    let receive_set: BTreeSet<&Address> = receive.required_verifiers.iter().collect();
    if send_set != receive_set {
        problems.push(ConfigMismatch {
            field: "required_verifiers".to_string(),
            send_value: format_addresses(&send.required_verifiers),
            receive_value: format_addresses(&receive.required_verifiers),
        });
    }
    problems
}

/// Match results for both directions of a pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMatchReport {
    /// A sends, B receives
    pub a_to_b: Vec<ConfigMismatch>,
    /// B sends, A receives
    pub b_to_a: Vec<ConfigMismatch>,
}

impl ChannelMatchReport {
    pub fn matches(&self) -> bool {
        self.a_to_b.is_empty() && self.b_to_a.is_empty()
    }
}

pub struct SecurityConfigurator {
    chains: Arc<ChainAccess>,
}

impl SecurityConfigurator {
    pub fn new(chains: Arc<ChainAccess>) -> Self {
        Self { chains }
    }

    fn endpoint(&self, chain_id: u64) -> Result<Address, ClassifiedError> {
        self.chains
            .registry()
            .get(chain_id)
            .map(|c| c.endpoint)
            .ok_or_else(|| {
                ClassifiedError::new(
                    ErrorKind::NetworkError,
                    format!("chain {} is not configured", chain_id),
                )
            })
    }

    fn endpoint_and_eid(
        &self,
        local_chain: u64,
        remote_chain: u64,
    ) -> Result<(Address, u32), ClassifiedError> {
        let endpoint = self.endpoint(local_chain)?;
        let remote = self.chains.registry().get(remote_chain).ok_or_else(|| {
            ClassifiedError::new(
                ErrorKind::InvalidPeer,
                format!("no endpoint id known for chain {}", remote_chain),
            )
        })?;
        Ok((endpoint, remote.eid))
    }

    /// Message library serving `local` for the remote endpoint id
    pub async fn library(
        &self,
        local: &ContractRef,
        remote_eid: u32,
        direction: Direction,
    ) -> Result<Address, ClassifiedError> {
        let endpoint = self.endpoint(local.chain_id)?;
        let lib = match direction {
            Direction::Send => {
                self.chains
                    .read(
                        local.chain_id,
                        endpoint,
                        IEndpointV2::getSendLibraryCall {
                            sender: local.address,
                            dstEid: remote_eid,
                        },
                    )
                    .await?
                    .lib
            }
            Direction::Receive => {
                self.chains
                    .read(
                        local.chain_id,
                        endpoint,
                        IEndpointV2::getReceiveLibraryCall {
                            receiver: local.address,
                            srcEid: remote_eid,
                        },
                    )
                    .await?
                    .lib
            }
        };

        if lib == Address::ZERO {
            return Err(ClassifiedError::new(
                ErrorKind::MessageLibraryError,
                format!(
                    "{} library not set for eid {} on chain {}",
                    direction, remote_eid, local.chain_id
                ),
            ));
        }
        Ok(lib)
    }

    /// Effective config as resolved by the endpoint (app-specific or default)
    pub async fn read_config(
        &self,
        local: &ContractRef,
        remote_chain: u64,
        direction: Direction,
    ) -> Result<SecurityChannelConfig, ClassifiedError> {
        let (endpoint, eid) = self.endpoint_and_eid(local.chain_id, remote_chain)?;
        let lib = self.library(local, eid, direction).await?;

        let uln_bytes = self
            .read_endpoint_config(local, endpoint, lib, eid, CONFIG_TYPE_ULN)
            .await?;
        let uln = <UlnConfig as SolType>::abi_decode(&uln_bytes, true).map_err(|e| {
            ClassifiedError::new(ErrorKind::ContractRevert, "undecodable ULN config")
                .with_detail(e.to_string())
        })?;

        let executor = match direction {
            Direction::Send => self.read_executor(local, endpoint, lib, eid).await?,
            Direction::Receive => None,
        };

        Ok(SecurityChannelConfig::from_uln(&uln, executor))
    }

    /// Executor the endpoint resolves for the send side; `None` when unset
    async fn read_executor(
        &self,
        local: &ContractRef,
        endpoint: Address,
        lib: Address,
        eid: u32,
    ) -> Result<Option<Address>, ClassifiedError> {
        let bytes = self
            .read_endpoint_config(local, endpoint, lib, eid, CONFIG_TYPE_EXECUTOR)
            .await?;
        Ok(<ExecutorConfig as SolType>::abi_decode(&bytes, true)
            .ok()
            .map(|c| c.executor)
            .filter(|a| *a != Address::ZERO))
    }

    async fn read_endpoint_config(
        &self,
        local: &ContractRef,
        endpoint: Address,
        lib: Address,
        eid: u32,
        config_type: u32,
    ) -> Result<Bytes, ClassifiedError> {
        Ok(self
            .chains
            .read(
                local.chain_id,
                endpoint,
                IEndpointV2::getConfigCall {
                    oapp: local.address,
                    lib,
                    eid,
                    configType: config_type,
                },
            )
            .await?
            .config)
    }

    /// App-specific ULN config stored in the library; `None` when the app
    /// still uses library defaults
    pub async fn read_app_config(
        &self,
        local: &ContractRef,
        lib: Address,
        remote_eid: u32,
    ) -> Result<Option<SecurityChannelConfig>, ClassifiedError> {
        let uln = self
            .chains
            .read(
                local.chain_id,
                lib,
                IUln302::getAppUlnConfigCall {
                    oapp: local.address,
                    remoteEid: remote_eid,
                },
            )
            .await?
            .config;
        let config = SecurityChannelConfig::from_uln(&uln, None);
        Ok(if config.is_unset() { None } else { Some(config) })
    }

    /// Apply `policy` to one channel end
    pub async fn configure(
        &self,
        local: &ContractRef,
        remote_chain: u64,
        direction: Direction,
        policy: &SecurityPolicy,
        mode: ConfigureMode,
    ) -> Result<ConfigureOutcome, ClassifiedError> {
        policy.validate()?;
        let (endpoint, eid) = self.endpoint_and_eid(local.chain_id, remote_chain)?;
        let lib = self.library(local, eid, direction).await?;

        let default_executor = self
            .chains
            .registry()
            .get(local.chain_id)
            .and_then(|c| c.executor);
        let desired = policy.channel_config(direction, default_executor);

        if let Some(mut existing) = self.read_app_config(local, lib, eid).await? {
            if direction == Direction::Send {
                existing.executor = self.read_executor(local, endpoint, lib, eid).await?;
            }
            if existing.satisfies(&desired) {
                debug!(
                    chain_id = local.chain_id,
                    remote_eid = eid,
                    direction = %direction,
                    "Security config already applied"
                );
                return Ok(ConfigureOutcome::AlreadyConfigured);
            }
            if mode == ConfigureMode::PreserveExisting {
                warn!(
                    chain_id = local.chain_id,
                    remote_eid = eid,
                    direction = %direction,
                    existing_confirmations = existing.confirmations,
                    "Existing security config differs, leaving it in place"
                );
                return Ok(ConfigureOutcome::Preserved { existing });
            }
        }

        let mut params = vec![SetConfigParam {
            eid,
            configType: CONFIG_TYPE_ULN,
            config: <UlnConfig as SolType>::abi_encode(&desired.to_uln()).into(),
        }];
        if let Some(executor) = desired.executor {
            params.push(SetConfigParam {
                eid,
                configType: CONFIG_TYPE_EXECUTOR,
                config: <ExecutorConfig as SolType>::abi_encode(&ExecutorConfig {
                    maxMessageSize: DEFAULT_MAX_MESSAGE_SIZE,
                    executor,
                })
                .into(),
            });
        }

        let call = IEndpointV2::setConfigCall {
            oapp: local.address,
            lib,
            params,
        };
        let receipt = self
            .chains
            .transact(TxRequest::call(
                local.chain_id,
                endpoint,
                call.abi_encode().into(),
            ))
            .await?;

        info!(
            chain_id = local.chain_id,
            remote_eid = eid,
            direction = %direction,
            confirmations = desired.confirmations,
            required = desired.required_verifiers.len(),
            tx_hash = %receipt.tx_hash,
            "Security config applied"
        );
        Ok(ConfigureOutcome::Applied {
            tx_hash: receipt.tx_hash,
        })
    }

    /// Configure every channel end between the given contracts.
    ///
    /// Returns the chain and hash of the last transaction sent, if any.
    pub async fn configure_mesh(
        &self,
        contracts: &[ContractRef],
        policy: &SecurityPolicy,
    ) -> Result<Option<(u64, B256)>, ClassifiedError> {
        let mode = ConfigureMode::from(policy.overwrite_existing);
        let mut last_tx = None;
        for local in contracts {
            for remote in contracts.iter().filter(|r| r.chain_id != local.chain_id) {
                for direction in [Direction::Send, Direction::Receive] {
                    let outcome = self
                        .configure(local, remote.chain_id, direction, policy, mode)
                        .await?;
                    if let Some(tx_hash) = outcome.tx_hash() {
                        last_tx = Some((local.chain_id, tx_hash));
                    }
                }
            }
        }
        Ok(last_tx)
    }

    /// Check every pair of the mesh and fail with the mismatches found.
    ///
    /// Ends left in place under `PreserveExisting` can leave a channel
    /// unverifiable; this is where that surfaces.
    pub async fn ensure_mesh_matches(&self, contracts: &[ContractRef]) -> Result<(), ClassifiedError> {
        let mut problems = Vec::new();
        for (i, a) in contracts.iter().enumerate() {
            for b in &contracts[i + 1..] {
                let report = self.check_match(&ContractPair::new(*a, *b)).await?;
                for mismatch in &report.a_to_b {
                    problems.push(format!("{}->{} {}", a.chain_id, b.chain_id, mismatch));
                }
                for mismatch in &report.b_to_a {
                    problems.push(format!("{}->{} {}", b.chain_id, a.chain_id, mismatch));
                }
            }
        }
        if problems.is_empty() {
            return Ok(());
        }
        warn!(mismatches = problems.len(), "Security channels disagree after configuration");
        Err(ClassifiedError::new(
            ErrorKind::ContractRevert,
            format!(
                "security channels disagree: {}; set overwriteExisting to replace existing configs",
                problems.join("; ")
            ),
        ))
    }

    /// Read both directions of a pair and report every mismatch
    pub async fn check_match(&self, pair: &ContractPair) -> Result<ChannelMatchReport, ClassifiedError> {
        let a_send = self.read_config(&pair.a, pair.b.chain_id, Direction::Send).await?;
        let b_receive = self.read_config(&pair.b, pair.a.chain_id, Direction::Receive).await?;
        let b_send = self.read_config(&pair.b, pair.a.chain_id, Direction::Send).await?;
        let a_receive = self.read_config(&pair.a, pair.b.chain_id, Direction::Receive).await?;
        Ok(ChannelMatchReport {
            a_to_b: validate_match(&a_send, &b_receive),
            b_to_a: validate_match(&b_send, &a_receive),
        })
    }
}
