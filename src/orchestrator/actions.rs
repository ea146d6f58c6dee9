//! Executors for each step action
//!
//! Every executor returns the evidence recorded in `completedSteps`. None of
//! them persist anything; the orchestrator does that once the step returns.

use alloy::primitives::{Address, B256};
use chrono::Utc;
use std::sync::Arc;
use tracing::info;

use crate::builder::{BuildParams, ContractBuilder, ContractKind};
use crate::chain::contracts::IERC20Metadata;
use crate::chain::{ChainAccess, TxRequest};
use crate::peers::{ContractRef, PeerLinker};
use crate::record::{CompletedStep, DeploymentConfig, DeploymentRequest, ResultAddresses};
use crate::retry::{ClassifiedError, ErrorKind};
use crate::security::{SecurityConfigurator, SecurityPolicy};

pub(super) struct StepContext<'a> {
    pub chains: &'a Arc<ChainAccess>,
    pub builder: &'a dyn ContractBuilder,
    pub request: &'a DeploymentRequest,
    pub results: &'a ResultAddresses,
}

fn name_and_symbol(request: &DeploymentRequest) -> (&str, &str) {
    match &request.config {
        DeploymentConfig::Adapter { name, symbol, .. }
        | DeploymentConfig::NewCollection { name, symbol, .. } => (name.as_str(), symbol.as_str()),
    }
}

fn build_error(error: eyre::Report) -> ClassifiedError {
    ClassifiedError::new(ErrorKind::Unknown, "contract build failed").with_detail(format!("{:#}", error))
}

async fn head(chains: &ChainAccess, chain_id: u64) -> Result<u64, ClassifiedError> {
    chains
        .rpc()
        .block_number(chain_id)
        .await
        .map_err(|e| e.classify())
}

impl StepContext<'_> {
    async fn build_params(&self, chain_id: u64, token: Option<Address>) -> Result<BuildParams, ClassifiedError> {
        let endpoint = self
            .chains
            .registry()
            .get(chain_id)
            .map(|c| c.endpoint)
            .ok_or_else(|| {
                ClassifiedError::new(
                    ErrorKind::NetworkError,
                    format!("chain {} is not configured", chain_id),
                )
            })?;
        let delegate = self
            .chains
            .session()
            .address()
            .await
            .map_err(|e| e.classify())?;
        let (name, symbol) = name_and_symbol(self.request);
        Ok(BuildParams {
            name: name.to_string(),
            symbol: symbol.to_string(),
            endpoint,
            delegate,
            token,
        })
    }

    /// Confirm the token exists, looks like an ERC20, and that the adapter
    /// artifact can be built for it
    pub async fn verify_source_contract(&self, chain_id: u64, token: Address) -> Result<CompletedStep, ClassifiedError> {
        let code = self
            .chains
            .rpc()
            .code_at(chain_id, token)
            .await
            .map_err(|e| e.classify())?;
        if code.is_empty() {
            return Err(ClassifiedError::new(
                ErrorKind::ContractRevert,
                format!("no contract at token address {} on chain {}", token, chain_id),
            ));
        }

        let decimals = self
            .chains
            .read(chain_id, token, IERC20Metadata::decimalsCall {})
            .await
            .map_err(|e| not_erc20(token, e))?
            .decimals;
        let symbol = self
            .chains
            .read(chain_id, token, IERC20Metadata::symbolCall {})
            .await
            .map_err(|e| not_erc20(token, e))?
            .symbol;

        let params = self.build_params(chain_id, Some(token)).await?;
        self.builder
            .build(ContractKind::Adapter, &params)
            .map_err(build_error)?;

        info!(chain_id, token = %token, symbol = %symbol, decimals, "Source token verified");
        Ok(CompletedStep {
            tx_hash: None,
            chain_id,
            contract_address: Some(token),
            block_number: head(self.chains, chain_id).await?,
            timestamp: Utc::now(),
        })
    }

    /// Build, deploy, and check bytecode landed at the created address
    pub async fn deploy(&self, chain_id: u64, kind: ContractKind, token: Option<Address>) -> Result<CompletedStep, ClassifiedError> {
        let params = self.build_params(chain_id, token).await?;
        let built = self.builder.build(kind, &params).map_err(build_error)?;

        let receipt = self
            .chains
            .transact(TxRequest::deploy(chain_id, built.init_code()))
            .await?;
        let address = receipt.contract_address.ok_or_else(|| {
            ClassifiedError::new(
                ErrorKind::ContractRevert,
                format!("deployment {} created no contract", receipt.tx_hash),
            )
        })?;

        let code = self
            .chains
            .rpc()
            .code_at(chain_id, address)
            .await
            .map_err(|e| e.classify())?;
        if code.is_empty() {
            return Err(ClassifiedError::new(
                ErrorKind::ContractRevert,
                format!("no code at {} after deployment", address),
            ));
        }

        info!(
            chain_id,
            contract = %built.contract_name,
            address = %address,
            tx_hash = %receipt.tx_hash,
            "Contract deployed"
        );
        Ok(CompletedStep {
            tx_hash: Some(receipt.tx_hash),
            chain_id,
            contract_address: Some(address),
            block_number: receipt.block_number,
            timestamp: Utc::now(),
        })
    }

    /// Source adapter (if any) plus every mirror, in chain order
    pub fn contracts(&self) -> Result<Vec<ContractRef>, ClassifiedError> {
        let missing = |chain_id: u64| {
            ClassifiedError::new(
                ErrorKind::InvalidPeer,
                format!("no deployed contract recorded for chain {}", chain_id),
            )
        };
        let mut contracts = Vec::new();
        if let Some(source_chain) = self.request.source_chain() {
            let address = self.results.source.ok_or_else(|| missing(source_chain))?;
            contracts.push(ContractRef::new(source_chain, address));
        }
        for chain_id in self.request.mirror_chains() {
            let address = self
                .results
                .mirrors
                .get(&chain_id)
                .copied()
                .ok_or_else(|| missing(chain_id))?;
            contracts.push(ContractRef::new(chain_id, address));
        }
        Ok(contracts)
    }

    /// Evidence for a multi-chain step: the last transaction it sent, or a
    /// read-only entry when nothing needed changing
    async fn mesh_completion(
        &self,
        contracts: &[ContractRef],
        last_tx: Option<(u64, B256)>,
    ) -> Result<CompletedStep, ClassifiedError> {
        let (chain_id, tx_hash) = match last_tx {
            Some((chain_id, tx_hash)) => (chain_id, Some(tx_hash)),
            None => (contracts.first().map(|c| c.chain_id).unwrap_or_default(), None),
        };
        let block_number = match tx_hash {
            Some(tx_hash) => self
                .chains
                .rpc()
                .transaction_receipt(chain_id, tx_hash)
                .await
                .map_err(|e| e.classify())?
                .map(|r| r.block_number)
                .unwrap_or_default(),
            None => head(self.chains, chain_id).await?,
        };
        Ok(CompletedStep {
            tx_hash,
            chain_id,
            contract_address: None,
            block_number,
            timestamp: Utc::now(),
        })
    }

    pub async fn link_peers(&self) -> Result<CompletedStep, ClassifiedError> {
        let contracts = self.contracts()?;
        let linker = PeerLinker::new(self.chains.clone());
        let last_tx = linker.link_all(&contracts).await?;
        info!(contracts = contracts.len(), "Peer mesh linked");
        self.mesh_completion(&contracts, last_tx).await
    }

    pub async fn configure_security(&self, policy: &SecurityPolicy) -> Result<CompletedStep, ClassifiedError> {
        policy.validate()?;
        let contracts = self.contracts()?;
        let configurator = SecurityConfigurator::new(self.chains.clone());
        let last_tx = configurator.configure_mesh(&contracts, policy).await?;
        configurator.ensure_mesh_matches(&contracts).await?;
        info!(contracts = contracts.len(), "Security channels configured");
        self.mesh_completion(&contracts, last_tx).await
    }
}

fn not_erc20(token: Address, error: ClassifiedError) -> ClassifiedError {
    match error.kind {
        ErrorKind::NetworkError => error,
        _ => ClassifiedError::new(
            ErrorKind::ContractRevert,
            format!("{} does not implement ERC20 metadata", token),
        )
        .with_detail(error.message),
    }
}
