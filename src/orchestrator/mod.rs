//! Deployment orchestrator
//!
//! Expands a request into its ordered steps, reconciles the stored record
//! against chain state, then executes whatever is left one step at a time.
//! Each completed step is persisted before the next begins, so a crash or a
//! rejected transaction loses at most the step in flight.
//!
//! - `actions` - executors for each step action
//! - `events` - the progress stream handed to callers

mod actions;
pub mod events;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::builder::{ContractBuilder, ContractKind};
use crate::chain::ChainAccess;
use crate::hash::deployment_id;
use crate::poll::PollPolicy;
use crate::record::{
    CompletedStep, DeploymentConfig, DeploymentRecord, DeploymentRequest, DeploymentState,
    ResultAddresses, StepState,
};
use crate::retry::{with_retry, ClassifiedError, ErrorKind, StepFailure};
use crate::steps::{plan, Step, StepAction, StepId};
use crate::store::{RecordStore, StoreError};
use crate::verifier::{StepVerifier, VerifyError};

use actions::StepContext;
pub use events::{EventSink, StepStatus};

#[derive(Debug, Error)]
pub enum DeployFailure {
    #[error("invalid deployment request: {0}")]
    InvalidRequest(String),
    #[error("deployment {0} is already running")]
    AlreadyRunning(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{0}")]
    Step(StepFailure),
    #[error("deployment {id} cancelled")]
    Cancelled { id: String, next_step: Option<String> },
}

impl DeployFailure {
    /// The step failure, when a step is what failed
    pub fn step_failure(&self) -> Option<&StepFailure> {
        match self {
            DeployFailure::Step(failure) => Some(failure),
            _ => None,
        }
    }
}

/// Resume summary derived from a stored record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentProgress {
    pub id: String,
    pub status: DeploymentState,
    pub total_steps: usize,
    pub completed_steps: usize,
    pub next_step: Option<String>,
    pub can_resume: bool,
    pub result_addresses: ResultAddresses,
    pub last_error: Option<StepFailure>,
}

impl DeploymentProgress {
    /// `running` is whether a worker currently owns the record
    pub fn from_record(record: &DeploymentRecord, running: bool) -> Self {
        let steps = plan(&record.request);
        let completed_steps = steps
            .iter()
            .filter(|s| record.is_step_complete(&s.id))
            .count();
        let next_step = steps
            .iter()
            .find(|s| !record.is_step_complete(&s.id))
            .map(|s| s.id.to_string());
        Self {
            id: record.id.clone(),
            status: record.status,
            total_steps: steps.len(),
            completed_steps,
            can_resume: next_step.is_some() && !running,
            next_step,
            result_addresses: record.result_addresses.clone(),
            last_error: record.last_error.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Bounded wait for recorded steps that are mined but not yet confirmed
    pub pending_wait: PollPolicy,
    /// Refuse chain-mutating steps when the deployer holds no native balance
    pub check_balances: bool,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            pending_wait: PollPolicy::fixed(30, Duration::from_secs(2)),
            check_balances: true,
        }
    }
}

pub struct Orchestrator {
    chains: Arc<ChainAccess>,
    store: RecordStore,
    builder: Arc<dyn ContractBuilder>,
    verifier: StepVerifier,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        chains: Arc<ChainAccess>,
        store: RecordStore,
        builder: Arc<dyn ContractBuilder>,
        settings: OrchestratorSettings,
    ) -> Self {
        let verifier = StepVerifier::new(chains.rpc().clone(), chains.settings().confirmations);
        Self {
            chains,
            store,
            builder,
            verifier,
            settings,
        }
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn chains(&self) -> &Arc<ChainAccess> {
        &self.chains
    }

    /// Validate a request against itself and the configured chains.
    /// Returns the deployment id.
    pub fn prepare(&self, request: &DeploymentRequest) -> Result<String, DeployFailure> {
        request
            .validate()
            .map_err(|e| DeployFailure::InvalidRequest(e.to_string()))?;
        for chain_id in request.all_chains() {
            if self.chains.registry().get(chain_id).is_none() {
                return Err(DeployFailure::InvalidRequest(format!(
                    "chain {} is not configured or disabled",
                    chain_id
                )));
            }
        }
        if let Some(policy) = &request.security {
            policy
                .normalized()
                .validate()
                .map_err(|e| DeployFailure::InvalidRequest(e.to_string()))?;
        }
        deployment_id(request).map_err(|e| DeployFailure::InvalidRequest(e.to_string()))
    }

    /// Merge with the stored copy and write
    async fn persist(&self, record: &mut DeploymentRecord) -> Result<(), StoreError> {
        if let Some(stored) = self.store.get(&record.id).await? {
            record.merge(&stored);
        }
        self.store.put(record).await
    }

    async fn load_or_create(&self, id: &str, request: &DeploymentRequest) -> Result<DeploymentRecord, StoreError> {
        match self.store.get(id).await? {
            Some(mut record) => {
                info!(id, completed = record.completed_steps.len(), "Resuming deployment");
                // Same id means same chains and token; only the policy may differ
                let request = request.normalized();
                let policy_changed = request.security.is_some()
                    && request.security.as_ref().map(|p| p.normalized())
                        != record.request.security.as_ref().map(|p| p.normalized());
                record.request = request;

                let security = StepId::configure_security();
                if policy_changed && record.remove_steps(&[security.to_string()]) > 0 {
                    info!(id, "Security policy changed, channels will be reconfigured");
                    record.set_step_display(
                        &security,
                        StepState::Pending,
                        Some("security policy changed".to_string()),
                    );
                    // Written directly: persist() would merge the old completion back in
                    self.store.put(&record).await?;
                }
                Ok(record)
            }
            None => {
                info!(id, kind = %request.kind(), "Starting new deployment");
                Ok(DeploymentRecord::new(id.to_string(), request.clone()))
            }
        }
    }

    /// Record a terminal step failure and emit it
    async fn fail(
        &self,
        record: &mut DeploymentRecord,
        step: &Step,
        failure: StepFailure,
        events: &EventSink,
    ) -> DeployFailure {
        warn!(
            id = %record.id,
            step = %step.id,
            kind = %failure.kind,
            attempts = failure.attempts,
            error = %failure.message,
            "Deployment step failed"
        );
        record.set_step_display(&step.id, StepState::Failed, Some(failure.message.clone()));
        record.status = DeploymentState::Failed;
        record.last_error = Some(failure.clone());
        if let Err(e) = self.persist(record).await {
            return DeployFailure::Store(e);
        }
        events.emit(StepStatus::Failed(failure.clone()));
        events.emit(StepStatus::DeploymentFailed {
            id: record.id.clone(),
            failure: failure.clone(),
        });
        DeployFailure::Step(failure)
    }

    /// Drop invalid steps and wait (bounded) for pending ones.
    /// Returns a recorded step that is still not verified, with the reason.
    async fn reconcile(
        &self,
        record: &mut DeploymentRecord,
    ) -> Result<Option<(String, ClassifiedError)>, DeployFailure> {
        let report = match self.verifier.reconcile(&self.store, record).await {
            Ok(report) => report,
            Err(VerifyError::Store(e)) => return Err(DeployFailure::Store(e)),
            Err(VerifyError::Chain { step_id, error }) => {
                warn!(id = %record.id, step = %step_id, error = %error, "Recorded step could not be verified");
                return Ok(Some((step_id, error)));
            }
        };
        if report.pending.is_empty() {
            return Ok(None);
        }

        debug!(id = %record.id, pending = ?report.pending, "Waiting for pending steps");
        let report = match self
            .verifier
            .await_pending(record, report.clone(), &self.settings.pending_wait)
            .await
        {
            Ok(settled) => settled,
            Err(e) => {
                warn!(id = %record.id, error = %e, "Pending steps could not be re-checked");
                report
            }
        };
        if record.remove_steps(&report.invalid_ids()) > 0 {
            self.store.put(record).await?;
        }
        Ok(report.pending.first().map(|pending_id| {
            let error = ClassifiedError::new(
                ErrorKind::NetworkError,
                format!("{} is still waiting for confirmations", pending_id),
            );
            (pending_id.clone(), error)
        }))
    }

    async fn ensure_funded(&self, chain_id: u64) -> Result<(), ClassifiedError> {
        let address = self
            .chains
            .session()
            .address()
            .await
            .map_err(|e| e.classify())?;
        let balance = self
            .chains
            .rpc()
            .balance(chain_id, address)
            .await
            .map_err(|e| e.classify())?;
        if balance.is_zero() {
            let symbol = self
                .chains
                .registry()
                .get(chain_id)
                .map(|c| c.native_symbol.clone())
                .unwrap_or_default();
            return Err(ClassifiedError::new(
                ErrorKind::InsufficientFunds,
                format!("deployer {} holds no {} on chain {}", address, symbol, chain_id),
            ));
        }
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &StepContext<'_>,
        step: &Step,
        events: &EventSink,
    ) -> Result<CompletedStep, ClassifiedError> {
        if self.settings.check_balances && step.action.mutates_chain() {
            let chains = match step.chain_id {
                Some(chain_id) => vec![chain_id],
                None => ctx.request.all_chains(),
            };
            for chain_id in chains {
                self.ensure_funded(chain_id).await?;
            }
        }

        if let (Some(chain_id), true) = (step.chain_id, step.action.mutates_chain()) {
            let switcher = self.chains.switcher();
            if !switcher.is_active(chain_id).await.map_err(|e| e.classify())? {
                events.emit(StepStatus::AwaitingNetworkSwitch {
                    step_id: step.id.to_string(),
                    chain_id,
                });
                switcher
                    .ensure_chain(chain_id)
                    .await
                    .map_err(|e| e.classify())?;
            }
        }

        match step.action {
            StepAction::VerifySourceContract | StepAction::DeploySourceAdapter => {
                let DeploymentConfig::Adapter {
                    source_chain, token, ..
                } = &ctx.request.config
                else {
                    return Err(ClassifiedError::new(
                        ErrorKind::Unknown,
                        format!("{} needs an adapter deployment", step.id),
                    ));
                };
                if step.action == StepAction::VerifySourceContract {
                    ctx.verify_source_contract(*source_chain, *token).await
                } else {
                    ctx.deploy(*source_chain, ContractKind::Adapter, Some(*token))
                        .await
                }
            }
            StepAction::DeployMirror { chain_id } => {
                ctx.deploy(chain_id, ContractKind::Mirror, None).await
            }
            StepAction::LinkPeers => ctx.link_peers().await,
            StepAction::ConfigureSecurity => {
                let policy = ctx.request.security.as_ref().ok_or_else(|| {
                    ClassifiedError::new(ErrorKind::Unknown, "no security policy in request")
                })?;
                ctx.configure_security(policy).await
            }
        }
    }

    /// Run (or resume) a deployment to completion, failure, or cancellation
    pub async fn run(
        &self,
        request: DeploymentRequest,
        events: EventSink,
        cancel: watch::Receiver<bool>,
    ) -> Result<DeploymentRecord, DeployFailure> {
        let id = self.prepare(&request)?;
        let mut record = self.load_or_create(&id, &request).await?;
        record.status = DeploymentState::Running;
        record.last_error = None;
        self.persist(&mut record).await?;

        let unverified = self.reconcile(&mut record).await?;
        let steps = plan(&record.request);
        let total = steps.len();

        // Recorded steps are only skipped once verified
        if let Some((step_id, error)) = unverified {
            let failure = StepFailure::from_classified(&step_id, &error, 1);
            let step = steps
                .iter()
                .find(|s| s.id.as_str() == step_id)
                .or_else(|| steps.first());
            return Err(match step {
                Some(step) => self.fail(&mut record, step, failure, &events).await,
                None => DeployFailure::Step(failure),
            });
        }

        for step in &steps {
            if record.is_step_complete(&step.id) {
                let done = record.completed_steps.get(step.id.as_str());
                events.emit(StepStatus::Completed {
                    step_id: step.id.to_string(),
                    position: step.position,
                    total,
                    skipped: true,
                    tx_hash: done.and_then(|c| c.tx_hash),
                    contract_address: done.and_then(|c| c.contract_address),
                });
                continue;
            }

            if *cancel.borrow() {
                info!(id = %record.id, next_step = %step.id, "Deployment cancelled");
                record.status = DeploymentState::Failed;
                self.persist(&mut record).await?;
                events.emit(StepStatus::Cancelled {
                    id: record.id.clone(),
                    next_step: Some(step.id.to_string()),
                });
                return Err(DeployFailure::Cancelled {
                    id: record.id.clone(),
                    next_step: Some(step.id.to_string()),
                });
            }

            info!(id = %record.id, step = %step.id, position = step.position, total, "Executing step");
            record.set_step_display(&step.id, StepState::InProgress, None);
            events.emit(StepStatus::InProgress {
                step_id: step.id.to_string(),
                position: step.position,
                total,
                chain_id: step.chain_id,
            });

            let result = {
                let ctx = StepContext {
                    chains: &self.chains,
                    builder: self.builder.as_ref(),
                    request: &record.request,
                    results: &record.result_addresses,
                };
                let ctx = &ctx;
                let events_ref = &events;
                with_retry(
                    step.id.as_str(),
                    move |_| self.execute(ctx, step, events_ref),
                    |attempt, error, delay| {
                        events.emit(StepStatus::Retrying {
                            step_id: step.id.to_string(),
                            attempt,
                            kind: error.kind,
                            delay,
                        })
                    },
                )
                .await
            };

            match result {
                Ok(completion) => {
                    let tx_hash = completion.tx_hash;
                    let contract_address = completion.contract_address;
                    record.record_step(&step.id, completion);
                    self.persist(&mut record).await?;
                    info!(id = %record.id, step = %step.id, "Step completed");
                    events.emit(StepStatus::Completed {
                        step_id: step.id.to_string(),
                        position: step.position,
                        total,
                        skipped: false,
                        tx_hash,
                        contract_address,
                    });
                }
                Err(exhausted) => {
                    let failure =
                        StepFailure::from_classified(step.id.as_str(), &exhausted.error, exhausted.attempts);
                    return Err(self.fail(&mut record, step, failure, &events).await);
                }
            }
        }

        record.status = DeploymentState::Completed;
        self.persist(&mut record).await?;
        info!(
            id = %record.id,
            source = ?record.result_addresses.source,
            mirrors = record.result_addresses.mirrors.len(),
            "Deployment completed"
        );
        events.emit(StepStatus::DeploymentCompleted {
            id: record.id.clone(),
            result_addresses: record.result_addresses.clone(),
        });
        Ok(record)
    }
}
