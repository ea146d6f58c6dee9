//! On-chain verification of recorded steps
//!
//! A completed step only counts if the chain still agrees: its receipt exists
//! with success status and enough confirmations, and any contract it created
//! still has code. Steps that fail these checks are removed from the record
//! so the orchestrator redoes them.

use alloy::primitives::Address;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::chain::{confirmations, ChainRpc};
use crate::poll::{poll_until, PollPolicy};
use crate::record::{CompletedStep, DeploymentRecord};
use crate::retry::{ClassifiedError, ErrorKind};
use crate::steps::{StepAction, StepId};
use crate::store::{RecordStore, StoreError};

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error(transparent)]
    Store(#[from] StoreError),
    /// A step could not be checked for a reason other than an unreachable chain
    #[error("verification of {step_id} failed: {error}")]
    Chain {
        step_id: String,
        error: ClassifiedError,
    },
}

/// Result of checking one step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepCheck {
    Verified,
    /// Mined but not yet deep enough, or the chain could not be reached
    Pending { confirmations: u64, required: u64 },
    Invalid { reason: String },
}

/// Disjoint verified / pending / invalid step ids
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationReport {
    pub verified: Vec<String>,
    pub pending: Vec<String>,
    /// Step id and reason
    pub invalid: Vec<(String, String)>,
}

impl VerificationReport {
    pub fn invalid_ids(&self) -> Vec<String> {
        self.invalid.iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn is_clean(&self) -> bool {
        self.pending.is_empty() && self.invalid.is_empty()
    }
}

pub struct StepVerifier {
    rpc: Arc<dyn ChainRpc>,
    required_confirmations: u64,
}

impl StepVerifier {
    pub fn new(rpc: Arc<dyn ChainRpc>, required_confirmations: u64) -> Self {
        Self {
            rpc,
            required_confirmations: required_confirmations.max(1),
        }
    }

    async fn has_code(&self, chain_id: u64, address: Address) -> Result<bool, ClassifiedError> {
        let code = self
            .rpc
            .code_at(chain_id, address)
            .await
            .map_err(|e| e.classify())?;
        Ok(!code.is_empty())
    }

    async fn check_code(&self, step: &CompletedStep, address: Address) -> Result<StepCheck, ClassifiedError> {
        if self.has_code(step.chain_id, address).await? {
            Ok(StepCheck::Verified)
        } else {
            Ok(StepCheck::Invalid {
                reason: format!("no code at {} on chain {}", address, step.chain_id),
            })
        }
    }

    async fn check_inner(&self, step: &CompletedStep) -> Result<StepCheck, ClassifiedError> {
        let Some(tx_hash) = step.tx_hash else {
            // Read-only step: only a recorded contract can be re-checked
            return match step.contract_address {
                Some(address) => self.check_code(step, address).await,
                None => Ok(StepCheck::Verified),
            };
        };

        let receipt = self
            .rpc
            .transaction_receipt(step.chain_id, tx_hash)
            .await
            .map_err(|e| e.classify())?;

        // Live code at the recorded address does not stand in for the receipt
        let Some(receipt) = receipt else {
            return Ok(StepCheck::Invalid {
                reason: format!("transaction {} not found on chain {}", tx_hash, step.chain_id),
            });
        };

        if !receipt.success {
            return Ok(StepCheck::Invalid {
                reason: format!("transaction {} reverted", tx_hash),
            });
        }

        let head = self
            .rpc
            .block_number(step.chain_id)
            .await
            .map_err(|e| e.classify())?;
        let depth = confirmations(head, receipt.block_number);
        if depth < self.required_confirmations {
            return Ok(StepCheck::Pending {
                confirmations: depth,
                required: self.required_confirmations,
            });
        }

        match step.contract_address {
            Some(address) => self.check_code(step, address).await,
            None => Ok(StepCheck::Verified),
        }
    }

    /// Check one step. Unreachable chains report `Pending`, not `Invalid`.
    pub async fn check_step(&self, step: &CompletedStep) -> Result<StepCheck, ClassifiedError> {
        match self.check_inner(step).await {
            Err(e) if e.kind == ErrorKind::NetworkError => {
                debug!(chain_id = step.chain_id, error = %e, "Chain unreachable during verification");
                Ok(StepCheck::Pending {
                    confirmations: 0,
                    required: self.required_confirmations,
                })
            }
            other => other,
        }
    }

    /// Check every completed step of a record
    pub async fn verify(&self, record: &DeploymentRecord) -> Result<VerificationReport, VerifyError> {
        let mut report = VerificationReport::default();
        for (step_id, step) in &record.completed_steps {
            let check = self
                .check_step(step)
                .await
                .map_err(|error| VerifyError::Chain {
                    step_id: step_id.clone(),
                    error,
                })?;
            match check {
                StepCheck::Verified => report.verified.push(step_id.clone()),
                StepCheck::Pending {
                    confirmations,
                    required,
                } => {
                    debug!(step = %step_id, confirmations, required, "Step pending");
                    report.pending.push(step_id.clone());
                }
                StepCheck::Invalid { reason } => {
                    warn!(step = %step_id, reason = %reason, "Recorded step failed verification");
                    report.invalid.push((step_id.clone(), reason));
                }
            }
        }
        invalidate_dependents(&mut report);
        Ok(report)
    }

    /// Re-check pending steps until they settle or the policy runs out.
    /// Steps still pending afterwards stay in `pending`.
    pub async fn await_pending(
        &self,
        record: &DeploymentRecord,
        mut report: VerificationReport,
        policy: &PollPolicy,
    ) -> Result<VerificationReport, ClassifiedError> {
        if report.pending.is_empty() {
            return Ok(report);
        }

        let settled = poll_until(policy, |_| {
            let pending = report.pending.clone();
            async move {
                let mut verified = Vec::new();
                let mut invalid = Vec::new();
                for step_id in &pending {
                    let Some(step) = record.completed_steps.get(step_id) else {
                        continue;
                    };
                    match self.check_step(step).await? {
                        StepCheck::Verified => verified.push(step_id.clone()),
                        StepCheck::Invalid { reason } => invalid.push((step_id.clone(), reason)),
                        StepCheck::Pending { .. } => return Ok(None),
                    }
                }
                Ok(Some((verified, invalid)))
            }
        })
        .await;

        match settled {
            Ok((verified, invalid)) => {
                report.pending.clear();
                report.verified.extend(verified);
                report.invalid.extend(invalid);
                Ok(report)
            }
            Err(crate::poll::PollError::Failed(e)) => Err(e),
            Err(_) => Ok(report),
        }
    }

    /// Verify a record, drop invalid steps, and persist when anything changed
    pub async fn reconcile(
        &self,
        store: &RecordStore,
        record: &mut DeploymentRecord,
    ) -> Result<VerificationReport, VerifyError> {
        let report = self.verify(record).await?;
        let removed = record.remove_steps(&report.invalid_ids());
        if removed > 0 {
            info!(id = %record.id, removed, "Removed steps that failed on-chain verification");
            store.put(record).await?;
        }
        Ok(report)
    }
}

/// Peer and security steps wire up the deployed contracts, so they are
/// redone whenever any deployment step is
fn invalidate_dependents(report: &mut VerificationReport) {
    let redeploying = report.invalid.iter().any(|(id, _)| {
        matches!(
            StepId::from(id.as_str()).action(),
            Some(StepAction::DeploySourceAdapter | StepAction::DeployMirror { .. })
        )
    });
    if !redeploying {
        return;
    }
    for dependent in [StepId::link_peers(), StepId::configure_security()] {
        let id = dependent.as_str();
        let before = report.verified.len() + report.pending.len();
        report.verified.retain(|v| v != id);
        report.pending.retain(|p| p != id);
        if report.verified.len() + report.pending.len() < before {
            report
                .invalid
                .push((id.to_string(), "a linked contract is being redeployed".to_string()));
        }
    }
}
