//! End-to-end deployment flows against in-process mock chains
//!
//! Run with: cargo test --features test-utils --test deployment_flow

use alloy::primitives::{Address, U256};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;

use bridge_deployer::chain::SessionError;
use bridge_deployer::orchestrator::OrchestratorSettings;
use bridge_deployer::peers::{ContractPair, ContractRef};
use bridge_deployer::poll::PollPolicy;
use bridge_deployer::record::DeploymentState;
use bridge_deployer::store::RecordStore;
use bridge_deployer::testing::{MockChains, StaticBuilder};
use bridge_deployer::{
    DeployFailure, Deployer, DeploymentConfig, DeploymentRequest, ErrorKind, SecurityPolicy,
    StepStatus,
};

async fn deployer(mock: &Arc<MockChains>, store: RecordStore) -> Deployer {
    Deployer::new(
        mock.access(),
        store,
        Arc::new(StaticBuilder),
        OrchestratorSettings {
            pending_wait: PollPolicy::fixed(3, Duration::from_millis(1)),
            check_balances: true,
        },
    )
}

fn adapter_request(token: Address, security: Option<SecurityPolicy>) -> DeploymentRequest {
    DeploymentRequest {
        requester: Address::repeat_byte(0x42),
        config: DeploymentConfig::Adapter {
            source_chain: 1,
            token,
            destination_chains: vec![56, 137],
            name: "Bridged Token".to_string(),
            symbol: "bTKN".to_string(),
        },
        security,
    }
}

fn policy(confirmations: u64) -> SecurityPolicy {
    SecurityPolicy {
        confirmations,
        required_verifiers: vec![Address::repeat_byte(0xd2), Address::repeat_byte(0xd1)],
        optional_verifiers: vec![],
        optional_threshold: 0,
        executor: None,
        overwrite_existing: false,
    }
}

fn executed(events: &[StepStatus]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            StepStatus::Completed {
                step_id,
                skipped: false,
                ..
            } => Some(step_id.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_adapter_with_security_end_to_end() {
    let mock = Arc::new(MockChains::new(&[1, 56, 137]));
    let token = mock.install_token(1, "TKN", 18);
    let deployer = deployer(&mock, RecordStore::in_memory().await.unwrap()).await;

    let handle = deployer
        .start_deployment(adapter_request(token, Some(policy(15))))
        .unwrap();
    let (events, _cancel, task) = handle.into_parts();
    let events: Vec<StepStatus> = events.collect().await;
    let record = task.await.unwrap().unwrap();

    assert_eq!(record.status, DeploymentState::Completed);
    assert_eq!(executed(&events).len(), 6);
    assert_eq!(executed(&events).last().unwrap(), "configure-security");

    let source = ContractRef::new(1, record.result_addresses.source.unwrap());
    for (&chain_id, &mirror) in &record.result_addresses.mirrors {
        let pair = ContractPair::new(source, ContractRef::new(chain_id, mirror));
        assert!(deployer.check_peer_link(&pair).await.unwrap().is_linked());
        let report = deployer.check_security_channel_match(&pair).await.unwrap();
        assert!(report.matches(), "{:?}", report);
    }
}

#[tokio::test]
async fn test_rejection_then_resume_completes_remaining_steps() {
    let mock = Arc::new(MockChains::new(&[1, 56, 137]));
    let token = mock.install_token(1, "TKN", 18);
    let store = RecordStore::in_memory().await.unwrap();
    let deployer = deployer(&mock, store).await;
    let request = adapter_request(token, None);

    mock.fail_transaction_at(
        2,
        SessionError::UserRejected("User denied transaction signature".to_string()),
    );
    let failed = deployer
        .start_deployment(request.clone())
        .unwrap()
        .join()
        .await
        .unwrap_err();
    let DeployFailure::Step(failure) = failed else {
        panic!("expected a step failure");
    };
    assert_eq!(failure.kind, ErrorKind::UserRejected);
    assert!(!failure.recovery_actions.is_empty());
    let sent_before = mock.sent_transactions().len();

    let id = bridge_deployer::deployment_id(&request).unwrap();
    let progress = deployer.get_progress(&id).await.unwrap().unwrap();
    assert_eq!(progress.completed_steps, 3);
    assert!(progress.can_resume);

    let handle = deployer.start_deployment(request).unwrap();
    let (events, _cancel, task) = handle.into_parts();
    let events: Vec<StepStatus> = events.collect().await;
    task.await.unwrap().unwrap();

    assert_eq!(executed(&events), vec!["deploy-mirror-137", "link-peers"]);
    // One mirror deploy plus setPeer for the directions not yet linked
    assert!(mock.sent_transactions().len() > sent_before + 1);
}

#[tokio::test]
async fn test_policy_added_later_resumes_same_record() {
    let mock = Arc::new(MockChains::new(&[1, 56, 137]));
    let token = mock.install_token(1, "TKN", 18);
    let deployer = deployer(&mock, RecordStore::in_memory().await.unwrap()).await;

    let first = deployer
        .start_deployment(adapter_request(token, None))
        .unwrap()
        .join()
        .await
        .unwrap();
    let second = deployer
        .start_deployment(adapter_request(token, Some(policy(20))))
        .unwrap()
        .join()
        .await
        .unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(first.result_addresses, second.result_addresses);
    assert!(second.completed_steps.contains_key("configure-security"));
}

#[tokio::test]
async fn test_missing_token_is_terminal() {
    let mock = Arc::new(MockChains::new(&[1, 56]));
    let deployer = deployer(&mock, RecordStore::in_memory().await.unwrap()).await;
    let mut request = adapter_request(Address::repeat_byte(0x99), None);
    request.config = DeploymentConfig::Adapter {
        source_chain: 1,
        token: Address::repeat_byte(0x99),
        destination_chains: vec![56],
        name: "Bridged Token".to_string(),
        symbol: "bTKN".to_string(),
    };

    let failure = deployer
        .start_deployment(request)
        .unwrap()
        .join()
        .await
        .unwrap_err();
    let step = failure.step_failure().unwrap();
    assert_eq!(step.step_id, "verify-source-contract");
    assert_eq!(step.kind, ErrorKind::ContractRevert);
    assert!(mock.sent_transactions().is_empty());
}

#[tokio::test]
async fn test_unfunded_destination_fails_before_sending() {
    let mock = Arc::new(MockChains::new(&[1, 56]));
    let token = mock.install_token(1, "TKN", 18);
    mock.set_balance(56, mock.account(), U256::ZERO);
    let deployer = deployer(&mock, RecordStore::in_memory().await.unwrap()).await;
    let mut request = adapter_request(token, None);
    request.config = DeploymentConfig::Adapter {
        source_chain: 1,
        token,
        destination_chains: vec![56],
        name: "Bridged Token".to_string(),
        symbol: "bTKN".to_string(),
    };

    let failure = deployer
        .start_deployment(request)
        .unwrap()
        .join()
        .await
        .unwrap_err();
    let step = failure.step_failure().unwrap();
    assert_eq!(step.kind, ErrorKind::InsufficientFunds);
    assert_eq!(step.step_id, "deploy-mirror-56");
    assert!(mock
        .sent_transactions()
        .iter()
        .all(|tx| tx.chain_id != 56));
}

#[tokio::test(start_paused = true)]
async fn test_lagging_rpc_does_not_duplicate_deploy() {
    let mock = Arc::new(MockChains::new(&[1, 56]));
    let deployer = deployer(&mock, RecordStore::in_memory().await.unwrap()).await;
    // The first deploy is mined at once but the node only reports it later
    mock.lag_receipts(1, 3);

    let request = DeploymentRequest {
        requester: Address::repeat_byte(0x43),
        config: DeploymentConfig::NewCollection {
            chains: vec![1, 56],
            name: "Mirror".to_string(),
            symbol: "MIR".to_string(),
        },
        security: None,
    };
    let handle = deployer.start_deployment(request).unwrap();
    let (events, _cancel, task) = handle.into_parts();
    let events: Vec<StepStatus> = events.collect().await;
    let record = task.await.unwrap().unwrap();

    assert_eq!(record.status, DeploymentState::Completed);
    assert!(events
        .iter()
        .any(|e| matches!(e, StepStatus::Retrying { step_id, .. } if step_id == "deploy-mirror-1")));
    let deploys_on_source = mock
        .sent_transactions()
        .iter()
        .filter(|tx| tx.chain_id == 1 && tx.to.is_none())
        .count();
    assert_eq!(deploys_on_source, 1);
}
