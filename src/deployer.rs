//! Public facade over the orchestrator, store and chain checks
//!
//! One worker task per running deployment. A deployment id can only be
//! owned by one worker at a time; starting it again or deleting it while
//! it runs is refused.

use eyre::{Result, WrapErr};
use futures::channel::mpsc::UnboundedReceiver;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::builder::{ArtifactBuilder, ContractBuilder};
use crate::chain::local::LocalKeySession;
use crate::chain::remote::RemoteWalletSession;
use crate::chain::rpc::EvmRpc;
use crate::chain::{ChainAccess, ChainSession};
use crate::config::{Config, StoreConfig, WalletConfig};
use crate::network_switch::NetworkSwitchCoordinator;
use crate::orchestrator::{
    DeployFailure, DeploymentProgress, EventSink, Orchestrator, OrchestratorSettings, StepStatus,
};
use crate::peers::{ContractPair, PeerLinkReport, PeerLinker};
use crate::record::{DeploymentRecord, DeploymentRequest};
use crate::retry::ClassifiedError;
use crate::security::{ChannelMatchReport, SecurityConfigurator};
use crate::snapshot::{self, ImportReport, Snapshot};
use crate::store::{FileBackup, RecordStore, SqliteBackend, StoreResult};

pub type DeploymentResult = Result<DeploymentRecord, DeployFailure>;

/// A running deployment
pub struct DeploymentHandle {
    pub id: String,
    events: UnboundedReceiver<StepStatus>,
    cancel: watch::Sender<bool>,
    task: JoinHandle<DeploymentResult>,
}

impl DeploymentHandle {
    /// Stop before the next step starts. The step in flight finishes.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    pub fn events(&mut self) -> &mut UnboundedReceiver<StepStatus> {
        &mut self.events
    }

    /// Wait for the worker, discarding unread events
    pub async fn join(self) -> DeploymentResult {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(DeployFailure::InvalidRequest(format!(
                "deployment worker panicked: {}",
                e
            ))),
        }
    }

    /// Split into the event stream and the worker. Dropping the cancel side
    /// leaves the deployment running to the end.
    pub fn into_parts(
        self,
    ) -> (
        UnboundedReceiver<StepStatus>,
        watch::Sender<bool>,
        JoinHandle<DeploymentResult>,
    ) {
        (self.events, self.cancel, self.task)
    }
}

/// Removes the id from the running set when the worker ends
struct RunningGuard {
    running: Arc<Mutex<HashSet<String>>>,
    id: String,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        lock(&self.running).remove(&self.id);
    }
}

fn lock(running: &Mutex<HashSet<String>>) -> std::sync::MutexGuard<'_, HashSet<String>> {
    running.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct Deployer {
    orchestrator: Arc<Orchestrator>,
    running: Arc<Mutex<HashSet<String>>>,
}

impl Deployer {
    pub fn new(
        chains: Arc<ChainAccess>,
        store: RecordStore,
        builder: Arc<dyn ContractBuilder>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            orchestrator: Arc::new(Orchestrator::new(chains, store, builder, settings)),
            running: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Wire store, RPC, wallet and artifacts from configuration
    pub async fn from_config(config: &Config) -> Result<Self> {
        config.chains.validate()?;
        let store = open_store(&config.store).await?;
        let registry = Arc::new(config.chains.clone());

        let rpc = Arc::new(EvmRpc::new(&registry)?);
        let session: Arc<dyn ChainSession> = match config.require_wallet()? {
            WalletConfig::LocalKey { private_key } => {
                let initial = registry.chain_ids().first().copied().unwrap_or_default();
                Arc::new(LocalKeySession::new(private_key, &registry, initial)?)
            }
            WalletConfig::Remote { url } => Arc::new(RemoteWalletSession::new(url)?),
        };

        let switcher =
            NetworkSwitchCoordinator::new(session.clone(), registry.clone(), config.switch.settings());
        let chains = Arc::new(ChainAccess::new(
            rpc,
            session,
            registry,
            switcher,
            config.tx.settings(),
        ));
        let builder = Arc::new(ArtifactBuilder::new(&config.artifacts_dir));

        info!(
            chains = config.chains.chain_ids().len(),
            confirmations = config.tx.required_confirmations,
            "Deployer initialized"
        );
        Ok(Self::new(chains, store, builder, OrchestratorSettings::default()))
    }

    pub fn store(&self) -> &RecordStore {
        self.orchestrator.store()
    }

    pub fn is_running(&self, id: &str) -> bool {
        lock(&self.running).contains(id)
    }

    /// Validate the request and spawn its worker.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start_deployment(&self, request: DeploymentRequest) -> Result<DeploymentHandle, DeployFailure> {
        let id = self.orchestrator.prepare(&request)?;
        if !lock(&self.running).insert(id.clone()) {
            return Err(DeployFailure::AlreadyRunning(id));
        }
        let guard = RunningGuard {
            running: self.running.clone(),
            id: id.clone(),
        };

        let (sink, events) = EventSink::channel();
        let (cancel, cancel_rx) = watch::channel(false);
        let orchestrator = self.orchestrator.clone();
        let task = tokio::spawn(async move {
            let _guard = guard;
            orchestrator.run(request, sink, cancel_rx).await
        });

        Ok(DeploymentHandle {
            id,
            events,
            cancel,
            task,
        })
    }

    /// Resume summary of a stored deployment
    pub async fn get_progress(&self, id: &str) -> StoreResult<Option<DeploymentProgress>> {
        let record = self.store().get(id).await?;
        Ok(record.map(|r| DeploymentProgress::from_record(&r, self.is_running(id))))
    }

    /// Progress of every stored deployment, newest first
    pub async fn list(&self) -> StoreResult<Vec<DeploymentProgress>> {
        let records = self.store().list_all().await?;
        Ok(records
            .iter()
            .map(|r| DeploymentProgress::from_record(r, self.is_running(&r.id)))
            .collect())
    }

    /// Remove a record. Refused while its worker runs.
    pub async fn delete(&self, id: &str) -> Result<bool, DeployFailure> {
        if self.is_running(id) {
            return Err(DeployFailure::AlreadyRunning(id.to_string()));
        }
        let removed = self.store().remove(id).await?;
        if removed {
            warn!(id, "Deployment record deleted");
        }
        Ok(removed)
    }

    pub async fn export_all(&self) -> StoreResult<Snapshot> {
        snapshot::export_all(self.store()).await
    }

    pub async fn import_all(&self, snapshot: &Snapshot) -> StoreResult<ImportReport> {
        snapshot::import_all(self.store(), snapshot).await
    }

    pub async fn check_peer_link(&self, pair: &ContractPair) -> Result<PeerLinkReport, ClassifiedError> {
        PeerLinker::new(self.orchestrator.chains().clone())
            .check(pair)
            .await
    }

    pub async fn check_security_channel_match(
        &self,
        pair: &ContractPair,
    ) -> Result<ChannelMatchReport, ClassifiedError> {
        SecurityConfigurator::new(self.orchestrator.chains().clone())
            .check_match(pair)
            .await
    }
}

/// Open the SQLite store with its retention cap and optional file backup
pub async fn open_store(config: &StoreConfig) -> Result<RecordStore> {
    let backend = SqliteBackend::new(&config.database_url)
        .wrap_err("Invalid DEPLOYER_DATABASE_URL")?;
    let mut store = RecordStore::new(Arc::new(backend)).with_max_records(config.max_records);
    if let Some(dir) = &config.backup_dir {
        store = store.with_backup(Arc::new(FileBackup::new(dir)));
    }
    store
        .open()
        .await
        .wrap_err("Failed to open deployment record store")?;
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peers::ContractRef;
    use crate::poll::PollPolicy;
    use crate::record::DeploymentConfig;
    use crate::record::DeploymentState;
    use crate::testing::{MockChains, StaticBuilder};
    use alloy::primitives::Address;
    use futures::StreamExt;
    use std::time::Duration;

    async fn deployer(mock: &Arc<MockChains>) -> Deployer {
        Deployer::new(
            mock.access(),
            RecordStore::in_memory().await.unwrap(),
            Arc::new(StaticBuilder),
            OrchestratorSettings {
                pending_wait: PollPolicy::fixed(3, Duration::from_millis(1)),
                check_balances: true,
            },
        )
    }

    fn request() -> DeploymentRequest {
        DeploymentRequest {
            requester: Address::repeat_byte(0x10),
            config: DeploymentConfig::NewCollection {
                chains: vec![1, 56],
                name: "Mirror".to_string(),
                symbol: "MIR".to_string(),
            },
            security: None,
        }
    }

    #[tokio::test]
    async fn test_start_deployment_streams_until_terminal() {
        let mock = Arc::new(MockChains::new(&[1, 56]));
        let deployer = deployer(&mock).await;
        let handle = deployer.start_deployment(request()).unwrap();
        let id = handle.id.clone();
        let (events, _cancel, task) = handle.into_parts();

        let events: Vec<StepStatus> = events.collect().await;
        let record = task.await.unwrap().unwrap();
        assert_eq!(record.id, id);
        assert!(events.last().unwrap().is_terminal());
        assert!(!deployer.is_running(&id));

        let progress = deployer.get_progress(&id).await.unwrap().unwrap();
        assert_eq!(progress.status, DeploymentState::Completed);
        assert_eq!(progress.completed_steps, progress.total_steps);
        assert!(!progress.can_resume);
    }

    #[tokio::test]
    async fn test_same_id_cannot_run_twice() {
        let mock = Arc::new(MockChains::new(&[1, 56]));
        let deployer = deployer(&mock).await;
        let first = deployer.start_deployment(request()).unwrap();
        assert!(deployer.is_running(&first.id));

        assert!(matches!(
            deployer.start_deployment(request()),
            Err(DeployFailure::AlreadyRunning(_))
        ));
        assert!(matches!(
            deployer.delete(&first.id).await,
            Err(DeployFailure::AlreadyRunning(_))
        ));

        let id = first.id.clone();
        first.join().await.unwrap();
        assert!(!deployer.is_running(&id));
        assert!(deployer.delete(&id).await.unwrap());
        assert!(deployer.get_progress(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalid_request_not_started() {
        let mock = Arc::new(MockChains::new(&[1, 56]));
        let deployer = deployer(&mock).await;
        let mut bad = request();
        bad.config = DeploymentConfig::NewCollection {
            chains: vec![1],
            name: "Mirror".to_string(),
            symbol: "MIR".to_string(),
        };
        assert!(matches!(
            deployer.start_deployment(bad),
            Err(DeployFailure::InvalidRequest(_))
        ));
        assert!(deployer.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_checks_after_deployment() {
        let mock = Arc::new(MockChains::new(&[1, 56]));
        let deployer = deployer(&mock).await;
        let record = deployer
            .start_deployment(request())
            .unwrap()
            .join()
            .await
            .unwrap();

        let pair = ContractPair::new(
            ContractRef::new(1, record.result_addresses.mirrors[&1]),
            ContractRef::new(56, record.result_addresses.mirrors[&56]),
        );
        let report = deployer.check_peer_link(&pair).await.unwrap();
        assert!(report.is_linked());

        let unlinked = ContractPair::new(
            ContractRef::new(1, mock.install_oapp(1)),
            ContractRef::new(56, mock.install_oapp(56)),
        );
        assert!(!deployer.check_peer_link(&unlinked).await.unwrap().is_linked());
    }

    #[tokio::test]
    async fn test_export_import_between_deployers() {
        let mock = Arc::new(MockChains::new(&[1, 56]));
        let source = deployer(&mock).await;
        source
            .start_deployment(request())
            .unwrap()
            .join()
            .await
            .unwrap();
        let snapshot = source.export_all().await.unwrap();
        assert_eq!(snapshot.count, 1);

        let target = deployer(&mock).await;
        let report = target.import_all(&snapshot).await.unwrap();
        assert_eq!(report.imported, 1);
        let again = target.import_all(&snapshot).await.unwrap();
        assert_eq!((again.imported, again.skipped), (0, 1));
        assert_eq!(target.list().await.unwrap().len(), 1);
    }
}
