//! Network-switch coordination
//!
//! Makes the wallet's active chain match the chain of the next step, in
//! three tiers: ask the wallet to switch, register the chain and ask again
//! once, then hand over to the user and wait for a manual switch.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::chain::{ChainSession, SessionError};
use crate::chains::{ChainDescriptor, ChainRegistry};
use crate::poll::{poll_until, PollPolicy};
use crate::retry::{ClassifiedError, ErrorKind};

/// How the active chain ended up matching the target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchOutcome {
    AlreadyActive,
    Switched,
    /// The chain had to be registered with the wallet first
    SwitchedAfterRegister,
    SwitchedManually,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SwitchError {
    #[error("chain {0} is not in the chain registry")]
    UnregisteredChain(u64),
    #[error("network switch to chain {0} was rejected")]
    Rejected(u64),
    #[error("wallet still on chain {current:?} after waiting for a manual switch to {target}")]
    ManualSwitchTimeout { target: u64, current: Option<u64> },
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl SwitchError {
    pub fn classify(&self) -> ClassifiedError {
        match self {
            SwitchError::Rejected(_) => ClassifiedError::new(ErrorKind::UserRejected, self.to_string()),
            SwitchError::UnregisteredChain(_) => {
                ClassifiedError::new(ErrorKind::NetworkError, self.to_string())
            }
            SwitchError::ManualSwitchTimeout { .. } => {
                ClassifiedError::new(ErrorKind::NetworkError, self.to_string())
                    .with_detail("manual switch timeout")
            }
            SwitchError::Session(e) => e.classify(),
        }
    }
}

/// Receives the hand-over to the user when automatic switching fails
pub trait ManualSwitchNotifier: Send + Sync {
    fn notify(&self, target: &ChainDescriptor, current: Option<u64>, window: Option<Duration>);
}

/// Logs the manual switch request
#[derive(Debug, Default)]
pub struct LogNotifier;

impl ManualSwitchNotifier for LogNotifier {
    fn notify(&self, target: &ChainDescriptor, current: Option<u64>, window: Option<Duration>) {
        warn!(
            target_chain = target.chain_id,
            target_name = %target.name,
            current_chain = ?current,
            window_secs = window.map(|w| w.as_secs()),
            "Switch the wallet network manually to continue"
        );
    }
}

/// Polling bounds for the automatic and manual tiers
#[derive(Debug, Clone)]
pub struct SwitchSettings {
    /// Checks after an automatic switch request
    pub poll: PollPolicy,
    /// Wait window for a manual switch
    pub manual: PollPolicy,
}

impl Default for SwitchSettings {
    fn default() -> Self {
        Self {
            poll: PollPolicy::fixed(10, Duration::from_secs(2)),
            manual: PollPolicy::fixed(120, Duration::from_secs(1))
                .with_timeout(Duration::from_secs(120)),
        }
    }
}

pub struct NetworkSwitchCoordinator {
    session: Arc<dyn ChainSession>,
    registry: Arc<ChainRegistry>,
    settings: SwitchSettings,
    notifier: Arc<dyn ManualSwitchNotifier>,
}

impl NetworkSwitchCoordinator {
    pub fn new(
        session: Arc<dyn ChainSession>,
        registry: Arc<ChainRegistry>,
        settings: SwitchSettings,
    ) -> Self {
        Self {
            session,
            registry,
            settings,
            notifier: Arc::new(LogNotifier),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn ManualSwitchNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Whether the wallet is already on `target`
    pub async fn is_active(&self, target: u64) -> Result<bool, SwitchError> {
        Ok(self.session.current_chain().await? == target)
    }

    /// Make `target` the active chain
    pub async fn ensure_chain(&self, target: u64) -> Result<SwitchOutcome, SwitchError> {
        if self.is_active(target).await? {
            return Ok(SwitchOutcome::AlreadyActive);
        }

        let descriptor = self
            .registry
            .get(target)
            .ok_or(SwitchError::UnregisteredChain(target))?;

        info!(target_chain = target, name = %descriptor.name, "Requesting network switch");
        let mut outcome = SwitchOutcome::Switched;
        let requested = match self.session.request_switch(target).await {
            Ok(()) => true,
            Err(SessionError::UnknownChain(_)) => {
                debug!(target_chain = target, "Wallet does not know chain, registering it");
                outcome = SwitchOutcome::SwitchedAfterRegister;
                match self.session.add_chain(descriptor).await {
                    Ok(()) => self.retry_switch_once(target).await?,
                    Err(SessionError::UserRejected(_)) => return Err(SwitchError::Rejected(target)),
                    Err(e) => {
                        warn!(target_chain = target, error = %e, "Failed to register chain");
                        false
                    }
                }
            }
            Err(SessionError::UserRejected(_)) => return Err(SwitchError::Rejected(target)),
            Err(e) => {
                warn!(target_chain = target, error = %e, "Automatic switch request failed");
                false
            }
        };

        if requested && self.wait_for(target, &self.settings.poll).await {
            info!(target_chain = target, "Network switched");
            return Ok(outcome);
        }

        self.manual_switch(descriptor).await
    }

    async fn retry_switch_once(&self, target: u64) -> Result<bool, SwitchError> {
        match self.session.request_switch(target).await {
            Ok(()) => Ok(true),
            Err(SessionError::UserRejected(_)) => Err(SwitchError::Rejected(target)),
            Err(e) => {
                warn!(target_chain = target, error = %e, "Switch after registration failed");
                Ok(false)
            }
        }
    }

    async fn manual_switch(&self, target: &ChainDescriptor) -> Result<SwitchOutcome, SwitchError> {
        let current = self.session.current_chain().await.ok();
        self.notifier
            .notify(target, current, self.settings.manual.timeout);

        if self.wait_for(target.chain_id, &self.settings.manual).await {
            info!(target_chain = target.chain_id, "Network switched manually");
            return Ok(SwitchOutcome::SwitchedManually);
        }

        Err(SwitchError::ManualSwitchTimeout {
            target: target.chain_id,
            current: self.session.current_chain().await.ok(),
        })
    }

    async fn wait_for(&self, target: u64, policy: &PollPolicy) -> bool {
        let session = &self.session;
        poll_until(policy, |_| async move {
            match session.current_chain().await {
                Ok(current) if current == target => Ok::<_, SessionError>(Some(())),
                _ => Ok(None),
            }
        })
        .await
        .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockChains;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_settings() -> SwitchSettings {
        SwitchSettings {
            poll: PollPolicy::fixed(3, Duration::from_millis(1)),
            manual: PollPolicy::fixed(5, Duration::from_millis(1)),
        }
    }

    fn coordinator(chains: &Arc<MockChains>) -> NetworkSwitchCoordinator {
        NetworkSwitchCoordinator::new(chains.clone(), chains.registry(), fast_settings())
    }

    #[derive(Default)]
    struct CountingNotifier(AtomicU32);

    impl ManualSwitchNotifier for CountingNotifier {
        fn notify(&self, _: &ChainDescriptor, _: Option<u64>, _: Option<Duration>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_already_active_is_noop() {
        let chains = Arc::new(MockChains::new(&[1, 56]));
        let outcome = coordinator(&chains).ensure_chain(1).await.unwrap();
        assert_eq!(outcome, SwitchOutcome::AlreadyActive);
        assert_eq!(chains.switch_requests(), 0);
    }

    #[tokio::test]
    async fn test_automatic_switch() {
        let chains = Arc::new(MockChains::new(&[1, 56]));
        let outcome = coordinator(&chains).ensure_chain(56).await.unwrap();
        assert_eq!(outcome, SwitchOutcome::Switched);
        assert_eq!(chains.active_chain(), 56);
    }

    #[tokio::test]
    async fn test_unknown_chain_is_registered_then_retried() {
        let chains = Arc::new(MockChains::new(&[1, 56]));
        chains.forget_wallet_chain(56);
        let outcome = coordinator(&chains).ensure_chain(56).await.unwrap();
        assert_eq!(outcome, SwitchOutcome::SwitchedAfterRegister);
        assert_eq!(chains.switch_requests(), 2);
    }

    #[tokio::test]
    async fn test_manual_switch_timeout() {
        let chains = Arc::new(MockChains::new(&[1, 56]));
        chains.ignore_switch_requests(true);
        let notifier = Arc::new(CountingNotifier::default());
        let result = coordinator(&chains)
            .with_notifier(notifier.clone())
            .ensure_chain(56)
            .await;
        assert_eq!(
            result,
            Err(SwitchError::ManualSwitchTimeout {
                target: 56,
                current: Some(1)
            })
        );
        assert_eq!(notifier.0.load(Ordering::SeqCst), 1);
        assert_eq!(
            result.unwrap_err().classify().kind,
            ErrorKind::NetworkError
        );
    }

    #[tokio::test]
    async fn test_rejected_switch() {
        let chains = Arc::new(MockChains::new(&[1, 56]));
        chains.reject_switch_requests(true);
        let result = coordinator(&chains).ensure_chain(56).await;
        assert_eq!(result, Err(SwitchError::Rejected(56)));
    }

    #[tokio::test]
    async fn test_unregistered_target() {
        let chains = Arc::new(MockChains::new(&[1]));
        let result = coordinator(&chains).ensure_chain(999).await;
        assert_eq!(result, Err(SwitchError::UnregisteredChain(999)));
    }
}
