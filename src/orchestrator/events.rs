//! Progress events streamed while a deployment runs

use alloy::primitives::{Address, B256};
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use serde::Serialize;
use std::time::Duration;

use crate::record::ResultAddresses;
use crate::retry::{ErrorKind, StepFailure};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum StepStatus {
    #[serde(rename_all = "camelCase")]
    InProgress {
        step_id: String,
        position: usize,
        total: usize,
        chain_id: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    AwaitingNetworkSwitch { step_id: String, chain_id: u64 },
    #[serde(rename_all = "camelCase")]
    Retrying {
        step_id: String,
        attempt: u32,
        kind: ErrorKind,
        #[serde(with = "millis")]
        delay: Duration,
    },
    /// `skipped` is set when the step was already complete on chain
    #[serde(rename_all = "camelCase")]
    Completed {
        step_id: String,
        position: usize,
        total: usize,
        skipped: bool,
        tx_hash: Option<B256>,
        contract_address: Option<Address>,
    },
    Failed(StepFailure),
    #[serde(rename_all = "camelCase")]
    DeploymentCompleted {
        id: String,
        result_addresses: ResultAddresses,
    },
    #[serde(rename_all = "camelCase")]
    DeploymentFailed { id: String, failure: StepFailure },
    #[serde(rename_all = "camelCase")]
    Cancelled { id: String, next_step: Option<String> },
}

impl StepStatus {
    /// Whether no further events follow
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::DeploymentCompleted { .. }
                | StepStatus::DeploymentFailed { .. }
                | StepStatus::Cancelled { .. }
        )
    }
}

mod millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(delay: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(delay.as_millis() as u64)
    }
}

/// Sending half of the event stream. Dropped receivers are ignored.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<UnboundedSender<StepStatus>>,
}

impl EventSink {
    pub fn channel() -> (Self, UnboundedReceiver<StepStatus>) {
        let (tx, rx) = unbounded();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that discards everything
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn emit(&self, status: StepStatus) {
        if let Some(tx) = &self.tx {
            let _ = tx.unbounded_send(status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_events_reach_receiver() {
        let (sink, mut rx) = EventSink::channel();
        sink.emit(StepStatus::AwaitingNetworkSwitch {
            step_id: "deploy-mirror-56".to_string(),
            chain_id: 56,
        });
        drop(sink);
        let events: Vec<StepStatus> = rx.by_ref().collect().await;
        assert_eq!(events.len(), 1);
        assert!(!events[0].is_terminal());
    }

    #[test]
    fn test_retrying_serializes_delay_in_millis() {
        let json = serde_json::to_value(StepStatus::Retrying {
            step_id: "link-peers".to_string(),
            attempt: 1,
            kind: ErrorKind::NetworkError,
            delay: Duration::from_secs(2),
        })
        .unwrap();
        assert_eq!(json["event"], "retrying");
        assert_eq!(json["delay"], 2000);
        assert_eq!(json["stepId"], "link-peers");
    }

    #[test]
    fn test_disabled_sink_is_silent() {
        EventSink::disabled().emit(StepStatus::Cancelled {
            id: "0x01".to_string(),
            next_step: None,
        });
    }
}
