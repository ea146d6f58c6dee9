//! Error classification and retry policy for deployment steps
//!
//! Raw failures (RPC errors, wallet errors, revert data) are mapped to an
//! [`ErrorKind`] with a fixed retry verdict. Revert payloads are matched
//! against selectors of known endpoint/OApp errors before falling back to
//! message text.

use alloy::sol_types::{Revert, SolError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::hash::selector;
use crate::poll::Backoff;

/// Error taxonomy driving retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The wallet owner declined the request
    UserRejected,
    /// Not enough native balance for gas
    InsufficientFunds,
    /// RPC unreachable, rate limited, or timed out
    NetworkError,
    /// Node could not estimate gas for the call
    GasEstimationFailed,
    /// Peer missing or not matching on the remote contract
    InvalidPeer,
    /// Send/receive library not set or not registered
    MessageLibraryError,
    /// Verifier list contains duplicates or is unsorted
    DuplicateVerifier,
    /// Any other revert; the reason is carried in the message
    ContractRevert,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::UserRejected => "user_rejected",
            ErrorKind::InsufficientFunds => "insufficient_funds",
            ErrorKind::NetworkError => "network_error",
            ErrorKind::GasEstimationFailed => "gas_estimation_failed",
            ErrorKind::InvalidPeer => "invalid_peer",
            ErrorKind::MessageLibraryError => "message_library_error",
            ErrorKind::DuplicateVerifier => "duplicate_verifier",
            ErrorKind::ContractRevert => "contract_revert",
            ErrorKind::Unknown => "unknown",
        }
    }

    /// Fixed retry verdict for this kind
    pub fn verdict(&self) -> RetryVerdict {
        let exponential = Backoff::Exponential {
            initial: Duration::from_secs(2),
            multiplier: 2.0,
            max: Duration::from_secs(30),
        };
        match self {
            // Retryable by the user re-confirming, never automatically
            ErrorKind::UserRejected => RetryVerdict::manual(),
            ErrorKind::NetworkError => RetryVerdict::automatic(3, exponential),
            ErrorKind::GasEstimationFailed => {
                RetryVerdict::automatic(2, Backoff::Fixed(Duration::from_secs(3)))
            }
            ErrorKind::Unknown => RetryVerdict::automatic(1, exponential),
            ErrorKind::InsufficientFunds
            | ErrorKind::InvalidPeer
            | ErrorKind::MessageLibraryError
            | ErrorKind::DuplicateVerifier
            | ErrorKind::ContractRevert => RetryVerdict::terminal(),
        }
    }

    /// Human-facing next steps
    pub fn recovery_actions(&self) -> Vec<String> {
        let actions: &[&str] = match self {
            ErrorKind::UserRejected => &["Approve the transaction in your wallet and resume"],
            ErrorKind::InsufficientFunds => &[
                "Fund the deployer address with native gas token on the failing chain",
                "Resume the deployment once the balance is confirmed",
            ],
            ErrorKind::NetworkError => &[
                "Check RPC endpoint availability or add a fallback URL",
                "Switch the wallet network manually if prompted",
                "Resume the deployment",
            ],
            ErrorKind::GasEstimationFailed => &[
                "Verify constructor arguments and the target contract state",
                "Resume the deployment",
            ],
            ErrorKind::InvalidPeer => &[
                "Run check-peers to inspect both directions",
                "Re-run link-peers after fixing the remote contract address",
            ],
            ErrorKind::MessageLibraryError => &[
                "Set the send and receive libraries on the endpoint for this remote chain",
                "Re-run configure-security",
            ],
            ErrorKind::DuplicateVerifier => {
                &["Remove duplicate verifier addresses from the security policy"]
            }
            ErrorKind::ContractRevert => &[
                "Inspect the revert reason and contract state",
                "Resume the deployment after correcting the cause",
            ],
            ErrorKind::Unknown => &["Inspect logs for the raw error and resume"],
        };
        actions.iter().map(|s| s.to_string()).collect()
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether and how a kind may be retried
#[derive(Debug, Clone, PartialEq)]
pub struct RetryVerdict {
    /// Whether resuming after this failure can succeed
    pub retryable: bool,
    /// Automatic retries inside one run
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl RetryVerdict {
    fn automatic(max_retries: u32, backoff: Backoff) -> Self {
        Self {
            retryable: true,
            max_retries,
            backoff,
        }
    }

    fn manual() -> Self {
        Self {
            retryable: true,
            max_retries: 0,
            backoff: Backoff::Fixed(Duration::ZERO),
        }
    }

    fn terminal() -> Self {
        Self {
            retryable: false,
            max_retries: 0,
            backoff: Backoff::Fixed(Duration::ZERO),
        }
    }

    /// Check if we should retry based on attempt count (0-indexed failures so far)
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.retryable && attempt < self.max_retries
    }
}

/// A raw failure mapped onto the taxonomy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default)]
    pub detail: Option<String>,
}

impl ClassifiedError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{}: {} ({})", self.kind, self.message, detail),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for ClassifiedError {}

/// Terminal failure of a step, persisted as the record's `lastError`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepFailure {
    pub step_id: String,
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default)]
    pub detail: Option<String>,
    pub recovery_actions: Vec<String>,
    pub attempts: u32,
}

impl StepFailure {
    pub fn from_classified(step_id: &str, error: &ClassifiedError, attempts: u32) -> Self {
        Self {
            step_id: step_id.to_string(),
            kind: error.kind,
            message: error.message.clone(),
            detail: error.detail.clone(),
            recovery_actions: error.kind.recovery_actions(),
            attempts,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.verdict().retryable
    }
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "step {} failed after {} attempt(s): {}: {}",
            self.step_id, self.attempts, self.kind, self.message
        )
    }
}

struct KnownRevert {
    signature: &'static str,
    kind: ErrorKind,
    message: &'static str,
}

const KNOWN_REVERTS: &[KnownRevert] = &[
    KnownRevert {
        signature: "NoPeer(uint32)",
        kind: ErrorKind::InvalidPeer,
        message: "no peer configured for the remote endpoint",
    },
    KnownRevert {
        signature: "OnlyPeer(uint32,bytes32)",
        kind: ErrorKind::InvalidPeer,
        message: "message sender is not the configured peer",
    },
    KnownRevert {
        signature: "LZ_ULN_Unsorted()",
        kind: ErrorKind::DuplicateVerifier,
        message: "verifier list is unsorted or contains duplicates",
    },
    KnownRevert {
        signature: "LZ_DefaultReceiveLibUnavailable()",
        kind: ErrorKind::MessageLibraryError,
        message: "no default receive library for the remote endpoint",
    },
    KnownRevert {
        signature: "LZ_OnlyReceiveLib()",
        kind: ErrorKind::MessageLibraryError,
        message: "library is not a receive library",
    },
    KnownRevert {
        signature: "LZ_OnlyRegisteredOrDefaultLib()",
        kind: ErrorKind::MessageLibraryError,
        message: "library is neither registered nor the default",
    },
    KnownRevert {
        signature: "LZ_OnlyRegisteredLib()",
        kind: ErrorKind::MessageLibraryError,
        message: "library is not registered on the endpoint",
    },
    KnownRevert {
        signature: "LZ_InvalidNonce(uint64)",
        kind: ErrorKind::ContractRevert,
        message: "invalid nonce",
    },
];

/// Classify ABI-encoded revert data
pub fn classify_revert_data(data: &[u8]) -> Option<ClassifiedError> {
    if data.len() < 4 {
        return None;
    }
    let head: [u8; 4] = [data[0], data[1], data[2], data[3]];

    if head == Revert::SELECTOR {
        let reason = Revert::abi_decode(data, true)
            .map(|r| r.reason)
            .unwrap_or_else(|_| "undecodable revert reason".to_string());
        // Error(string) reasons can still name a known condition
        let by_text = classify_text(&reason);
        return Some(match by_text.kind {
            ErrorKind::Unknown => ClassifiedError::new(ErrorKind::ContractRevert, reason),
            _ => by_text,
        });
    }

    let known = KNOWN_REVERTS
        .iter()
        .find(|known| selector(known.signature) == head)?;
    let mut error = ClassifiedError::new(known.kind, known.message);
    error = match known.signature {
        "NoPeer(uint32)" if data.len() >= 36 => {
            let eid = u32::from_be_bytes([data[32], data[33], data[34], data[35]]);
            error.with_detail(format!("eid {}", eid))
        }
        "LZ_InvalidNonce(uint64)" => error.with_detail("stuck in-flight message"),
        _ => error,
    };
    Some(error)
}

/// Classify a raw error message, looking for embedded revert data first
pub fn classify(raw: &str) -> ClassifiedError {
    for candidate in hex_payloads(raw) {
        if let Some(classified) = classify_revert_data(&candidate) {
            return classified;
        }
    }
    classify_text(raw)
}

fn hex_payloads(raw: &str) -> Vec<Vec<u8>> {
    raw.match_indices("0x")
        .filter_map(|(start, _)| {
            let digits: String = raw[start + 2..]
                .chars()
                .take_while(|c| c.is_ascii_hexdigit())
                .collect();
            // Selectors are 4 bytes; addresses (20) and hashes (32) without
            // a selector prefix are filtered out by the lookup.
            if digits.len() < 8 || digits.len() % 2 != 0 {
                return None;
            }
            hex::decode(&digits).ok()
        })
        .collect()
}

fn classify_text(raw: &str) -> ClassifiedError {
    let lower = raw.to_lowercase();
    let message = raw.trim().to_string();

    // Named endpoint/OApp errors surfaced as text by some RPCs
    if lower.contains("nopeer") || lower.contains("onlypeer") || lower.contains("invalid peer") {
        return ClassifiedError::new(ErrorKind::InvalidPeer, message);
    }
    if lower.contains("lz_uln_unsorted")
        || lower.contains("duplicate dvn")
        || lower.contains("duplicate verifier")
    {
        return ClassifiedError::new(ErrorKind::DuplicateVerifier, message);
    }
    if lower.contains("receivelib")
        || lower.contains("registeredlib")
        || lower.contains("registeredordefaultlib")
        || lower.contains("message library")
    {
        return ClassifiedError::new(ErrorKind::MessageLibraryError, message);
    }

    if lower.contains("user rejected")
        || lower.contains("user denied")
        || lower.contains("rejected the request")
        || lower.contains("action_rejected")
        || lower.contains("code: 4001")
        || lower.contains("\"code\":4001")
    {
        return ClassifiedError::new(ErrorKind::UserRejected, message);
    }

    if lower.contains("insufficient funds") || lower.contains("insufficient balance") {
        return ClassifiedError::new(ErrorKind::InsufficientFunds, message);
    }

    if lower.contains("gas required exceeds")
        || lower.contains("cannot estimate gas")
        || lower.contains("unpredictable_gas_limit")
        || lower.contains("gas estimation")
        || lower.contains("intrinsic gas too low")
    {
        return ClassifiedError::new(ErrorKind::GasEstimationFailed, message);
    }

    if lower.contains("timeout")
        || lower.contains("timed out")
        || lower.contains("connection")
        || lower.contains("network")
        || lower.contains("rate limit")
        || lower.contains("too many requests")
        || lower.contains("503")
        || lower.contains("502")
        || lower.contains("temporarily unavailable")
        || lower.contains("failed to fetch")
    {
        return ClassifiedError::new(ErrorKind::NetworkError, message);
    }

    if lower.contains("execution reverted") || lower.contains("reverted") {
        return ClassifiedError::new(ErrorKind::ContractRevert, message);
    }

    ClassifiedError::new(ErrorKind::Unknown, message)
}

/// Outcome of [`with_retry`] when every allowed attempt failed
#[derive(Debug, Clone, PartialEq)]
pub struct RetryExhausted {
    pub error: ClassifiedError,
    pub attempts: u32,
}

/// Run `op` with the retry verdict of whatever kind it fails with.
///
/// `on_retry(attempt, error, delay)` is invoked before each backoff sleep.
pub async fn with_retry<T, F, Fut, R>(
    label: &str,
    mut op: F,
    mut on_retry: R,
) -> Result<T, RetryExhausted>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ClassifiedError>>,
    R: FnMut(u32, &ClassifiedError, Duration),
{
    let mut attempt = 0u32;
    loop {
        match op(attempt).await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(label, attempts = attempt + 1, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) => {
                let verdict = error.kind.verdict();
                if !verdict.should_retry(attempt) {
                    warn!(
                        label,
                        kind = %error.kind,
                        attempts = attempt + 1,
                        error = %error.message,
                        "Operation failed, not retrying"
                    );
                    return Err(RetryExhausted {
                        error,
                        attempts: attempt + 1,
                    });
                }
                let delay = verdict.backoff.delay_for_attempt(attempt);
                debug!(
                    label,
                    kind = %error.kind,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying after classified failure"
                );
                on_retry(attempt + 1, &error, delay);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
