//! Bridge Deployer: resumable cross-chain OFT bridge deployment
//!
//! Deploys an adapter (wrapping an existing token) or a fresh collection of
//! mint/burn mirrors across EVM chains, links every contract pair as peers
//! and applies a verifier/executor security policy to every channel. Each
//! completed step is recorded with on-chain evidence so an interrupted
//! deployment resumes exactly where it stopped.
//!
//! - **Records** - Deployment requests, ids, step plans and persisted state
//! - **Store** - SQLite / in-memory record storage, backups, snapshots
//! - **Chain** - RPC and wallet abstractions, network switching, verification
//! - **Wiring** - Peer linking and security-channel configuration
//! - **Orchestrator** - Step execution with classified retries and events
//!
//! ## Feature Flags
//!
//! - `test-utils` - Expose the in-process mock chains to integration tests

// Records and planning
pub mod hash;
pub mod record;
pub mod steps;

// Persistence
pub mod snapshot;
pub mod store;

// Chain access
pub mod builder;
pub mod chain;
pub mod chains;
pub mod network_switch;
pub mod poll;
pub mod retry;
pub mod verifier;

// Wiring
pub mod peers;
pub mod security;

// Execution
pub mod config;
pub mod deployer;
pub mod orchestrator;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use deployer::{DeploymentHandle, Deployer};
pub use hash::deployment_id;
pub use orchestrator::{DeployFailure, DeploymentProgress, StepStatus};
pub use record::{DeploymentConfig, DeploymentKind, DeploymentRecord, DeploymentRequest};
pub use retry::{ClassifiedError, ErrorKind, StepFailure};
pub use security::SecurityPolicy;
pub use snapshot::{ImportReport, Snapshot};
