use eyre::{eyre, Result, WrapErr};
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::chain::TxSettings;
use crate::chains::{self, ChainRegistry};
use crate::network_switch::SwitchSettings;
use crate::poll::PollPolicy;
use crate::store::DEFAULT_MAX_RECORDS;

/// Deployer configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub store: StoreConfig,
    pub chains: ChainRegistry,
    /// Not needed for read-only commands
    pub wallet: Option<WalletConfig>,
    pub tx: TxConfig,
    pub switch: SwitchConfig,
    /// Forge output directory (`out/`)
    pub artifacts_dir: PathBuf,
}

/// Record store configuration
#[derive(Clone)]
pub struct StoreConfig {
    pub database_url: String,
    pub backup_dir: Option<PathBuf>,
    pub max_records: usize,
}

/// Custom Debug that redacts the database URL (may contain credentials).
impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("database_url", &"<redacted>")
            .field("backup_dir", &self.backup_dir)
            .field("max_records", &self.max_records)
            .finish()
    }
}

/// Who signs transactions
#[derive(Clone)]
pub enum WalletConfig {
    LocalKey { private_key: String },
    Remote { url: String },
}

/// Custom Debug that redacts the private key to prevent accidental log leakage.
impl fmt::Debug for WalletConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WalletConfig::LocalKey { .. } => f
                .debug_struct("LocalKey")
                .field("private_key", &"<redacted>")
                .finish(),
            WalletConfig::Remote { url } => f.debug_struct("Remote").field("url", url).finish(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TxConfig {
    pub required_confirmations: u64,
    pub tx_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SwitchConfig {
    pub poll_attempts: u32,
    pub poll_interval_ms: u64,
    pub manual_timeout_secs: u64,
    pub manual_poll_interval_ms: u64,
}

/// Default functions
fn default_database_url() -> String {
    "sqlite://deployments.db".to_string()
}

fn default_required_confirmations() -> u64 {
    1
}

fn default_tx_timeout_secs() -> u64 {
    60
}

fn default_switch_poll_attempts() -> u32 {
    10
}

fn default_switch_poll_interval_ms() -> u64 {
    2000
}

fn default_manual_switch_poll_interval_ms() -> u64 {
    1000
}

fn default_manual_switch_timeout_secs() -> u64 {
    120
}

fn default_artifacts_dir() -> PathBuf {
    PathBuf::from("out")
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| eyre!("Invalid {}: {}", name, raw)),
        _ => Ok(default),
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl TxConfig {
    pub fn settings(&self) -> TxSettings {
        TxSettings {
            confirmations: self.required_confirmations,
            receipt_poll: PollPolicy::transaction_confirmation(Duration::from_secs(
                self.tx_timeout_secs,
            )),
        }
    }
}

impl SwitchConfig {
    pub fn settings(&self) -> SwitchSettings {
        let manual_interval = Duration::from_millis(self.manual_poll_interval_ms);
        let manual_timeout = Duration::from_secs(self.manual_timeout_secs);
        let manual_attempts =
            (manual_timeout.as_millis() / manual_interval.as_millis().max(1)).max(1) as u32;
        SwitchSettings {
            poll: PollPolicy::fixed(
                self.poll_attempts,
                Duration::from_millis(self.poll_interval_ms),
            ),
            manual: PollPolicy::fixed(manual_attempts, manual_interval).with_timeout(manual_timeout),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    /// Loads .env file if present, then reads from environment
    pub fn load() -> Result<Self> {
        Self::load_from_file(".env")
    }

    /// Load from a specific .env file path
    pub fn load_from_file(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            dotenvy::from_filename(path)
                .wrap_err_with(|| format!("Failed to load .env file from {}", path))?;
        }
        Self::load_from_env()
    }

    /// Load configuration from environment variables
    pub fn load_from_env() -> Result<Self> {
        let store = StoreConfig {
            database_url: non_empty_var("DEPLOYER_DATABASE_URL").unwrap_or_else(default_database_url),
            backup_dir: non_empty_var("DEPLOYER_BACKUP_DIR").map(PathBuf::from),
            max_records: parse_var("DEPLOYER_MAX_RECORDS", DEFAULT_MAX_RECORDS)?,
        };

        let wallet = match (
            non_empty_var("DEPLOYER_PRIVATE_KEY"),
            non_empty_var("WALLET_RPC_URL"),
        ) {
            (Some(_), Some(_)) => {
                return Err(eyre!(
                    "Set only one of DEPLOYER_PRIVATE_KEY and WALLET_RPC_URL"
                ))
            }
            (Some(private_key), None) => Some(WalletConfig::LocalKey { private_key }),
            (None, Some(url)) => Some(WalletConfig::Remote { url }),
            (None, None) => None,
        };

        let tx = TxConfig {
            required_confirmations: parse_var(
                "REQUIRED_CONFIRMATIONS",
                default_required_confirmations(),
            )?,
            tx_timeout_secs: parse_var("TX_TIMEOUT_SECS", default_tx_timeout_secs())?,
        };

        let switch = SwitchConfig {
            poll_attempts: parse_var("SWITCH_POLL_ATTEMPTS", default_switch_poll_attempts())?,
            poll_interval_ms: parse_var(
                "SWITCH_POLL_INTERVAL_MS",
                default_switch_poll_interval_ms(),
            )?,
            manual_timeout_secs: parse_var(
                "MANUAL_SWITCH_TIMEOUT_SECS",
                default_manual_switch_timeout_secs(),
            )?,
            manual_poll_interval_ms: parse_var(
                "MANUAL_SWITCH_POLL_INTERVAL_MS",
                default_manual_switch_poll_interval_ms(),
            )?,
        };

        let config = Config {
            store,
            chains: chains::load_from_env()?,
            wallet,
            tx,
            switch,
            artifacts_dir: non_empty_var("ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(default_artifacts_dir),
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !self.store.database_url.starts_with("sqlite:") {
            return Err(eyre!("DEPLOYER_DATABASE_URL must be a sqlite: URL"));
        }
        if self.store.max_records == 0 {
            return Err(eyre!("DEPLOYER_MAX_RECORDS must be at least 1"));
        }
        if self.tx.required_confirmations == 0 {
            return Err(eyre!("REQUIRED_CONFIRMATIONS must be at least 1"));
        }
        if self.tx.tx_timeout_secs == 0 {
            return Err(eyre!("TX_TIMEOUT_SECS must be at least 1"));
        }
        if self.switch.poll_attempts == 0 || self.switch.poll_interval_ms == 0 {
            return Err(eyre!("SWITCH_POLL_ATTEMPTS and SWITCH_POLL_INTERVAL_MS must be positive"));
        }
        if self.switch.manual_poll_interval_ms == 0 {
            return Err(eyre!("MANUAL_SWITCH_POLL_INTERVAL_MS must be positive"));
        }

        match &self.wallet {
            Some(WalletConfig::LocalKey { private_key }) => {
                let hex_part = private_key.trim_start_matches("0x");
                if hex_part.len() != 64 || hex::decode(hex_part).is_err() {
                    return Err(eyre!(
                        "DEPLOYER_PRIVATE_KEY must be 32 bytes of hex (0x + 64 hex chars)"
                    ));
                }
            }
            Some(WalletConfig::Remote { url }) => {
                chains::validate_rpc_url(url, "WALLET_RPC_URL")?;
            }
            None => {}
        }

        if !self.chains.is_empty() {
            self.chains.validate()?;
            for chain in self.chains.enabled() {
                for url in &chain.rpc_urls {
                    chains::validate_rpc_url(url, &chain.name)?;
                }
            }
        }
        Ok(())
    }

    /// The wallet, or an error naming what to set
    pub fn require_wallet(&self) -> Result<&WalletConfig> {
        self.wallet
            .as_ref()
            .ok_or_else(|| eyre!("DEPLOYER_PRIVATE_KEY or WALLET_RPC_URL is required"))
    }
}
