//! Chain registry: which networks the deployer can reach and how
//!
//! # Environment Variable Schema
//!
//! ```text
//! DEPLOY_CHAINS_COUNT=2
//! DEPLOY_CHAIN_1_CHAIN_ID=56                       # native EVM chain id
//! DEPLOY_CHAIN_1_RPC_URL=https://a.example,https://b.example
//! DEPLOY_CHAIN_1_NAME=bsc                          # optional, known chains have defaults
//! DEPLOY_CHAIN_1_EID=30102                         # optional for known chains
//! DEPLOY_CHAIN_1_ENDPOINT_ADDRESS=0x...            # optional for known chains
//! DEPLOY_CHAIN_1_EXECUTOR_ADDRESS=0x...            # optional
//! DEPLOY_CHAIN_1_NATIVE_SYMBOL=BNB                 # optional
//! DEPLOY_CHAIN_1_ENABLED=true                      # optional, default true
//! ```

use alloy::primitives::{address, Address};
use eyre::{eyre, Result};
use std::collections::{HashMap, HashSet};

/// LayerZero v2 EndpointV2 address shared by all mainnets
pub const MAINNET_ENDPOINT: Address = address!("1a44076050125825900e736c501f859c50fE728c");
/// LayerZero v2 EndpointV2 address shared by all testnets
pub const TESTNET_ENDPOINT: Address = address!("6EDCE65403992e310A62460808c4b910D972f10f");

/// Static defaults for a well-known network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnownChain {
    pub chain_id: u64,
    pub name: &'static str,
    pub eid: u32,
    pub endpoint: Address,
    pub native_symbol: &'static str,
}

const fn known(
    chain_id: u64,
    name: &'static str,
    eid: u32,
    endpoint: Address,
    native_symbol: &'static str,
) -> KnownChain {
    KnownChain {
        chain_id,
        name,
        eid,
        endpoint,
        native_symbol,
    }
}

const KNOWN_CHAINS: &[KnownChain] = &[
    known(1, "ethereum", 30101, MAINNET_ENDPOINT, "ETH"),
    known(56, "bsc", 30102, MAINNET_ENDPOINT, "BNB"),
    known(43114, "avalanche", 30106, MAINNET_ENDPOINT, "AVAX"),
    known(137, "polygon", 30109, MAINNET_ENDPOINT, "POL"),
    known(42161, "arbitrum", 30110, MAINNET_ENDPOINT, "ETH"),
    known(10, "optimism", 30111, MAINNET_ENDPOINT, "ETH"),
    known(8453, "base", 30184, MAINNET_ENDPOINT, "ETH"),
    known(11155111, "sepolia", 40161, TESTNET_ENDPOINT, "ETH"),
    known(421614, "arbitrum-sepolia", 40231, TESTNET_ENDPOINT, "ETH"),
    known(84532, "base-sepolia", 40245, TESTNET_ENDPOINT, "ETH"),
    known(97, "bsc-testnet", 40102, TESTNET_ENDPOINT, "tBNB"),
    known(43113, "avalanche-fuji", 40106, TESTNET_ENDPOINT, "AVAX"),
];

/// Look up defaults for a native chain id
pub fn known_chain(chain_id: u64) -> Option<&'static KnownChain> {
    KNOWN_CHAINS.iter().find(|c| c.chain_id == chain_id)
}

/// Validates that a URL uses http/https and has a host component.
pub fn validate_rpc_url(url_str: &str, name: &str) -> Result<()> {
    let parsed =
        url::Url::parse(url_str).map_err(|e| eyre!("{} must be a valid URL: {}", name, e))?;

    let scheme = parsed.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(eyre!(
            "{} must use http:// or https:// scheme, got {}",
            name,
            scheme
        ));
    }

    if parsed.host_str().is_none() {
        return Err(eyre!("{} must have a host component", name));
    }

    Ok(())
}

/// Parse a comma-separated RPC URL string into individual trimmed URLs.
pub fn parse_rpc_urls(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Everything needed to talk to one network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainDescriptor {
    pub name: String,
    /// Native EVM chain id
    pub chain_id: u64,
    /// LayerZero endpoint id
    pub eid: u32,
    /// Primary RPC first, fallbacks after
    pub rpc_urls: Vec<String>,
    /// EndpointV2 contract
    pub endpoint: Address,
    /// Default executor for the send direction
    pub executor: Option<Address>,
    pub native_symbol: String,
    pub enabled: bool,
}

impl ChainDescriptor {
    /// Build a descriptor from the known-chain table
    pub fn from_known(chain_id: u64, rpc_urls: Vec<String>) -> Option<Self> {
        known_chain(chain_id).map(|k| Self {
            name: k.name.to_string(),
            chain_id,
            eid: k.eid,
            rpc_urls,
            endpoint: k.endpoint,
            executor: None,
            native_symbol: k.native_symbol.to_string(),
            enabled: true,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.rpc_urls.is_empty() {
            return Err(eyre!("RPC URL is empty for chain {}", self.name));
        }
        for url in &self.rpc_urls {
            validate_rpc_url(url, &format!("{}_RPC_URL", self.name))?;
        }
        if self.eid == 0 {
            return Err(eyre!(
                "Endpoint id is 0 for chain {}, this is likely a configuration error",
                self.name
            ));
        }
        if self.endpoint == Address::ZERO {
            return Err(eyre!("Endpoint address is zero for chain {}", self.name));
        }
        Ok(())
    }
}

/// Registry of reachable chains with lookup by chain id or endpoint id
#[derive(Debug, Clone, Default)]
pub struct ChainRegistry {
    chains: Vec<ChainDescriptor>,
    by_chain_id: HashMap<u64, usize>,
    by_eid: HashMap<u32, usize>,
}

impl ChainRegistry {
    pub fn new(chains: Vec<ChainDescriptor>) -> Result<Self> {
        let mut seen_ids = HashSet::new();
        let mut seen_eids = HashSet::new();
        for chain in &chains {
            if !seen_ids.insert(chain.chain_id) {
                return Err(eyre!(
                    "Duplicate chain ID: {} (chain: {})",
                    chain.chain_id,
                    chain.name
                ));
            }
            if !seen_eids.insert(chain.eid) {
                return Err(eyre!(
                    "Duplicate endpoint id: {} (chain: {})",
                    chain.eid,
                    chain.name
                ));
            }
        }

        let by_chain_id = chains
            .iter()
            .enumerate()
            .map(|(i, c)| (c.chain_id, i))
            .collect();
        let by_eid = chains.iter().enumerate().map(|(i, c)| (c.eid, i)).collect();

        Ok(Self {
            chains,
            by_chain_id,
            by_eid,
        })
    }

    /// Get an enabled chain by native chain id
    pub fn get(&self, chain_id: u64) -> Option<&ChainDescriptor> {
        self.by_chain_id
            .get(&chain_id)
            .map(|&i| &self.chains[i])
            .filter(|c| c.enabled)
    }

    pub fn require(&self, chain_id: u64) -> Result<&ChainDescriptor> {
        self.get(chain_id)
            .ok_or_else(|| eyre!("Chain {} is not configured or disabled", chain_id))
    }

    pub fn get_by_eid(&self, eid: u32) -> Option<&ChainDescriptor> {
        self.by_eid
            .get(&eid)
            .map(|&i| &self.chains[i])
            .filter(|c| c.enabled)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &ChainDescriptor> {
        self.chains.iter().filter(|c| c.enabled)
    }

    pub fn chain_ids(&self) -> Vec<u64> {
        self.enabled().map(|c| c.chain_id).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.enabled().next().is_none()
    }

    pub fn validate(&self) -> Result<()> {
        if self.is_empty() {
            return Err(eyre!("At least one chain must be configured"));
        }
        for chain in self.enabled() {
            chain.validate()?;
        }
        Ok(())
    }
}

fn parse_address_var(var: &str) -> Result<Option<Address>> {
    match std::env::var(var) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| eyre!("Invalid {}: {}", var, e)),
        _ => Ok(None),
    }
}

/// Load the chain registry from `DEPLOY_CHAIN_{N}_*` variables.
///
/// Chains from the known table only need `CHAIN_ID` and `RPC_URL`; anything
/// else must set `EID` and `ENDPOINT_ADDRESS` explicitly.
pub fn load_from_env() -> Result<ChainRegistry> {
    let count: usize = match std::env::var("DEPLOY_CHAINS_COUNT") {
        Ok(s) => s
            .parse()
            .map_err(|_| eyre!("Invalid DEPLOY_CHAINS_COUNT, must be a number"))?,
        Err(_) => 0,
    };

    let mut chains = Vec::with_capacity(count);
    for i in 1..=count {
        let prefix = format!("DEPLOY_CHAIN_{}", i);

        let chain_id: u64 = std::env::var(format!("{}_CHAIN_ID", prefix))
            .map_err(|_| eyre!("Missing {}_CHAIN_ID", prefix))?
            .parse()
            .map_err(|_| eyre!("Invalid {}_CHAIN_ID, must be a u64", prefix))?;
        let known = known_chain(chain_id);

        let rpc_urls = parse_rpc_urls(
            &std::env::var(format!("{}_RPC_URL", prefix))
                .map_err(|_| eyre!("Missing {}_RPC_URL", prefix))?,
        );

        let name = std::env::var(format!("{}_NAME", prefix))
            .ok()
            .or_else(|| known.map(|k| k.name.to_string()))
            .unwrap_or_else(|| format!("chain_{}", chain_id));

        let eid: u32 = match std::env::var(format!("{}_EID", prefix)) {
            Ok(s) => s
                .parse()
                .map_err(|_| eyre!("Invalid {}_EID, must be a u32", prefix))?,
            Err(_) => known.map(|k| k.eid).ok_or_else(|| {
                eyre!(
                    "{}_EID is required for chain {} (not a known network)",
                    prefix,
                    chain_id
                )
            })?,
        };

        let endpoint = match parse_address_var(&format!("{}_ENDPOINT_ADDRESS", prefix))? {
            Some(address) => address,
            None => known.map(|k| k.endpoint).ok_or_else(|| {
                eyre!(
                    "{}_ENDPOINT_ADDRESS is required for chain {} (not a known network)",
                    prefix,
                    chain_id
                )
            })?,
        };

        let executor = parse_address_var(&format!("{}_EXECUTOR_ADDRESS", prefix))?;

        let native_symbol = std::env::var(format!("{}_NATIVE_SYMBOL", prefix))
            .ok()
            .or_else(|| known.map(|k| k.native_symbol.to_string()))
            .unwrap_or_else(|| "ETH".to_string());

        let enabled: bool = std::env::var(format!("{}_ENABLED", prefix))
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(true);

        chains.push(ChainDescriptor {
            name,
            chain_id,
            eid,
            rpc_urls,
            endpoint,
            executor,
            native_symbol,
            enabled,
        });
    }

    ChainRegistry::new(chains)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn chain(chain_id: u64, eid: u32) -> ChainDescriptor {
        ChainDescriptor {
            name: format!("chain{}", chain_id),
            chain_id,
            eid,
            rpc_urls: vec!["http://localhost:8545".to_string()],
            endpoint: MAINNET_ENDPOINT,
            executor: None,
            native_symbol: "ETH".to_string(),
            enabled: true,
        }
    }

    fn clear_env() {
        for i in 1..=3 {
            for suffix in [
                "CHAIN_ID",
                "RPC_URL",
                "NAME",
                "EID",
                "ENDPOINT_ADDRESS",
                "EXECUTOR_ADDRESS",
                "NATIVE_SYMBOL",
                "ENABLED",
            ] {
                std::env::remove_var(format!("DEPLOY_CHAIN_{}_{}", i, suffix));
            }
        }
        std::env::remove_var("DEPLOY_CHAINS_COUNT");
    }

    #[test]
    fn test_known_chain_lookup() {
        let bsc = known_chain(56).unwrap();
        assert_eq!(bsc.eid, 30102);
        assert_eq!(bsc.endpoint, MAINNET_ENDPOINT);
        assert_eq!(known_chain(11155111).unwrap().endpoint, TESTNET_ENDPOINT);
        assert!(known_chain(31337).is_none());
    }

    #[test]
    fn test_registry_lookup_by_eid() {
        let registry = ChainRegistry::new(vec![chain(1, 30101), chain(56, 30102)]).unwrap();
        assert_eq!(registry.get_by_eid(30102).unwrap().chain_id, 56);
        assert_eq!(registry.chain_ids(), vec![1, 56]);
    }

    #[test]
    fn test_duplicate_chain_id_rejected() {
        assert!(ChainRegistry::new(vec![chain(1, 30101), chain(1, 30102)]).is_err());
    }

    #[test]
    fn test_duplicate_eid_rejected() {
        assert!(ChainRegistry::new(vec![chain(1, 30101), chain(56, 30101)]).is_err());
    }

    #[test]
    fn test_disabled_chain_hidden() {
        let mut disabled = chain(56, 30102);
        disabled.enabled = false;
        let registry = ChainRegistry::new(vec![chain(1, 30101), disabled]).unwrap();
        assert!(registry.get(56).is_none());
        assert!(registry.require(56).is_err());
    }

    #[test]
    fn test_validate_rpc_url_rejects_file_scheme() {
        assert!(validate_rpc_url("file:///etc/passwd", "RPC").is_err());
        assert!(validate_rpc_url("https://rpc.example.com", "RPC").is_ok());
    }

    #[test]
    fn test_parse_rpc_urls_ignores_empty() {
        assert_eq!(
            parse_rpc_urls(" https://a.com,,https://b.com, "),
            vec!["https://a.com", "https://b.com"]
        );
    }

    #[test]
    #[serial]
    fn test_load_from_env_uses_known_defaults() {
        clear_env();
        std::env::set_var("DEPLOY_CHAINS_COUNT", "2");
        std::env::set_var("DEPLOY_CHAIN_1_CHAIN_ID", "56");
        std::env::set_var(
            "DEPLOY_CHAIN_1_RPC_URL",
            "https://bsc.publicnode.com,https://bsc-dataseed1.binance.org",
        );
        std::env::set_var("DEPLOY_CHAIN_2_CHAIN_ID", "31337");
        std::env::set_var("DEPLOY_CHAIN_2_RPC_URL", "http://localhost:8545");
        std::env::set_var("DEPLOY_CHAIN_2_EID", "40999");
        std::env::set_var(
            "DEPLOY_CHAIN_2_ENDPOINT_ADDRESS",
            "0x5FbDB2315678afecb367f032d93F642f64180aa3",
        );

        let registry = load_from_env().unwrap();
        let bsc = registry.get(56).unwrap();
        assert_eq!(bsc.name, "bsc");
        assert_eq!(bsc.eid, 30102);
        assert_eq!(bsc.rpc_urls.len(), 2);
        let local = registry.get(31337).unwrap();
        assert_eq!(local.eid, 40999);
        assert_eq!(local.name, "chain_31337");
        clear_env();
    }

    #[test]
    #[serial]
    fn test_load_from_env_requires_eid_for_unknown_chain() {
        clear_env();
        std::env::set_var("DEPLOY_CHAINS_COUNT", "1");
        std::env::set_var("DEPLOY_CHAIN_1_CHAIN_ID", "31337");
        std::env::set_var("DEPLOY_CHAIN_1_RPC_URL", "http://localhost:8545");
        assert!(load_from_env().is_err());
        clear_env();
    }
}
