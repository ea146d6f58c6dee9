//! Hash computation for deployment identifiers and revert selectors
//!
//! Deployment ids are keccak-256 digests over the canonical JSON encoding of a
//! normalized request, so identical logical requests always collide onto the
//! same record and can be resumed instead of deployed twice.

use alloy::primitives::{Address, B256};
use eyre::{eyre, Result};
use tiny_keccak::{Hasher, Keccak};

use crate::record::DeploymentRequest;

/// Compute keccak256 hash of data
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    hasher.update(data);
    let mut output = [0u8; 32];
    hasher.finalize(&mut output);
    output
}

/// 4-byte selector for a Solidity error or function signature,
/// e.g. `NoPeer(uint32)`.
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// Compute the deterministic deployment id for a request.
///
/// The request is normalized first (sorted, de-duplicated chain sets, trimmed
/// names) so that cosmetic differences do not fork the record.
pub fn deployment_id(request: &DeploymentRequest) -> Result<String> {
    let normalized = request.normalized();
    let canonical = serde_json::to_vec(&(
        normalized.kind().as_str(),
        normalized.requester,
        &normalized.config,
    ))
    .map_err(|e| eyre!("Failed to encode deployment request: {}", e))?;

    Ok(bytes32_to_hex(&keccak256(&canonical)))
}

/// Convert an EVM address to the bytes32 peer format (left-padded with zeros)
pub fn address_to_bytes32(addr: &Address) -> B256 {
    B256::left_padding_from(addr.as_slice())
}

/// Extract the address from a bytes32 peer value.
///
/// Returns `None` when the word is zero (no peer set) or when the upper
/// 12 bytes are not zero padding.
pub fn bytes32_to_address(word: &B256) -> Option<Address> {
    if word.is_zero() || word[..12].iter().any(|&b| b != 0) {
        return None;
    }
    Some(Address::from_word(*word))
}

/// Convert bytes to hex string with 0x prefix
pub fn bytes32_to_hex(bytes: &[u8; 32]) -> String {
    format!("0x{}", hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{DeploymentConfig, DeploymentRequest};

    fn adapter_request(destinations: Vec<u64>) -> DeploymentRequest {
        DeploymentRequest {
            requester: Address::repeat_byte(0x11),
            config: DeploymentConfig::Adapter {
                source_chain: 1,
                token: Address::repeat_byte(0x22),
                destination_chains: destinations,
                name: "Bridged Token".to_string(),
                symbol: "BTK".to_string(),
            },
            security: None,
        }
    }

    #[test]
    fn test_keccak256() {
        let result = keccak256(b"hello");
        assert_eq!(
            bytes32_to_hex(&result),
            "0x1c8aff950685c2ed4bc3174f3472287b56d9517b9c948127319a09a7a36deac8"
        );
    }

    #[test]
    fn test_selector_matches_known_erc20_transfer() {
        assert_eq!(selector("transfer(address,uint256)"), [0xa9, 0x05, 0x9c, 0xbb]);
    }

    #[test]
    fn test_deployment_id_is_deterministic() {
        let a = deployment_id(&adapter_request(vec![56, 137])).unwrap();
        let b = deployment_id(&adapter_request(vec![56, 137])).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 66);
    }

    #[test]
    fn test_deployment_id_ignores_destination_order() {
        let a = deployment_id(&adapter_request(vec![137, 56])).unwrap();
        let b = deployment_id(&adapter_request(vec![56, 137, 56])).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_deployment_id_depends_on_requester() {
        let a = adapter_request(vec![56]);
        let mut b = adapter_request(vec![56]);
        b.requester = Address::repeat_byte(0x33);
        assert_ne!(deployment_id(&a).unwrap(), deployment_id(&b).unwrap());
    }

    #[test]
    fn test_peer_bytes32_roundtrip() {
        let addr = Address::repeat_byte(0xab);
        let word = address_to_bytes32(&addr);
        assert_eq!(&word[..12], &[0u8; 12]);
        assert_eq!(bytes32_to_address(&word), Some(addr));
    }

    #[test]
    fn test_zero_or_dirty_peer_is_none() {
        assert_eq!(bytes32_to_address(&B256::ZERO), None);
        assert_eq!(bytes32_to_address(&B256::repeat_byte(0xff)), None);
    }
}
