//! Contract init-code construction
//!
//! Compilation happens outside the deployer (forge); this module loads the
//! compiled artifacts and appends ABI-encoded constructor arguments.

use alloy::primitives::{Address, Bytes};
use alloy::sol_types::SolValue;
use eyre::{eyre, Result, WrapErr};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default artifact names for the adapter and the mirror token
pub const DEFAULT_ADAPTER_CONTRACT: &str = "MyOFTAdapter";
pub const DEFAULT_MIRROR_CONTRACT: &str = "MyOFT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractKind {
    /// Lock/unlock wrapper around an existing token
    Adapter,
    /// Mint/burn token
    Mirror,
}

/// Constructor inputs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildParams {
    pub name: String,
    pub symbol: String,
    pub endpoint: Address,
    /// Owner and endpoint delegate
    pub delegate: Address,
    /// Wrapped token, adapters only
    pub token: Option<Address>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuiltContract {
    pub contract_name: String,
    pub bytecode: Bytes,
    pub abi: serde_json::Value,
    pub constructor_args: Bytes,
}

impl BuiltContract {
    /// Creation bytecode followed by the encoded constructor arguments
    pub fn init_code(&self) -> Bytes {
        let mut code = self.bytecode.to_vec();
        code.extend_from_slice(&self.constructor_args);
        code.into()
    }
}

/// Produces deployable init code for a contract kind
pub trait ContractBuilder: Send + Sync {
    fn build(&self, kind: ContractKind, params: &BuildParams) -> Result<BuiltContract>;
}

/// ABI-encode constructor arguments for a kind
pub fn constructor_args(kind: ContractKind, params: &BuildParams) -> Result<Bytes> {
    let encoded = match kind {
        ContractKind::Adapter => {
            let token = params
                .token
                .ok_or_else(|| eyre!("adapter build needs the wrapped token address"))?;
            (token, params.endpoint, params.delegate).abi_encode_params()
        }
        ContractKind::Mirror => (
            params.name.clone(),
            params.symbol.clone(),
            params.endpoint,
            params.delegate,
        )
            .abi_encode_params(),
    };
    Ok(encoded.into())
}

#[derive(Debug, Deserialize)]
struct ForgeArtifact {
    abi: serde_json::Value,
    bytecode: ForgeBytecode,
}

#[derive(Debug, Deserialize)]
struct ForgeBytecode {
    object: String,
}

/// Reads forge output: `{dir}/{Name}.sol/{Name}.json`
#[derive(Debug, Clone)]
pub struct ArtifactBuilder {
    dir: PathBuf,
    adapter_contract: String,
    mirror_contract: String,
}

impl ArtifactBuilder {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            adapter_contract: DEFAULT_ADAPTER_CONTRACT.to_string(),
            mirror_contract: DEFAULT_MIRROR_CONTRACT.to_string(),
        }
    }

    pub fn with_contract_names(mut self, adapter: &str, mirror: &str) -> Self {
        self.adapter_contract = adapter.to_string();
        self.mirror_contract = mirror.to_string();
        self
    }

    pub fn artifact_path(&self, contract_name: &str) -> PathBuf {
        self.dir
            .join(format!("{}.sol", contract_name))
            .join(format!("{}.json", contract_name))
    }

    fn load(&self, contract_name: &str) -> Result<(Bytes, serde_json::Value)> {
        let path = self.artifact_path(contract_name);
        let artifact = read_artifact(&path)?;
        let object = artifact.bytecode.object.trim();
        if object.contains("__$") {
            return Err(eyre!(
                "Artifact {} has unlinked library placeholders",
                path.display()
            ));
        }
        let bytecode = hex::decode(object.trim_start_matches("0x"))
            .wrap_err_with(|| format!("Invalid bytecode in {}", path.display()))?;
        if bytecode.is_empty() {
            return Err(eyre!(
                "Artifact {} has no creation bytecode (abstract contract or interface?)",
                path.display()
            ));
        }
        Ok((bytecode.into(), artifact.abi))
    }
}

fn read_artifact(path: &Path) -> Result<ForgeArtifact> {
    let content = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("Failed to read artifact {}", path.display()))?;
    serde_json::from_str(&content)
        .wrap_err_with(|| format!("Failed to parse artifact {}", path.display()))
}

impl ContractBuilder for ArtifactBuilder {
    fn build(&self, kind: ContractKind, params: &BuildParams) -> Result<BuiltContract> {
        let contract_name = match kind {
            ContractKind::Adapter => &self.adapter_contract,
            ContractKind::Mirror => &self.mirror_contract,
        };
        let (bytecode, abi) = self.load(contract_name)?;
        let constructor_args = constructor_args(kind, params)?;
        debug!(
            contract = %contract_name,
            bytecode_len = bytecode.len(),
            "Loaded contract artifact"
        );
        Ok(BuiltContract {
            contract_name: contract_name.clone(),
            bytecode,
            abi,
            constructor_args,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn write_artifact(dir: &Path, name: &str, object: &str) {
        let contract_dir = dir.join(format!("{}.sol", name));
        std::fs::create_dir_all(&contract_dir).unwrap();
        let artifact = json!({
            "abi": [{"type": "constructor", "inputs": []}],
            "bytecode": {"object": object, "sourceMap": ""},
            "deployedBytecode": {"object": "0x00"}
        });
        std::fs::write(
            contract_dir.join(format!("{}.json", name)),
            serde_json::to_string(&artifact).unwrap(),
        )
        .unwrap();
    }

    fn params(token: Option<Address>) -> BuildParams {
        BuildParams {
            name: "Bridged".to_string(),
            symbol: "BRG".to_string(),
            endpoint: Address::repeat_byte(0xee),
            delegate: Address::repeat_byte(0xdd),
            token,
        }
    }

    #[test]
    fn test_adapter_init_code_appends_constructor_args() {
        let dir = TempDir::new().unwrap();
        write_artifact(dir.path(), DEFAULT_ADAPTER_CONTRACT, "0x6080604052");
        let builder = ArtifactBuilder::new(dir.path());

        let built = builder
            .build(ContractKind::Adapter, &params(Some(Address::repeat_byte(0xaa))))
            .unwrap();
        assert_eq!(built.contract_name, "MyOFTAdapter");
        let init = built.init_code();
        assert_eq!(&init[..5], &[0x60, 0x80, 0x60, 0x40, 0x52]);
        // three static address words
        assert_eq!(init.len(), 5 + 3 * 32);
        assert_eq!(&init[5 + 12..5 + 32], Address::repeat_byte(0xaa).as_slice());
    }

    #[test]
    fn test_adapter_without_token_fails() {
        assert!(constructor_args(ContractKind::Adapter, &params(None)).is_err());
    }

    #[test]
    fn test_mirror_args_encode_strings() {
        let args = constructor_args(ContractKind::Mirror, &params(None)).unwrap();
        // 4 head words + 2 strings of one word each (length + data)
        assert_eq!(args.len(), 4 * 32 + 2 * 64);
    }

    #[test]
    fn test_missing_artifact_is_error() {
        let dir = TempDir::new().unwrap();
        let builder = ArtifactBuilder::new(dir.path());
        assert!(builder.build(ContractKind::Mirror, &params(None)).is_err());
    }

    #[test]
    fn test_empty_or_unlinked_bytecode_rejected() {
        let dir = TempDir::new().unwrap();
        write_artifact(dir.path(), "Empty", "0x");
        write_artifact(dir.path(), "Linked", "0x6080__$abc$__");
        let builder = ArtifactBuilder::new(dir.path()).with_contract_names("Empty", "Linked");
        assert!(builder.build(ContractKind::Adapter, &params(Some(Address::ZERO))).is_err());
        assert!(builder.build(ContractKind::Mirror, &params(None)).is_err());
    }
}
