//! In-process chain simulation for tests
//!
//! [`MockChains`] plays both the read-only RPC and the signing wallet for a
//! set of chains. It understands just enough of the OApp, EndpointV2, ULN and
//! ERC20 surfaces to drive deployments end to end, plus knobs to inject
//! wallet rejections, dropped or reverted transactions and RPC outages.

use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::sol_types::{SolCall, SolType};
use async_trait::async_trait;
use eyre::Result;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::builder::{constructor_args, BuildParams, BuiltContract, ContractBuilder, ContractKind};
use crate::chain::contracts::{
    ExecutorConfig, IERC20Metadata, IEndpointV2, IOApp, IUln302, UlnConfig, CONFIG_TYPE_EXECUTOR,
    CONFIG_TYPE_ULN,
};
use crate::chain::{
    ChainAccess, ChainRpc, ChainSession, ReceiptInfo, RpcError, SessionError, TxRequest, TxSettings,
};
use crate::chains::{ChainDescriptor, ChainRegistry};
use crate::hash::keccak256;
use crate::network_switch::{NetworkSwitchCoordinator, SwitchSettings};
use crate::poll::PollPolicy;

/// Runtime code stored for every simulated contract
const MOCK_RUNTIME: [u8; 4] = [0x60, 0x80, 0x60, 0x40];

fn derived_address(tag: &str) -> Address {
    Address::from_slice(&keccak256(tag.as_bytes())[12..])
}

#[derive(Debug, Clone)]
struct Token {
    name: String,
    symbol: String,
    decimals: u8,
}

#[derive(Debug)]
struct ChainState {
    head: u64,
    auto_mine: bool,
    rpc_down: bool,
    /// Revert message returned by every receipt lookup
    receipt_error: Option<String>,
    /// Receipt lookups still to answer "unknown" regardless of what was mined
    receipt_lag: u32,
    endpoint: Address,
    send_lib: Address,
    receive_lib: Address,
    code: HashMap<Address, Bytes>,
    receipts: HashMap<B256, ReceiptInfo>,
    balances: HashMap<Address, U256>,
    oapps: HashSet<Address>,
    tokens: HashMap<Address, Token>,
    peers: HashMap<(Address, u32), B256>,
    /// (library, oapp, eid, config type) -> encoded config
    app_configs: HashMap<(Address, Address, u32, u32), Bytes>,
}

impl ChainState {
    fn new(chain_id: u64, endpoint: Address) -> Self {
        let send_lib = derived_address(&format!("send-lib-{}", chain_id));
        let receive_lib = derived_address(&format!("receive-lib-{}", chain_id));
        let mut code = HashMap::new();
        for contract in [endpoint, send_lib, receive_lib] {
            code.insert(contract, Bytes::from(MOCK_RUNTIME.to_vec()));
        }
        Self {
            head: 100,
            auto_mine: false,
            rpc_down: false,
            receipt_error: None,
            receipt_lag: 0,
            endpoint,
            send_lib,
            receive_lib,
            code,
            receipts: HashMap::new(),
            balances: HashMap::new(),
            oapps: HashSet::new(),
            tokens: HashMap::new(),
            peers: HashMap::new(),
            app_configs: HashMap::new(),
        }
    }

    fn mine(&mut self) -> u64 {
        self.head += 1;
        self.head
    }

    fn app_config(&self, lib: Address, oapp: Address, eid: u32, config_type: u32) -> Option<Bytes> {
        self.app_configs
            .get(&(lib, oapp, eid, config_type))
            .cloned()
    }
}

#[derive(Debug)]
struct MockState {
    chains: HashMap<u64, ChainState>,
    active: u64,
    wallet_chains: HashSet<u64>,
    ignore_switch: bool,
    reject_switch: bool,
    switch_requests: u32,
    sent: Vec<TxRequest>,
    fail_next: VecDeque<SessionError>,
    /// Transaction index (count of accepted txs) -> injected failure
    fail_at: HashMap<usize, SessionError>,
    drop_next: u32,
    revert_next: u32,
    nonce: u64,
}

impl MockState {
    fn chain(&self, chain_id: u64) -> Result<&ChainState, RpcError> {
        let chain = self
            .chains
            .get(&chain_id)
            .ok_or(RpcError::UnknownChain(chain_id))?;
        if chain.rpc_down {
            return Err(RpcError::Transport {
                chain_id,
                message: "error sending request: connection refused".to_string(),
            });
        }
        Ok(chain)
    }

    fn next_hash(&mut self, tag: &str) -> B256 {
        self.nonce += 1;
        B256::from(keccak256(format!("{}-{}", tag, self.nonce).as_bytes()))
    }
}

/// Simulated wallet plus RPC over a fixed set of chains
pub struct MockChains {
    state: Mutex<MockState>,
    registry: Arc<ChainRegistry>,
    account: Address,
}

impl MockChains {
    /// Chains in the known table keep their real endpoint ids; others get
    /// synthetic ones. The first chain starts active.
    pub fn new(chain_ids: &[u64]) -> Self {
        let descriptors: Vec<ChainDescriptor> = chain_ids
            .iter()
            .map(|&chain_id| {
                let rpc = vec![format!("http://localhost:{}", 8545 + chain_id % 1000)];
                ChainDescriptor::from_known(chain_id, rpc.clone()).unwrap_or_else(|| {
                    ChainDescriptor {
                        name: format!("chain-{}", chain_id),
                        chain_id,
                        eid: 50_000 + (chain_id % 10_000) as u32,
                        rpc_urls: rpc,
                        endpoint: derived_address(&format!("endpoint-{}", chain_id)),
                        executor: None,
                        native_symbol: "ETH".to_string(),
                        enabled: true,
                    }
                })
            })
            .collect();

        let account = Address::repeat_byte(0xaa);
        let chains = descriptors
            .iter()
            .map(|d| {
                let mut state = ChainState::new(d.chain_id, d.endpoint);
                state
                    .balances
                    .insert(account, U256::from(10u64).pow(U256::from(19u64)));
                (d.chain_id, state)
            })
            .collect();

        let registry = ChainRegistry::new(descriptors).unwrap_or_default();

        Self {
            state: Mutex::new(MockState {
                chains,
                active: chain_ids.first().copied().unwrap_or_default(),
                wallet_chains: chain_ids.iter().copied().collect(),
                ignore_switch: false,
                reject_switch: false,
                switch_requests: 0,
                sent: Vec::new(),
                fail_next: VecDeque::new(),
                fail_at: HashMap::new(),
                drop_next: 0,
                revert_next: 0,
                nonce: 0,
            }),
            registry: Arc::new(registry),
            account,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn with_chain<T>(&self, chain_id: u64, f: impl FnOnce(&mut ChainState) -> T) -> T {
        let mut state = self.lock();
        let chain = state
            .chains
            .get_mut(&chain_id)
            .unwrap_or_else(|| panic!("mock has no chain {}", chain_id));
        f(chain)
    }

    pub fn registry(&self) -> Arc<ChainRegistry> {
        self.registry.clone()
    }

    /// Switch and receipt polling tuned for tests
    pub fn fast_switch_settings() -> SwitchSettings {
        SwitchSettings {
            poll: PollPolicy::fixed(3, Duration::from_millis(1)),
            manual: PollPolicy::fixed(3, Duration::from_millis(1)),
        }
    }

    pub fn fast_tx_settings() -> TxSettings {
        TxSettings {
            confirmations: 1,
            receipt_poll: PollPolicy::fixed(3, Duration::from_millis(1)),
        }
    }

    /// Chain access with this mock as both RPC and wallet
    pub fn access(self: &Arc<Self>) -> Arc<ChainAccess> {
        let switcher =
            NetworkSwitchCoordinator::new(self.clone(), self.registry(), Self::fast_switch_settings());
        Arc::new(ChainAccess::new(
            self.clone(),
            self.clone(),
            self.registry(),
            switcher,
            Self::fast_tx_settings(),
        ))
    }

    /// The wallet's signing address
    pub fn account(&self) -> Address {
        self.account
    }

    pub fn active_chain(&self) -> u64 {
        self.lock().active
    }

    pub fn switch_requests(&self) -> u32 {
        self.lock().switch_requests
    }

    /// Make the wallet answer switch requests with "unrecognized chain"
    pub fn forget_wallet_chain(&self, chain_id: u64) {
        self.lock().wallet_chains.remove(&chain_id);
    }

    /// Accept switch requests without actually switching
    pub fn ignore_switch_requests(&self, ignore: bool) {
        self.lock().ignore_switch = ignore;
    }

    pub fn reject_switch_requests(&self, reject: bool) {
        self.lock().reject_switch = reject;
    }

    /// Simulate the user changing network in the wallet UI
    pub fn set_active_chain(&self, chain_id: u64) {
        self.lock().active = chain_id;
    }

    /// Every transaction the wallet accepted, in order
    pub fn sent_transactions(&self) -> Vec<TxRequest> {
        self.lock().sent.clone()
    }

    /// Fail the next `send_transaction` with `error`
    pub fn fail_next_transaction(&self, error: SessionError) {
        self.lock().fail_next.push_back(error);
    }

    /// Fail whichever transaction arrives once `accepted` have gone through
    pub fn fail_transaction_at(&self, accepted: usize, error: SessionError) {
        self.lock().fail_at.insert(accepted, error);
    }

    /// Accept the next transaction but never produce a receipt for it
    pub fn drop_next_transaction(&self) {
        self.lock().drop_next += 1;
    }

    /// Mine the next transaction with a failed receipt
    pub fn revert_next_transaction(&self) {
        self.lock().revert_next += 1;
    }

    pub fn set_rpc_down(&self, chain_id: u64, down: bool) {
        self.with_chain(chain_id, |c| c.rpc_down = down);
    }

    /// Make receipt lookups revert with `message` (`None` restores them)
    pub fn fail_receipt_lookups(&self, chain_id: u64, message: Option<&str>) {
        self.with_chain(chain_id, |c| c.receipt_error = message.map(str::to_string));
    }

    /// Answer the next `lookups` receipt queries as if the node had not
    /// indexed the transaction yet
    pub fn lag_receipts(&self, chain_id: u64, lookups: u32) {
        self.with_chain(chain_id, |c| c.receipt_lag = lookups);
    }

    pub fn set_balance(&self, chain_id: u64, address: Address, amount: U256) {
        self.with_chain(chain_id, |c| {
            c.balances.insert(address, amount);
        });
    }

    /// Advance the head by one on every `block_number` query
    pub fn set_auto_mine(&self, chain_id: u64, enabled: bool) {
        self.with_chain(chain_id, |c| c.auto_mine = enabled);
    }

    pub fn advance_blocks(&self, chain_id: u64, blocks: u64) {
        self.with_chain(chain_id, |c| c.head += blocks);
    }

    /// Deploy an OApp directly, outside the wallet
    pub fn install_oapp(&self, chain_id: u64) -> Address {
        let mut state = self.lock();
        state.nonce += 1;
        let address = derived_address(&format!("oapp-{}-{}", chain_id, state.nonce));
        let chain = state
            .chains
            .get_mut(&chain_id)
            .unwrap_or_else(|| panic!("mock has no chain {}", chain_id));
        chain.code.insert(address, Bytes::from(MOCK_RUNTIME.to_vec()));
        chain.oapps.insert(address);
        address
    }

    /// Deploy an ERC20 with metadata
    pub fn install_token(&self, chain_id: u64, symbol: &str, decimals: u8) -> Address {
        let address = derived_address(&format!("token-{}-{}", chain_id, symbol));
        self.with_chain(chain_id, |c| {
            c.code.insert(address, Bytes::from(MOCK_RUNTIME.to_vec()));
            c.tokens.insert(
                address,
                Token {
                    name: format!("{} Token", symbol),
                    symbol: symbol.to_string(),
                    decimals,
                },
            );
        });
        address
    }

    /// Mine a contract creation with `code`, returning its hash and address
    pub fn mine_deployment(&self, chain_id: u64, code: Bytes) -> (B256, Address) {
        let mut state = self.lock();
        let tx_hash = state.next_hash("deploy");
        let address = derived_address(&format!("contract-{}", tx_hash));
        let chain = state
            .chains
            .get_mut(&chain_id)
            .unwrap_or_else(|| panic!("mock has no chain {}", chain_id));
        let block_number = chain.mine();
        chain.code.insert(address, code);
        chain.receipts.insert(
            tx_hash,
            ReceiptInfo {
                tx_hash,
                block_number,
                success: true,
                contract_address: Some(address),
            },
        );
        (tx_hash, address)
    }

    /// Remove a contract's code, as after a reorg
    pub fn wipe_code(&self, chain_id: u64, address: Address) {
        self.with_chain(chain_id, |c| {
            c.code.remove(&address);
            c.oapps.remove(&address);
        });
    }

    /// Forget a mined receipt
    pub fn forget_receipt(&self, chain_id: u64, tx_hash: B256) {
        self.with_chain(chain_id, |c| {
            c.receipts.remove(&tx_hash);
        });
    }

    pub fn clear_send_library(&self, chain_id: u64) {
        self.with_chain(chain_id, |c| c.send_lib = Address::ZERO);
    }

    pub fn clear_receive_library(&self, chain_id: u64) {
        self.with_chain(chain_id, |c| c.receive_lib = Address::ZERO);
    }

    /// Raw peer word stored on `oapp` for `eid`
    pub fn peer_of(&self, chain_id: u64, oapp: Address, eid: u32) -> B256 {
        self.with_chain(chain_id, |c| {
            c.peers.get(&(oapp, eid)).copied().unwrap_or_default()
        })
    }
}

fn empty_uln() -> UlnConfig {
    UlnConfig {
        confirmations: 0,
        requiredDVNCount: 0,
        optionalDVNCount: 0,
        optionalDVNThreshold: 0,
        requiredDVNs: vec![],
        optionalDVNs: vec![],
    }
}

fn revert(chain_id: u64, message: &str) -> RpcError {
    RpcError::Revert {
        chain_id,
        data: Bytes::new(),
        message: message.to_string(),
    }
}

/// Answer an `eth_call` against the simulated contracts
fn simulate_call(chain_id: u64, chain: &ChainState, to: Address, input: &[u8]) -> Result<Vec<u8>, RpcError> {
    if !chain.code.contains_key(&to) {
        return Ok(Vec::new());
    }
    if input.len() < 4 {
        return Err(revert(chain_id, "execution reverted"));
    }
    let selector: [u8; 4] = [input[0], input[1], input[2], input[3]];
    let bad_input = |_| revert(chain_id, "execution reverted: bad calldata");

    if chain.oapps.contains(&to) {
        return match selector {
            IOApp::peersCall::SELECTOR => {
                let call = IOApp::peersCall::abi_decode(input, true).map_err(bad_input)?;
                let peer = chain.peers.get(&(to, call.eid)).copied().unwrap_or_default();
                Ok(IOApp::peersCall::abi_encode_returns(&(peer,)))
            }
            IOApp::endpointCall::SELECTOR => {
                Ok(IOApp::endpointCall::abi_encode_returns(&(chain.endpoint,)))
            }
            IOApp::ownerCall::SELECTOR => Ok(IOApp::ownerCall::abi_encode_returns(&(Address::ZERO,))),
            _ => Err(revert(chain_id, "execution reverted")),
        };
    }

    if let Some(token) = chain.tokens.get(&to) {
        return match selector {
            IERC20Metadata::decimalsCall::SELECTOR => {
                Ok(IERC20Metadata::decimalsCall::abi_encode_returns(&(token.decimals,)))
            }
            IERC20Metadata::symbolCall::SELECTOR => {
                Ok(IERC20Metadata::symbolCall::abi_encode_returns(&(token.symbol.clone(),)))
            }
            IERC20Metadata::nameCall::SELECTOR => {
                Ok(IERC20Metadata::nameCall::abi_encode_returns(&(token.name.clone(),)))
            }
            _ => Err(revert(chain_id, "execution reverted")),
        };
    }

    if to == chain.endpoint {
        return match selector {
            IEndpointV2::getSendLibraryCall::SELECTOR => {
                IEndpointV2::getSendLibraryCall::abi_decode(input, true).map_err(bad_input)?;
                Ok(IEndpointV2::getSendLibraryCall::abi_encode_returns(&(chain.send_lib,)))
            }
            IEndpointV2::getReceiveLibraryCall::SELECTOR => {
                IEndpointV2::getReceiveLibraryCall::abi_decode(input, true).map_err(bad_input)?;
                Ok(IEndpointV2::getReceiveLibraryCall::abi_encode_returns(&(
                    chain.receive_lib,
                    true,
                )))
            }
            IEndpointV2::getConfigCall::SELECTOR => {
                let call = IEndpointV2::getConfigCall::abi_decode(input, true).map_err(bad_input)?;
                let config = match chain.app_config(call.lib, call.oapp, call.eid, call.configType) {
                    Some(config) => config,
                    None if call.configType == CONFIG_TYPE_EXECUTOR => {
                        Bytes::from(<ExecutorConfig as SolType>::abi_encode(&ExecutorConfig {
                            maxMessageSize: 0,
                            executor: Address::ZERO,
                        }))
                    }
                    None => Bytes::from(<UlnConfig as SolType>::abi_encode(&empty_uln())),
                };
                Ok(IEndpointV2::getConfigCall::abi_encode_returns(&(config,)))
            }
            _ => Err(revert(chain_id, "execution reverted")),
        };
    }

    if (to == chain.send_lib || to == chain.receive_lib) && selector == IUln302::getAppUlnConfigCall::SELECTOR {
        let call = IUln302::getAppUlnConfigCall::abi_decode(input, true).map_err(bad_input)?;
        let config = chain
            .app_config(to, call.oapp, call.remoteEid, CONFIG_TYPE_ULN)
            .and_then(|b| <UlnConfig as SolType>::abi_decode(&b, true).ok())
            .unwrap_or_else(empty_uln);
        return Ok(IUln302::getAppUlnConfigCall::abi_encode_returns(&(config,)));
    }

    Err(revert(chain_id, "execution reverted"))
}

/// Apply a state-changing call; `false` means the transaction reverts
fn apply_call(chain: &mut ChainState, to: Address, input: &[u8]) -> bool {
    if chain.oapps.contains(&to) {
        return match IOApp::setPeerCall::abi_decode(input, true) {
            Ok(call) => {
                chain.peers.insert((to, call.eid), call.peer);
                true
            }
            Err(_) => false,
        };
    }
    if to == chain.endpoint {
        return match IEndpointV2::setConfigCall::abi_decode(input, true) {
            Ok(call) => {
                if call.lib == Address::ZERO || call.params.is_empty() {
                    return false;
                }
                for param in call.params {
                    chain
                        .app_configs
                        .insert((call.lib, call.oapp, param.eid, param.configType), param.config);
                }
                true
            }
            Err(_) => false,
        };
    }
    false
}

#[async_trait]
impl ChainRpc for MockChains {
    async fn block_number(&self, chain_id: u64) -> Result<u64, RpcError> {
        let mut state = self.lock();
        state.chain(chain_id)?;
        let chain = state
            .chains
            .get_mut(&chain_id)
            .ok_or(RpcError::UnknownChain(chain_id))?;
        if chain.auto_mine {
            chain.mine();
        }
        Ok(chain.head)
    }

    async fn transaction_receipt(
        &self,
        chain_id: u64,
        tx_hash: B256,
    ) -> Result<Option<ReceiptInfo>, RpcError> {
        let mut state = self.lock();
        state.chain(chain_id)?;
        let chain = state
            .chains
            .get_mut(&chain_id)
            .ok_or(RpcError::UnknownChain(chain_id))?;
        if let Some(message) = &chain.receipt_error {
            return Err(revert(chain_id, message));
        }
        if chain.receipt_lag > 0 {
            chain.receipt_lag -= 1;
            return Ok(None);
        }
        Ok(chain.receipts.get(&tx_hash).cloned())
    }

    async fn code_at(&self, chain_id: u64, address: Address) -> Result<Bytes, RpcError> {
        let state = self.lock();
        Ok(state
            .chain(chain_id)?
            .code
            .get(&address)
            .cloned()
            .unwrap_or_default())
    }

    async fn balance(&self, chain_id: u64, address: Address) -> Result<U256, RpcError> {
        let state = self.lock();
        Ok(state
            .chain(chain_id)?
            .balances
            .get(&address)
            .copied()
            .unwrap_or_default())
    }

    async fn call(&self, chain_id: u64, to: Address, input: Bytes) -> Result<Bytes, RpcError> {
        let state = self.lock();
        let chain = state.chain(chain_id)?;
        simulate_call(chain_id, chain, to, &input).map(Bytes::from)
    }
}

#[async_trait]
impl ChainSession for MockChains {
    async fn current_chain(&self) -> Result<u64, SessionError> {
        Ok(self.lock().active)
    }

    async fn address(&self) -> Result<Address, SessionError> {
        Ok(self.account)
    }

    async fn request_switch(&self, chain_id: u64) -> Result<(), SessionError> {
        let mut state = self.lock();
        state.switch_requests += 1;
        if state.reject_switch {
            return Err(SessionError::UserRejected(
                "User rejected the request.".to_string(),
            ));
        }
        if !state.wallet_chains.contains(&chain_id) {
            return Err(SessionError::UnknownChain(chain_id));
        }
        if !state.ignore_switch {
            state.active = chain_id;
        }
        Ok(())
    }

    async fn add_chain(&self, chain: &ChainDescriptor) -> Result<(), SessionError> {
        self.lock().wallet_chains.insert(chain.chain_id);
        Ok(())
    }

    async fn send_transaction(&self, tx: TxRequest) -> Result<B256, SessionError> {
        let mut state = self.lock();
        if let Some(error) = state.fail_next.pop_front() {
            return Err(error);
        }
        let accepted = state.sent.len();
        if let Some(error) = state.fail_at.remove(&accepted) {
            return Err(error);
        }
        if tx.chain_id != state.active {
            return Err(SessionError::WrongChain {
                expected: tx.chain_id,
                actual: state.active,
            });
        }

        state.sent.push(tx.clone());
        let tx_hash = state.next_hash("tx");
        let dropped = state.drop_next > 0;
        if dropped {
            state.drop_next -= 1;
        }
        let forced_revert = state.revert_next > 0;
        if forced_revert {
            state.revert_next -= 1;
        }
        let account = self.account;

        let chain = state
            .chains
            .get_mut(&tx.chain_id)
            .ok_or(SessionError::Rpc(format!("unknown chain {}", tx.chain_id)))?;
        if let Some(balance) = chain.balances.get_mut(&account) {
            *balance = balance.saturating_sub(U256::from(1_000_000_000_000u64));
        }
        if dropped {
            return Ok(tx_hash);
        }

        let (success, contract_address) = match tx.to {
            _ if forced_revert => (false, None),
            None => {
                let address = derived_address(&format!("created-{}", tx_hash));
                chain.code.insert(address, Bytes::from(MOCK_RUNTIME.to_vec()));
                chain.oapps.insert(address);
                (true, Some(address))
            }
            Some(to) => (apply_call(chain, to, &tx.input), None),
        };

        let block_number = chain.mine();
        chain.receipts.insert(
            tx_hash,
            ReceiptInfo {
                tx_hash,
                block_number,
                success,
                contract_address,
            },
        );
        Ok(tx_hash)
    }
}

/// Builder that needs no artifacts on disk
#[derive(Debug, Clone, Default)]
pub struct StaticBuilder;

impl ContractBuilder for StaticBuilder {
    fn build(&self, kind: ContractKind, params: &BuildParams) -> Result<BuiltContract> {
        let contract_name = match kind {
            ContractKind::Adapter => crate::builder::DEFAULT_ADAPTER_CONTRACT,
            ContractKind::Mirror => crate::builder::DEFAULT_MIRROR_CONTRACT,
        };
        Ok(BuiltContract {
            contract_name: contract_name.to_string(),
            bytecode: Bytes::from(vec![0x60, 0x80, 0x60, 0x40, 0x52]),
            abi: serde_json::json!([]),
            constructor_args: constructor_args(kind, params)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_set_peer_roundtrip() {
        let mock = Arc::new(MockChains::new(&[1, 56]));
        let oapp = mock.install_oapp(1);
        let input = IOApp::setPeerCall {
            eid: 30102,
            peer: B256::repeat_byte(5),
        }
        .abi_encode();
        let tx = mock
            .send_transaction(TxRequest::call(1, oapp, input.into()))
            .await
            .unwrap();
        let receipt = mock.transaction_receipt(1, tx).await.unwrap().unwrap();
        assert!(receipt.success);
        assert_eq!(mock.peer_of(1, oapp, 30102), B256::repeat_byte(5));
    }

    #[tokio::test]
    async fn test_mock_rejects_wrong_chain() {
        let mock = MockChains::new(&[1, 56]);
        let result = mock
            .send_transaction(TxRequest::deploy(56, Bytes::from(vec![0x60])))
            .await;
        assert_eq!(
            result,
            Err(SessionError::WrongChain {
                expected: 56,
                actual: 1
            })
        );
    }

    #[tokio::test]
    async fn test_mock_rpc_down() {
        let mock = MockChains::new(&[1]);
        mock.set_rpc_down(1, true);
        assert!(matches!(
            mock.block_number(1).await,
            Err(RpcError::Transport { .. })
        ));
    }
}
