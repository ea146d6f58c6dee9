//! Contract bindings for the OApp, the LayerZero v2 endpoint and message libraries
//!
//! Uses alloy's sol! macro for typed calldata. Calls go through
//! [`ChainRpc::call`](super::ChainRpc::call) and
//! [`ChainSession::send_transaction`](super::ChainSession::send_transaction)
//! rather than generated providers so that wallets stay injectable.

use alloy::sol;

sol! {
    #![sol(all_derives)]

    /// OFT / OFT adapter peer management
    interface IOApp {
        function setPeer(uint32 eid, bytes32 peer) external;
        function peers(uint32 eid) external view returns (bytes32 peer);
        function endpoint() external view returns (address endpoint);
        function owner() external view returns (address owner);
    }

    struct SetConfigParam {
        uint32 eid;
        uint32 configType;
        bytes config;
    }

    struct UlnConfig {
        uint64 confirmations;
        uint8 requiredDVNCount;
        uint8 optionalDVNCount;
        uint8 optionalDVNThreshold;
        address[] requiredDVNs;
        address[] optionalDVNs;
    }

    struct ExecutorConfig {
        uint32 maxMessageSize;
        address executor;
    }

    interface IEndpointV2 {
        function getConfig(address oapp, address lib, uint32 eid, uint32 configType)
            external view returns (bytes config);
        function setConfig(address oapp, address lib, SetConfigParam[] params) external;
        function getSendLibrary(address sender, uint32 dstEid) external view returns (address lib);
        function getReceiveLibrary(address receiver, uint32 srcEid)
            external view returns (address lib, bool isDefault);
    }

    /// ULN 302 send/receive library
    interface IUln302 {
        function getAppUlnConfig(address oapp, uint32 remoteEid)
            external view returns (UlnConfig config);
    }

    interface IERC20Metadata {
        function decimals() external view returns (uint8 decimals);
        function symbol() external view returns (string symbol);
        function name() external view returns (string name);
    }
}

/// `configType` for executor settings on the send library
pub const CONFIG_TYPE_EXECUTOR: u32 = 1;
/// `configType` for ULN verifier settings
pub const CONFIG_TYPE_ULN: u32 = 2;
