use alloy::primitives::{b256, B256};

/// EIP-1967 implementation storage slot (`keccak256("eip1967.proxy.implementation") - 1`).
pub const EIP1967_IMPL_SLOT: B256 =
    b256!("360894a13ba1a3210667c828492db98dca3e2076cc3735a920a3ca505d382bbc");

/// EIP-1967 admin slot (`keccak256("eip1967.proxy.admin") - 1`).
pub const EIP1967_ADMIN_SLOT: B256 =
    b256!("b53127684a568b3173ae13b9f8a6016e243e63b6e8ee1178d6a717850b5d6103");

/// EIP-1967 beacon slot (`keccak256("eip1967.proxy.beacon") - 1`).
pub const EIP1967_BEACON_SLOT: B256 =
    b256!("a3f0ad74e5423aebfd80d3ef4346578335a9a72aeaee59ff6cb3582b35133d50");

/// EIP-1822 (UUPS) proxiable slot (`keccak256("PROXIABLE")`).
pub const EIP1822_PROXIABLE_SLOT: B256 =
    b256!("c5f16f0fcc639fa48a6947836d9850f504798523bf8c9a3a87d5876cf622bcf7");

pub const DEFAULT_ARTIFACT_DB_PATH: &str = "artifacts.db";
pub const DEFAULT_DEPLOYMENTS_DIR: &str = "deployments";
pub const DEFAULT_MAX_IN_FLIGHT: usize = 8;
pub const DEFAULT_RPC_RETRIES: usize = 3;
pub const DEFAULT_RPC_CALL_TIMEOUT_MS: u64 = 5_000;
