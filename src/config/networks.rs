use crate::error::{Result, SpiderError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfig {
    pub name: &'static str,
    pub chain_id: u64,
    /// Prefix of the per-network RPC variable, e.g. `MAINNET` for `MAINNET_RPC_URL`.
    pub env_prefix: &'static str,
}

const NETWORKS: &[NetworkConfig] = &[
    NetworkConfig {
        name: "mainnet",
        chain_id: 1,
        env_prefix: "MAINNET",
    },
    NetworkConfig {
        name: "sepolia",
        chain_id: 11_155_111,
        env_prefix: "SEPOLIA",
    },
    NetworkConfig {
        name: "polygon",
        chain_id: 137,
        env_prefix: "POLYGON",
    },
    NetworkConfig {
        name: "arbitrum",
        chain_id: 42_161,
        env_prefix: "ARBITRUM",
    },
    NetworkConfig {
        name: "base",
        chain_id: 8_453,
        env_prefix: "BASE",
    },
    NetworkConfig {
        name: "optimism",
        chain_id: 10,
        env_prefix: "OPTIMISM",
    },
    NetworkConfig {
        name: "scroll",
        chain_id: 534_352,
        env_prefix: "SCROLL",
    },
    NetworkConfig {
        name: "mantle",
        chain_id: 5_000,
        env_prefix: "MANTLE",
    },
    NetworkConfig {
        name: "linea",
        chain_id: 59_144,
        env_prefix: "LINEA",
    },
];

impl NetworkConfig {
    pub fn get(name: &str) -> Result<&'static NetworkConfig> {
        let wanted = name.trim().to_ascii_lowercase();
        NETWORKS
            .iter()
            .find(|network| network.name == wanted)
            .ok_or_else(|| SpiderError::InvalidConfig(format!("unknown network `{name}`")))
    }

    pub fn all() -> &'static [NetworkConfig] {
        NETWORKS
    }

    pub fn rpc_env_var(&self) -> String {
        format!("{}_RPC_URL", self.env_prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_is_case_insensitive() {
        let network = NetworkConfig::get(" Base ").expect("base");
        assert_eq!(network.chain_id, 8_453);
        assert_eq!(network.rpc_env_var(), "BASE_RPC_URL");
    }

    #[test]
    fn test_unknown_network_is_config_error() {
        assert!(matches!(
            NetworkConfig::get("goerli-ish"),
            Err(SpiderError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_network_names_are_unique() {
        let mut names: Vec<_> = NetworkConfig::all().iter().map(|n| n.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), NetworkConfig::all().len());
    }
}
