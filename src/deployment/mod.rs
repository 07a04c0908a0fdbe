pub mod files;
pub mod manager;

use alloy::primitives::Address;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{Result, SpiderError};
use crate::relations::CrossDeployment;
use crate::spider::{
    ContractMap, ContractMapBuilder, ContractNode, DeploymentImports, NodeError, NodeOrigin,
};

pub use files::DeploymentFiles;
pub use manager::DeploymentManager;

/// One network/market instance of crawl output.
#[derive(Debug, Clone)]
pub struct Deployment {
    pub network: String,
    pub name: String,
    pub roots: BTreeMap<String, Address>,
    /// Alias to node, without subtrees.
    pub contracts: BTreeMap<String, ContractNode>,
    /// Proxy address to implementation address.
    pub proxy_links: BTreeMap<Address, Address>,
    pub errors: Vec<NodeError>,
}

impl Deployment {
    pub fn contract(&self, alias: &str) -> Option<&ContractNode> {
        self.contracts.get(alias)
    }

    pub fn aliases(&self) -> BTreeMap<String, Address> {
        self.contracts
            .iter()
            .map(|(alias, node)| (alias.clone(), node.address))
            .collect()
    }

    pub fn alias_of(&self, address: Address) -> Option<&str> {
        self.contracts
            .iter()
            .find(|(_, node)| node.address == address)
            .map(|(alias, _)| alias.as_str())
    }

    pub fn contract_map(&self) -> ContractMap {
        ContractMapBuilder::flatten(self)
    }

    /// Node handed to another deployment. It carries the ABI callers should use at its
    /// address, so the importer needs none of this deployment's proxy links.
    pub fn export_node(&self, alias: &str) -> Result<ContractNode> {
        let node = self
            .contracts
            .get(alias)
            .ok_or_else(|| SpiderError::CrossDeploymentAliasMissing {
                network: self.network.clone(),
                deployment: self.name.clone(),
                alias: alias.to_string(),
            })?;
        let abi = self
            .contract_map()
            .contract(alias)
            .map(|handle| handle.abi.clone())
            .unwrap_or_else(|| node.abi.clone());
        Ok(ContractNode {
            abi,
            origin: NodeOrigin::Imported {
                network: self.network.clone(),
                deployment: self.name.clone(),
            },
            ..node.detached()
        })
    }
}

/// Deployments built or loaded in this process, available for cross-deployment imports.
#[derive(Default)]
pub struct DeploymentSet {
    built: DashMap<(String, String), Arc<Deployment>>,
}

impl DeploymentSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, deployment: Deployment) -> Arc<Deployment> {
        let key = (deployment.network.clone(), deployment.name.clone());
        let shared = Arc::new(deployment);
        self.built.insert(key, shared.clone());
        shared
    }

    pub fn get(&self, network: &str, name: &str) -> Option<Arc<Deployment>> {
        self.built
            .get(&(network.to_string(), name.to_string()))
            .map(|entry| entry.value().clone())
    }

    pub fn contains(&self, network: &str, name: &str) -> bool {
        self.built
            .contains_key(&(network.to_string(), name.to_string()))
    }
}

impl DeploymentImports for DeploymentSet {
    fn import(&self, target: &CrossDeployment, alias: &str) -> Result<ContractNode> {
        let deployment = self.get(&target.network, &target.deployment).ok_or_else(|| {
            SpiderError::DeploymentUnavailable {
                network: target.network.clone(),
                deployment: target.deployment.clone(),
            }
        })?;
        deployment.export_node(alias)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::json_abi::JsonAbi;

    fn abi(function: &str) -> Arc<JsonAbi> {
        Arc::new(
            serde_json::from_str(&format!(
                r#"[{{"type":"function","name":"{function}","stateMutability":"view","inputs":[],"outputs":[{{"name":"","type":"address"}}]}}]"#
            ))
            .expect("abi"),
        )
    }

    fn infrastructure() -> Deployment {
        let proxy = Address::from([0x01; 20]);
        let implementation = Address::from([0x02; 20]);
        let node = |name: &str, address: Address, abi: Arc<JsonAbi>| ContractNode {
            name: name.to_string(),
            type_name: "Governor".to_string(),
            address,
            abi,
            implementation: None,
            origin: NodeOrigin::Crawled,
            children: Vec::new(),
        };
        let mut contracts = BTreeMap::new();
        contracts.insert("governor".to_string(), node("governor", proxy, abi("admin")));
        contracts.insert(
            "governor:implementation".to_string(),
            node("governor:implementation", implementation, abi("timelock")),
        );
        Deployment {
            network: "mainnet".into(),
            name: "_infrastructure".into(),
            roots: BTreeMap::new(),
            contracts,
            proxy_links: BTreeMap::from([(proxy, implementation)]),
            errors: Vec::new(),
        }
    }

    #[test]
    fn test_export_node_binds_implementation_abi() {
        let exported = infrastructure().export_node("governor").expect("export");
        assert_eq!(exported.address, Address::from([0x01; 20]));
        assert!(exported.abi.function("timelock").is_some());
        assert!(matches!(exported.origin, NodeOrigin::Imported { .. }));
    }

    #[test]
    fn test_import_errors_distinguish_missing_deployment_and_alias() {
        let set = DeploymentSet::new();
        let target = CrossDeployment {
            network: "mainnet".into(),
            deployment: "_infrastructure".into(),
        };
        assert!(matches!(
            set.import(&target, "governor"),
            Err(SpiderError::DeploymentUnavailable { .. })
        ));
        set.insert(infrastructure());
        assert!(set.import(&target, "governor").is_ok());
        assert!(matches!(
            set.import(&target, "timelock"),
            Err(SpiderError::CrossDeploymentAliasMissing { .. })
        ));
    }
}
