use alloy::dyn_abi::DynSolValue;
use alloy::json_abi::JsonAbi;
use alloy::primitives::Address;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::chain::{find_function, ChainReader};
use crate::deployment::Deployment;
use crate::error::{Result, SpiderError};

/// A typed, callable contract: an address plus the ABI callers should use with it.
#[derive(Debug, Clone, PartialEq)]
pub struct ContractHandle {
    pub name: String,
    pub address: Address,
    pub abi: Arc<JsonAbi>,
}

impl ContractHandle {
    pub fn new(name: impl Into<String>, address: Address, abi: Arc<JsonAbi>) -> Self {
        Self {
            name: name.into(),
            address,
            abi,
        }
    }

    pub fn has_function(&self, function: &str, arity: usize) -> bool {
        find_function(&self.abi, function, arity).is_some()
    }

    /// Read-only call by function name. A function missing from the ABI is a configuration
    /// error and never reaches the node.
    pub async fn call(
        &self,
        reader: &dyn ChainReader,
        function: &str,
        args: &[DynSolValue],
    ) -> Result<Vec<DynSolValue>> {
        if !self.has_function(function, args.len()) {
            return Err(SpiderError::MissingRelationFunction {
                contract: self.name.clone(),
                address: self.address,
                function: function.to_string(),
            });
        }
        reader.call(self.address, &self.abi, function, args).await
    }
}

/// Name-keyed lookup table consumed by deploy scripts, bots and tests.
#[derive(Debug, Clone, Default)]
pub struct ContractMap {
    handles: BTreeMap<String, ContractHandle>,
}

impl ContractMap {
    pub fn contract(&self, name: &str) -> Option<&ContractHandle> {
        self.handles.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handles.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ContractHandle)> {
        self.handles.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

pub struct ContractMapBuilder;

impl ContractMapBuilder {
    /// Build handles from an already-merged deployment. No network access.
    ///
    /// A proxy's handle carries the ABI of the last implementation reachable through
    /// `proxy_links`, so implementation functions are callable at the proxy address.
    pub fn flatten(deployment: &Deployment) -> ContractMap {
        let abi_by_address: BTreeMap<Address, Arc<JsonAbi>> = deployment
            .contracts
            .values()
            .map(|node| (node.address, node.abi.clone()))
            .collect();

        let handles = deployment
            .contracts
            .iter()
            .map(|(alias, node)| {
                let target = final_implementation(&deployment.proxy_links, node.address);
                let abi = abi_by_address
                    .get(&target)
                    .cloned()
                    .unwrap_or_else(|| node.abi.clone());
                (
                    alias.clone(),
                    ContractHandle::new(alias.clone(), node.address, abi),
                )
            })
            .collect();
        ContractMap { handles }
    }
}

/// Follow proxy links to the end of the chain. Bounded by the number of links so a
/// misconfigured loop cannot spin.
fn final_implementation(links: &BTreeMap<Address, Address>, start: Address) -> Address {
    let mut current = start;
    for _ in 0..links.len() {
        match links.get(&current) {
            Some(next) if *next != start => current = *next,
            _ => break,
        }
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_final_implementation_follows_chain_and_stops_on_loop() {
        let a = Address::from([0x0a; 20]);
        let b = Address::from([0x0b; 20]);
        let c = Address::from([0x0c; 20]);
        let mut links = BTreeMap::new();
        links.insert(a, b);
        links.insert(b, c);
        assert_eq!(final_implementation(&links, a), c);
        assert_eq!(final_implementation(&links, c), c);

        links.insert(c, a);
        assert_eq!(final_implementation(&links, a), c);
    }
}
