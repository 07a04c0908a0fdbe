use alloy::primitives::Address;
use std::collections::{BTreeMap, HashMap};

use super::crawler::{ContractNode, DeploymentImports, GraphCrawler, Session};
use crate::artifact::ArtifactCache;
use crate::chain::ChainReader;
use crate::deployment::Deployment;
use crate::relations::RelationRegistry;

/// Runs the crawler over every root of a deployment and merges the trees into one
/// alias-keyed map.
pub struct DeploymentComposer<'a> {
    crawler: GraphCrawler<'a>,
    registry: &'a RelationRegistry,
    imports: &'a dyn DeploymentImports,
}

impl<'a> DeploymentComposer<'a> {
    pub fn new(
        artifacts: &'a ArtifactCache,
        registry: &'a RelationRegistry,
        reader: &'a dyn ChainReader,
        imports: &'a dyn DeploymentImports,
    ) -> Self {
        Self {
            crawler: GraphCrawler::new(artifacts, registry, reader, imports),
            registry,
            imports,
        }
    }

    /// Roots are processed in name order inside a single session, so a contract reachable
    /// from two roots is resolved once and named by the first.
    pub async fn build_deployment(
        &self,
        network: &str,
        name: &str,
        roots: &BTreeMap<String, Address>,
    ) -> Deployment {
        let session = Session::new();
        let mut imported: HashMap<String, ContractNode> = HashMap::new();
        let mut to_crawl: Vec<(String, Address)> = Vec::new();

        for (alias, address) in roots {
            let pointer = self
                .registry
                .lookup(alias, *address)
                .and_then(|hit| hit.entry.cross_deployment.as_ref());
            let Some(target) = pointer else {
                to_crawl.push((alias.clone(), *address));
                continue;
            };
            match self.imports.import(target, alias) {
                Ok(node) => {
                    tracing::info!(
                        "[DEPLOY] {}/{}: root {} imported from {}/{}",
                        network,
                        name,
                        alias,
                        target.network,
                        target.deployment
                    );
                    imported.insert(alias.clone(), node);
                }
                Err(err) => {
                    tracing::warn!(
                        "[DEPLOY] {}/{}: root {} import failed: {}",
                        network,
                        name,
                        alias,
                        err
                    );
                    session.record_error(alias, *address, &err);
                }
            }
        }

        let mut crawled: HashMap<String, ContractNode> = self
            .crawler
            .crawl_roots(&session, &to_crawl)
            .await
            .into_iter()
            .collect();

        let trees: Vec<(String, ContractNode)> = roots
            .keys()
            .filter_map(|alias| {
                imported
                    .remove(alias)
                    .or_else(|| crawled.remove(alias))
                    .map(|node| (alias.clone(), node))
            })
            .collect();

        let mut merger = Merger::default();
        for (root, tree) in &trees {
            merger.merge(root, tree, None);
        }

        let report = session.into_report(trees);
        tracing::info!(
            "[DEPLOY] {}/{}: {} contracts, {} proxies, {} unresolved",
            network,
            name,
            merger.contracts.len(),
            report.proxy_links.len(),
            report.errors.len()
        );

        Deployment {
            network: network.to_string(),
            name: name.to_string(),
            roots: roots.clone(),
            contracts: merger.contracts,
            proxy_links: report.proxy_links,
            errors: report.errors,
        }
    }
}

#[derive(Default)]
struct Merger {
    contracts: BTreeMap<String, ContractNode>,
    alias_by_address: HashMap<Address, String>,
}

impl Merger {
    /// The first alias given to an address sticks. Reference nodes carry nothing new.
    fn merge(&mut self, root: &str, node: &ContractNode, forced_alias: Option<String>) {
        if node.is_reference() {
            return;
        }
        if !self.alias_by_address.contains_key(&node.address) {
            let candidate = forced_alias.unwrap_or_else(|| node.name.clone());
            let alias = self.unique_alias(root, candidate);
            self.alias_by_address.insert(node.address, alias.clone());
            let mut flat = node.detached();
            flat.name = alias.clone();
            self.contracts.insert(alias, flat);
        }
        let own_alias = self
            .alias_by_address
            .get(&node.address)
            .cloned()
            .unwrap_or_else(|| node.name.clone());

        for child in &node.children {
            let forced = (node.implementation == Some(child.address))
                .then(|| format!("{own_alias}:implementation"));
            self.merge(root, child, forced);
        }
    }

    /// `name`, else `{root}:{name}`, else `{root}:{name}:{n}` from 2 upward.
    fn unique_alias(&self, root: &str, name: String) -> String {
        if !self.contracts.contains_key(&name) {
            return name;
        }
        let qualified = format!("{root}:{name}");
        if !self.contracts.contains_key(&qualified) {
            return qualified;
        }
        let mut n = 2usize;
        loop {
            let candidate = format!("{qualified}:{n}");
            if !self.contracts.contains_key(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spider::crawler::NodeOrigin;
    use alloy::json_abi::JsonAbi;
    use std::sync::Arc;

    fn node(name: &str, byte: u8) -> ContractNode {
        ContractNode {
            name: name.to_string(),
            type_name: "T".to_string(),
            address: Address::from([byte; 20]),
            abi: Arc::new(JsonAbi::default()),
            implementation: None,
            origin: NodeOrigin::Crawled,
            children: Vec::new(),
        }
    }

    #[test]
    fn test_implementation_child_gets_suffixed_alias() {
        let mut proxy = node("comet", 0x01);
        let implementation = node("comet", 0x02);
        proxy.implementation = Some(implementation.address);
        proxy.children.push(implementation);

        let mut merger = Merger::default();
        merger.merge("comet", &proxy, None);
        let aliases: Vec<&str> = merger.contracts.keys().map(String::as_str).collect();
        assert_eq!(aliases, vec!["comet", "comet:implementation"]);
    }

    #[test]
    fn test_name_collisions_are_qualified_by_root() {
        let mut merger = Merger::default();
        merger.merge("cUSDCv3", &node("rewards", 0x01), None);
        merger.merge("cWETHv3", &node("rewards", 0x02), None);
        merger.merge("cWETHv3", &node("rewards", 0x03), None);
        merger.merge("cWETHv3", &node("rewards", 0x01), None);
        let aliases: Vec<&str> = merger.contracts.keys().map(String::as_str).collect();
        assert_eq!(aliases, vec!["cWETHv3:rewards", "cWETHv3:rewards:2", "rewards"]);
    }

    #[test]
    fn test_reference_nodes_do_not_claim_aliases() {
        let mut merger = Merger::default();
        merger.merge("a", &ContractNode::reference("ghost", Address::from([0x09; 20])), None);
        assert!(merger.contracts.is_empty());
    }
}
