use alloy::primitives::Address;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::files::DeploymentFiles;
use super::{Deployment, DeploymentSet};
use crate::artifact::{ArtifactCache, ArtifactSource};
use crate::chain::ChainReader;
use crate::error::{Result, SpiderError};
use crate::spider::{ContractMap, ContractNode, DeploymentComposer, NodeOrigin};
use crate::storage::artifact_db::ArtifactDb;
use crate::utils::constants::DEFAULT_MAX_IN_FLIGHT;

const IMPLEMENTATION_SUFFIX: &str = ":implementation";

/// Owns the deployments directory, the per-network artifact caches, and every
/// deployment built or loaded so far.
pub struct DeploymentManager {
    files: DeploymentFiles,
    artifact_db: Option<ArtifactDb>,
    source: Option<Arc<dyn ArtifactSource>>,
    caches: DashMap<String, Arc<ArtifactCache>>,
    deployments: DeploymentSet,
    max_in_flight: usize,
}

impl DeploymentManager {
    pub fn new(
        files: DeploymentFiles,
        artifact_db: Option<ArtifactDb>,
        source: Option<Arc<dyn ArtifactSource>>,
    ) -> Self {
        Self {
            files,
            artifact_db,
            source,
            caches: DashMap::new(),
            deployments: DeploymentSet::new(),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }

    /// Cap on simultaneous artifact-source fetches per network.
    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight;
        self
    }

    pub fn files(&self) -> &DeploymentFiles {
        &self.files
    }

    pub fn artifacts(&self, network: &str) -> Arc<ArtifactCache> {
        self.caches
            .entry(network.to_string())
            .or_insert_with(|| {
                Arc::new(
                    ArtifactCache::new(network, self.artifact_db.clone(), self.source.clone())
                        .with_max_in_flight(self.max_in_flight),
                )
            })
            .clone()
    }

    pub fn deployment(&self, network: &str, deployment: &str) -> Option<Arc<Deployment>> {
        self.deployments.get(network, deployment)
    }

    pub fn contract_map(&self, network: &str, deployment: &str) -> Option<ContractMap> {
        self.deployment(network, deployment)
            .map(|built| built.contract_map())
    }

    /// Crawl a deployment from its `roots.json`. With `persist`, the alias table and the
    /// unresolved listing are written next to the roots; otherwise the result is only
    /// held in memory for this process.
    pub async fn spider(
        &self,
        network: &str,
        deployment: &str,
        reader: &dyn ChainReader,
        persist: bool,
    ) -> Result<Arc<Deployment>> {
        let registry = self.files.load_registry(network, deployment)?;
        let roots = self.files.read_roots(network, deployment)?;

        for target in registry.cross_deployments() {
            if self.deployments.contains(&target.network, &target.deployment) {
                continue;
            }
            if let Err(err) = self.load(&target.network, &target.deployment) {
                tracing::warn!(
                    "[DEPLOY] {}/{} referenced by {}/{} is not available: {}",
                    target.network,
                    target.deployment,
                    network,
                    deployment,
                    err
                );
            }
        }

        let artifacts = self.artifacts(network);
        let built = DeploymentComposer::new(&artifacts, &registry, reader, &self.deployments)
            .build_deployment(network, deployment, &roots)
            .await;

        if persist {
            self.files
                .write_aliases(network, deployment, &built.aliases())?;
            self.files
                .write_unresolved(network, deployment, &built.errors)?;
            tracing::info!(
                "[DEPLOY] wrote {}",
                self.files.deployment_dir(network, deployment).display()
            );
        }
        for err in &built.errors {
            tracing::warn!(
                "[DEPLOY] unresolved {} at {:#x} ({}): {}",
                err.path,
                err.address,
                err.kind,
                err.reason
            );
        }
        Ok(self.deployments.insert(built))
    }

    /// Rebuild a deployment from `aliases.json` and cached artifacts. No RPC and no
    /// artifact source traffic; an alias whose artifact is not cached is an error.
    pub fn load(&self, network: &str, deployment: &str) -> Result<Arc<Deployment>> {
        let aliases = self
            .files
            .read_aliases(network, deployment)?
            .ok_or_else(|| SpiderError::DeploymentUnavailable {
                network: network.to_string(),
                deployment: deployment.to_string(),
            })?;
        let roots = match self.files.read_roots(network, deployment) {
            Ok(roots) => roots,
            Err(SpiderError::InvalidConfig(_)) => BTreeMap::new(),
            Err(err) => return Err(err),
        };
        let registry = self.files.load_registry(network, deployment)?;
        let artifacts = self.artifacts(network);

        let mut contracts = BTreeMap::new();
        for (alias, address) in &aliases {
            let artifact = artifacts.get_cached(*address)?.ok_or_else(|| {
                SpiderError::ArtifactNotFound {
                    network: network.to_string(),
                    address: *address,
                }
            })?;
            let type_name = registry
                .lookup_any(&[alias.as_str(), artifact.contract_name.as_str()], *address)
                .and_then(|hit| hit.entry.artifact.clone())
                .unwrap_or_else(|| artifact.contract_name.clone());
            contracts.insert(
                alias.clone(),
                ContractNode {
                    name: alias.clone(),
                    type_name,
                    address: *address,
                    abi: artifact.abi.clone(),
                    implementation: None,
                    origin: NodeOrigin::Crawled,
                    children: Vec::new(),
                },
            );
        }

        let proxy_links = proxy_links_from_aliases(&aliases);
        for (proxy, implementation) in &proxy_links {
            if let Some(node) = contracts.values_mut().find(|node| node.address == *proxy) {
                node.implementation = Some(*implementation);
            }
        }

        tracing::info!(
            "[DEPLOY] loaded {}/{} ({} contracts) from disk",
            network,
            deployment,
            contracts.len()
        );
        Ok(self.deployments.insert(Deployment {
            network: network.to_string(),
            name: deployment.to_string(),
            roots,
            contracts,
            proxy_links,
            errors: Vec::new(),
        }))
    }
}

/// `x` and `x:implementation` in one alias table are a proxy and its implementation.
fn proxy_links_from_aliases(aliases: &BTreeMap<String, Address>) -> BTreeMap<Address, Address> {
    aliases
        .iter()
        .filter_map(|(alias, implementation)| {
            let proxy_alias = alias.strip_suffix(IMPLEMENTATION_SUFFIX)?;
            aliases
                .get(proxy_alias)
                .map(|proxy| (*proxy, *implementation))
        })
        .collect()
}
