//! Recursive relation-graph discovery.
//!
//! One [`Session`] is one traversal. It owns the visited index, the proxy links found so
//! far, and every node-level failure. Nothing here is global, so independent crawls can
//! run side by side in one process.
//!
//! Traversal is depth-first in declaration order. Before descending into a set of
//! siblings the crawler fetches their artifacts concurrently; the descent itself stays
//! ordered so that the same chain state always produces the same names.

use alloy::json_abi::JsonAbi;
use alloy::primitives::Address;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, OnceLock};

use super::alias::assign_name;
use super::contract_map::ContractHandle;
use super::proxy::resolve_implementation;
use super::relation::resolve_relation;
use crate::artifact::ArtifactCache;
use crate::chain::ChainReader;
use crate::error::{Result, SpiderError};
use crate::relations::{
    AliasResolver, CrossDeployment, RelationEntry, RelationKey, RelationRegistry,
};
use crate::utils::error::compact_error_message;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeOrigin {
    /// Fully resolved by this crawl.
    Crawled,
    /// Second sighting of an address already claimed in this session.
    Reference,
    /// Copied from another deployment's output.
    Imported { network: String, deployment: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContractNode {
    pub name: String,
    pub type_name: String,
    pub address: Address,
    pub abi: Arc<JsonAbi>,
    /// Set on proxies whose implementation was found; the implementation is then the
    /// first child.
    pub implementation: Option<Address>,
    pub origin: NodeOrigin,
    pub children: Vec<ContractNode>,
}

impl ContractNode {
    pub fn reference(name: impl Into<String>, address: Address) -> Self {
        Self {
            name: name.into(),
            type_name: String::new(),
            address,
            abi: Arc::new(JsonAbi::default()),
            implementation: None,
            origin: NodeOrigin::Reference,
            children: Vec::new(),
        }
    }

    pub fn is_reference(&self) -> bool {
        self.origin == NodeOrigin::Reference
    }

    /// Same node without its subtree.
    pub fn detached(&self) -> Self {
        Self {
            children: Vec::new(),
            ..self.clone()
        }
    }

    /// Pre-order walk over this node and all descendants.
    pub fn walk(&self) -> Vec<&ContractNode> {
        let mut out = vec![self];
        for child in &self.children {
            out.extend(child.walk());
        }
        out
    }
}

/// A failure isolated to one node or one relation of a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeError {
    /// Slash-separated discovery path, e.g. `comet/implementation/baseToken`.
    pub path: String,
    pub address: Address,
    pub kind: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct CrawlReport {
    /// Root name and its discovered tree, in crawl order. Roots that could not be
    /// resolved are absent here and present in `errors`.
    pub roots: Vec<(String, ContractNode)>,
    pub proxy_links: BTreeMap<Address, Address>,
    pub errors: Vec<NodeError>,
}

impl CrawlReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Where the crawler gets nodes for `crossDeployment` entries.
pub trait DeploymentImports: Send + Sync {
    fn import(&self, target: &CrossDeployment, alias: &str) -> Result<ContractNode>;
}

/// Import provider for crawls with no other deployments available.
pub struct NoImports;

impl DeploymentImports for NoImports {
    fn import(&self, target: &CrossDeployment, _alias: &str) -> Result<ContractNode> {
        Err(SpiderError::DeploymentUnavailable {
            network: target.network.clone(),
            deployment: target.deployment.clone(),
        })
    }
}

/// An implementation is visited once per proxy that fronts it, because relations on it
/// are evaluated through that proxy's address.
type VisitKey = (Address, Option<Address>);

/// `None` inside the cell marks an address whose resolution failed.
type NameMemo = Arc<OnceLock<Option<String>>>;

enum Claim {
    New(NameMemo),
    Seen(NameMemo),
}

#[derive(Default)]
pub struct Session {
    visited: DashMap<VisitKey, NameMemo>,
    proxy_links: DashMap<Address, Address>,
    fetch_failures: DashMap<Address, SpiderError>,
    errors: Mutex<Vec<NodeError>>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomic check-then-claim on the visited index.
    fn claim(&self, key: VisitKey) -> Claim {
        match self.visited.entry(key) {
            Entry::Occupied(seen) => Claim::Seen(seen.get().clone()),
            Entry::Vacant(slot) => {
                let memo: NameMemo = Arc::new(OnceLock::new());
                slot.insert(memo.clone());
                Claim::New(memo)
            }
        }
    }

    pub fn is_visited(&self, address: Address) -> bool {
        self.visited.contains_key(&(address, None))
    }

    /// Name recorded for `address`, once it has one.
    pub fn visited_name(&self, address: Address) -> Option<String> {
        self.visited
            .get(&(address, None))
            .and_then(|memo| memo.get().cloned().flatten())
    }

    pub fn visited_count(&self) -> usize {
        self.visited.len()
    }

    pub fn implementation_of(&self, proxy: Address) -> Option<Address> {
        self.proxy_links.get(&proxy).map(|entry| *entry.value())
    }

    pub fn record_error(&self, path: &str, address: Address, err: &SpiderError) {
        let record = NodeError {
            path: path.to_string(),
            address,
            kind: err.kind().to_string(),
            reason: compact_error_message(&err.to_string(), 400),
        };
        self.errors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(record);
    }

    pub fn errors(&self) -> Vec<NodeError> {
        self.errors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn into_report(self, roots: Vec<(String, ContractNode)>) -> CrawlReport {
        let proxy_links = self.proxy_links.into_iter().collect();
        let errors = self
            .errors
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        CrawlReport {
            roots,
            proxy_links,
            errors,
        }
    }
}

/// Context carried into an implementation reached through a proxy.
#[derive(Debug, Clone)]
struct Proxied {
    proxy_address: Address,
    entry_key: Option<RelationKey>,
    /// The proxy's rule, whose relations are evaluated on the implementation.
    entry: Option<RelationEntry>,
}

#[derive(Debug, Clone)]
struct Visit {
    address: Address,
    type_hint: Option<String>,
    name: String,
    path: String,
    relation_alias: Option<AliasResolver>,
    proxied: Option<Proxied>,
}

impl Visit {
    fn key(&self) -> VisitKey {
        (
            self.address,
            self.proxied.as_ref().map(|proxied| proxied.proxy_address),
        )
    }
}

pub struct GraphCrawler<'a> {
    artifacts: &'a ArtifactCache,
    registry: &'a RelationRegistry,
    reader: &'a dyn ChainReader,
    imports: &'a dyn DeploymentImports,
}

impl<'a> GraphCrawler<'a> {
    pub fn new(
        artifacts: &'a ArtifactCache,
        registry: &'a RelationRegistry,
        reader: &'a dyn ChainReader,
        imports: &'a dyn DeploymentImports,
    ) -> Self {
        Self {
            artifacts,
            registry,
            reader,
            imports,
        }
    }

    /// Discover the subtree rooted at `address`. `None` for the zero address and for
    /// nodes whose resolution failed (the failure is in the session).
    pub async fn crawl(
        &self,
        session: &Session,
        address: Address,
        type_hint: Option<&str>,
        path_name: &str,
    ) -> Option<ContractNode> {
        self.visit(session, root_visit(address, type_hint, path_name))
            .await
    }

    /// Crawl several roots in the given order after fetching their artifacts together.
    pub async fn crawl_roots(
        &self,
        session: &Session,
        roots: &[(String, Address)],
    ) -> Vec<(String, ContractNode)> {
        let visits: Vec<Visit> = roots
            .iter()
            .map(|(name, address)| root_visit(*address, None, name))
            .collect();
        self.prefetch(session, &visits).await;

        let mut out = Vec::with_capacity(visits.len());
        for visit in visits {
            let name = visit.name.clone();
            if let Some(node) = self.visit(session, visit).await {
                out.push((name, node));
            }
        }
        out
    }

    fn visit<'s>(&'s self, session: &'s Session, visit: Visit) -> BoxFuture<'s, Option<ContractNode>> {
        async move {
            if visit.address.is_zero() {
                return None;
            }
            let memo = match session.claim(visit.key()) {
                Claim::New(memo) => memo,
                Claim::Seen(memo) => {
                    return match memo.get() {
                        Some(None) => None,
                        Some(Some(name)) => Some(ContractNode::reference(name.clone(), visit.address)),
                        None => Some(ContractNode::reference(visit.name.clone(), visit.address)),
                    };
                }
            };

            match self.resolve(session, &visit, &memo).await {
                Ok(node) => Some(node),
                Err(err) => {
                    let _ = memo.set(None);
                    tracing::warn!(
                        "[SPIDER] {} at {:#x} unresolved ({}): {}",
                        visit.path,
                        visit.address,
                        err.kind(),
                        err
                    );
                    session.record_error(&visit.path, visit.address, &err);
                    None
                }
            }
        }
        .boxed()
    }

    /// Artifact and alias failures fail the node. Proxy and relation failures are recorded
    /// and the node is kept with what was found.
    async fn resolve(&self, session: &Session, visit: &Visit, memo: &NameMemo) -> Result<ContractNode> {
        let mut names: Vec<&str> = vec![visit.name.as_str()];
        if let Some(hint) = visit.type_hint.as_deref() {
            names.push(hint);
        }

        if visit.proxied.is_none() {
            if let Some(target) = self
                .registry
                .lookup_any(&names, visit.address)
                .and_then(|hit| hit.entry.cross_deployment.as_ref())
            {
                let node = self.imports.import(target, &visit.name)?;
                if node.address != visit.address {
                    tracing::warn!(
                        "[SPIDER] {} imported from {}/{} at {:#x}, discovered at {:#x}",
                        visit.path,
                        target.network,
                        target.deployment,
                        node.address,
                        visit.address
                    );
                }
                let _ = memo.set(Some(node.name.clone()));
                tracing::info!(
                    "[SPIDER] {} -> {} imported from {}/{}",
                    visit.path,
                    node.name,
                    target.network,
                    target.deployment
                );
                return Ok(node);
            }
        }

        let artifact = match session.fetch_failures.remove(&visit.address) {
            Some((_, err)) => return Err(err),
            None => self.artifacts.get(visit.address).await?,
        };
        names.push(artifact.contract_name.as_str());
        let matched = self.registry.lookup_any(&names, visit.address);
        let entry: Option<&RelationEntry> = matched.map(|hit| hit.entry);

        let call_address = visit
            .proxied
            .as_ref()
            .map(|proxied| proxied.proxy_address)
            .unwrap_or(visit.address);
        let mut handle = ContractHandle::new(visit.name.clone(), call_address, artifact.abi.clone());

        // An implementation matched by the rule that already resolved its proxy would
        // resolve itself again through the proxy address.
        let same_rule = match (visit.proxied.as_ref(), matched) {
            (Some(proxied), Some(hit)) => proxied.entry_key.as_ref() == Some(hit.key),
            _ => false,
        };
        let strategy = entry
            .filter(|_| !same_rule)
            .and_then(|entry| entry.proxy_strategy.as_ref());

        // Resolved before naming so an alias like `symbol()` sees the implementation ABI.
        let mut proxy_failed = false;
        let implementation = match resolve_implementation(self.reader, strategy, &handle).await {
            Ok(found) => found,
            Err(err) => {
                tracing::warn!(
                    "[SPIDER] {} proxy resolution failed ({}): {}",
                    visit.path,
                    err.kind(),
                    err
                );
                session.record_error(&format!("{}/implementation", visit.path), visit.address, &err);
                proxy_failed = true;
                None
            }
        };

        let name = match visit.proxied {
            Some(_) => visit.name.clone(),
            None => {
                let alias_handle = match implementation {
                    Some(implementation) => {
                        self.implementation_handle(session, &handle, implementation)
                            .await
                    }
                    None => handle.clone(),
                };
                assign_name(
                    self.reader,
                    &visit.name,
                    &[
                        visit.relation_alias.as_ref(),
                        entry.and_then(|entry| entry.alias.as_ref()),
                    ],
                    &alias_handle,
                )
                .await?
            }
        };
        let _ = memo.set(Some(name.clone()));
        handle.name = name.clone();

        let type_name = entry
            .and_then(|entry| entry.artifact.clone())
            .unwrap_or_else(|| artifact.contract_name.clone());
        tracing::info!(
            "[SPIDER] {} -> {} ({}) at {:#x}",
            visit.path,
            name,
            type_name,
            visit.address
        );

        let mut node = ContractNode {
            name,
            type_name,
            address: visit.address,
            abi: artifact.abi.clone(),
            implementation: None,
            origin: NodeOrigin::Crawled,
            children: Vec::new(),
        };

        if let Some(implementation) = implementation {
            session.proxy_links.insert(visit.address, implementation);
            node.implementation = Some(implementation);
            tracing::debug!(
                "[SPIDER] {} proxies to {:#x}",
                visit.path,
                implementation
            );
            let child = Visit {
                address: implementation,
                type_hint: None,
                name: node.name.clone(),
                path: format!("{}/implementation", visit.path),
                relation_alias: None,
                proxied: Some(Proxied {
                    proxy_address: call_address,
                    entry_key: matched.map(|hit| hit.key.clone()),
                    entry: entry.cloned(),
                }),
            };
            if let Some(child) = self.visit(session, child).await {
                node.children.push(child);
            }
        }

        // Relations declared on the proxy's rule run on the implementation, through the
        // proxy address, unless the implementation matched that same rule.
        let inherited = visit
            .proxied
            .as_ref()
            .filter(|_| !same_rule)
            .and_then(|proxied| proxied.entry.as_ref());
        if let Some(inherited) = inherited {
            let children = self
                .visit_relations(session, &visit.path, inherited, &handle)
                .await;
            node.children.extend(children);
        }

        if implementation.is_none() && !proxy_failed {
            if let Some(entry) = entry {
                let children = self.visit_relations(session, &visit.path, entry, &handle).await;
                node.children.extend(children);
            }
        }
        Ok(node)
    }

    /// Handle at the proxy address carrying the implementation ABI. Falls back to the
    /// proxy's own ABI when the implementation artifact is unavailable; that failure is
    /// parked and reported when the implementation is visited.
    async fn implementation_handle(
        &self,
        session: &Session,
        proxy: &ContractHandle,
        implementation: Address,
    ) -> ContractHandle {
        if session.fetch_failures.contains_key(&implementation) {
            return proxy.clone();
        }
        match self.artifacts.get(implementation).await {
            Ok(artifact) => ContractHandle::new(proxy.name.clone(), proxy.address, artifact.abi),
            Err(err) => {
                session.fetch_failures.insert(implementation, err);
                proxy.clone()
            }
        }
    }

    async fn visit_relations(
        &self,
        session: &Session,
        path: &str,
        entry: &RelationEntry,
        handle: &ContractHandle,
    ) -> Vec<ContractNode> {
        let mut planned = Vec::new();
        for relation in &entry.child_relations {
            match resolve_relation(self.reader, handle, &relation.resolver).await {
                Ok(resolved) => {
                    let names = resolved.child_names(&relation.name);
                    for (name, address) in names.into_iter().zip(resolved.addresses) {
                        if address.is_zero() {
                            continue;
                        }
                        planned.push(Visit {
                            address,
                            type_hint: None,
                            path: format!("{path}/{name}"),
                            name,
                            relation_alias: relation.alias.clone(),
                            proxied: None,
                        });
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        "[SPIDER] {}/{} relation failed ({}): {}",
                        path,
                        relation.name,
                        err.kind(),
                        err
                    );
                    session.record_error(&format!("{path}/{}", relation.name), handle.address, &err);
                }
            }
        }

        self.prefetch(session, &planned).await;

        let mut children = Vec::with_capacity(planned.len());
        for child in planned {
            if let Some(node) = self.visit(session, child).await {
                children.push(node);
            }
        }
        children
    }

    /// Warm the artifact cache for upcoming siblings. Fetches are issued together but the
    /// cache admits at most its in-flight limit at once. Failures are parked in the session
    /// and surface when the sibling itself is visited.
    async fn prefetch(&self, session: &Session, visits: &[Visit]) {
        let mut pending = BTreeSet::new();
        for visit in visits {
            if visit.address.is_zero() || session.visited.contains_key(&visit.key()) {
                continue;
            }
            let imported = self
                .registry
                .lookup_any(&[visit.name.as_str()], visit.address)
                .is_some_and(|hit| hit.entry.cross_deployment.is_some());
            if imported {
                continue;
            }
            if matches!(self.artifacts.get_cached(visit.address), Ok(Some(_))) {
                continue;
            }
            pending.insert(visit.address);
        }
        if pending.len() < 2 {
            return;
        }

        let pending: Vec<Address> = pending.into_iter().collect();
        tracing::debug!("[SPIDER] prefetching {} artifacts", pending.len());
        let results = join_all(pending.iter().map(|address| self.artifacts.get(*address))).await;
        for (address, result) in pending.into_iter().zip(results) {
            if let Err(err) = result {
                session.fetch_failures.insert(address, err);
            }
        }
    }
}

fn root_visit(address: Address, type_hint: Option<&str>, name: &str) -> Visit {
    Visit {
        address,
        type_hint: type_hint.map(str::to_string),
        name: name.to_string(),
        path: name.to_string(),
        relation_alias: None,
        proxied: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_claim_is_exclusive_per_key() {
        let session = Session::new();
        let address = Address::from([0x01; 20]);
        assert!(matches!(session.claim((address, None)), Claim::New(_)));
        assert!(matches!(session.claim((address, None)), Claim::Seen(_)));
        assert!(matches!(
            session.claim((address, Some(Address::from([0x02; 20])))),
            Claim::New(_)
        ));
        assert!(session.is_visited(address));
        assert_eq!(session.visited_count(), 2);
    }

    #[test]
    fn test_walk_is_preorder() {
        let mut root = ContractNode::reference("root", Address::from([0x01; 20]));
        let mut mid = ContractNode::reference("mid", Address::from([0x02; 20]));
        mid.children
            .push(ContractNode::reference("leaf", Address::from([0x03; 20])));
        root.children.push(mid);
        root.children
            .push(ContractNode::reference("tail", Address::from([0x04; 20])));
        let names: Vec<&str> = root.walk().iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["root", "mid", "leaf", "tail"]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_zero_address_is_pruned_without_error() {
        let artifacts = ArtifactCache::in_memory("mainnet");
        let registry = RelationRegistry::default();
        let reader = NullReader;
        let crawler = GraphCrawler::new(&artifacts, &registry, &reader, &NoImports);
        let session = Session::new();
        assert!(crawler
            .crawl(&session, Address::ZERO, None, "comet")
            .await
            .is_none());
        assert!(session.errors().is_empty());
        assert_eq!(session.visited_count(), 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_missing_artifact_is_reported_once() {
        let artifacts = ArtifactCache::in_memory("mainnet");
        let registry = RelationRegistry::default();
        let reader = NullReader;
        let crawler = GraphCrawler::new(&artifacts, &registry, &reader, &NoImports);
        let session = Session::new();
        let address = Address::from([0x05; 20]);

        assert!(crawler.crawl(&session, address, None, "comet").await.is_none());
        assert!(crawler.crawl(&session, address, None, "again").await.is_none());
        let errors = session.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, "artifact_not_found");
        assert_eq!(errors[0].path, "comet");
    }

    struct NullReader;

    #[async_trait::async_trait]
    impl ChainReader for NullReader {
        async fn call(
            &self,
            address: Address,
            _abi: &JsonAbi,
            function: &str,
            _args: &[alloy::dyn_abi::DynSolValue],
        ) -> Result<Vec<alloy::dyn_abi::DynSolValue>> {
            Err(SpiderError::CallFailed {
                address,
                function: function.to_string(),
                reason: "null reader".into(),
            })
        }

        async fn read_storage_slot(
            &self,
            _address: Address,
            _slot: alloy::primitives::B256,
        ) -> Result<alloy::primitives::B256> {
            Ok(alloy::primitives::B256::ZERO)
        }
    }
}
