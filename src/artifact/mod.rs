//! Build artifacts and the cache that serves them.
//!
//! Lookup order for an address is memory, then the SQLite store, then the external
//! [`ArtifactSource`]. Anything fetched is written through to both layers so later crawls
//! in this or another process resolve it locally.

pub mod etherscan;

use alloy::json_abi::JsonAbi;
use alloy::primitives::{Address, Bytes};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::error::{Result, SpiderError};
use crate::storage::artifact_db::ArtifactDb;
use crate::utils::constants::DEFAULT_MAX_IN_FLIGHT;

/// Compiled-contract metadata for one address. Replaced wholesale, never patched.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildArtifact {
    pub address: Address,
    pub contract_name: String,
    pub abi: Arc<JsonAbi>,
    pub bytecode: Bytes,
    pub metadata: serde_json::Value,
}

/// Source-verification lookup used on a cache miss.
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    /// Fails with [`SpiderError::UnverifiedContract`] or [`SpiderError::ArtifactNotFound`]
    /// when the address has no published source.
    async fn fetch_verified_contract(&self, network: &str, address: Address)
        -> Result<BuildArtifact>;
}

pub struct ArtifactCache {
    network: String,
    memory: DashMap<Address, BuildArtifact>,
    db: Option<ArtifactDb>,
    source: Option<Arc<dyn ArtifactSource>>,
    /// Caps simultaneous source fetches, however many siblings are prefetched.
    fetch_permits: Arc<Semaphore>,
}

impl ArtifactCache {
    pub fn new(
        network: impl Into<String>,
        db: Option<ArtifactDb>,
        source: Option<Arc<dyn ArtifactSource>>,
    ) -> Self {
        Self {
            network: network.into(),
            memory: DashMap::new(),
            db,
            source,
            fetch_permits: Arc::new(Semaphore::new(DEFAULT_MAX_IN_FLIGHT)),
        }
    }

    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.fetch_permits = Arc::new(Semaphore::new(max_in_flight.max(1)));
        self
    }

    /// Cache with no durable store and no source; only `put` populates it.
    pub fn in_memory(network: impl Into<String>) -> Self {
        Self::new(network, None, None)
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    pub async fn get(&self, address: Address) -> Result<BuildArtifact> {
        if let Some(hit) = self.get_cached(address)? {
            return Ok(hit);
        }
        let Some(source) = self.source.as_ref() else {
            return Err(SpiderError::ArtifactNotFound {
                network: self.network.clone(),
                address,
            });
        };

        let _permit = self
            .fetch_permits
            .acquire()
            .await
            .map_err(|_| SpiderError::TransientRpc("artifact fetch limiter closed".to_string()))?;
        // Another task may have fetched it while this one waited.
        if let Some(hit) = self.get_cached(address)? {
            return Ok(hit);
        }
        tracing::debug!("[ARTIFACT] miss for {:#x} on {}, fetching", address, self.network);
        let mut artifact = match source.fetch_verified_contract(&self.network, address).await {
            Ok(artifact) => artifact,
            Err(err) => {
                tracing::warn!(
                    "[ARTIFACT] {:#x} on {} unavailable ({}): {}",
                    address,
                    self.network,
                    err.kind(),
                    err
                );
                return Err(err);
            }
        };
        artifact.address = address;
        self.put(artifact.clone())?;
        tracing::info!(
            "[ARTIFACT] cached {} at {:#x} on {}",
            artifact.contract_name,
            address,
            self.network
        );
        Ok(artifact)
    }

    /// Write-through insert, for callers that already hold the artifact.
    pub fn put(&self, artifact: BuildArtifact) -> Result<()> {
        if let Some(db) = self.db.as_ref() {
            db.store(&self.network, &artifact)
                .map_err(|err| SpiderError::Storage(format!("{err:#}")))?;
        }
        self.memory.insert(artifact.address, artifact);
        Ok(())
    }

    /// Memory and disk only. Never contacts the source.
    pub fn get_cached(&self, address: Address) -> Result<Option<BuildArtifact>> {
        if let Some(hit) = self.memory.get(&address) {
            return Ok(Some(hit.value().clone()));
        }
        let Some(db) = self.db.as_ref() else {
            return Ok(None);
        };
        let loaded = db
            .load(&self.network, address)
            .map_err(|err| SpiderError::Storage(format!("{err:#}")))?;
        if let Some(artifact) = loaded.as_ref() {
            self.memory.insert(address, artifact.clone());
        }
        Ok(loaded)
    }

    /// Drop one record from memory and disk so the next `get` refetches it.
    pub fn invalidate(&self, address: Address) -> Result<bool> {
        let in_memory = self.memory.remove(&address).is_some();
        let on_disk = match self.db.as_ref() {
            Some(db) => db
                .remove(&self.network, address)
                .map_err(|err| SpiderError::Storage(format!("{err:#}")))?,
            None => false,
        };
        Ok(in_memory || on_disk)
    }
}
