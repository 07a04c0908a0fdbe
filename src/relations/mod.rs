//! Declarative discovery rules.
//!
//! A [`RelationRegistry`] is two [`RelationTable`]s: deployment-specific overrides on top of
//! a shared base. A key present in the override table replaces the base entry wholesale;
//! fields are never merged across layers.

pub mod strategy;

use alloy::primitives::Address;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::Path;

pub use strategy::{AliasResolver, ProxyStrategy, ResolutionStrategy};

use crate::error::{Result, SpiderError};
use crate::utils::hex::{address_key, parse_address};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RelationEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_strategy: Option<ProxyStrategy>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub child_relations: Vec<ChildRelation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<AliasResolver>,
    /// Artifact name reported as the node's type name instead of the verified one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cross_deployment: Option<CrossDeployment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChildRelation {
    pub name: String,
    pub resolver: ResolutionStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<AliasResolver>,
}

/// Pointer to another deployment whose already-built output supplies this node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CrossDeployment {
    pub network: String,
    pub deployment: String,
}

/// The key an entry was found under. Lower-case hex for address keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RelationKey {
    Address(Address),
    Name(String),
}

impl std::fmt::Display for RelationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelationKey::Address(address) => f.write_str(&address_key(*address)),
            RelationKey::Name(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MatchedEntry<'a> {
    pub key: &'a RelationKey,
    pub entry: &'a RelationEntry,
}

/// One layer of relation rules.
#[derive(Debug, Clone, Default)]
pub struct RelationTable {
    by_address: HashMap<Address, (RelationKey, RelationEntry)>,
    by_name: HashMap<String, (RelationKey, RelationEntry)>,
}

impl RelationTable {
    pub fn from_entries<I>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, RelationEntry)>,
    {
        let mut table = Self::default();
        for (key, entry) in entries {
            table.insert(&key, entry)?;
        }
        Ok(table)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let entries: BTreeMap<String, RelationEntry> = serde_json::from_str(raw)?;
        Self::from_entries(entries)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Self::from_json_str(&raw).map_err(|err| {
            SpiderError::InvalidConfig(format!("{}: {err}", path.display()))
        })
    }

    /// `0x`-prefixed 40-hex-digit keys are address keys; everything else is a name.
    pub fn insert(&mut self, key: &str, entry: RelationEntry) -> Result<()> {
        let trimmed = key.trim();
        if trimmed.is_empty() {
            return Err(SpiderError::InvalidConfig(
                "relation keys must not be empty".to_string(),
            ));
        }
        if looks_like_address(trimmed) {
            let address = parse_address(trimmed)?;
            self.by_address
                .insert(address, (RelationKey::Address(address), entry));
        } else {
            self.by_name.insert(
                trimmed.to_string(),
                (RelationKey::Name(trimmed.to_string()), entry),
            );
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.by_address.len() + self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entries(&self) -> impl Iterator<Item = &RelationEntry> {
        self.by_address
            .values()
            .chain(self.by_name.values())
            .map(|(_, entry)| entry)
    }

    fn by_address(&self, address: Address) -> Option<MatchedEntry<'_>> {
        self.by_address
            .get(&address)
            .map(|(key, entry)| MatchedEntry { key, entry })
    }

    fn by_name(&self, name: &str) -> Option<MatchedEntry<'_>> {
        self.by_name
            .get(name)
            .map(|(key, entry)| MatchedEntry { key, entry })
    }
}

fn looks_like_address(key: &str) -> bool {
    let Some(body) = key.strip_prefix("0x").or_else(|| key.strip_prefix("0X")) else {
        return false;
    };
    body.len() == 40 && body.chars().all(|c| c.is_ascii_hexdigit())
}

#[derive(Debug, Clone, Default)]
pub struct RelationRegistry {
    overrides: RelationTable,
    base: RelationTable,
}

impl RelationRegistry {
    pub fn new(base: RelationTable) -> Self {
        Self {
            overrides: RelationTable::default(),
            base,
        }
    }

    pub fn overlay(base: RelationTable, overrides: RelationTable) -> Self {
        Self { overrides, base }
    }

    /// Address entries beat name entries; the override layer beats the base at each step.
    pub fn lookup(&self, contract_name: &str, address: Address) -> Option<MatchedEntry<'_>> {
        self.lookup_any(&[contract_name], address)
    }

    /// Like [`lookup`](Self::lookup) with several candidate names tried in order, e.g. the
    /// path-derived name before the verified type name.
    pub fn lookup_any(&self, names: &[&str], address: Address) -> Option<MatchedEntry<'_>> {
        if let Some(hit) = self
            .overrides
            .by_address(address)
            .or_else(|| self.base.by_address(address))
        {
            return Some(hit);
        }
        names.iter().find_map(|name| {
            self.overrides
                .by_name(name)
                .or_else(|| self.base.by_name(name))
        })
    }

    /// Every deployment referenced by a `crossDeployment` pointer in either layer.
    pub fn cross_deployments(&self) -> BTreeSet<CrossDeployment> {
        self.overrides
            .entries()
            .chain(self.base.entries())
            .filter_map(|entry| entry.cross_deployment.clone())
            .collect()
    }
}
