//! On-disk deployment artifacts.
//!
//! ```text
//! deployments/
//!   relations.json                     shared base relation table
//!   <network>/<deployment>/
//!     roots.json                       rootName -> address   (crawl input)
//!     relations.json                   deployment overrides  (optional)
//!     aliases.json                     alias -> address      (crawl output)
//!     unresolved.json                  node failures of the last crawl, if any
//! ```
//!
//! Maps are written as pretty JSON with sorted keys and lower-case addresses so reruns
//! against unchanged chain state produce identical bytes.

use alloy::primitives::Address;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, SpiderError};
use crate::relations::{RelationRegistry, RelationTable};
use crate::spider::NodeError;
use crate::utils::hex::{address_key, parse_address};

pub const ROOTS_FILE: &str = "roots.json";
pub const ALIASES_FILE: &str = "aliases.json";
pub const RELATIONS_FILE: &str = "relations.json";
pub const UNRESOLVED_FILE: &str = "unresolved.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnresolvedRecord {
    pub path: String,
    pub address: String,
    pub kind: String,
    pub reason: String,
}

impl From<&NodeError> for UnresolvedRecord {
    fn from(err: &NodeError) -> Self {
        Self {
            path: err.path.clone(),
            address: address_key(err.address),
            kind: err.kind.clone(),
            reason: err.reason.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeploymentFiles {
    root: PathBuf,
}

impl DeploymentFiles {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn deployment_dir(&self, network: &str, deployment: &str) -> PathBuf {
        self.root.join(network).join(deployment)
    }

    fn file(&self, network: &str, deployment: &str, name: &str) -> PathBuf {
        self.deployment_dir(network, deployment).join(name)
    }

    pub fn read_roots(&self, network: &str, deployment: &str) -> Result<BTreeMap<String, Address>> {
        let path = self.file(network, deployment, ROOTS_FILE);
        read_address_map(&path)?.ok_or_else(|| {
            SpiderError::InvalidConfig(format!("missing roots file {}", path.display()))
        })
    }

    pub fn write_roots(
        &self,
        network: &str,
        deployment: &str,
        roots: &BTreeMap<String, Address>,
    ) -> Result<()> {
        write_address_map(&self.file(network, deployment, ROOTS_FILE), roots)
    }

    pub fn read_aliases(
        &self,
        network: &str,
        deployment: &str,
    ) -> Result<Option<BTreeMap<String, Address>>> {
        read_address_map(&self.file(network, deployment, ALIASES_FILE))
    }

    pub fn write_aliases(
        &self,
        network: &str,
        deployment: &str,
        aliases: &BTreeMap<String, Address>,
    ) -> Result<()> {
        write_address_map(&self.file(network, deployment, ALIASES_FILE), aliases)
    }

    /// Writes the listing when there are errors and removes a stale one when there are none.
    pub fn write_unresolved(&self, network: &str, deployment: &str, errors: &[NodeError]) -> Result<()> {
        let path = self.file(network, deployment, UNRESOLVED_FILE);
        if errors.is_empty() {
            match fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(err) => Err(err.into()),
            }
        } else {
            let records: Vec<UnresolvedRecord> = errors.iter().map(UnresolvedRecord::from).collect();
            atomic_write_json(&path, &records)
        }
    }

    pub fn read_unresolved(&self, network: &str, deployment: &str) -> Result<Vec<UnresolvedRecord>> {
        let path = self.file(network, deployment, UNRESOLVED_FILE);
        match fs::read_to_string(&path) {
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    /// Base table from `<root>/relations.json` overlaid by the deployment's own file.
    /// Either may be absent.
    pub fn load_registry(&self, network: &str, deployment: &str) -> Result<RelationRegistry> {
        let base = read_relation_table(&self.root.join(RELATIONS_FILE))?;
        let overrides = read_relation_table(&self.file(network, deployment, RELATIONS_FILE))?;
        Ok(RelationRegistry::overlay(base, overrides))
    }
}

fn read_relation_table(path: &Path) -> Result<RelationTable> {
    if !path.exists() {
        return Ok(RelationTable::default());
    }
    RelationTable::from_file(path)
}

fn read_address_map(path: &Path) -> Result<Option<BTreeMap<String, Address>>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let parsed: BTreeMap<String, String> = serde_json::from_str(&raw)?;
    let mut out = BTreeMap::new();
    for (name, address) in parsed {
        let address = parse_address(&address).map_err(|err| {
            SpiderError::InvalidConfig(format!("{} entry `{name}`: {err}", path.display()))
        })?;
        out.insert(name, address);
    }
    Ok(Some(out))
}

fn write_address_map(path: &Path, map: &BTreeMap<String, Address>) -> Result<()> {
    let rendered: BTreeMap<&str, String> = map
        .iter()
        .map(|(name, address)| (name.as_str(), address_key(*address)))
        .collect();
    atomic_write_json(path, &rendered)
}

/// Pretty JSON written to `<file>.tmp` and renamed into place.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut json = serde_json::to_vec_pretty(value)?;
    json.push(b'\n');
    let tmp_path = path.with_extension(format!(
        "{}.tmp",
        path.extension().and_then(|s| s.to_str()).unwrap_or("tmp")
    ));
    fs::write(&tmp_path, &json)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(prefix: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .ok()
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("{}_{}", prefix, nanos))
    }

    #[test]
    fn test_alias_file_is_sorted_and_lower_case() {
        let dir = temp_dir("deployment_files_aliases");
        let files = DeploymentFiles::new(&dir);
        let mut aliases = BTreeMap::new();
        aliases.insert(
            "comet".to_string(),
            parse_address("0xc3d688B66703497DAA19211EEdff47f25384cdc3").expect("address"),
        );
        aliases.insert("USDC".to_string(), Address::from([0xab; 20]));

        files.write_aliases("mainnet", "usdc", &aliases).expect("write");
        let raw = fs::read_to_string(dir.join("mainnet/usdc/aliases.json")).expect("read");
        assert_eq!(
            raw,
            "{\n  \"USDC\": \"0xabababababababababababababababababababab\",\n  \"comet\": \"0xc3d688b66703497daa19211eedff47f25384cdc3\"\n}\n"
        );
        assert_eq!(
            files.read_aliases("mainnet", "usdc").expect("read back"),
            Some(aliases)
        );
        assert!(!dir.join("mainnet/usdc/aliases.json.tmp").exists());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_unresolved_written_then_cleared() {
        let dir = temp_dir("deployment_files_unresolved");
        let files = DeploymentFiles::new(&dir);
        let errors = vec![NodeError {
            path: "comet/rewards".into(),
            address: Address::from([0x01; 20]),
            kind: "unverified_contract".into(),
            reason: "not verified".into(),
        }];
        files
            .write_unresolved("mainnet", "usdc", &errors)
            .expect("write");
        assert_eq!(files.read_unresolved("mainnet", "usdc").expect("read").len(), 1);

        files.write_unresolved("mainnet", "usdc", &[]).expect("clear");
        assert!(files.read_unresolved("mainnet", "usdc").expect("read").is_empty());
        files.write_unresolved("mainnet", "usdc", &[]).expect("clear twice");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_missing_roots_is_config_error_and_missing_relations_are_empty() {
        let dir = temp_dir("deployment_files_missing");
        let files = DeploymentFiles::new(&dir);
        assert!(matches!(
            files.read_roots("mainnet", "usdc"),
            Err(SpiderError::InvalidConfig(_))
        ));
        let registry = files.load_registry("mainnet", "usdc").expect("registry");
        assert!(registry.lookup("comet", Address::ZERO).is_none());
    }
}
