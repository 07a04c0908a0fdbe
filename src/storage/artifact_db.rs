use alloy::json_abi::JsonAbi;
use alloy::primitives::{Address, Bytes};
use anyhow::Context;
use rusqlite::ffi::ErrorCode;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::artifact::BuildArtifact;
use crate::utils::constants::DEFAULT_ARTIFACT_DB_PATH;
use crate::utils::hex::address_key;

static LAST_ARTIFACT_DB_NOW_MS: AtomicU64 = AtomicU64::new(1);

/// Durable artifact store shared by every crawl session on this machine.
///
/// Rows are keyed by `(network, lower-case address)`. Writes are single-statement
/// `INSERT OR REPLACE`, so a record is either fully present or absent, and WAL mode lets
/// readers in other processes proceed while a crawl is persisting.
#[derive(Debug, Clone)]
pub struct ArtifactDb {
    path: PathBuf,
}

type ArtifactRow = (String, String, String, String);

impl ArtifactDb {
    pub fn open_default() -> anyhow::Result<Self> {
        Self::open(DEFAULT_ARTIFACT_DB_PATH)
    }

    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let db = Self {
            path: path.as_ref().to_path_buf(),
        };
        db.ensure_schema()?;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_schema(&self) -> anyhow::Result<()> {
        self.with_connection("ensure_schema", |conn| {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS artifacts (
                    network TEXT NOT NULL,
                    address TEXT NOT NULL,
                    contract_name TEXT NOT NULL,
                    abi_json TEXT NOT NULL,
                    bytecode TEXT NOT NULL,
                    metadata_json TEXT NOT NULL,
                    updated_at_ms INTEGER NOT NULL,
                    PRIMARY KEY (network, address)
                );
                "#,
            )?;
            let _ = conn.execute_batch(
                r#"
                PRAGMA journal_mode = WAL;
                PRAGMA synchronous = NORMAL;
                "#,
            );
            Ok(())
        })
    }

    pub fn load(&self, network: &str, address: Address) -> anyhow::Result<Option<BuildArtifact>> {
        let key = address_key(address);
        let row: Option<ArtifactRow> = self.with_connection("load_artifact", |conn| {
            conn.query_row(
                "SELECT contract_name, abi_json, bytecode, metadata_json FROM artifacts WHERE network = ?1 AND address = ?2",
                params![network, key],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()
        })?;
        let Some((contract_name, abi_json, bytecode, metadata_json)) = row else {
            return Ok(None);
        };

        let abi: JsonAbi = serde_json::from_str(&abi_json)
            .with_context(|| format!("corrupt abi for {network}/{key}"))?;
        let bytecode = hex::decode(bytecode.trim_start_matches("0x"))
            .with_context(|| format!("corrupt bytecode for {network}/{key}"))?;
        let metadata: serde_json::Value = serde_json::from_str(&metadata_json)
            .with_context(|| format!("corrupt metadata for {network}/{key}"))?;

        Ok(Some(BuildArtifact {
            address,
            contract_name,
            abi: Arc::new(abi),
            bytecode: Bytes::from(bytecode),
            metadata,
        }))
    }

    pub fn store(&self, network: &str, artifact: &BuildArtifact) -> anyhow::Result<()> {
        let key = address_key(artifact.address);
        let abi_json = serde_json::to_string(artifact.abi.as_ref()).context("encode abi")?;
        let metadata_json = serde_json::to_string(&artifact.metadata).context("encode metadata")?;
        let bytecode = format!("0x{}", hex::encode(&artifact.bytecode));
        let now = now_ms();
        self.with_connection("store_artifact", |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO artifacts(network, address, contract_name, abi_json, bytecode, metadata_json, updated_at_ms) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    network,
                    key,
                    artifact.contract_name,
                    abi_json,
                    bytecode,
                    metadata_json,
                    now as i64
                ],
            )
        })
        .map(|_| ())
    }

    /// Returns true when a row was deleted.
    pub fn remove(&self, network: &str, address: Address) -> anyhow::Result<bool> {
        let key = address_key(address);
        self.with_connection("remove_artifact", |conn| {
            conn.execute(
                "DELETE FROM artifacts WHERE network = ?1 AND address = ?2",
                params![network, key],
            )
        })
        .map(|deleted| deleted > 0)
    }

    pub fn count(&self, network: &str) -> anyhow::Result<u64> {
        self.with_connection("count_artifacts", |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM artifacts WHERE network = ?1",
                params![network],
                |row| row.get::<_, i64>(0),
            )
        })
        .map(|n| n.max(0) as u64)
    }

    fn with_connection<T, F>(&self, context: &str, op: F) -> anyhow::Result<T>
    where
        F: Fn(&Connection) -> rusqlite::Result<T>,
    {
        let max_attempts = 6u32;
        let mut last_err = String::new();

        for attempt in 1..=max_attempts {
            let conn = Connection::open(&self.path).with_context(|| {
                format!("failed to open sqlite database {}", self.path.display())
            })?;
            conn.busy_timeout(Duration::from_millis(5_000))
                .context("failed to configure sqlite busy timeout")?;

            match op(&conn) {
                Ok(value) => return Ok(value),
                Err(err) => {
                    last_err = err.to_string();
                    if is_sqlite_locked_error(&err) && attempt < max_attempts {
                        continue;
                    }
                    return Err(anyhow::anyhow!(
                        "{} failed for {}: {}",
                        context,
                        self.path.display(),
                        last_err
                    ));
                }
            }
        }

        Err(anyhow::anyhow!(
            "{} failed for {} after {} attempt(s): {}",
            context,
            self.path.display(),
            max_attempts,
            last_err
        ))
    }
}

fn is_sqlite_locked_error(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(code, _) => {
            matches!(
                code.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            )
        }
        _ => {
            let msg = err.to_string().to_ascii_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
    }
}

fn now_ms() -> u64 {
    let sample = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|duration| duration.as_millis() as u64);
    let mut prev = LAST_ARTIFACT_DB_NOW_MS.load(Ordering::Relaxed);
    loop {
        let normalized = sample.unwrap_or(prev).max(prev).max(1);
        match LAST_ARTIFACT_DB_NOW_MS.compare_exchange_weak(
            prev,
            normalized,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => return normalized,
            Err(actual) => prev = actual,
        }
    }
}
