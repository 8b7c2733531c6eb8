//! Stage checkpoints keyed by upstream content and stage parameters.
//!
//! A key chains the fingerprint of everything upstream with the stage's own
//! name and parameters, so changing one threshold invalidates that stage and
//! every stage after it.

use std::collections::HashMap;
use std::path::Path;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::calibration::CalibrationReport;
use crate::normalize::NormalizationConstants;
use crate::table::WideTable;

pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("checkpoint payload error: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckpointKey {
    pub stage: String,
    pub fingerprint: String,
}

impl CheckpointKey {
    pub fn derive<P: Serialize>(
        upstream_fingerprint: &str,
        stage: &str,
        params: &P,
    ) -> Result<Self, CheckpointError> {
        let params_json = serde_json::to_string(params)?;
        let mut hasher = Sha256::new();
        hasher.update(format!("version:{CHECKPOINT_SCHEMA_VERSION};"));
        hasher.update(format!("upstream:{upstream_fingerprint};"));
        hasher.update(format!("stage:{stage};"));
        hasher.update("params:");
        hasher.update(params_json.as_bytes());
        Ok(Self {
            stage: stage.to_string(),
            fingerprint: hex::encode(hasher.finalize()),
        })
    }
}

/// Everything a stage hands downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutput {
    pub table: WideTable,
    #[serde(default)]
    pub normalization: Option<NormalizationConstants>,
    #[serde(default)]
    pub calibration: Option<CalibrationReport>,
    #[serde(default)]
    pub cells_nullified: usize,
    #[serde(default)]
    pub cells_repaired: usize,
}

impl StageOutput {
    pub fn from_table(table: WideTable) -> Self {
        Self {
            table,
            normalization: None,
            calibration: None,
            cells_nullified: 0,
            cells_repaired: 0,
        }
    }
}

pub trait CheckpointStore {
    fn load(&self, key: &CheckpointKey) -> Result<Option<StageOutput>, CheckpointError>;

    fn store(&mut self, key: &CheckpointKey, output: &StageOutput) -> Result<(), CheckpointError>;
}

/// Returns the cached output for `key`, or runs `compute`, stores its result
/// and returns it. The flag is `true` on a cache hit. Nothing is written when
/// `compute` fails.
pub fn load_or_compute<F, E>(
    store: &mut dyn CheckpointStore,
    key: &CheckpointKey,
    compute: F,
) -> Result<(StageOutput, bool), E>
where
    F: FnOnce() -> Result<StageOutput, E>,
    E: From<CheckpointError>,
{
    if let Some(cached) = store.load(key)? {
        return Ok((cached, true));
    }
    let output = compute()?;
    store.store(key, &output)?;
    Ok((output, false))
}

#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    entries: HashMap<CheckpointKey, StageOutput>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load(&self, key: &CheckpointKey) -> Result<Option<StageOutput>, CheckpointError> {
        Ok(self.entries.get(key).cloned())
    }

    fn store(&mut self, key: &CheckpointKey, output: &StageOutput) -> Result<(), CheckpointError> {
        self.entries.insert(key.clone(), output.clone());
        Ok(())
    }
}

/// One row per checkpoint key with the stage output as a JSON payload.
pub struct SqliteCheckpointStore {
    conn: Connection,
}

impl SqliteCheckpointStore {
    pub fn open(path: &Path) -> Result<Self, CheckpointError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            ",
        )?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, CheckpointError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, CheckpointError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS stage_checkpoints (
                fingerprint TEXT PRIMARY KEY,
                stage TEXT NOT NULL,
                schema_version INTEGER NOT NULL,
                created_ts_ms_utc INTEGER NOT NULL,
                payload TEXT NOT NULL
            );
            ",
        )?;
        Ok(Self { conn })
    }

    pub fn stages(&self) -> Result<Vec<String>, CheckpointError> {
        let mut stmt = self.conn.prepare(
            "SELECT stage FROM stage_checkpoints ORDER BY created_ts_ms_utc ASC, rowid ASC",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut stages = Vec::new();
        for stage in rows {
            stages.push(stage?);
        }
        Ok(stages)
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    fn load(&self, key: &CheckpointKey) -> Result<Option<StageOutput>, CheckpointError> {
        let payload: Option<String> = self
            .conn
            .query_row(
                "SELECT payload FROM stage_checkpoints WHERE fingerprint = ?1 AND stage = ?2",
                params![key.fingerprint, key.stage],
                |row| row.get(0),
            )
            .optional()?;
        match payload {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    fn store(&mut self, key: &CheckpointKey, output: &StageOutput) -> Result<(), CheckpointError> {
        let payload = serde_json::to_string(output)?;
        let tx = self.conn.transaction()?;
        tx.execute(
            "
            INSERT OR REPLACE INTO stage_checkpoints
                (fingerprint, stage, schema_version, created_ts_ms_utc, payload)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ",
            params![
                key.fingerprint,
                key.stage,
                CHECKPOINT_SCHEMA_VERSION,
                Utc::now().timestamp_millis(),
                payload
            ],
        )?;
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnKey, FeatureType, TurbineId};

    fn output() -> StageOutput {
        let table = WideTable::new(
            1_000,
            vec![0, 1_000],
            vec![(
                ColumnKey::new(FeatureType::WindSpeed, TurbineId::new("wt001")),
                vec![Some(1.0), None],
            )],
        )
        .expect("valid table");
        StageOutput::from_table(table)
    }

    #[test]
    fn key_changes_with_params_and_upstream() {
        let a = CheckpointKey::derive("up", "range_flag", &(0.0, 70.0)).expect("key");
        let b = CheckpointKey::derive("up", "range_flag", &(0.0, 71.0)).expect("key");
        let c = CheckpointKey::derive("other", "range_flag", &(0.0, 70.0)).expect("key");
        let a2 = CheckpointKey::derive("up", "range_flag", &(0.0, 70.0)).expect("key");
        assert_ne!(a.fingerprint, b.fingerprint);
        assert_ne!(a.fingerprint, c.fingerprint);
        assert_eq!(a, a2);
        assert_eq!(a.fingerprint.len(), 64);
    }

    #[test]
    fn memory_store_computes_once() {
        let mut store = MemoryCheckpointStore::new();
        let key = CheckpointKey::derive("up", "impute", &"params").expect("key");
        let mut calls = 0;
        let (_, cached) = load_or_compute::<_, CheckpointError>(&mut store, &key, || {
            calls += 1;
            Ok(output())
        })
        .expect("first");
        assert!(!cached);
        let (out, cached) = load_or_compute::<_, CheckpointError>(&mut store, &key, || {
            calls += 1;
            Ok(output())
        })
        .expect("second");
        assert!(cached);
        assert_eq!(calls, 1);
        assert_eq!(out, output());
    }

    #[test]
    fn failed_compute_writes_nothing() {
        let mut store = MemoryCheckpointStore::new();
        let key = CheckpointKey::derive("up", "split", &1).expect("key");
        let result = load_or_compute(&mut store, &key, || {
            Err::<StageOutput, CheckpointError>(CheckpointError::Io(std::io::Error::other("boom")))
        });
        assert!(result.is_err());
        assert!(store.is_empty());
    }

    #[test]
    fn sqlite_store_round_trips_payload() {
        let mut store = SqliteCheckpointStore::open_in_memory().expect("open");
        let key = CheckpointKey::derive("up", "normalize", &"p").expect("key");
        assert!(store.load(&key).expect("load").is_none());
        store.store(&key, &output()).expect("store");
        assert_eq!(store.load(&key).expect("load"), Some(output()));
        assert_eq!(store.stages().expect("stages"), vec!["normalize".to_string()]);
    }
}
