use crate::model::EntityVersion;
use crate::store::HistoryStore;
use crate::temporal::{format_date, RunDate};
use anyhow::{anyhow, Context, Result};
use rocksdb::{
    checkpoint::Checkpoint, ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch, DB,
};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info};

const CF_VERSIONS: &str = "versions";
const CF_METADATA: &str = "metadata";

const KEY_MANIFEST: &[u8] = b"manifest";
const KEY_LAST_RUN: &[u8] = b"last_run";
const KEY_GENERATION: &[u8] = b"generation";

const STORAGE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct StorageManifest {
    format_version: u32,
    app_version: String,
}

/// History table persisted in RocksDB, one value per identity key.
///
/// Rows are stored as JSON because field values are schemaless; the manifest and run
/// metadata use bincode.
pub struct PersistentHistoryStore {
    db: DB,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PersistentOpenOptions {
    pub repair: bool,
}

impl PersistentHistoryStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_options(path, PersistentOpenOptions::default())
    }

    pub fn open_with_options(
        path: impl AsRef<Path>,
        options: PersistentOpenOptions,
    ) -> Result<Self> {
        if options.repair {
            repair_db(path.as_ref())?;
        }
        let db = open_db(path.as_ref())
            .with_context(|| format!("opening history store at {}", path.as_ref().display()))?;
        validate_or_init_manifest(&db)?;
        Ok(Self { db })
    }

    /// Number of generations written since the store was created.
    pub fn generation(&self) -> Result<u64> {
        Ok(load_metadata::<u64>(&self.db, KEY_GENERATION)?.unwrap_or(0))
    }

    pub fn checkpoint(&self, path: impl AsRef<Path>) -> Result<()> {
        let checkpoint = Checkpoint::new(&self.db)?;
        checkpoint.create_checkpoint(path)?;
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    fn stored_keys(&self) -> Result<Vec<Vec<u8>>> {
        let cf = self
            .db
            .cf_handle(CF_VERSIONS)
            .ok_or_else(|| anyhow!("missing versions column family"))?;
        let keys = self
            .db
            .iterator_cf(cf, IteratorMode::Start)
            .map(|entry| entry.map(|(key, _)| key.to_vec()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }
}

impl HistoryStore for PersistentHistoryStore {
    fn load(&self) -> Result<Vec<EntityVersion>> {
        let cf = self
            .db
            .cf_handle(CF_VERSIONS)
            .ok_or_else(|| anyhow!("missing versions column family"))?;
        let mut rows = Vec::new();
        for entry in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = entry?;
            let row: EntityVersion = serde_json::from_slice(&value).with_context(|| {
                format!("decoding history row {}", String::from_utf8_lossy(&key))
            })?;
            rows.push(row);
        }
        debug!(rows = rows.len(), "history loaded");
        Ok(rows)
    }

    fn replace(&mut self, rows: &[EntityVersion], run_date: RunDate) -> Result<()> {
        let versions_cf = self
            .db
            .cf_handle(CF_VERSIONS)
            .ok_or_else(|| anyhow!("missing versions column family"))?;
        let metadata_cf = self
            .db
            .cf_handle(CF_METADATA)
            .ok_or_else(|| anyhow!("missing metadata column family"))?;

        let mut batch = WriteBatch::default();
        let mut written: HashSet<&[u8]> = HashSet::with_capacity(rows.len());
        for row in rows {
            let key = row.identity_key.0.as_bytes();
            if !written.insert(key) {
                return Err(anyhow!(
                    "history generation holds identity {} twice",
                    row.identity_key
                ));
            }
            batch.put_cf(versions_cf, key, serde_json::to_vec(row)?);
        }
        let mut removed = 0usize;
        for key in self.stored_keys()? {
            if !written.contains(key.as_slice()) {
                batch.delete_cf(versions_cf, key);
                removed += 1;
            }
        }

        let generation = self.generation()? + 1;
        batch.put_cf(metadata_cf, KEY_LAST_RUN, bincode::serialize(&run_date)?);
        batch.put_cf(metadata_cf, KEY_GENERATION, bincode::serialize(&generation)?);
        self.db.write(batch)?;

        info!(
            run_date = %format_date(run_date),
            rows = rows.len(),
            removed,
            generation,
            "history generation written"
        );
        Ok(())
    }

    fn last_run(&self) -> Result<Option<RunDate>> {
        load_metadata::<RunDate>(&self.db, KEY_LAST_RUN)
    }

    fn checkpoint(&self, path: &Path) -> Result<()> {
        PersistentHistoryStore::checkpoint(self, path)
    }
}

impl Drop for PersistentHistoryStore {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn open_db(path: &Path) -> Result<DB> {
    let mut options = Options::default();
    options.create_if_missing(true);
    options.create_missing_column_families(true);
    options.set_paranoid_checks(true);
    let cfs = vec![
        ColumnFamilyDescriptor::new(CF_VERSIONS, Options::default()),
        ColumnFamilyDescriptor::new(CF_METADATA, Options::default()),
    ];
    Ok(DB::open_cf_descriptors(&options, path, cfs)?)
}

fn repair_db(path: &Path) -> Result<()> {
    let mut options = Options::default();
    options.create_if_missing(true);
    DB::repair(&options, path)?;
    Ok(())
}

fn validate_or_init_manifest(db: &DB) -> Result<()> {
    let metadata_cf = db
        .cf_handle(CF_METADATA)
        .ok_or_else(|| anyhow!("missing metadata column family"))?;
    if let Some(bytes) = db.get_cf(metadata_cf, KEY_MANIFEST)? {
        let manifest: StorageManifest = bincode::deserialize(&bytes)?;
        if manifest.format_version != STORAGE_FORMAT_VERSION {
            return Err(anyhow!(
                "storage format version mismatch: expected {}, found {}",
                STORAGE_FORMAT_VERSION,
                manifest.format_version
            ));
        }
        return Ok(());
    }

    let manifest = StorageManifest {
        format_version: STORAGE_FORMAT_VERSION,
        app_version: env!("CARGO_PKG_VERSION").to_string(),
    };
    let bytes = bincode::serialize(&manifest)?;
    db.put_cf(metadata_cf, KEY_MANIFEST, bytes)?;
    Ok(())
}

fn load_metadata<T: serde::de::DeserializeOwned>(db: &DB, key: &[u8]) -> Result<Option<T>> {
    let metadata_cf = db
        .cf_handle(CF_METADATA)
        .ok_or_else(|| anyhow!("missing metadata column family"))?;
    if let Some(bytes) = db.get_cf(metadata_cf, key)? {
        Ok(Some(bincode::deserialize(&bytes)?))
    } else {
        Ok(None)
    }
}
