//! RocksDB-backed snapshot store.
//!
//! Column families:
//! - `documents`: latest snapshot blob per document name
//! - `metadata`: sizes and timestamps per document (bincode)
//!
//! Both are written in one `WriteBatch`, so a reader never sees a snapshot
//! without its metadata. RocksDB calls block, so the async backend runs
//! them on the blocking pool.

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use crate::persistence::{PersistenceError, SnapshotBackend};

const CF_DOCUMENTS: &str = "documents";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("scribble_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches rooted at `path`.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Bookkeeping stored next to each snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub document: String,
    /// Blob size in bytes.
    pub size: u64,
    /// Number of stores since creation.
    pub revision: u64,
    /// Seconds since epoch.
    pub created_at: u64,
    pub updated_at: u64,
}

impl SnapshotMetadata {
    fn new(document: &str) -> Self {
        let now = unix_now();
        Self {
            document: document.to_string(),
            size: 0,
            revision: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, PersistenceError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| PersistenceError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, PersistenceError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| PersistenceError::Serialization(e.to_string()))?;
        Ok(meta)
    }
}

/// Synchronous snapshot store over RocksDB.
pub struct SnapshotStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl SnapshotStore {
    /// Open (or create) the store at the configured path.
    pub fn open(config: StoreConfig) -> Result<Self, PersistenceError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened snapshot store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);
        opts.optimize_for_point_lookup(config.block_cache_size as u64);

        // Snapshot blobs are already lz4-compressed by the codec.
        match name {
            CF_DOCUMENTS => opts.set_compression_type(DBCompressionType::None),
            _ => opts.set_compression_type(DBCompressionType::Lz4),
        }

        opts
    }

    /// Replace the snapshot of `document`, updating its metadata atomically.
    pub fn save(&self, document: &str, blob: &[u8]) -> Result<SnapshotMetadata, PersistenceError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let key = document.as_bytes();

        let mut meta = self.metadata(document)?.unwrap_or_else(|| SnapshotMetadata::new(document));
        meta.size = blob.len() as u64;
        meta.revision += 1;
        meta.updated_at = unix_now();

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_docs, key, blob);
        batch.put_cf(cf_meta, key, meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        Ok(meta)
    }

    pub fn load(&self, document: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        Ok(self.db.get_cf(cf, document.as_bytes())?)
    }

    pub fn metadata(&self, document: &str) -> Result<Option<SnapshotMetadata>, PersistenceError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, document.as_bytes())? {
            Some(bytes) => SnapshotMetadata::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Names of every stored document.
    pub fn list_documents(&self) -> Result<Vec<String>, PersistenceError> {
        let cf = self.cf(CF_METADATA)?;
        let mut names = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            names.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(names)
    }

    pub fn delete(&self, document: &str) -> Result<(), PersistenceError> {
        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_DOCUMENTS)?, document.as_bytes());
        batch.delete_cf(self.cf(CF_METADATA)?, document.as_bytes());
        self.db.write(batch)?;
        Ok(())
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), PersistenceError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, PersistenceError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| PersistenceError::Backend(format!("column family '{name}' not found")))
    }
}

/// [`SnapshotBackend`] running a [`SnapshotStore`] on the blocking pool.
#[derive(Clone)]
pub struct RocksBackend {
    store: Arc<SnapshotStore>,
}

impl RocksBackend {
    pub fn open(config: StoreConfig) -> Result<Self, PersistenceError> {
        Ok(Self { store: Arc::new(SnapshotStore::open(config)?) })
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, PersistenceError>
    where
        T: Send + 'static,
        F: FnOnce(&SnapshotStore) -> Result<T, PersistenceError> + Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| PersistenceError::TaskFailed(e.to_string()))?
    }
}

#[async_trait]
impl SnapshotBackend for RocksBackend {
    async fn get(&self, document: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        let name = document.to_string();
        self.blocking(move |store| store.load(&name)).await
    }

    async fn put(&self, document: &str, blob: Vec<u8>) -> Result<(), PersistenceError> {
        let name = document.to_string();
        let meta = self.blocking(move |store| store.save(&name, &blob)).await?;
        log::debug!("Stored {} revision {} ({} bytes)", meta.document, meta.revision, meta.size);
        Ok(())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
