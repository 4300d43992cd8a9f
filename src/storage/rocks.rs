//! RocksDB-backed snapshot store.
//!
//! Column families:
//! - `snapshots` — full replica snapshots, LZ4 compressed
//! - `metadata`  — per-document bookkeeping (sizes, flush counter, timestamps)
//!
//! Snapshots are write-mostly and point-read on document open, so both CFs
//! are tuned for point lookups with bloom filters and a shared block cache.
//! Old snapshots are overwritten in place; archival and retention are the
//! host's concern, this store never deletes.
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;
use uuid::Uuid;

use super::{SnapshotStore, StoreError};

const CF_SNAPSHOTS: &str = "snapshots";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_METADATA];

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
            path: PathBuf::from("tandem_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 2 * 1024 * 1024,
        }
    }
}

/// Bookkeeping stored alongside each snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub doc_id: Uuid,
    /// Number of snapshots flushed for this document.
    pub flush_count: u64,
    /// Uncompressed snapshot size in bytes
    pub snapshot_size: u64,
    /// Compressed snapshot size in bytes
    pub compressed_size: u64,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last flush timestamp (seconds since epoch)
    pub flushed_at: u64,
}

impl SnapshotMetadata {
    fn new(doc_id: Uuid) -> Self {
        let now = unix_now();
        Self {
            doc_id,
            flush_count: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            flushed_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Encode(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        Ok(meta)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// RocksDB-backed snapshot store.
///
/// Single-threaded RocksDB mode; serialization across callers comes from the
/// per-document actor, the interior mutex only covers cross-document access.
pub struct RocksStore {
    db: Mutex<DBWithThreadMode<SingleThreaded>>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open the store at the configured path, creating it if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(&config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        Ok(Self {
            db: Mutex::new(db),
            config,
        })
    }

    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        // Values are LZ4-compressed by us before the write, skip double work.
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);
        opts.optimize_for_point_lookup(config.block_cache_size as u64);

        opts
    }

    /// Per-document bookkeeping.
    pub fn metadata(&self, doc_id: Uuid) -> Result<Option<SnapshotMetadata>, StoreError> {
        let db = self.lock()?;
        let cf = db
            .cf_handle(CF_METADATA)
            .ok_or_else(|| StoreError::Backend(format!("Column family '{CF_METADATA}' not found")))?;
        match db.get_cf(&cf, doc_id.as_bytes())? {
            Some(bytes) => Ok(Some(SnapshotMetadata::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All document ids with a stored snapshot.
    pub fn list_documents(&self) -> Result<Vec<Uuid>, StoreError> {
        let db = self.lock()?;
        let cf = db
            .cf_handle(CF_METADATA)
            .ok_or_else(|| StoreError::Backend(format!("Column family '{CF_METADATA}' not found")))?;

        let mut doc_ids = Vec::new();
        for item in db.iterator_cf(&cf, rocksdb::IteratorMode::Start) {
            let (key, _) = item.map_err(|e| StoreError::Backend(e.to_string()))?;
            if key.len() == 16 {
                let id = Uuid::from_bytes(
                    key.as_ref()
                        .try_into()
                        .map_err(|_| StoreError::Decode("Invalid UUID key".into()))?,
                );
                doc_ids.push(id);
            }
        }
        Ok(doc_ids)
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, DBWithThreadMode<SingleThreaded>>, StoreError> {
        self.db
            .lock()
            .map_err(|_| StoreError::Backend("store mutex poisoned".into()))
    }
}

impl SnapshotStore for RocksStore {
    fn load(&self, doc_id: Uuid) -> Result<Option<Vec<u8>>, StoreError> {
        let db = self.lock()?;
        let cf = db
            .cf_handle(CF_SNAPSHOTS)
            .ok_or_else(|| StoreError::Backend(format!("Column family '{CF_SNAPSHOTS}' not found")))?;

        match db.get_cf(&cf, doc_id.as_bytes())? {
            Some(compressed) => {
                let snapshot = lz4_flex::decompress_size_prepended(&compressed)
                    .map_err(|e| StoreError::Decode(e.to_string()))?;
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }

    fn save(&self, doc_id: Uuid, snapshot: &[u8]) -> Result<(), StoreError> {
        let compressed = lz4_flex::compress_prepend_size(snapshot);

        let mut meta = self
            .metadata(doc_id)?
            .unwrap_or_else(|| SnapshotMetadata::new(doc_id));
        meta.flush_count += 1;
        meta.snapshot_size = snapshot.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.flushed_at = unix_now();

        let db = self.lock()?;
        let cf_snap = db
            .cf_handle(CF_SNAPSHOTS)
            .ok_or_else(|| StoreError::Backend(format!("Column family '{CF_SNAPSHOTS}' not found")))?;
        let cf_meta = db
            .cf_handle(CF_METADATA)
            .ok_or_else(|| StoreError::Backend(format!("Column family '{CF_METADATA}' not found")))?;

        // Atomic batch: snapshot + metadata move together.
        let mut batch = WriteBatch::default();
        let key = doc_id.as_bytes();
        batch.put_cf(&cf_snap, key, &compressed);
        batch.put_cf(&cf_meta, key, &meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        db.write_opt(batch, &write_opts)?;
        Ok(())
    }
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
