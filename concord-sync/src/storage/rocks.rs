//! RocksDB-backed [`LogStore`].
//!
//! Column families:
//! - `documents`: document heads (state, clock, sequence, status), keyed by doc_id
//! - `operations`: committed operations, keyed by `doc_id:sequence`
//! - `checkpoints`: folded log prefixes left behind by pruning, keyed by doc_id
//!
//! Values are bincode records compressed with LZ4. Every multi-key write
//! goes through a single `WriteBatch`.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use concord_core::DocumentId;

use super::{decode_blob, encode_blob, Checkpoint, DocumentRecord, LogStore, OperationRecord};
use crate::error::{CommitError, StoreError};

const CF_DOCUMENTS: &str = "documents";
const CF_OPERATIONS: &str = "operations";
const CF_CHECKPOINTS: &str = "checkpoints";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_OPERATIONS, CF_CHECKPOINTS];

/// Length of an operation key: doc_id (16) + sequence (8, big-endian).
const OP_KEY_LEN: usize = 24;

/// Store configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 256MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Fsync on every write
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 64MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("concord_data"),
            block_cache_size: 256 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, no fsync.
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

pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes the read-compare-write in `append` and `compact`.
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open (or create) the database and its column families.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
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
        log::info!("Opened RocksDB log store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        // Values are already LZ4 blobs.
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCUMENTS | CF_CHECKPOINTS => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_OPERATIONS => {
                // Many small appends, range-scanned by doc_id prefix.
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            _ => {}
        }

        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family '{name}' not found")))
    }

    fn write_opts(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>, StoreError> {
        self.write_lock
            .lock()
            .map_err(|_| StoreError::Database("write lock poisoned".into()))
    }

    /// Operation key: doc_id (16 bytes) + sequence (8 bytes big-endian).
    fn op_key(doc_id: DocumentId, sequence: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(OP_KEY_LEN);
        key.extend_from_slice(doc_id.as_bytes());
        key.extend_from_slice(&sequence.to_be_bytes());
        key
    }

    fn sequence_of(key: &[u8]) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&key[16..OP_KEY_LEN]);
        u64::from_be_bytes(buf)
    }

    /// Keys of `doc_id`'s operations with sequence in `[from, to]`.
    fn op_keys_in(
        &self,
        doc_id: DocumentId,
        from: u64,
        to: u64,
    ) -> Result<Vec<Box<[u8]>>, StoreError> {
        let cf = self.cf(CF_OPERATIONS)?;
        let start = Self::op_key(doc_id, from);
        let mut keys = Vec::new();
        for item in self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start, Direction::Forward))
        {
            let (key, _) = item?;
            if key.len() != OP_KEY_LEN || &key[..16] != doc_id.as_bytes() {
                break;
            }
            if Self::sequence_of(&key) > to {
                break;
            }
            keys.push(key);
        }
        Ok(keys)
    }
}

impl LogStore for RocksStore {
    fn load_document(&self, id: DocumentId) -> Result<Option<DocumentRecord>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(&cf, id.as_bytes())? {
            Some(bytes) => Ok(Some(decode_blob(&bytes)?)),
            None => Ok(None),
        }
    }

    fn list_documents(&self) -> Result<Vec<DocumentId>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            let bytes: [u8; 16] = key
                .as_ref()
                .try_into()
                .map_err(|_| StoreError::Deserialization("invalid document key".into()))?;
            ids.push(DocumentId::from_bytes(bytes));
        }
        Ok(ids)
    }

    fn append(
        &self,
        document: &DocumentRecord,
        operation: &OperationRecord,
        expected_sequence: u64,
    ) -> Result<(), CommitError> {
        let _guard = self.lock()?;
        let actual = self.load_document(document.id)?.map_or(0, |d| d.sequence);
        if actual != expected_sequence {
            return Err(CommitError::RaceLost {
                expected: expected_sequence,
                actual,
            });
        }

        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_ops = self.cf(CF_OPERATIONS)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(
            &cf_ops,
            Self::op_key(operation.document_id, operation.sequence),
            encode_blob(operation)?,
        );
        batch.put_cf(&cf_docs, document.id.as_bytes(), encode_blob(document)?);
        self.db
            .write_opt(batch, &self.write_opts())
            .map_err(StoreError::from)?;
        Ok(())
    }

    fn put_document(&self, document: &DocumentRecord) -> Result<(), StoreError> {
        let _guard = self.lock()?;
        let cf = self.cf(CF_DOCUMENTS)?;
        self.db
            .put_cf_opt(&cf, document.id.as_bytes(), encode_blob(document)?, &self.write_opts())?;
        Ok(())
    }

    fn read_operations(
        &self,
        id: DocumentId,
        from: u64,
        limit: usize,
    ) -> Result<Vec<OperationRecord>, StoreError> {
        let cf = self.cf(CF_OPERATIONS)?;
        let start = Self::op_key(id, from);
        let mut ops = Vec::new();
        for item in self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start, Direction::Forward))
        {
            if ops.len() >= limit {
                break;
            }
            let (key, value) = item?;
            if key.len() != OP_KEY_LEN || &key[..16] != id.as_bytes() {
                break;
            }
            ops.push(decode_blob(&value)?);
        }
        Ok(ops)
    }

    fn load_checkpoint(&self, id: DocumentId) -> Result<Option<Checkpoint>, StoreError> {
        let cf = self.cf(CF_CHECKPOINTS)?;
        match self.db.get_cf(&cf, id.as_bytes())? {
            Some(bytes) => Ok(Some(decode_blob(&bytes)?)),
            None => Ok(None),
        }
    }

    fn compact(&self, checkpoint: &Checkpoint) -> Result<u64, StoreError> {
        let _guard = self.lock()?;
        let cf_ops = self.cf(CF_OPERATIONS)?;
        let cf_cps = self.cf(CF_CHECKPOINTS)?;

        let keys = self.op_keys_in(checkpoint.document_id, 0, checkpoint.sequence)?;
        let mut batch = WriteBatch::default();
        for key in &keys {
            batch.delete_cf(&cf_ops, key);
        }
        batch.put_cf(
            &cf_cps,
            checkpoint.document_id.as_bytes(),
            encode_blob(checkpoint)?,
        );
        self.db.write_opt(batch, &self.write_opts())?;
        Ok(keys.len() as u64)
    }

    fn backend(&self) -> &'static str {
        "rocksdb"
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
