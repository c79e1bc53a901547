//! Keyed-by-hash block header storage with a best-tip pointer.
//!
//! Record layout is byte exact: 80 bytes of consensus-encoded header,
//! 4 bytes big-endian height, 32 bytes big-endian cumulative work. A
//! separate single-record region holds the current chain tip.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bitcoin::block::Header as BlockHeader;
use bitcoin::consensus::{deserialize, serialize};
use bitcoin::BlockHash;

use crate::chain::work::ChainWork;
use crate::error::{StoreError, StoreResult};

/// Size of one serialized header record.
pub const HEADER_RECORD_SIZE: usize = 116;

/// Number of confirmations kept below the tip when pruning.
pub const PRUNE_KEEP_DEPTH: u32 = 2000;

/// A block header with its chain position and accumulated work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredHeader {
    pub header: BlockHeader,
    pub height: u32,
    pub total_work: ChainWork,
}

impl StoredHeader {
    pub fn new(header: BlockHeader, height: u32, total_work: ChainWork) -> Self {
        Self {
            header,
            height,
            total_work,
        }
    }

    pub fn block_hash(&self) -> BlockHash {
        self.header.block_hash()
    }

    /// Encode to the fixed 116-byte record layout.
    pub fn serialize_record(&self) -> [u8; HEADER_RECORD_SIZE] {
        let mut out = [0u8; HEADER_RECORD_SIZE];
        let header_bytes = serialize(&self.header);
        out[..80].copy_from_slice(&header_bytes);
        out[80..84].copy_from_slice(&self.height.to_be_bytes());
        out[84..116].copy_from_slice(&self.total_work.to_be_bytes());
        out
    }

    /// Decode from the fixed 116-byte record layout.
    pub fn deserialize_record(bytes: &[u8]) -> StoreResult<Self> {
        if bytes.len() != HEADER_RECORD_SIZE {
            return Err(StoreError::Corruption(format!(
                "header record has {} bytes, expected {}",
                bytes.len(),
                HEADER_RECORD_SIZE
            )));
        }
        let header: BlockHeader = deserialize(&bytes[..80])
            .map_err(|e| StoreError::Corruption(format!("header decode: {}", e)))?;
        let mut height_bytes = [0u8; 4];
        height_bytes.copy_from_slice(&bytes[80..84]);
        let mut work_bytes = [0u8; 32];
        work_bytes.copy_from_slice(&bytes[84..116]);
        Ok(Self {
            header,
            height: u32::from_be_bytes(height_bytes),
            total_work: ChainWork::from_be_bytes(work_bytes),
        })
    }
}

/// Persistence seam for the chain engine.
pub trait HeaderStore: Send {
    /// Upsert a record; when `new_tip` is set, the tip pointer is
    /// overwritten as well.
    fn put(&mut self, record: StoredHeader, new_tip: bool) -> StoreResult<()>;

    /// Fetch the record whose hash equals `header.prev_blockhash`.
    fn get_previous(&mut self, header: &BlockHeader) -> StoreResult<StoredHeader>;

    /// Fetch a record by hash.
    fn get(&mut self, hash: &BlockHash) -> StoreResult<StoredHeader>;

    /// The current chain tip. Fails with `NotFound` until the store is
    /// seeded.
    fn best(&mut self) -> StoreResult<StoredHeader>;

    /// Height of the current tip.
    fn height(&mut self) -> StoreResult<u32> {
        Ok(self.best()?.height)
    }

    /// Delete every record below `tip.height - keep_depth`, keeping the
    /// unique record at exactly that boundary.
    fn prune(&mut self, keep_depth: u32) -> StoreResult<()>;

    /// Write every record, ordered by height, in a human-readable form.
    fn dump(&mut self, writer: &mut dyn Write) -> StoreResult<()>;

    /// Flush pending writes.
    fn close(&mut self) -> StoreResult<()>;
}

fn dump_records(records: &mut Vec<StoredHeader>, writer: &mut dyn Write) -> StoreResult<()> {
    records.sort_by_key(|r| r.height);
    let mut prev_height = None;
    let mut dup = 0u32;
    for record in records {
        dup = match prev_height {
            Some(h) if h == record.height => dup + 1,
            _ => 0,
        };
        prev_height = Some(record.height);
        writeln!(
            writer,
            "Height: {}.{}, Hash: {}, Parent: {}",
            record.height,
            dup,
            record.block_hash(),
            record.header.prev_blockhash
        )?;
    }
    Ok(())
}

/// In-memory header store, used by tests and as the regtest default.
#[derive(Debug, Default)]
pub struct MemoryHeaderStore {
    headers: HashMap<BlockHash, StoredHeader>,
    tip: Option<StoredHeader>,
}

impl MemoryHeaderStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HeaderStore for MemoryHeaderStore {
    fn put(&mut self, record: StoredHeader, new_tip: bool) -> StoreResult<()> {
        self.headers.insert(record.block_hash(), record);
        if new_tip {
            self.tip = Some(record);
        }
        Ok(())
    }

    fn get_previous(&mut self, header: &BlockHeader) -> StoreResult<StoredHeader> {
        self.get(&header.prev_blockhash)
    }

    fn get(&mut self, hash: &BlockHash) -> StoreResult<StoredHeader> {
        self.headers
            .get(hash)
            .copied()
            .ok_or_else(|| StoreError::NotFound(format!("header {}", hash)))
    }

    fn best(&mut self) -> StoreResult<StoredHeader> {
        self.tip.ok_or_else(|| StoreError::NotFound("chain tip".into()))
    }

    fn prune(&mut self, keep_depth: u32) -> StoreResult<()> {
        let tip = self.best()?;
        let boundary = tip.height.saturating_sub(keep_depth);
        self.headers.retain(|_, record| record.height >= boundary);
        Ok(())
    }

    fn dump(&mut self, writer: &mut dyn Write) -> StoreResult<()> {
        let mut records: Vec<StoredHeader> = self.headers.values().copied().collect();
        dump_records(&mut records, writer)
    }

    fn close(&mut self) -> StoreResult<()> {
        Ok(())
    }
}

/// Append-style on-disk header store.
///
/// `headers.bin` holds 116-byte records; re-puts of the same hash append a
/// fresh record and the index keeps only the newest offset. `tip.bin` is
/// the single-record tip region. Pruning rewrites the log.
pub struct FileHeaderStore {
    headers_path: PathBuf,
    tip_path: PathBuf,
    file: File,
    /// hash -> byte offset of the newest record for that hash
    index: HashMap<BlockHash, u64>,
    tip: Option<StoredHeader>,
}

impl FileHeaderStore {
    pub fn open(dir: &Path) -> StoreResult<Self> {
        std::fs::create_dir_all(dir)?;
        let headers_path = dir.join("headers.bin");
        let tip_path = dir.join("tip.bin");
        let mut file =
            OpenOptions::new().read(true).write(true).create(true).open(&headers_path)?;

        let mut index = HashMap::new();
        let mut offset = 0u64;
        let mut record_bytes = [0u8; HEADER_RECORD_SIZE];
        file.seek(SeekFrom::Start(0))?;
        loop {
            match file.read_exact(&mut record_bytes) {
                Ok(()) => {
                    let record = StoredHeader::deserialize_record(&record_bytes)?;
                    index.insert(record.block_hash(), offset);
                    offset += HEADER_RECORD_SIZE as u64;
                }
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
        }

        let tip = match std::fs::read(&tip_path) {
            Ok(bytes) if bytes.len() == HEADER_RECORD_SIZE => {
                Some(StoredHeader::deserialize_record(&bytes)?)
            }
            Ok(_) => None,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        tracing::debug!(
            "Opened header store at {} with {} records",
            headers_path.display(),
            index.len()
        );

        Ok(Self {
            headers_path,
            tip_path,
            file,
            index,
            tip,
        })
    }

    fn read_at(&mut self, offset: u64) -> StoreResult<StoredHeader> {
        let mut record_bytes = [0u8; HEADER_RECORD_SIZE];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut record_bytes)?;
        StoredHeader::deserialize_record(&record_bytes)
    }

    fn all_records(&mut self) -> StoreResult<Vec<StoredHeader>> {
        let offsets: Vec<u64> = self.index.values().copied().collect();
        let mut records = Vec::with_capacity(offsets.len());
        for offset in offsets {
            records.push(self.read_at(offset)?);
        }
        Ok(records)
    }
}

impl HeaderStore for FileHeaderStore {
    fn put(&mut self, record: StoredHeader, new_tip: bool) -> StoreResult<()> {
        let offset = self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&record.serialize_record())?;
        self.index.insert(record.block_hash(), offset);
        if new_tip {
            std::fs::write(&self.tip_path, record.serialize_record())?;
            self.tip = Some(record);
        }
        Ok(())
    }

    fn get_previous(&mut self, header: &BlockHeader) -> StoreResult<StoredHeader> {
        let hash = header.prev_blockhash;
        self.get(&hash)
    }

    fn get(&mut self, hash: &BlockHash) -> StoreResult<StoredHeader> {
        let offset = *self
            .index
            .get(hash)
            .ok_or_else(|| StoreError::NotFound(format!("header {}", hash)))?;
        self.read_at(offset)
    }

    fn best(&mut self) -> StoreResult<StoredHeader> {
        self.tip.ok_or_else(|| StoreError::NotFound("chain tip".into()))
    }

    fn prune(&mut self, keep_depth: u32) -> StoreResult<()> {
        let tip = self.best()?;
        let boundary = tip.height.saturating_sub(keep_depth);
        let keep: Vec<StoredHeader> =
            self.all_records()?.into_iter().filter(|r| r.height >= boundary).collect();

        let tmp_path = self.headers_path.with_extension("bin.tmp");
        {
            let mut tmp = File::create(&tmp_path)?;
            for record in &keep {
                tmp.write_all(&record.serialize_record())?;
            }
            tmp.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.headers_path)?;

        self.file =
            OpenOptions::new().read(true).write(true).open(&self.headers_path)?;
        self.index.clear();
        for (i, record) in keep.iter().enumerate() {
            self.index.insert(record.block_hash(), (i * HEADER_RECORD_SIZE) as u64);
        }
        tracing::info!("Pruned header store to {} records above height {}", keep.len(), boundary);
        Ok(())
    }

    fn dump(&mut self, writer: &mut dyn Write) -> StoreResult<()> {
        let mut records = self.all_records()?;
        dump_records(&mut records, writer)
    }

    fn close(&mut self) -> StoreResult<()> {
        self.file.sync_all()?;
        Ok(())
    }
}
