pub mod buckets;
pub mod record;
pub mod recordlist;

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};
use crate::index::buckets::{BucketEntry, BucketIndex, BucketTable};
use crate::index::record::MAX_STORED_KEY_LEN;
use crate::index::recordlist::{RecordList, BUCKET_PREFIX_BYTES};
use crate::primary::PrimaryStorage;
use crate::types::{KeySize, KeyedBlock, Position, Size, Work};

const INDEX_BUFFER_SIZE: usize = 32 * 4096;

/// The index store: routes keys into buckets, keeps each bucket's record
/// list as an immutable snapshot in an append-only file, and stages
/// mutations in two in-memory pools.
///
/// `put` rewrites the affected bucket's payload into the `next` pool; a
/// flush swaps `next` into `current` and appends the payloads to the file;
/// a sync makes them durable and drops `current`. Readers consult `next`,
/// then `current`, then the file, so a bucket is never served from a file
/// region that is not yet durable.
pub struct Index<P: PrimaryStorage> {
    primary: Arc<P>,
    buckets_path: PathBuf,
    file: File, // read handle; appends go through the writer
    writer: Mutex<IndexWriter>,
    inner: RwLock<IndexInner>,
}

struct IndexWriter {
    writer: BufWriter<File>,
    length: Position,
}

struct IndexInner {
    table: BucketTable,
    current: HashMap<BucketIndex, PendingBucket>,
    next: HashMap<BucketIndex, PendingBucket>,
    outstanding: Work,
}

/// A bucket snapshot waiting to be written: the full prefixed payload plus
/// the key size that will land in the bucket table.
struct PendingBucket {
    bytes: Vec<u8>,
    key_size: KeySize,
}

impl<P: PrimaryStorage> Index<P> {
    /// Opens (or creates) an index. An existing bucket-table snapshot is
    /// loaded and verified; an index file without one cannot be interpreted,
    /// since the append stream alone is not self-delimiting.
    pub fn open(
        index_path: impl Into<PathBuf>,
        buckets_path: impl Into<PathBuf>,
        primary: Arc<P>,
        index_bits: u8,
    ) -> Result<Self> {
        let buckets_path = buckets_path.into();
        let file = File::options()
            .create(true)
            .read(true)
            .append(true)
            .open(index_path.into())?;
        let length = file.metadata()?.len();

        let table = if buckets_path.exists() {
            let table = BucketTable::read_from(&buckets_path)?;
            if table.index_bits() != index_bits {
                return Err(Error::invalid_input(format!(
                    "index opened with {} bits but its bucket table has {}",
                    index_bits,
                    table.index_bits()
                )));
            }
            table
        } else if length > 0 {
            return Err(Error::corruption("index file present without bucket table"));
        } else {
            BucketTable::new(index_bits)?
        };

        let writer = BufWriter::with_capacity(INDEX_BUFFER_SIZE, file.try_clone()?);
        Ok(Self {
            primary,
            buckets_path,
            file,
            writer: Mutex::new(IndexWriter { writer, length }),
            inner: RwLock::new(IndexInner {
                table,
                current: HashMap::new(),
                next: HashMap::new(),
                outstanding: 0,
            }),
        })
    }

    /// Looks up the candidate block for an index key. Because stored keys
    /// are prefixes, a hit still has to be confirmed against the full key in
    /// the primary.
    pub fn get(&self, index_key: &[u8]) -> Result<Option<KeyedBlock>> {
        let entry = {
            let inner = self.inner.read()?;
            let bucket = inner.table.bucket_index(index_key);
            if let Some(pending) = inner.next.get(&bucket).or_else(|| inner.current.get(&bucket)) {
                return RecordList::new(&pending.bytes).get(index_key);
            }
            inner.table.get(bucket)?
        };
        if entry.size == 0 {
            return Ok(None);
        }
        let mut snapshot = vec![0u8; entry.size as usize];
        self.file.read_exact_at(&mut snapshot, entry.offset)?;
        RecordList::new(&snapshot).get(index_key)
    }

    /// Inserts a key pointing at a block of the primary.
    ///
    /// The new record stores the shortest prefix of the key that tells it
    /// apart from both neighbors. When the predecessor's stored prefix
    /// would stop disambiguating, its full key is fetched from the primary
    /// and the prefix lengthened in the same splice. Re-inserting a key
    /// with its existing block is a no-op.
    pub fn put(&self, index_key: &[u8], block: KeyedBlock) -> Result<()> {
        let mut inner = self.inner.write()?;
        let bucket = inner.table.bucket_index(index_key);
        let snapshot = match inner.next.get(&bucket).or_else(|| inner.current.get(&bucket)) {
            Some(pending) => pending.bytes.clone(),
            None => {
                let entry = inner.table.get(bucket)?;
                if entry.size == 0 {
                    empty_snapshot(inner.table.index_bits())
                } else {
                    let mut bytes = vec![0u8; entry.size as usize];
                    self.file.read_exact_at(&mut bytes, entry.offset)?;
                    bytes
                }
            }
        };

        let records = RecordList::new(&snapshot);
        let (pos, prev) = records.find_key_position(index_key)?;
        let next_common = if pos < records.len() {
            common_prefix_len(index_key, records.record_at(pos)?.key)
        } else {
            0
        };

        let payload = match prev {
            // The record for this very key, stored at full length.
            Some(prev_rec) if prev_rec.key == index_key => {
                if prev_rec.block == block {
                    return Ok(());
                }
                records.put_keys(&[(index_key, block)], prev_rec.pos, pos)?
            }
            // The predecessor's stored prefix no longer disambiguates.
            Some(prev_rec) if index_key.starts_with(prev_rec.key) => {
                let full_prev = self.primary.get_index_key(prev_rec.block.block.offset)?;
                if full_prev == index_key {
                    // Same key behind a shorter stored prefix.
                    if prev_rec.block == block {
                        return Ok(());
                    }
                    records.put_keys(&[(prev_rec.key, block)], prev_rec.pos, pos)?
                } else {
                    let distinct = common_prefix_len(&full_prev, index_key) + 1;
                    if distinct > full_prev.len() {
                        return Err(Error::invalid_input(
                            "key extends an existing key and cannot be disambiguated",
                        ));
                    }
                    if distinct > MAX_STORED_KEY_LEN {
                        return Err(Error::KeyTooLong(distinct));
                    }
                    let new_prev = &full_prev[..distinct];
                    let stored = stored_prefix(index_key, distinct - 1, next_common)?;
                    let mut pair = [(new_prev, prev_rec.block), (stored, block)];
                    if pair[0].0 > pair[1].0 {
                        pair.swap(0, 1);
                    }
                    records.put_keys(&pair, prev_rec.pos, pos)?
                }
            }
            Some(prev_rec) => {
                let prev_common = common_prefix_len(index_key, prev_rec.key);
                let stored = stored_prefix(index_key, prev_common, next_common)?;
                records.put_keys(&[(stored, block)], pos, pos)?
            }
            None => {
                let stored = stored_prefix(index_key, 0, next_common)?;
                records.put_keys(&[(stored, block)], pos, pos)?
            }
        };

        let mut bytes = Vec::with_capacity(BUCKET_PREFIX_BYTES + payload.len());
        bytes.extend_from_slice(&snapshot[..BUCKET_PREFIX_BYTES]);
        bytes.extend_from_slice(&payload);

        let added = bytes.len() as Work;
        let replaced = inner
            .next
            .insert(
                bucket,
                PendingBucket {
                    bytes,
                    key_size: block.key_size,
                },
            )
            .map(|old| old.bytes.len() as Work)
            .unwrap_or(0);
        inner.outstanding = inner.outstanding + added - replaced;
        Ok(())
    }

    /// Appends every staged bucket snapshot to the index file and points the
    /// bucket table at the new regions. Returns the bytes written. The data
    /// is not durable (and keeps being served from memory) until `sync`.
    pub fn flush(&self) -> Result<Work> {
        let mut writer = self.writer.lock()?;

        // Swap next into current so readers keep finding the snapshots
        // while the bytes drain into the buffered writer.
        let flushed: Vec<BucketIndex> = {
            let mut inner = self.inner.write()?;
            let next = std::mem::take(&mut inner.next);
            inner.outstanding = 0;
            let buckets = next.keys().copied().collect();
            inner.current.extend(next);
            buckets
        };
        if flushed.is_empty() {
            return Ok(0);
        }

        let mut work: Work = 0;
        let mut updates = Vec::with_capacity(flushed.len());
        {
            let inner = self.inner.read()?;
            for bucket in &flushed {
                let pending = inner
                    .current
                    .get(bucket)
                    .ok_or_else(|| Error::corruption("flushed bucket vanished from pool"))?;
                let offset = writer.length;
                writer.writer.write_all(&pending.bytes)?;
                writer.length += pending.bytes.len() as Position;
                work += pending.bytes.len() as Work;
                updates.push((
                    *bucket,
                    BucketEntry {
                        offset,
                        size: pending.bytes.len() as Size,
                        key_size: pending.key_size,
                    },
                ));
            }
        }

        let mut inner = self.inner.write()?;
        for (bucket, entry) in updates {
            inner.table.put(bucket, entry)?;
        }
        tracing::debug!(buckets = flushed.len(), bytes = work, "flushed index pool");
        Ok(work)
    }

    /// Makes every flushed snapshot durable: drains the buffered writer,
    /// fsyncs the index file, persists the bucket table and releases the
    /// `current` pool.
    pub fn sync(&self) -> Result<()> {
        let mut writer = self.writer.lock()?;
        writer.writer.flush()?;
        writer.writer.get_ref().sync_all()?;
        {
            let inner = self.inner.read()?;
            inner.table.write_to(&self.buckets_path)?;
        }
        self.inner.write()?.current.clear();
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        let mut writer = self.writer.lock()?;
        writer.writer.flush()?;
        writer.writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Bytes staged in the next pool but not yet flushed.
    pub fn outstanding_work(&self) -> Result<Work> {
        Ok(self.inner.read()?.outstanding)
    }

    /// Size of the index file including unsynced appends.
    pub fn file_len(&self) -> Result<Position> {
        Ok(self.writer.lock()?.length)
    }
}

/// A fresh bucket snapshot: just the bucket-bits prefix, no records.
fn empty_snapshot(index_bits: u8) -> Vec<u8> {
    let mut bytes = vec![0u8; BUCKET_PREFIX_BYTES];
    LittleEndian::write_u32(&mut bytes, u32::from(index_bits));
    bytes
}

fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

/// The shortest prefix of `key` that differs from both neighbors, given the
/// lengths it shares with each.
fn stored_prefix<'a>(key: &'a [u8], prev_common: usize, next_common: usize) -> Result<&'a [u8]> {
    let len = prev_common.max(next_common) + 1;
    if len > key.len() {
        return Err(Error::invalid_input(
            "key is a prefix of an existing key and cannot be disambiguated",
        ));
    }
    if len > MAX_STORED_KEY_LEN {
        return Err(Error::KeyTooLong(len));
    }
    Ok(&key[..len])
}
