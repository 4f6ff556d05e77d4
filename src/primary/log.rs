use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};
use crate::primary::{PrimaryIter, PrimaryStorage};
use crate::types::{Block, Position, Size, Work};

/// Every log record starts with the byte length of its key + value.
const LENGTH_PREFIX_BYTES: usize = 4;

const LOG_BUFFER_SIZE: usize = 32 * 4096;

/// Content digests are 32 bytes unless configured otherwise.
pub const DEFAULT_KEY_BYTES: usize = 32;

/// Append-only primary storage for content-addressed keys.
///
/// Records are `u32 LE length || key || value`, the length counting key and
/// value only. Keys are fixed-width digests, which is what lets a record be
/// split back into key and value without a second length field. Accepted
/// writes sit in the `next` pool until flushed, then in `current` until
/// synced; readers check both pools before touching the file.
pub struct LogPrimary {
    path: PathBuf,
    file: File, // read handle; appends go through the writer
    key_bytes: usize,
    writer: Mutex<BufWriter<File>>,
    pools: RwLock<LogPools>,
}

struct LogPools {
    length: Position,
    outstanding: Work,
    current: BlockPool,
    next: BlockPool,
}

#[derive(Default)]
struct BlockPool {
    refs: HashMap<Position, usize>,
    blocks: Vec<(Vec<u8>, Vec<u8>)>,
}

impl BlockPool {
    fn get(&self, pos: Position) -> Option<&(Vec<u8>, Vec<u8>)> {
        self.refs.get(&pos).map(|idx| &self.blocks[*idx])
    }
}

impl LogPrimary {
    /// Opens (or creates) a log with the default digest width.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_key_bytes(path, DEFAULT_KEY_BYTES)
    }

    /// Opens (or creates) a log whose keys are `key_bytes` wide.
    pub fn open_with_key_bytes(path: impl AsRef<Path>, key_bytes: usize) -> Result<Self> {
        if key_bytes == 0 || key_bytes > u8::MAX as usize {
            return Err(Error::invalid_input(format!(
                "unsupported key width {key_bytes}"
            )));
        }
        let path = path.as_ref().to_path_buf();
        let file = File::options()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        let length = file.metadata()?.len();
        let writer = BufWriter::with_capacity(LOG_BUFFER_SIZE, file.try_clone()?);
        Ok(Self {
            path,
            file,
            key_bytes,
            writer: Mutex::new(writer),
            pools: RwLock::new(LogPools {
                length,
                outstanding: 0,
                current: BlockPool::default(),
                next: BlockPool::default(),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_record(&self, pos: Position) -> Result<Vec<u8>> {
        let mut prefix = [0u8; LENGTH_PREFIX_BYTES];
        self.file.read_exact_at(&mut prefix, pos)?;
        let size = LittleEndian::read_u32(&prefix) as usize;
        if size < self.key_bytes {
            return Err(Error::corruption(format!(
                "log record of {size} bytes is shorter than a key"
            )));
        }
        let mut record = vec![0u8; size];
        self.file
            .read_exact_at(&mut record, pos + LENGTH_PREFIX_BYTES as Position)?;
        Ok(record)
    }
}

impl PrimaryStorage for LogPrimary {
    type Iter = LogIter;

    fn put(&self, key: &[u8], value: &[u8]) -> Result<Block> {
        if key.len() != self.key_bytes {
            return Err(Error::invalid_input(format!(
                "key of {} bytes, log stores {} byte keys",
                key.len(),
                self.key_bytes
            )));
        }
        let mut pools = self.pools.write()?;
        let offset = pools.length;
        let size = (key.len() + value.len()) as Size;
        pools.length += (LENGTH_PREFIX_BYTES as Position) + Position::from(size);
        pools.outstanding += LENGTH_PREFIX_BYTES as Work + Work::from(size);
        let idx = pools.next.blocks.len();
        pools.next.refs.insert(offset, idx);
        pools.next.blocks.push((key.to_vec(), value.to_vec()));
        Ok(Block { offset, size })
    }

    fn get(&self, pos: Position) -> Result<(Vec<u8>, Vec<u8>)> {
        {
            let pools = self.pools.read()?;
            if let Some((key, value)) = pools.next.get(pos).or_else(|| pools.current.get(pos)) {
                return Ok((key.clone(), value.clone()));
            }
            if pos >= pools.length {
                return Err(Error::OutOfBounds);
            }
        }
        let record = self.read_record(pos)?;
        let (key, value) = record.split_at(self.key_bytes);
        Ok((key.to_vec(), value.to_vec()))
    }

    fn index_key(&self, key: &[u8]) -> Result<Vec<u8>> {
        // Keys are already bare digests.
        Ok(key.to_vec())
    }

    fn get_index_key(&self, pos: Position) -> Result<Vec<u8>> {
        {
            let pools = self.pools.read()?;
            if let Some((key, _)) = pools.next.get(pos).or_else(|| pools.current.get(pos)) {
                return Ok(key.clone());
            }
            if pos >= pools.length {
                return Err(Error::OutOfBounds);
            }
        }
        let record = self.read_record(pos)?;
        Ok(record[..self.key_bytes].to_vec())
    }

    fn flush(&self) -> Result<Work> {
        let mut writer = self.writer.lock()?;

        // Move accepted writes over to current so readers keep finding them
        // while the bytes drain into the buffered writer.
        let appended = {
            let mut pools = self.pools.write()?;
            let next = std::mem::take(&mut pools.next);
            pools.outstanding = 0;
            let base = pools.current.blocks.len();
            for (pos, idx) in next.refs {
                pools.current.refs.insert(pos, base + idx);
            }
            pools.current.blocks.extend(next.blocks);
            base..pools.current.blocks.len()
        };

        let pools = self.pools.read()?;
        let mut work: Work = 0;
        let mut prefix = [0u8; LENGTH_PREFIX_BYTES];
        for (key, value) in &pools.current.blocks[appended] {
            let size = (key.len() + value.len()) as u32;
            LittleEndian::write_u32(&mut prefix, size);
            writer.write_all(&prefix)?;
            writer.write_all(key)?;
            writer.write_all(value)?;
            work += LENGTH_PREFIX_BYTES as Work + Work::from(size);
        }
        Ok(work)
    }

    fn sync(&self) -> Result<()> {
        let mut writer = self.writer.lock()?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        let mut pools = self.pools.write()?;
        pools.current = BlockPool::default();
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut writer = self.writer.lock()?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    fn outstanding_work(&self) -> Result<Work> {
        Ok(self.pools.read()?.outstanding)
    }

    fn iter(&self) -> Result<Self::Iter> {
        let file = self.file.try_clone()?;
        let end = file.metadata()?.len();
        Ok(LogIter {
            file,
            key_bytes: self.key_bytes,
            pos: 0,
            end,
        })
    }
}

/// Iterates the durable records of a log file in append order.
pub struct LogIter {
    file: File,
    key_bytes: usize,
    pos: Position,
    end: Position,
}

impl PrimaryIter for LogIter {
    fn next(&mut self) -> Result<Option<(Position, Vec<u8>, Vec<u8>)>> {
        if self.pos >= self.end {
            return Ok(None);
        }
        let mut prefix = [0u8; LENGTH_PREFIX_BYTES];
        self.file.read_exact_at(&mut prefix, self.pos)?;
        let size = LittleEndian::read_u32(&prefix) as usize;
        if size < self.key_bytes {
            return Err(Error::corruption(format!(
                "log record of {size} bytes is shorter than a key"
            )));
        }
        let mut record = vec![0u8; size];
        self.file
            .read_exact_at(&mut record, self.pos + LENGTH_PREFIX_BYTES as Position)?;

        let record_pos = self.pos;
        self.pos += (LENGTH_PREFIX_BYTES + size) as Position;
        let value = record.split_off(self.key_bytes);
        Ok(Some((record_pos, record, value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    fn key(fill: u8) -> Vec<u8> {
        vec![fill; 4]
    }

    fn open_log(dir: &TempDir) -> LogPrimary {
        LogPrimary::open_with_key_bytes(dir.path().join("primary.log"), 4)
            .expect("Failed to open log")
    }

    #[test]
    fn test_put_served_from_pool_before_flush() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let log = open_log(&temp_dir);

        let block = log.put(&key(1), b"first").unwrap();
        assert_eq!(block, Block { offset: 0, size: 9 });
        let block = log.put(&key(2), b"second").unwrap();
        assert_eq!(block.offset, 13); // 4-byte prefix + 9 bytes

        // Nothing on disk yet, reads come out of the pool
        assert_eq!(log.outstanding_work().unwrap(), 13 + 14);
        let (k, v) = log.get(0).unwrap();
        assert_eq!((k, v), (key(1), b"first".to_vec()));
        assert_eq!(log.get_index_key(13).unwrap(), key(2));
    }

    #[test]
    fn test_flush_then_sync_reads_from_file() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let log = open_log(&temp_dir);

        log.put(&key(1), b"first").unwrap();
        log.put(&key(2), b"second").unwrap();

        let work = log.flush().unwrap();
        assert_eq!(work, 27);
        assert_eq!(log.outstanding_work().unwrap(), 0);

        // Between flush and sync the current pool still serves reads
        let (k, _) = log.get(0).unwrap();
        assert_eq!(k, key(1));

        log.sync().unwrap();
        let (k, v) = log.get(13).unwrap();
        assert_eq!((k, v), (key(2), b"second".to_vec()));
        assert_eq!(log.get_index_key(0).unwrap(), key(1));
    }

    #[test]
    fn test_rejects_wrong_key_width() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let log = open_log(&temp_dir);
        assert!(matches!(
            log.put(b"too-long-key", b"v"),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_get_out_of_bounds() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let log = open_log(&temp_dir);
        log.put(&key(1), b"value").unwrap();
        assert_eq!(log.get(500), Err(Error::OutOfBounds));
    }

    #[test]
    fn test_reopen_and_iterate() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let path = temp_dir.path().join("primary.log");

        {
            let log = LogPrimary::open_with_key_bytes(&path, 4).unwrap();
            log.put(&key(1), b"first").unwrap();
            log.put(&key(2), b"second").unwrap();
            log.flush().unwrap();
            log.sync().unwrap();
            log.close().unwrap();
        }

        let log = LogPrimary::open_with_key_bytes(&path, 4).unwrap();
        let (k, v) = log.get(0).unwrap();
        assert_eq!((k, v), (key(1), b"first".to_vec()));

        let mut iter = log.iter().unwrap();
        assert_eq!(
            iter.next().unwrap(),
            Some((0, key(1), b"first".to_vec()))
        );
        assert_eq!(
            iter.next().unwrap(),
            Some((13, key(2), b"second".to_vec()))
        );
        assert_eq!(iter.next().unwrap(), None);

        // New appends land after the recovered length
        let block = log.put(&key(3), b"third").unwrap();
        assert_eq!(block.offset, 27);
    }
}
