use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use crc::{Algorithm, Crc};

use crate::error::{Error, Result};
use crate::types::{KeySize, Position, Size};

/// An index into the bucket table.
pub type BucketIndex = u32;

/// Widest supported bucket routing; the table holds at most 2^32 entries.
pub const MAX_INDEX_BITS: u8 = 32;

const SNAPSHOT_MAGIC: u32 = 0x43_42_4B_54; // ASCII "CBKT"
const SNAPSHOT_VERSION: u16 = 1;

const CRC_64_ECMA: Algorithm<u64> = crc::CRC_64_ECMA_182;

/// One fixed-size array of per-bucket values.
#[derive(Debug, Clone)]
pub struct BucketArray<T> {
    slots: Vec<T>,
}

impl<T: Copy + Default> BucketArray<T> {
    fn new(index_bits: u8) -> Result<Self> {
        if index_bits > MAX_INDEX_BITS {
            return Err(Error::IndexTooLarge);
        }
        Ok(Self {
            slots: vec![T::default(); 1usize << index_bits],
        })
    }

    fn get(&self, index: BucketIndex) -> Result<T> {
        self.slots
            .get(index as usize)
            .copied()
            .ok_or(Error::OutOfBounds)
    }

    fn put(&mut self, index: BucketIndex, value: T) -> Result<()> {
        match self.slots.get_mut(index as usize) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(Error::OutOfBounds),
        }
    }
}

/// Where one bucket's current record list lives in the index file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BucketEntry {
    /// File offset of the bucket's latest snapshot.
    pub offset: Position,
    /// Snapshot length in bytes, including the bucket-bits prefix. Zero
    /// means the bucket has never been written.
    pub size: Size,
    /// Original key length of the record written most recently.
    pub key_size: KeySize,
}

/// The bucket table: three parallel arrays of length 2^index_bits mapping a
/// bucket to the file region of its record list. The offset alone locates
/// the snapshot; size and key size bound it without an extra read.
#[derive(Debug, Clone)]
pub struct BucketTable {
    index_bits: u8,
    offsets: BucketArray<Position>,
    sizes: BucketArray<Size>,
    key_sizes: BucketArray<KeySize>,
}

impl BucketTable {
    pub fn new(index_bits: u8) -> Result<Self> {
        Ok(Self {
            index_bits,
            offsets: BucketArray::new(index_bits)?,
            sizes: BucketArray::new(index_bits)?,
            key_sizes: BucketArray::new(index_bits)?,
        })
    }

    pub fn index_bits(&self) -> u8 {
        self.index_bits
    }

    /// Number of buckets in the table.
    pub fn len(&self) -> usize {
        self.offsets.slots.len()
    }

    /// Routes an index key to its bucket: the first `index_bits` bits of the
    /// key, big-endian, left-justified, with any leftover bits masked off.
    pub fn bucket_index(&self, index_key: &[u8]) -> BucketIndex {
        if self.index_bits == 0 {
            return 0;
        }
        let mut word = [0u8; 4];
        let used = index_key.len().min(word.len());
        word[..used].copy_from_slice(&index_key[..used]);
        u32::from_be_bytes(word) >> (32 - self.index_bits as u32)
    }

    pub fn get(&self, index: BucketIndex) -> Result<BucketEntry> {
        Ok(BucketEntry {
            offset: self.offsets.get(index)?,
            size: self.sizes.get(index)?,
            key_size: self.key_sizes.get(index)?,
        })
    }

    pub fn put(&mut self, index: BucketIndex, entry: BucketEntry) -> Result<()> {
        self.offsets.put(index, entry.offset)?;
        self.sizes.put(index, entry.size)?;
        self.key_sizes.put(index, entry.key_size)
    }

    /// Persists the table next to the index file: a checksummed header
    /// followed by the three arrays, written to a temp file and renamed so
    /// that readers only ever observe a complete snapshot.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let mut payload =
            Vec::with_capacity(self.len() * (8 + 4 + 2));
        for offset in &self.offsets.slots {
            payload.write_u64::<LittleEndian>(*offset)?;
        }
        for size in &self.sizes.slots {
            payload.write_u32::<LittleEndian>(*size)?;
        }
        for key_size in &self.key_sizes.slots {
            payload.write_u16::<LittleEndian>(*key_size)?;
        }
        let checksum = Crc::<u64>::new(&CRC_64_ECMA).checksum(&payload);

        let tmp_path = path.with_extension("tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        writer.write_u32::<BigEndian>(SNAPSHOT_MAGIC)?;
        writer.write_u16::<BigEndian>(SNAPSHOT_VERSION)?;
        writer.write_u8(self.index_bits)?;
        writer.write_u64::<BigEndian>(checksum)?;
        writer.write_all(&payload)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Reads a table snapshot back, verifying magic, version and checksum.
    pub fn read_from(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);

        let magic = reader.read_u32::<BigEndian>()?;
        if magic != SNAPSHOT_MAGIC {
            return Err(Error::corruption("bad bucket table magic"));
        }
        let version = reader.read_u16::<BigEndian>()?;
        if version != SNAPSHOT_VERSION {
            return Err(Error::corruption(format!(
                "unsupported bucket table version {version}"
            )));
        }
        let index_bits = reader.read_u8()?;
        if index_bits > MAX_INDEX_BITS {
            return Err(Error::IndexTooLarge);
        }
        let checksum = reader.read_u64::<BigEndian>()?;

        let buckets = 1usize << index_bits;
        let mut payload = vec![0u8; buckets * (8 + 4 + 2)];
        reader.read_exact(&mut payload)?;
        if reader.bytes().next().is_some() {
            return Err(Error::corruption("trailing bytes after bucket table"));
        }
        if Crc::<u64>::new(&CRC_64_ECMA).checksum(&payload) != checksum {
            return Err(Error::corruption("bucket table checksum mismatch"));
        }

        let mut table = Self::new(index_bits)?;
        let mut reader = payload.as_slice();
        for slot in table.offsets.slots.iter_mut() {
            *slot = reader.read_u64::<LittleEndian>()?;
        }
        for slot in table.sizes.slots.iter_mut() {
            *slot = reader.read_u32::<LittleEndian>()?;
        }
        for slot in table.key_sizes.slots.iter_mut() {
            *slot = reader.read_u16::<LittleEndian>()?;
        }
        Ok(table)
    }
}
