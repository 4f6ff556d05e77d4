use std::sync::RwLock;

use crate::error::{Error, Result};
use crate::primary::{PrimaryIter, PrimaryStorage};
use crate::types::{Block, Position, Size, Work};

/// In-memory primary storage backed by a vector of key-value pairs; a
/// record's position is its insertion ordinal. Nothing is buffered, so
/// flush and sync are no-ops.
#[derive(Debug, Default)]
pub struct MemoryPrimary {
    entries: RwLock<Vec<(Vec<u8>, Vec<u8>)>>,
}

impl MemoryPrimary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from pre-existing pairs, useful for recovery tests.
    pub fn with_entries(entries: Vec<(Vec<u8>, Vec<u8>)>) -> Self {
        Self {
            entries: RwLock::new(entries),
        }
    }
}

impl PrimaryStorage for MemoryPrimary {
    type Iter = MemoryIter;

    fn put(&self, key: &[u8], value: &[u8]) -> Result<Block> {
        let mut entries = self.entries.write()?;
        let offset = entries.len() as Position;
        let size = (key.len() + value.len()) as Size;
        entries.push((key.to_vec(), value.to_vec()));
        Ok(Block { offset, size })
    }

    fn get(&self, pos: Position) -> Result<(Vec<u8>, Vec<u8>)> {
        let entries = self.entries.read()?;
        let (key, value) = entries.get(pos as usize).ok_or(Error::OutOfBounds)?;
        Ok((key.clone(), value.clone()))
    }

    fn index_key(&self, key: &[u8]) -> Result<Vec<u8>> {
        Ok(key.to_vec())
    }

    fn flush(&self) -> Result<Work> {
        Ok(0)
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }

    fn outstanding_work(&self) -> Result<Work> {
        Ok(0)
    }

    fn iter(&self) -> Result<Self::Iter> {
        let entries = self.entries.read()?;
        Ok(MemoryIter {
            entries: entries.clone(),
            next: 0,
        })
    }
}

/// Iterates a snapshot of the entries taken when the iterator was created.
pub struct MemoryIter {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    next: usize,
}

impl PrimaryIter for MemoryIter {
    fn next(&mut self) -> Result<Option<(Position, Vec<u8>, Vec<u8>)>> {
        match self.entries.get(self.next) {
            Some((key, value)) => {
                let pos = self.next as Position;
                self.next += 1;
                Ok(Some((pos, key.clone(), value.clone())))
            }
            None => Ok(None),
        }
    }
}
