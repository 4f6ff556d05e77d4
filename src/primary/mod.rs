pub mod log;
pub mod memory;

use crate::error::Result;
use crate::types::{Block, Position, Work};

/// Capability set the index requires from a backing key-value log.
///
/// A primary owns the authoritative copy of every key; the index only keeps
/// prefixes and defers to the primary for final confirmation.
pub trait PrimaryStorage: Send + Sync + 'static {
    type Iter: PrimaryIter;

    /// Appends a key-value pair and returns the block to store in the index.
    fn put(&self, key: &[u8], value: &[u8]) -> Result<Block>;

    /// Retrieves the full key and value at a position.
    fn get(&self, pos: Position) -> Result<(Vec<u8>, Vec<u8>)>;

    /// Derives the index key from a user key. For content-addressed keys
    /// this is the bare digest.
    fn index_key(&self, key: &[u8]) -> Result<Vec<u8>>;

    /// Derives the index key of the record at a position. Implementations
    /// may avoid materializing the value.
    fn get_index_key(&self, pos: Position) -> Result<Vec<u8>> {
        let (key, _) = self.get(pos)?;
        self.index_key(&key)
    }

    /// Writes pending records out, returning the bytes moved.
    fn flush(&self) -> Result<Work>;

    /// Makes flushed records durable.
    fn sync(&self) -> Result<()>;

    fn close(&self) -> Result<()>;

    /// Bytes accepted but not yet flushed.
    fn outstanding_work(&self) -> Result<Work>;

    /// Iterates every durable record in log order.
    fn iter(&self) -> Result<Self::Iter>;
}

/// Streaming cursor over a primary's records.
pub trait PrimaryIter {
    /// Returns the next record as `(position, key, value)`, or `None` at the
    /// end of the log.
    fn next(&mut self) -> Result<Option<(Position, Vec<u8>, Vec<u8>)>>;
}
