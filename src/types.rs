/// Byte offset within a file.
pub type Position = u64;

/// Byte length of a stored record.
pub type Size = u32;

/// Original (untruncated) length of a key.
pub type KeySize = u16;

/// Byte-denominated count of pending or completed writes, used for
/// admission control.
pub type Work = u64;

/// Where a record lives in the primary log and how big it is. The size
/// counts key + value bytes, not the log's own length prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub offset: Position,
    pub size: Size,
}

/// A block pointer together with the original length of the key stored at
/// that block, so that value sizes can be answered without reading it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyedBlock {
    pub block: Block,
    pub key_size: KeySize,
}

impl KeyedBlock {
    pub fn new(offset: Position, size: Size, key_size: KeySize) -> Self {
        Self {
            block: Block { offset, size },
            key_size,
        }
    }
}
