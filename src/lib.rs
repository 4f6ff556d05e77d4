pub mod config;
pub mod error;
pub mod flock;
pub mod index;
pub mod primary;
pub mod scheduler;
pub mod store;
pub mod tmpfs;
pub mod types;

pub use config::StoreConfig;
pub use error::{Error, Result};
pub use primary::log::LogPrimary;
pub use primary::memory::MemoryPrimary;
pub use primary::{PrimaryIter, PrimaryStorage};
pub use store::Store;
pub use types::{Block, KeySize, KeyedBlock, Position, Size, Work};
