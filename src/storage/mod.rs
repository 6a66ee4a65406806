pub mod index;
pub mod parquet;
pub mod uids;

pub use index::FileIndex;
pub use uids::UidDb;
