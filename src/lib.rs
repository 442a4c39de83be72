pub mod error;
pub mod index;
pub mod options;
pub mod schema;
pub mod stats;
pub mod storage;
pub mod table;
pub mod value;

pub use crate::error::{Result, StorageError};
pub use crate::index::BPlusTree;
pub use crate::options::Options;
pub use crate::schema::{Column, Constraint, DataType};
pub use crate::stats::TableStats;
pub use crate::storage::{
    BlockManager, ColumnStore, RowStore, StorageManager, WalManager, BLOCK_SIZE,
};
pub use crate::table::Table;
pub use crate::value::{Row, Val};
