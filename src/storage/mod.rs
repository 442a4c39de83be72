pub mod block;
pub mod column_store;
pub mod manager;
pub mod row_packer;
pub mod row_store;
pub mod wal;

use std::fs::File;
use std::io::Write;
use std::path::Path;

pub use block::{BlockManager, BLOCK_SIZE};
pub use column_store::ColumnStore;
pub use manager::StorageManager;
pub use row_store::RowStore;
pub use wal::WalManager;

/// Atomically replaces the file at `path`: the data is written to a
/// temporary sibling, synced, and renamed over the target.
pub(crate) fn atomic_write(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("INCOMPLETE");
    let mut file = File::create(&tmp_path)?;
    file.write_all(data)?;
    file.sync_all()?;
    std::fs::rename(tmp_path, path)?;
    Ok(())
}
