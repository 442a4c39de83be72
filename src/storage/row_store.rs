use std::collections::BTreeMap;
use std::path::Path;

use crate::error::Result;
use crate::storage::block::BlockManager;
use crate::storage::row_packer::{decode_rows_block, encode_rows_block};
use crate::storage::wal::{WalEntry, WalManager};
use crate::value::{Row, Val};

/// Maximum number of rows packed into one block.
pub const MAX_ROWS_PER_BLOCK: usize = 50;

/// Paged row file fronted by a write-ahead log. Every mutation appends to
/// the WAL before touching a block, so reopening after a crash recovers the
/// logged state.
pub struct RowStore {
    table: String,
    primary_key: String,
    block_manager: BlockManager,
    wal: WalManager,
    /// Decoded rows resident per block, in block order.
    blocks: BTreeMap<u64, Vec<Row>>,
}

impl RowStore {
    /// Opens the store, reading every block into memory and then replaying
    /// the WAL against the resident rows.
    pub fn open(table: &str, primary_key: &str, wal_dir: &Path) -> Result<RowStore> {
        let block_manager = BlockManager::open(&wal_dir.join(format!("{}.tbl", table)))?;
        let wal = WalManager::open(table, wal_dir)?;
        let mut store = RowStore {
            table: table.to_string(),
            primary_key: primary_key.to_string(),
            block_manager,
            wal,
            blocks: BTreeMap::new(),
        };
        store.load_blocks()?;
        store.recover()?;
        Ok(store)
    }

    fn load_blocks(&mut self) -> Result<()> {
        for block_num in 0..self.block_manager.num_blocks()? {
            let raw = self.block_manager.read_block(block_num)?;
            self.blocks.insert(block_num, decode_rows_block(&raw)?);
        }
        Ok(())
    }

    /// Replays the WAL against the resident blocks. An INSERT whose primary
    /// key is already resident was persisted by its block write as well and
    /// is skipped, so recovery is idempotent: the reopened state equals the
    /// post-`clear` WAL applied to an empty store.
    fn recover(&mut self) -> Result<()> {
        let entries = self.wal.read_entries()?;
        if entries.is_empty() {
            return Ok(());
        }
        log::info!(
            "row store {}: replaying {} wal entries",
            self.table,
            entries.len()
        );
        for entry in entries {
            match entry {
                WalEntry::Insert { row } => {
                    let resident = row
                        .get(&self.primary_key)
                        .map(|key| self.contains_key(key))
                        .unwrap_or(false);
                    if !resident {
                        self.insert_without_wal(row)?;
                    }
                }
                WalEntry::Delete { key } => {
                    self.delete_without_wal(&key)?;
                }
            }
        }
        Ok(())
    }

    fn contains_key(&self, key: &Val) -> bool {
        self.blocks
            .values()
            .flatten()
            .any(|row| row.get(&self.primary_key) == Some(key))
    }

    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }

    pub fn len(&self) -> usize {
        self.blocks.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends to the WAL, then writes the row into the last block if it has
    /// room, allocating a new block otherwise. Only the affected block is
    /// written back.
    pub fn insert_row(&mut self, row: Row) -> Result<()> {
        self.wal.log_insert(&row)?;
        self.insert_without_wal(row)
    }

    fn insert_without_wal(&mut self, row: Row) -> Result<()> {
        let num_blocks = self.block_manager.num_blocks()?;
        let block_num = match num_blocks.checked_sub(1) {
            Some(last) if self.blocks.get(&last).map_or(0, Vec::len) < MAX_ROWS_PER_BLOCK => last,
            _ => self.block_manager.allocate_block()?,
        };
        let rows = self.blocks.entry(block_num).or_default();
        rows.push(row);
        let data = encode_rows_block(rows)?;
        self.block_manager.write_block(block_num, &data)
    }

    /// Logs the whole batch in one WAL write, then packs rows into blocks of
    /// [`MAX_ROWS_PER_BLOCK`], writing each block once. The trailing partial
    /// block (if any) is topped up first.
    pub fn bulk_insert_rows(&mut self, rows: Vec<Row>) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        self.wal.log_insert_many(&rows)?;

        let mut rows = rows.into_iter();
        if let Some(last) = self.block_manager.num_blocks()?.checked_sub(1) {
            let resident = self.blocks.entry(last).or_default();
            if resident.len() < MAX_ROWS_PER_BLOCK {
                while resident.len() < MAX_ROWS_PER_BLOCK {
                    match rows.next() {
                        Some(row) => resident.push(row),
                        None => break,
                    }
                }
                let data = encode_rows_block(resident)?;
                self.block_manager.write_block(last, &data)?;
            }
        }

        let mut buffer: Vec<Row> = Vec::with_capacity(MAX_ROWS_PER_BLOCK);
        for row in rows {
            buffer.push(row);
            if buffer.len() == MAX_ROWS_PER_BLOCK {
                self.write_fresh_block(std::mem::take(&mut buffer))?;
            }
        }
        if !buffer.is_empty() {
            self.write_fresh_block(buffer)?;
        }
        Ok(())
    }

    fn write_fresh_block(&mut self, rows: Vec<Row>) -> Result<()> {
        let block_num = self.block_manager.allocate_block()?;
        let data = encode_rows_block(&rows)?;
        self.block_manager.write_block(block_num, &data)?;
        self.blocks.insert(block_num, rows);
        Ok(())
    }

    /// Appends a DELETE entry to the WAL, then removes the row whose
    /// primary-key column equals `key`, rewriting the affected block.
    /// Returns true iff a row was removed.
    pub fn delete_row(&mut self, key: &Val) -> Result<bool> {
        self.wal.log_delete(key)?;
        self.delete_without_wal(key)
    }

    fn delete_without_wal(&mut self, key: &Val) -> Result<bool> {
        let pk = self.primary_key.clone();
        let hit = self.blocks.iter().find_map(|(&block_num, rows)| {
            rows.iter()
                .position(|row| row.get(&pk) == Some(key))
                .map(|i| (block_num, i))
        });
        match hit {
            Some((block_num, i)) => {
                let rows = self.blocks.get_mut(&block_num).unwrap();
                rows.remove(i);
                let data = encode_rows_block(rows)?;
                self.block_manager.write_block(block_num, &data)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Removes every row whose `column` renders equal to `value`, rewriting
    /// each affected block and logging one DELETE per removed row.
    pub fn delete_rows_where(&mut self, column: &str, value: &str) -> Result<usize> {
        let pk = self.primary_key.clone();
        let mut deleted = 0;
        let block_nums: Vec<u64> = self.blocks.keys().copied().collect();
        for block_num in block_nums {
            let rows = self.blocks.get_mut(&block_num).unwrap();
            if !rows.iter().any(|row| renders_equal(row.get(column), value)) {
                continue;
            }
            let drained: Vec<Row> = rows.drain(..).collect();
            for row in drained {
                if renders_equal(row.get(column), value) {
                    if let Some(key) = row.get(&pk) {
                        self.wal.log_delete(key)?;
                    }
                    deleted += 1;
                } else {
                    rows.push(row);
                }
            }
            let data = encode_rows_block(rows)?;
            self.block_manager.write_block(block_num, &data)?;
        }
        Ok(deleted)
    }

    /// All resident rows, concatenated in block order.
    pub fn get_rows(&self) -> Vec<Row> {
        self.blocks.values().flatten().cloned().collect()
    }

    /// Drops resident state and truncates both the block file and the WAL.
    /// Called strictly after a successful column-store flush of the resident
    /// rows.
    pub fn clear(&mut self) -> Result<()> {
        self.blocks.clear();
        self.block_manager.truncate()?;
        self.wal.clear()
    }
}

fn renders_equal(val: Option<&Val>, value: &str) -> bool {
    val.map_or(false, |v| v.to_string() == value)
}
