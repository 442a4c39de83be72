use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::error::{Result, StorageError};
use crate::options::Options;
use crate::storage::column_store::ColumnStore;
use crate::storage::row_store::RowStore;
use crate::table::DEFAULT_PRIMARY_KEY;
use crate::value::{Row, Val};

/// Owns the per-table row and column store handles and the directory layout
/// beneath the base path. Handles are instantiated lazily and shared; the
/// per-table mutexes serialise writers with flushes and compaction.
pub struct StorageManager {
    options: Options,
    wal_dir: PathBuf,
    segments_dir: PathBuf,
    indexes_dir: PathBuf,
    row_stores: Mutex<HashMap<String, Arc<Mutex<RowStore>>>>,
    column_stores: Mutex<HashMap<String, Arc<Mutex<ColumnStore>>>>,
}

impl StorageManager {
    /// Creates the `wal/`, `segments/` and `indexes/` directories beneath
    /// the base path.
    pub fn open(options: Options) -> Result<StorageManager> {
        let wal_dir = options.db_path.join("wal");
        let segments_dir = options.db_path.join("segments");
        let indexes_dir = options.db_path.join("indexes");
        std::fs::create_dir_all(&wal_dir)?;
        std::fs::create_dir_all(&segments_dir)?;
        std::fs::create_dir_all(&indexes_dir)?;
        Ok(StorageManager {
            options,
            wal_dir,
            segments_dir,
            indexes_dir,
            row_stores: Mutex::new(HashMap::new()),
            column_stores: Mutex::new(HashMap::new()),
        })
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn block_path(&self, table: &str) -> PathBuf {
        self.wal_dir.join(format!("{}.tbl", table))
    }

    pub fn wal_path(&self, table: &str) -> PathBuf {
        self.wal_dir.join(format!("{}.wal", table))
    }

    pub fn segment_dir(&self, table: &str) -> PathBuf {
        self.segments_dir.join(table)
    }

    pub fn index_path(&self, table: &str, column: &str) -> PathBuf {
        self.indexes_dir.join(format!("{}_{}.idx", table, column))
    }

    /// Lazily opens the table's row store. `primary_key` is consulted only
    /// on first instantiation.
    pub fn get_row_store(&self, table: &str, primary_key: &str) -> Result<Arc<Mutex<RowStore>>> {
        let mut stores = self.row_stores.lock().unwrap();
        if let Some(store) = stores.get(table) {
            return Ok(store.clone());
        }
        let store = Arc::new(Mutex::new(RowStore::open(table, primary_key, &self.wal_dir)?));
        stores.insert(table.to_string(), store.clone());
        Ok(store)
    }

    /// Lazily opens the table's column store. `primary_key` is consulted
    /// only on first instantiation.
    pub fn get_column_store(
        &self,
        table: &str,
        primary_key: &str,
    ) -> Result<Arc<Mutex<ColumnStore>>> {
        let mut stores = self.column_stores.lock().unwrap();
        if let Some(store) = stores.get(table) {
            return Ok(store.clone());
        }
        let store = Arc::new(Mutex::new(ColumnStore::open(
            table,
            primary_key,
            &self.segments_dir,
            self.options.segment_rows,
        )?));
        stores.insert(table.to_string(), store.clone());
        Ok(store)
    }

    pub fn write_row(&self, table: &str, row: Row) -> Result<()> {
        let store = self.get_row_store(table, DEFAULT_PRIMARY_KEY)?;
        let mut store = store.lock().unwrap();
        store.insert_row(row)
    }

    pub fn bulk_write(&self, table: &str, rows: Vec<Row>) -> Result<()> {
        let store = self.get_row_store(table, DEFAULT_PRIMARY_KEY)?;
        let mut store = store.lock().unwrap();
        store.bulk_insert_rows(rows)
    }

    /// Deletes one row-store row by primary key. Returns true iff a row was
    /// removed.
    pub fn delete_row(&self, table: &str, key: &Val) -> Result<bool> {
        let store = self.get_row_store(table, DEFAULT_PRIMARY_KEY)?;
        let mut store = store.lock().unwrap();
        store.delete_row(key)
    }

    /// Tombstones a primary key in the table's segment-resident data.
    pub fn tombstone(&self, table: &str, key: Val) -> Result<()> {
        let store = self.get_column_store(table, DEFAULT_PRIMARY_KEY)?;
        let mut store = store.lock().unwrap();
        store.log_delete(key)
    }

    /// Moves the table's resident rows into a new column segment, then
    /// clears the row store. The WAL is truncated by `clear`, strictly after
    /// the column flush has succeeded.
    pub fn flush_table(&self, table: &str) -> Result<()> {
        let row_store = self.get_row_store(table, DEFAULT_PRIMARY_KEY)?;
        let column_store = self.get_column_store(table, DEFAULT_PRIMARY_KEY)?;
        let mut row_store = row_store.lock().unwrap();
        let rows = row_store.get_rows();
        if rows.is_empty() {
            return Ok(());
        }
        log::info!("flushing {} rows of table {} to column store", rows.len(), table);
        column_store.lock().unwrap().flush(&rows, None)?;
        row_store.clear()
    }

    /// Runs offline compaction for the table, holding its column store lock
    /// for the duration.
    pub fn compact_table(&self, table: &str) -> Result<()> {
        let column_store = self.get_column_store(table, DEFAULT_PRIMARY_KEY)?;
        let mut column_store = column_store.lock().unwrap();
        column_store.compact()
    }

    /// Tables with storage artifacts on disk, discovered from their WAL
    /// files.
    pub fn table_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.wal_dir)? {
            let path = entry?.path();
            if let Some(name) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(".wal"))
            {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Deletes every storage artifact of the table: row blocks, WAL,
    /// segments, tombstones and any `{table}_*` file under `indexes/`. The
    /// schema catalog (`schema.json`) belongs to the layer above and is left
    /// untouched.
    pub fn drop_table(&self, table: &str) -> Result<()> {
        let had_handle = {
            let had_row = self.row_stores.lock().unwrap().remove(table).is_some();
            let had_col = self.column_stores.lock().unwrap().remove(table).is_some();
            had_row || had_col
        };
        let mut removed_any = had_handle;

        for path in [self.block_path(table), self.wal_path(table)] {
            if path.exists() {
                std::fs::remove_file(&path)?;
                removed_any = true;
            }
        }
        let segment_dir = self.segment_dir(table);
        if segment_dir.exists() {
            std::fs::remove_dir_all(&segment_dir)?;
            removed_any = true;
        }
        let prefix = format!("{}_", table);
        for entry in std::fs::read_dir(&self.indexes_dir)? {
            let path = entry?.path();
            let matches = path
                .file_name()
                .and_then(|n| n.to_str())
                .map_or(false, |n| n.starts_with(&prefix));
            if matches {
                std::fs::remove_file(&path)?;
                removed_any = true;
            }
        }
        if !removed_any {
            return Err(StorageError::MissingTable(table.to_string()));
        }
        log::info!("dropped table {}", table);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Val;
    use tempfile::tempdir;

    fn manager(dir: &std::path::Path) -> StorageManager {
        StorageManager::open(Options {
            db_path: dir.to_path_buf(),
            ..Options::default()
        })
        .unwrap()
    }

    fn row(id: i64) -> Row {
        let mut row = Row::new();
        row.insert("id".to_string(), Val::Int(id));
        row
    }

    #[test]
    fn open_creates_the_directory_layout() {
        let dir = tempdir().unwrap();
        let _ = manager(dir.path());
        assert!(dir.path().join("wal").is_dir());
        assert!(dir.path().join("segments").is_dir());
        assert!(dir.path().join("indexes").is_dir());
    }

    #[test]
    fn flush_moves_rows_into_a_segment() {
        let dir = tempdir().unwrap();
        let storage = manager(dir.path());
        for i in 0..5 {
            storage.write_row("users", row(i)).unwrap();
        }
        storage.flush_table("users").unwrap();

        let row_store = storage.get_row_store("users", "id").unwrap();
        assert!(row_store.lock().unwrap().is_empty());
        let column_store = storage.get_column_store("users", "id").unwrap();
        assert_eq!(column_store.lock().unwrap().load_segments().unwrap().len(), 5);
    }

    #[test]
    fn flush_of_an_empty_table_is_a_no_op() {
        let dir = tempdir().unwrap();
        let storage = manager(dir.path());
        storage.get_row_store("users", "id").unwrap();
        storage.flush_table("users").unwrap();
        assert!(storage.segment_dir("users").exists());
        let column_store = storage.get_column_store("users", "id").unwrap();
        assert!(column_store.lock().unwrap().load_segments().unwrap().is_empty());
    }

    #[test]
    fn table_names_are_discovered_from_wal_files() {
        let dir = tempdir().unwrap();
        let storage = manager(dir.path());
        storage.write_row("users", row(1)).unwrap();
        storage.write_row("orders", row(1)).unwrap();
        assert_eq!(storage.table_names().unwrap(), vec!["orders", "users"]);
    }

    #[test]
    fn drop_table_removes_every_artifact_but_not_the_catalog() {
        let dir = tempdir().unwrap();
        let storage = manager(dir.path());
        storage.write_row("users", row(1)).unwrap();
        storage.flush_table("users").unwrap();
        storage.write_row("users", row(2)).unwrap();
        std::fs::write(dir.path().join("schema.json"), b"{}").unwrap();
        std::fs::write(storage.index_path("users", "id"), b"").unwrap();

        storage.drop_table("users").unwrap();

        assert!(!storage.block_path("users").exists());
        assert!(!storage.wal_path("users").exists());
        assert!(!storage.segment_dir("users").exists());
        assert!(!storage.index_path("users", "id").exists());
        assert!(dir.path().join("schema.json").exists());
    }

    #[test]
    fn dropping_an_unknown_table_is_an_error() {
        let dir = tempdir().unwrap();
        let storage = manager(dir.path());
        let err = storage.drop_table("ghost").unwrap_err();
        assert!(matches!(err, StorageError::MissingTable(_)));
    }
}
