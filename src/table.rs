use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use itertools::Itertools;

use crate::error::{Result, StorageError};
use crate::index::BPlusTree;
use crate::schema::Column;
use crate::stats::TableStats;
use crate::storage::StorageManager;
use crate::value::{Row, Val};

/// Column assumed to key the row store when a table has no PRIMARY KEY.
pub const DEFAULT_PRIMARY_KEY: &str = "id";

/// Per-table glue: constraint validation, auto-increment assignment and
/// unique-index maintenance over the table's row and column stores.
pub struct Table {
    name: String,
    columns: Vec<Column>,
    storage: Arc<StorageManager>,
    primary_key: String,
    auto_increment_col: Option<String>,
    /// One B+Tree per unique column.
    indexes: BTreeMap<String, BPlusTree>,
    next_increment: i64,
    /// Sequence position assigned to the next inserted row.
    next_position: u64,
}

impl Table {
    /// Opens (or creates) the table's storage artifacts and its unique
    /// indexes. `next_increment` is rediscovered by scanning the resident
    /// row-store rows for the largest value already assigned.
    pub fn open(name: &str, columns: Vec<Column>, storage: Arc<StorageManager>) -> Result<Table> {
        let primary_key = columns
            .iter()
            .find(|c| c.is_primary())
            .map(|c| c.name.clone())
            .unwrap_or_else(|| DEFAULT_PRIMARY_KEY.to_string());
        let auto_increment_col = columns
            .iter()
            .find(|c| c.auto_increment)
            .map(|c| c.name.clone());

        let row_store = storage.get_row_store(name, &primary_key)?;
        storage.get_column_store(name, &primary_key)?;

        let (resident, next_increment) = {
            let row_store = row_store.lock().unwrap();
            let rows = row_store.get_rows();
            let next = match &auto_increment_col {
                Some(col) => rows
                    .iter()
                    .filter_map(|r| r.get(col))
                    .filter_map(Val::as_int)
                    .max()
                    .map_or(1, |max| max + 1),
                None => 1,
            };
            (rows.len() as u64, next)
        };

        let mut indexes = BTreeMap::new();
        for col in columns.iter().filter(|c| c.is_unique()) {
            let path = storage.index_path(name, &col.name);
            let tree = BPlusTree::open(&path, storage.options().index_order)?;
            indexes.insert(col.name.clone(), tree);
        }

        Ok(Table {
            name: name.to_string(),
            columns,
            storage,
            primary_key,
            auto_increment_col,
            indexes,
            next_increment,
            next_position: resident,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }

    fn assign_auto_increment(&mut self, row: &mut Row) {
        if let Some(col) = &self.auto_increment_col {
            if row.get(col).map_or(true, Val::is_null) {
                row.insert(col.clone(), Val::Int(self.next_increment));
                self.next_increment += 1;
            }
        }
    }

    fn validate_not_null(&self, row: &Row) -> Result<()> {
        for col in &self.columns {
            if col.is_not_null() && row.get(&col.name).map_or(true, Val::is_null) {
                return Err(StorageError::NullConstraint(col.name.clone()));
            }
        }
        Ok(())
    }

    /// Validates constraints, probes every unique index for duplicates,
    /// writes the row and updates the indexes. Returns the stored row with
    /// any assigned auto-increment value filled in.
    pub fn insert(&mut self, mut row: Row) -> Result<Row> {
        self.assign_auto_increment(&mut row);
        self.validate_not_null(&row)?;

        for (col, tree) in &mut self.indexes {
            let key = row.get(col).cloned().unwrap_or(Val::Null);
            if tree.search(&key)?.is_some() {
                return Err(StorageError::DuplicateKey(key.to_string()));
            }
        }

        let position = self.next_position;
        self.storage.write_row(&self.name, row.clone())?;

        for (col, tree) in &mut self.indexes {
            let key = row.get(col).cloned().unwrap_or(Val::Null);
            tree.insert(key, position)?;
        }
        self.next_position += 1;
        self.save_indexes()?;
        Ok(row)
    }

    /// Bulk insert. With `bulk_mode` off, every key is checked against both
    /// the batch and the existing tree and the indexes are updated per row;
    /// with it on, only intra-batch duplicates are pre-checked and the
    /// caller commits to running `rebuild_index` afterwards.
    pub fn bulk_insert(&mut self, rows: Vec<Row>, bulk_mode: bool) -> Result<Vec<Row>> {
        let mut prepared = Vec::with_capacity(rows.len());
        for mut row in rows {
            self.assign_auto_increment(&mut row);
            self.validate_not_null(&row)?;
            prepared.push(row);
        }

        for col in self.indexes.keys() {
            let mut seen = HashSet::new();
            for row in &prepared {
                let key = row.get(col).cloned().unwrap_or(Val::Null);
                if !seen.insert(key.clone()) {
                    return Err(StorageError::DuplicateKey(key.to_string()));
                }
            }
        }
        if !bulk_mode {
            for (col, tree) in &mut self.indexes {
                for row in &prepared {
                    let key = row.get(col).cloned().unwrap_or(Val::Null);
                    if tree.search(&key)?.is_some() {
                        return Err(StorageError::DuplicateKey(key.to_string()));
                    }
                }
            }
        }

        self.storage.bulk_write(&self.name, prepared.clone())?;

        if !bulk_mode {
            let base = self.next_position;
            for (col, tree) in &mut self.indexes {
                for (offset, row) in prepared.iter().enumerate() {
                    let key = row.get(col).cloned().unwrap_or(Val::Null);
                    tree.insert(key, base + offset as u64)?;
                }
            }
        }
        self.next_position += prepared.len() as u64;
        if !bulk_mode {
            self.save_indexes()?;
        }
        Ok(prepared)
    }

    /// Replaces every unique column's index with a fresh bulk-loaded tree
    /// over the table's live rows (row-store rows followed by segment rows).
    pub fn rebuild_index(&mut self) -> Result<()> {
        let rows = self.select_all()?;
        let order = self.storage.options().index_order;
        let cols: Vec<String> = self.indexes.keys().cloned().collect();
        for col in cols {
            let items: Vec<(Val, u64)> = rows
                .iter()
                .enumerate()
                .map(|(position, row)| {
                    (
                        row.get(&col).cloned().unwrap_or(Val::Null),
                        position as u64,
                    )
                })
                .sorted_by(|a, b| a.0.cmp(&b.0))
                .collect();
            let path = self.storage.index_path(&self.name, &col);
            let tree = BPlusTree::bulk_load(&items, order, &path)?;
            self.indexes.insert(col, tree);
        }
        log::debug!("rebuilt {} indexes of table {}", self.indexes.len(), self.name);
        Ok(())
    }

    /// Removes every row-store row whose `column` renders equal to `value`,
    /// then rebuilds the indexes so no stale entries survive. Returns the
    /// number of rows removed.
    pub fn delete_rows(&mut self, column: &str, value: &str) -> Result<usize> {
        let row_store = self.storage.get_row_store(&self.name, &self.primary_key)?;
        let deleted = {
            let mut store = row_store.lock().unwrap();
            let deleted = store.delete_rows_where(column, value)?;
            self.next_position = store.len() as u64;
            deleted
        };
        if deleted > 0 {
            self.rebuild_index()?;
        }
        Ok(deleted)
    }

    /// Deletes a single row by primary key, wherever it resides: directly
    /// from the row store, or through a tombstone when the row has been
    /// flushed into segments.
    pub fn delete_by_key(&mut self, key: &Val) -> Result<bool> {
        if self.storage.delete_row(&self.name, key)? {
            let row_store = self.storage.get_row_store(&self.name, &self.primary_key)?;
            self.next_position = row_store.lock().unwrap().len() as u64;
            self.rebuild_index()?;
            return Ok(true);
        }
        let column_store = self.storage.get_column_store(&self.name, &self.primary_key)?;
        let in_segments = {
            let store = column_store.lock().unwrap();
            store
                .load_segments()?
                .iter()
                .any(|row| row.get(&self.primary_key) == Some(key))
        };
        if in_segments {
            self.storage.tombstone(&self.name, key.clone())?;
            self.rebuild_index()?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Moves the resident row-store rows into a new column segment and
    /// clears the row store.
    pub fn flush(&mut self) -> Result<()> {
        self.storage.flush_table(&self.name)?;
        self.next_position = 0;
        Ok(())
    }

    /// All live rows: row-store rows followed by segment rows.
    pub fn select_all(&self) -> Result<Vec<Row>> {
        let row_store = self.storage.get_row_store(&self.name, &self.primary_key)?;
        let column_store = self.storage.get_column_store(&self.name, &self.primary_key)?;
        let mut rows = row_store.lock().unwrap().get_rows();
        rows.extend(column_store.lock().unwrap().load_segments()?);
        Ok(rows)
    }

    /// Live rows whose `column` renders equal to `value`.
    pub fn select_where(&self, column: &str, value: &str) -> Result<Vec<Row>> {
        Ok(self
            .select_all()?
            .into_iter()
            .filter(|row| row.get(column).map_or(false, |v| v.to_string() == value))
            .collect())
    }

    /// Point-in-time statistics for the stats endpoint.
    pub fn stats(&self) -> Result<TableStats> {
        let row_store = self.storage.get_row_store(&self.name, &self.primary_key)?;
        let column_store = self.storage.get_column_store(&self.name, &self.primary_key)?;
        let rows = row_store.lock().unwrap().len();
        let segment_rows = column_store.lock().unwrap().load_segments()?.len();
        let disk_usage_bytes = std::fs::metadata(self.storage.block_path(&self.name))
            .map(|m| m.len())
            .unwrap_or(0);
        Ok(TableStats {
            name: self.name.clone(),
            columns: self.columns.len(),
            rows,
            segment_rows,
            disk_usage_bytes,
            indexes: self.indexes.keys().cloned().collect(),
            has_primary_key: self.columns.iter().any(|c| c.is_primary()),
        })
    }

    /// Persists every index's root pointer.
    fn save_indexes(&self) -> Result<()> {
        for tree in self.indexes.values() {
            tree.save_root()?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn index_mut(&mut self, column: &str) -> &mut BPlusTree {
        self.indexes.get_mut(column).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Options;
    use crate::schema::{Constraint, DataType};
    use tempfile::tempdir;

    fn storage(dir: &std::path::Path) -> Arc<StorageManager> {
        Arc::new(
            StorageManager::open(Options {
                db_path: dir.to_path_buf(),
                ..Options::default()
            })
            .unwrap(),
        )
    }

    fn users_columns() -> Vec<Column> {
        vec![
            Column::new("id", DataType::Int)
                .with_constraints(&[Constraint::PrimaryKey])
                .with_auto_increment(),
            Column::new("name", DataType::Text).with_constraints(&[Constraint::NotNull]),
        ]
    }

    fn named(name: &str) -> Row {
        let mut row = Row::new();
        row.insert("name".to_string(), Val::from(name));
        row
    }

    #[test]
    fn auto_increment_assigns_consecutive_ids() {
        let dir = tempdir().unwrap();
        let mut table = Table::open("users", users_columns(), storage(dir.path())).unwrap();
        let a = table.insert(named("alice")).unwrap();
        let b = table.insert(named("bob")).unwrap();
        assert_eq!(a["id"], Val::Int(1));
        assert_eq!(b["id"], Val::Int(2));
    }

    #[test]
    fn missing_not_null_column_is_rejected_without_mutation() {
        let dir = tempdir().unwrap();
        let mut table = Table::open("users", users_columns(), storage(dir.path())).unwrap();
        let mut row = Row::new();
        row.insert("id".to_string(), Val::Int(7));
        let err = table.insert(row).unwrap_err();
        assert!(matches!(err, StorageError::NullConstraint(_)));
        assert!(table.select_all().unwrap().is_empty());
    }

    #[test]
    fn explicit_null_violates_not_null() {
        let dir = tempdir().unwrap();
        let mut table = Table::open("users", users_columns(), storage(dir.path())).unwrap();
        let mut row = named("x");
        row.insert("name".to_string(), Val::Null);
        assert!(matches!(
            table.insert(row),
            Err(StorageError::NullConstraint(_))
        ));
    }

    #[test]
    fn duplicate_primary_key_is_rejected() {
        let dir = tempdir().unwrap();
        let mut table = Table::open("users", users_columns(), storage(dir.path())).unwrap();
        table.insert(named("alice")).unwrap();
        let mut dup = named("clone");
        dup.insert("id".to_string(), Val::Int(1));
        let err = table.insert(dup).unwrap_err();
        assert!(matches!(err, StorageError::DuplicateKey(_)));
        assert_eq!(table.select_all().unwrap().len(), 1);
    }

    #[test]
    fn next_increment_is_rediscovered_on_open() {
        let dir = tempdir().unwrap();
        let storage = storage(dir.path());
        {
            let mut table = Table::open("users", users_columns(), storage.clone()).unwrap();
            for name in ["alice", "bob", "carol"] {
                table.insert(named(name)).unwrap();
            }
        }
        let mut table = Table::open("users", users_columns(), storage).unwrap();
        let d = table.insert(named("dave")).unwrap();
        assert_eq!(d["id"], Val::Int(4));
    }

    #[test]
    fn bulk_insert_checks_duplicates_within_the_batch() {
        let dir = tempdir().unwrap();
        let mut table = Table::open("users", users_columns(), storage(dir.path())).unwrap();
        let mut a = named("a");
        a.insert("id".to_string(), Val::Int(2));
        let mut b = named("b");
        b.insert("id".to_string(), Val::Int(2));
        let err = table.bulk_insert(vec![a, b], true).unwrap_err();
        assert!(matches!(err, StorageError::DuplicateKey(_)));
    }

    #[test]
    fn bulk_insert_checks_existing_keys_in_non_bulk_mode() {
        let dir = tempdir().unwrap();
        let mut table = Table::open("users", users_columns(), storage(dir.path())).unwrap();
        table.insert(named("alice")).unwrap();
        let mut dup = named("b");
        dup.insert("id".to_string(), Val::Int(1));
        let err = table.bulk_insert(vec![dup], false).unwrap_err();
        assert!(matches!(err, StorageError::DuplicateKey(_)));
    }

    #[test]
    fn non_bulk_mode_indexes_every_row_at_its_position() {
        let dir = tempdir().unwrap();
        let mut table = Table::open("users", users_columns(), storage(dir.path())).unwrap();
        table.insert(named("seed")).unwrap();
        let batch: Vec<Row> = ["a", "b", "c"].iter().map(|n| named(n)).collect();
        table.bulk_insert(batch, false).unwrap();

        for (key, position) in [(1, 0), (2, 1), (3, 2), (4, 3)] {
            assert_eq!(
                table.index_mut("id").search(&Val::Int(key)).unwrap(),
                Some(position)
            );
        }
    }

    #[test]
    fn bulk_mode_defers_index_maintenance_to_rebuild() {
        let dir = tempdir().unwrap();
        let mut table = Table::open("users", users_columns(), storage(dir.path())).unwrap();
        let batch: Vec<Row> = (0..10).map(|i| named(&format!("u{}", i))).collect();
        table.bulk_insert(batch, true).unwrap();
        assert_eq!(table.index_mut("id").search(&Val::Int(1)).unwrap(), None);

        table.rebuild_index().unwrap();
        for i in 1..=10 {
            assert!(table.index_mut("id").search(&Val::Int(i)).unwrap().is_some());
        }
    }

    #[test]
    fn delete_rows_filters_by_rendered_value_and_rebuilds_indexes() {
        let dir = tempdir().unwrap();
        let mut table = Table::open("users", users_columns(), storage(dir.path())).unwrap();
        table.insert(named("alice")).unwrap();
        table.insert(named("bob")).unwrap();
        table.insert(named("bob")).unwrap();

        assert_eq!(table.delete_rows("name", "bob").unwrap(), 2);
        assert_eq!(table.select_all().unwrap().len(), 1);
        // The removed keys no longer answer index probes, so they are
        // insertable again.
        let mut replay = named("bob2");
        replay.insert("id".to_string(), Val::Int(2));
        table.insert(replay).unwrap();
        assert_eq!(table.delete_rows("name", "nobody").unwrap(), 0);
    }

    #[test]
    fn delete_by_key_reaches_flushed_rows_through_tombstones() {
        let dir = tempdir().unwrap();
        let mut table = Table::open("users", users_columns(), storage(dir.path())).unwrap();
        table.insert(named("alice")).unwrap();
        table.insert(named("bob")).unwrap();
        table.flush().unwrap();
        table.insert(named("carol")).unwrap();

        // Row-store resident.
        assert!(table.delete_by_key(&Val::Int(3)).unwrap());
        // Segment resident.
        assert!(table.delete_by_key(&Val::Int(1)).unwrap());
        assert!(!table.delete_by_key(&Val::Int(99)).unwrap());

        let ids: Vec<i64> = table
            .select_all()
            .unwrap()
            .iter()
            .map(|r| r["id"].as_int().unwrap())
            .collect();
        assert_eq!(ids, vec![2]);
    }

    #[test]
    fn select_all_merges_row_store_and_segments() {
        let dir = tempdir().unwrap();
        let mut table = Table::open("users", users_columns(), storage(dir.path())).unwrap();
        table.insert(named("alice")).unwrap();
        table.flush().unwrap();
        table.insert(named("bob")).unwrap();

        let rows = table.select_all().unwrap();
        assert_eq!(rows.len(), 2);
        // Row-store rows come first.
        assert_eq!(rows[0]["name"], Val::from("bob"));
        assert_eq!(rows[1]["name"], Val::from("alice"));
    }

    #[test]
    fn unique_keys_stay_enforced_across_a_flush() {
        let dir = tempdir().unwrap();
        let mut table = Table::open("users", users_columns(), storage(dir.path())).unwrap();
        table.insert(named("alice")).unwrap();
        table.flush().unwrap();

        let mut dup = named("imposter");
        dup.insert("id".to_string(), Val::Int(1));
        assert!(matches!(
            table.insert(dup),
            Err(StorageError::DuplicateKey(_))
        ));
    }

    #[test]
    fn select_where_filters_textually() {
        let dir = tempdir().unwrap();
        let mut table = Table::open("users", users_columns(), storage(dir.path())).unwrap();
        table.insert(named("alice")).unwrap();
        table.insert(named("bob")).unwrap();
        let hits = table.select_where("name", "bob").unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0]["id"], Val::Int(2));
        let by_id = table.select_where("id", "1").unwrap();
        assert_eq!(by_id[0]["name"], Val::from("alice"));
    }

    #[test]
    fn stats_reflect_both_stores() {
        let dir = tempdir().unwrap();
        let mut table = Table::open("users", users_columns(), storage(dir.path())).unwrap();
        table.insert(named("alice")).unwrap();
        table.flush().unwrap();
        table.insert(named("bob")).unwrap();

        let stats = table.stats().unwrap();
        assert_eq!(stats.rows, 1);
        assert_eq!(stats.segment_rows, 1);
        assert_eq!(stats.columns, 2);
        assert_eq!(stats.indexes, vec!["id".to_string()]);
        assert!(stats.has_primary_key);
    }

    #[test]
    fn unique_non_primary_columns_are_indexed_too() {
        let dir = tempdir().unwrap();
        let columns = vec![
            Column::new("id", DataType::Int)
                .with_constraints(&[Constraint::PrimaryKey])
                .with_auto_increment(),
            Column::new("email", DataType::Text).with_constraints(&[Constraint::Unique]),
        ];
        let mut table = Table::open("users", columns, storage(dir.path())).unwrap();
        let mut row = Row::new();
        row.insert("email".to_string(), Val::from("a@example.com"));
        table.insert(row.clone()).unwrap();
        let err = table.insert(row).unwrap_err();
        assert!(matches!(err, StorageError::DuplicateKey(_)));
    }
}
