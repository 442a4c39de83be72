use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use lz4_flex::{compress_prepend_size, decompress_size_prepended};

use crate::error::{Result, StorageError};
use crate::storage::atomic_write;
use crate::value::{Row, Val};

/// Suffix of compressed columnar segment files.
const SEGMENT_EXT: &str = ".json.lz4";
const TOMBSTONE_FILE: &str = "deletes.json";

/// Immutable compressed columnar segments plus a tombstone set, one
/// directory per table. Segments are written by flushes and only ever
/// rewritten wholesale by compaction.
pub struct ColumnStore {
    table: String,
    primary_key: String,
    segment_dir: PathBuf,
    deletes_path: PathBuf,
    segment_rows: usize,
    deleted_keys: BTreeSet<Val>,
}

impl ColumnStore {
    pub fn open(
        table: &str,
        primary_key: &str,
        segments_dir: &Path,
        segment_rows: usize,
    ) -> Result<ColumnStore> {
        let segment_dir = segments_dir.join(table);
        std::fs::create_dir_all(&segment_dir)?;
        let deletes_path = segment_dir.join(TOMBSTONE_FILE);
        let mut store = ColumnStore {
            table: table.to_string(),
            primary_key: primary_key.to_string(),
            segment_dir,
            deletes_path,
            segment_rows,
            deleted_keys: BTreeSet::new(),
        };
        store.load_tombstones()?;
        Ok(store)
    }

    fn load_tombstones(&mut self) -> Result<()> {
        if !self.deletes_path.exists() {
            return Ok(());
        }
        let data = std::fs::read(&self.deletes_path)?;
        let keys: Vec<Val> = serde_json::from_slice(&data)
            .map_err(|e| StorageError::Corruption(format!("tombstones: {}", e)))?;
        self.deleted_keys = keys.into_iter().collect();
        Ok(())
    }

    /// Columnarises the batch and writes one new compressed segment. When no
    /// id is given the next one is derived from the current segment count.
    pub fn flush(&self, rows: &[Row], segment_id: Option<u64>) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let segment_id = match segment_id {
            Some(id) => id,
            None => self.segment_files()?.len() as u64,
        };
        let path = self
            .segment_dir
            .join(format!("seg_{}{}", segment_id, SEGMENT_EXT));
        let cols = columnarise(rows);
        let payload = serde_json::to_vec(&cols)
            .map_err(|e| StorageError::Corruption(format!("segment encode: {}", e)))?;
        let compressed = compress_prepend_size(&payload);
        atomic_write(&path, &compressed)?;
        log::info!(
            "column store {}: wrote segment {} ({} rows, {} bytes)",
            self.table,
            segment_id,
            rows.len(),
            compressed.len()
        );
        Ok(())
    }

    /// Marks `key` deleted in segment-resident data and rewrites the
    /// tombstone file atomically.
    pub fn log_delete(&mut self, key: Val) -> Result<()> {
        self.deleted_keys.insert(key);
        self.write_tombstones()
    }

    fn write_tombstones(&self) -> Result<()> {
        let keys: Vec<&Val> = self.deleted_keys.iter().collect();
        let data = serde_json::to_vec(&keys)
            .map_err(|e| StorageError::Corruption(format!("tombstone encode: {}", e)))?;
        atomic_write(&self.deletes_path, &data)?;
        Ok(())
    }

    pub fn deleted_keys(&self) -> &BTreeSet<Val> {
        &self.deleted_keys
    }

    /// Decompresses every segment in id order, reconstructing rows and
    /// excluding any whose primary key is tombstoned.
    pub fn load_segments(&self) -> Result<Vec<Row>> {
        let mut all = Vec::new();
        for (_, path) in self.segment_files()? {
            let rows = self.read_segment(&path)?;
            all.extend(rows.into_iter().filter(|row| !self.is_deleted(row)));
        }
        Ok(all)
    }

    fn is_deleted(&self, row: &Row) -> bool {
        row.get(&self.primary_key)
            .map_or(false, |key| self.deleted_keys.contains(key))
    }

    fn read_segment(&self, path: &Path) -> Result<Vec<Row>> {
        let compressed = std::fs::read(path)?;
        let payload = decompress_size_prepended(&compressed)
            .map_err(|e| StorageError::Corruption(format!("segment {}: {}", path.display(), e)))?;
        let cols: BTreeMap<String, Vec<Val>> = serde_json::from_slice(&payload)
            .map_err(|e| StorageError::Corruption(format!("segment {}: {}", path.display(), e)))?;
        rows_from_columns(&cols)
    }

    /// Segment files sorted by segment id.
    fn segment_files(&self) -> Result<Vec<(u64, PathBuf)>> {
        let mut segments = Vec::new();
        for entry in std::fs::read_dir(&self.segment_dir)? {
            let path = entry?.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name,
                None => continue,
            };
            if let Some(id) = name
                .strip_prefix("seg_")
                .and_then(|rest| rest.strip_suffix(SEGMENT_EXT))
                .and_then(|id| id.parse::<u64>().ok())
            {
                segments.push((id, path));
            }
        }
        segments.sort_by_key(|&(id, _)| id);
        Ok(segments)
    }

    /// Rewrites all live rows into fresh segments of at most `segment_rows`
    /// rows each, then deletes the tombstone file and empties the tombstone
    /// set. Idempotent: compacting twice is a no-op the second time.
    pub fn compact(&mut self) -> Result<()> {
        log::info!("compacting table {}", self.table);
        let old = self.segment_files()?;
        let mut live = Vec::new();
        for (_, path) in &old {
            let rows = self.read_segment(path)?;
            live.extend(rows.into_iter().filter(|row| !self.is_deleted(row)));
        }
        log::info!(
            "table {}: {} live rows after filtering tombstones",
            self.table,
            live.len()
        );

        for (_, path) in &old {
            std::fs::remove_file(path)?;
        }
        for (i, chunk) in live.chunks(self.segment_rows).enumerate() {
            self.flush(chunk, Some(i as u64))?;
        }
        if self.deletes_path.exists() {
            std::fs::remove_file(&self.deletes_path)?;
        }
        self.deleted_keys.clear();
        log::info!("compaction complete for table {}", self.table);
        Ok(())
    }
}

/// One key→values list per column; absent cells become explicit nulls.
fn columnarise(rows: &[Row]) -> BTreeMap<String, Vec<Val>> {
    let mut cols: BTreeMap<String, Vec<Val>> = BTreeMap::new();
    for row in rows {
        for name in row.keys() {
            cols.entry(name.clone()).or_default();
        }
    }
    for (name, values) in &mut cols {
        for row in rows {
            values.push(row.get(name).cloned().unwrap_or(Val::Null));
        }
    }
    cols
}

fn rows_from_columns(cols: &BTreeMap<String, Vec<Val>>) -> Result<Vec<Row>> {
    let len = cols.values().map(Vec::len).max().unwrap_or(0);
    for (name, values) in cols {
        if values.len() != len {
            return Err(StorageError::Corruption(format!(
                "column {} has {} values, expected {}",
                name,
                values.len(),
                len
            )));
        }
    }
    let mut rows = Vec::with_capacity(len);
    for i in 0..len {
        let row: Row = cols
            .iter()
            .map(|(name, values)| (name.clone(), values[i].clone()))
            .collect();
        rows.push(row);
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn row(id: i64, name: &str) -> Row {
        let mut row = Row::new();
        row.insert("id".to_string(), Val::Int(id));
        row.insert("name".to_string(), Val::from(name));
        row
    }

    fn rows(range: std::ops::Range<i64>) -> Vec<Row> {
        range.map(|i| row(i, "x")).collect()
    }

    #[test]
    fn flush_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let store = ColumnStore::open("users", "id", dir.path(), 1000).unwrap();
        let batch = vec![row(1, "alice"), row(2, "bob")];
        store.flush(&batch, None).unwrap();
        assert_eq!(store.load_segments().unwrap(), batch);
    }

    #[test]
    fn segments_load_in_id_order() {
        let dir = tempdir().unwrap();
        let store = ColumnStore::open("users", "id", dir.path(), 1000).unwrap();
        for i in 0..12 {
            store.flush(&[row(i, "x")], None).unwrap();
        }
        let ids: Vec<i64> = store
            .load_segments()
            .unwrap()
            .iter()
            .map(|r| r["id"].as_int().unwrap())
            .collect();
        assert_eq!(ids, (0..12).collect::<Vec<i64>>());
    }

    #[test]
    fn tombstoned_keys_are_not_surfaced() {
        let dir = tempdir().unwrap();
        let mut store = ColumnStore::open("users", "id", dir.path(), 1000).unwrap();
        store.flush(&rows(0..10), None).unwrap();
        store.log_delete(Val::Int(3)).unwrap();
        store.log_delete(Val::Int(7)).unwrap();

        let ids: Vec<i64> = store
            .load_segments()
            .unwrap()
            .iter()
            .map(|r| r["id"].as_int().unwrap())
            .collect();
        assert_eq!(ids, vec![0, 1, 2, 4, 5, 6, 8, 9]);

        // Tombstones survive a reopen.
        let reopened = ColumnStore::open("users", "id", dir.path(), 1000).unwrap();
        assert_eq!(reopened.deleted_keys().len(), 2);
    }

    #[test]
    fn compact_drops_tombstones_and_rechunks() {
        let dir = tempdir().unwrap();
        let mut store = ColumnStore::open("users", "id", dir.path(), 5).unwrap();
        store.flush(&rows(0..8), Some(0)).unwrap();
        store.flush(&rows(8..16), Some(1)).unwrap();
        store.log_delete(Val::Int(0)).unwrap();
        store.log_delete(Val::Int(15)).unwrap();

        store.compact().unwrap();

        assert!(!dir.path().join("users").join(TOMBSTONE_FILE).exists());
        assert!(store.deleted_keys().is_empty());
        let ids: Vec<i64> = store
            .load_segments()
            .unwrap()
            .iter()
            .map(|r| r["id"].as_int().unwrap())
            .collect();
        assert_eq!(ids, (1..15).collect::<Vec<i64>>());
        // 14 live rows at 5 rows per segment.
        assert_eq!(store.segment_files().unwrap().len(), 3);
    }

    #[test]
    fn compact_is_idempotent() {
        let dir = tempdir().unwrap();
        let mut store = ColumnStore::open("users", "id", dir.path(), 5).unwrap();
        store.flush(&rows(0..7), None).unwrap();
        store.log_delete(Val::Int(2)).unwrap();
        store.compact().unwrap();
        let first = store.load_segments().unwrap();
        store.compact().unwrap();
        assert_eq!(store.load_segments().unwrap(), first);
    }

    #[test]
    fn absent_cells_come_back_as_nulls() {
        let dir = tempdir().unwrap();
        let store = ColumnStore::open("users", "id", dir.path(), 1000).unwrap();
        let mut partial = Row::new();
        partial.insert("id".to_string(), Val::Int(1));
        store.flush(&[partial, row(2, "bob")], None).unwrap();

        let loaded = store.load_segments().unwrap();
        assert_eq!(loaded[0]["name"], Val::Null);
        assert_eq!(loaded[1]["name"], Val::from("bob"));
    }
}
