use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, StorageError};
use crate::value::{Row, Val};

/// One logged operation, a single JSON line in the table's `.wal` file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum WalEntry {
    #[serde(rename = "INSERT")]
    Insert { row: Row },
    #[serde(rename = "DELETE")]
    Delete { key: Val },
}

/// Append-only operation log, one file per table. Every logged operation is
/// a complete line, flushed to the OS before the caller proceeds to its
/// block write.
pub struct WalManager {
    table: String,
    wal_path: PathBuf,
    file: File,
}

impl WalManager {
    pub fn open(table: &str, wal_dir: &Path) -> Result<WalManager> {
        std::fs::create_dir_all(wal_dir)?;
        let wal_path = wal_dir.join(format!("{}.wal", table));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&wal_path)?;
        Ok(WalManager {
            table: table.to_string(),
            wal_path,
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.wal_path
    }

    pub fn log_insert(&mut self, row: &Row) -> Result<()> {
        self.append(&WalEntry::Insert { row: row.clone() })
    }

    /// Logs a whole batch with a single write.
    pub fn log_insert_many(&mut self, rows: &[Row]) -> Result<()> {
        let mut buf = Vec::new();
        for row in rows {
            serialize_line(&WalEntry::Insert { row: row.clone() }, &mut buf)?;
        }
        self.file.write_all(&buf)?;
        self.file.flush()?;
        Ok(())
    }

    pub fn log_delete(&mut self, key: &Val) -> Result<()> {
        self.append(&WalEntry::Delete { key: key.clone() })
    }

    fn append(&mut self, entry: &WalEntry) -> Result<()> {
        let mut buf = Vec::new();
        serialize_line(entry, &mut buf)?;
        self.file.write_all(&buf)?;
        self.file.flush()?;
        Ok(())
    }

    /// Reads logged entries in file order. Replay stops at the first line
    /// that does not parse: after a crash the final line may be a torn
    /// write.
    pub fn read_entries(&self) -> Result<Vec<WalEntry>> {
        let file = match File::open(&self.wal_path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut entries = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<WalEntry>(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    log::warn!(
                        "wal {}: stopping replay at unparseable line: {}",
                        self.table,
                        e
                    );
                    break;
                }
            }
        }
        Ok(entries)
    }

    /// Replays the log in file order, dispatching each entry to the
    /// matching callback.
    pub fn replay<F, G>(&self, mut insert_cb: F, mut delete_cb: G) -> Result<()>
    where
        F: FnMut(Row) -> Result<()>,
        G: FnMut(&Val) -> Result<()>,
    {
        for entry in self.read_entries()? {
            match entry {
                WalEntry::Insert { row } => insert_cb(row)?,
                WalEntry::Delete { key } => delete_cb(&key)?,
            }
        }
        Ok(())
    }

    /// Truncates the log to zero length.
    pub fn clear(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        Ok(())
    }
}

fn serialize_line(entry: &WalEntry, buf: &mut Vec<u8>) -> Result<()> {
    let line = serde_json::to_vec(entry)
        .map_err(|e| StorageError::Corruption(format!("wal encode: {}", e)))?;
    buf.extend_from_slice(&line);
    buf.push(b'\n');
    Ok(())
}
