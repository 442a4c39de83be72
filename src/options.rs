use std::path::PathBuf;

/// Tuning knobs for a storage tree rooted at `db_path`.
#[derive(Debug, Clone)]
pub struct Options {
    /// Base directory holding `wal/`, `segments/` and `indexes/`.
    pub db_path: PathBuf,
    /// B+Tree order used for table indexes (max keys per node + 1).
    pub index_order: usize,
    /// Maximum number of rows per compaction-produced segment.
    pub segment_rows: usize,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            db_path: PathBuf::from("data"),
            index_order: 32,
            segment_rows: 1000,
        }
    }
}
