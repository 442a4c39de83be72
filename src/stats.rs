use serde::Serialize;

/// Point-in-time statistics for one table, shaped for the external stats
/// endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct TableStats {
    pub name: String,
    pub columns: usize,
    /// Live rows resident in the row store.
    pub rows: usize,
    /// Live rows resident in column segments.
    pub segment_rows: usize,
    /// Size of the table's row-block file.
    pub disk_usage_bytes: u64,
    pub indexes: Vec<String>,
    pub has_primary_key: bool,
}
