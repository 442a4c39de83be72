use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    /// A NOT NULL column was absent or null on insert.
    #[error("column '{0}' cannot be NULL")]
    NullConstraint(String),

    /// A unique column already holds the key.
    #[error("duplicate value for unique column: {0}")]
    DuplicateKey(String),

    #[error("no such table: {0}")]
    MissingTable(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Decoded on-disk data failed a structural check.
    #[error("corruption: {0}")]
    Corruption(String),
}
