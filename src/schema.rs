use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Int,
    Text,
    Float,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Constraint {
    PrimaryKey,
    Unique,
    NotNull,
}

/// A column descriptor; the column list drives validation and index
/// creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub dtype: DataType,
    pub constraints: Vec<Constraint>,
    pub auto_increment: bool,
}

impl Column {
    pub fn new(name: &str, dtype: DataType) -> Column {
        Column {
            name: name.to_string(),
            dtype,
            constraints: Vec::new(),
            auto_increment: false,
        }
    }

    pub fn with_constraints(mut self, constraints: &[Constraint]) -> Column {
        self.constraints.extend_from_slice(constraints);
        self
    }

    pub fn with_auto_increment(mut self) -> Column {
        self.auto_increment = true;
        self
    }

    pub fn is_primary(&self) -> bool {
        self.constraints.contains(&Constraint::PrimaryKey)
    }

    /// PRIMARY KEY columns are unique; UNIQUE is also valid on its own.
    pub fn is_unique(&self) -> bool {
        self.is_primary() || self.constraints.contains(&Constraint::Unique)
    }

    /// PRIMARY KEY columns are NOT NULL; explicit NOT NULL is also valid.
    pub fn is_not_null(&self) -> bool {
        self.is_primary() || self.constraints.contains(&Constraint::NotNull)
    }
}
