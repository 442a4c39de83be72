use std::collections::BTreeMap;
use std::fmt;

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

/// A single scalar cell value.
///
/// Variant order fixes the cross-type sort order; keys within one index are
/// homogeneous, so in practice only the per-variant ordering is observable.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Val {
    Null,
    Int(i64),
    Float(OrderedFloat<f64>),
    Str(String),
}

/// A row maps column names to scalar values. Key-sorted so the textual block
/// encoding is canonical.
pub type Row = BTreeMap<String, Val>;

impl Val {
    pub fn is_null(&self) -> bool {
        matches!(self, Val::Null)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Val::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl fmt::Display for Val {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Val::Null => write!(f, "null"),
            Val::Int(i) => write!(f, "{}", i),
            Val::Float(x) => write!(f, "{}", x),
            Val::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for Val {
    fn from(i: i64) -> Val {
        Val::Int(i)
    }
}

impl From<f64> for Val {
    fn from(x: f64) -> Val {
        Val::Float(OrderedFloat(x))
    }
}

impl From<&str> for Val {
    fn from(s: &str) -> Val {
        Val::Str(s.to_string())
    }
}

impl From<String> for Val {
    fn from(s: String) -> Val {
        Val::Str(s)
    }
}
