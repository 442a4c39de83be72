pub mod btree;
pub mod node;

pub use btree::{BPlusTree, Scan};
pub use node::Node;
