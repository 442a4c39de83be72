use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StorageError};
use crate::storage::block::BLOCK_SIZE;
use crate::value::Val;

/// Bytes in the big-endian payload-length header of a node block.
const LEN_HEADER: usize = 4;

/// A single B+Tree node, persisted in its own block. Children and the next
/// leaf are referenced by node id, never by pointer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub order: usize,
    pub leaf: bool,
    pub keys: Vec<Val>,
    /// Leaf only, parallel to `keys`.
    pub values: Vec<u64>,
    /// Internal only; length is `keys.len() + 1`.
    pub children: Vec<u64>,
    /// Leaf only, id of the next leaf in key order.
    pub next: Option<u64>,
    pub node_id: u64,
    #[serde(skip)]
    pub dirty: bool,
}

impl Node {
    pub fn new(order: usize, leaf: bool, node_id: u64) -> Node {
        Node {
            order,
            leaf,
            keys: Vec::new(),
            values: Vec::new(),
            children: Vec::new(),
            next: None,
            node_id,
            dirty: true,
        }
    }

    /// A node holds at most `order - 1` keys.
    pub fn is_full(&self) -> bool {
        self.keys.len() == self.order - 1
    }

    /// Serialises the node as a 4-byte big-endian payload length followed by
    /// its JSON encoding.
    pub fn to_block(&self) -> Result<Vec<u8>> {
        let payload = serde_json::to_vec(self)
            .map_err(|e| StorageError::Corruption(format!("node encode: {}", e)))?;
        if LEN_HEADER + payload.len() > BLOCK_SIZE {
            return Err(StorageError::Corruption(format!(
                "node {} does not fit in a block ({} bytes)",
                self.node_id,
                LEN_HEADER + payload.len()
            )));
        }
        let mut data = vec![0u8; LEN_HEADER];
        BigEndian::write_u32(&mut data, payload.len() as u32);
        data.extend_from_slice(&payload);
        Ok(data)
    }

    pub fn from_block(data: &[u8]) -> Result<Node> {
        if data.len() < LEN_HEADER {
            return Err(StorageError::Corruption("node block too short".to_string()));
        }
        let len = BigEndian::read_u32(&data[..LEN_HEADER]) as usize;
        if LEN_HEADER + len > data.len() {
            return Err(StorageError::Corruption(format!(
                "node payload length {} exceeds block",
                len
            )));
        }
        serde_json::from_slice(&data[LEN_HEADER..LEN_HEADER + len])
            .map_err(|e| StorageError::Corruption(format!("node decode: {}", e)))
    }
}
