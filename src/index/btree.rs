use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use lru::LruCache;

use crate::error::{Result, StorageError};
use crate::index::node::Node;
use crate::storage::atomic_write;
use crate::storage::block::BlockManager;
use crate::value::Val;

/// Number of recently loaded nodes kept in memory.
const NODE_CACHE_SIZE: usize = 256;

/// Persistent B+Tree. Every node occupies one block of the index file,
/// addressed by its node id (ids come from the block allocator, so they are
/// dense and monotonically increasing). The root id lives in a sibling
/// `.meta` file so the tree can be reopened.
pub struct BPlusTree {
    order: usize,
    block_manager: BlockManager,
    meta_path: PathBuf,
    root_id: u64,
    cache: LruCache<u64, Node>,
}

impl BPlusTree {
    /// Opens the index at `path`, creating an empty tree (a single leaf
    /// root) when no meta file exists yet.
    pub fn open(path: &Path, order: usize) -> Result<BPlusTree> {
        assert!(order >= 3, "B+Tree order must be at least 3");
        let meta_path = meta_path_for(path);
        let mut block_manager = BlockManager::open(path)?;
        let cache = LruCache::new(NonZeroUsize::new(NODE_CACHE_SIZE).unwrap());
        if meta_path.exists() {
            let raw = std::fs::read_to_string(&meta_path)?;
            let root_id = raw.trim().parse::<u64>().map_err(|_| {
                StorageError::Corruption(format!("bad index meta file {}", meta_path.display()))
            })?;
            Ok(BPlusTree {
                order,
                block_manager,
                meta_path,
                root_id,
                cache,
            })
        } else {
            let root_id = block_manager.allocate_block()?;
            let mut tree = BPlusTree {
                order,
                block_manager,
                meta_path,
                root_id,
                cache,
            };
            let root = Node::new(order, true, root_id);
            tree.save_node(&root)?;
            tree.save_root()?;
            Ok(tree)
        }
    }

    /// Builds a tree from `items`, which the caller guarantees to be sorted
    /// by key and duplicate-free. Leaves are packed to `order - 1` entries
    /// and linked left to right, then internal levels are built bottom-up
    /// until a single root remains; every node is written exactly once. Any
    /// previous index contents at `path` are discarded.
    pub fn bulk_load(items: &[(Val, u64)], order: usize, path: &Path) -> Result<BPlusTree> {
        assert!(order >= 3, "B+Tree order must be at least 3");
        let block_manager = BlockManager::create(path)?;
        let mut tree = BPlusTree {
            order,
            block_manager,
            meta_path: meta_path_for(path),
            root_id: 0,
            cache: LruCache::new(NonZeroUsize::new(NODE_CACHE_SIZE).unwrap()),
        };

        let node_size = order - 1;
        let mut leaves: Vec<Node> = Vec::new();
        for chunk in items.chunks(node_size) {
            let mut leaf = tree.allocate_node(true)?;
            leaf.keys = chunk.iter().map(|(k, _)| k.clone()).collect();
            leaf.values = chunk.iter().map(|&(_, v)| v).collect();
            leaves.push(leaf);
        }
        if leaves.is_empty() {
            leaves.push(tree.allocate_node(true)?);
        }
        for i in 0..leaves.len() - 1 {
            let next_id = leaves[i + 1].node_id;
            leaves[i].next = Some(next_id);
        }

        // (smallest key of subtree, node id) per node of the current level.
        let mut level: Vec<(Option<Val>, u64)> = Vec::with_capacity(leaves.len());
        for leaf in &leaves {
            level.push((leaf.keys.first().cloned(), leaf.node_id));
            tree.save_node(leaf)?;
        }

        // Each parent takes up to `order` children; the separator for child
        // i (i >= 1) is the smallest key of child i's subtree.
        while level.len() > 1 {
            let mut parents = Vec::new();
            for chunk in level.chunks(order) {
                let mut parent = tree.allocate_node(false)?;
                parent.children = chunk.iter().map(|&(_, id)| id).collect();
                parent.keys = chunk[1..]
                    .iter()
                    .map(|(min, _)| min.clone().expect("non-first bulk-load child is empty"))
                    .collect();
                let parent_min = chunk[0].0.clone();
                tree.save_node(&parent)?;
                parents.push((parent_min, parent.node_id));
            }
            level = parents;
        }

        tree.root_id = level[0].1;
        tree.save_root()?;
        Ok(tree)
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn root_id(&self) -> u64 {
        self.root_id
    }

    /// Persists the root pointer to the meta file.
    pub fn save_root(&self) -> Result<()> {
        atomic_write(&self.meta_path, format!("{}\n", self.root_id).as_bytes())?;
        Ok(())
    }

    fn allocate_node(&mut self, leaf: bool) -> Result<Node> {
        let node_id = self.block_manager.allocate_block()?;
        Ok(Node::new(self.order, leaf, node_id))
    }

    fn save_node(&mut self, node: &Node) -> Result<()> {
        let data = node.to_block()?;
        self.block_manager.write_block(node.node_id, &data)?;
        let mut cached = node.clone();
        cached.dirty = false;
        self.cache.put(node.node_id, cached);
        Ok(())
    }

    fn load_node(&mut self, node_id: u64) -> Result<Node> {
        if let Some(node) = self.cache.get(&node_id) {
            return Ok(node.clone());
        }
        let data = self.block_manager.read_block(node_id)?;
        let node = Node::from_block(&data)?;
        if node.node_id != node_id {
            return Err(StorageError::Corruption(format!(
                "node block {} claims id {}",
                node_id, node.node_id
            )));
        }
        self.cache.put(node_id, node.clone());
        Ok(node)
    }

    /// Index of the child slot to descend into: the first key strictly
    /// greater than `key`.
    fn child_index(keys: &[Val], key: &Val) -> usize {
        keys.partition_point(|k| k <= key)
    }

    fn find_leaf(&mut self, key: &Val) -> Result<Node> {
        let mut node = self.load_node(self.root_id)?;
        while !node.leaf {
            let idx = Self::child_index(&node.keys, key);
            node = self.load_node(node.children[idx])?;
        }
        Ok(node)
    }

    pub fn search(&mut self, key: &Val) -> Result<Option<u64>> {
        let leaf = self.find_leaf(key)?;
        Ok(leaf.keys.binary_search(key).ok().map(|i| leaf.values[i]))
    }

    /// Inserts `(key, value)`, refusing duplicates with
    /// [`StorageError::DuplicateKey`]. Splits happen top-down: a full root
    /// grows the tree by one level, and any full child is split before it is
    /// entered.
    pub fn insert(&mut self, key: Val, value: u64) -> Result<()> {
        let root = self.load_node(self.root_id)?;
        if root.is_full() {
            let mut new_root = self.allocate_node(false)?;
            new_root.children.push(root.node_id);
            self.split_child(&mut new_root, 0)?;
            self.save_node(&new_root)?;
            self.root_id = new_root.node_id;
            self.save_root()?;
        }
        self.insert_non_full(self.root_id, key, value)
    }

    fn insert_non_full(&mut self, node_id: u64, key: Val, value: u64) -> Result<()> {
        let mut node = self.load_node(node_id)?;
        loop {
            if node.leaf {
                let idx = match node.keys.binary_search(&key) {
                    Ok(_) => return Err(StorageError::DuplicateKey(key.to_string())),
                    Err(idx) => idx,
                };
                node.keys.insert(idx, key);
                node.values.insert(idx, value);
                node.dirty = true;
                return self.save_node(&node);
            }
            let mut idx = Self::child_index(&node.keys, &key);
            let child = self.load_node(node.children[idx])?;
            node = if child.is_full() {
                self.split_child(&mut node, idx)?;
                self.save_node(&node)?;
                // The promoted key starts the right half.
                if key >= node.keys[idx] {
                    idx += 1;
                }
                self.load_node(node.children[idx])?
            } else {
                child
            };
        }
    }

    /// Splits the full child at `parent.children[idx]`. The child keeps the
    /// left half under its own id (so a predecessor leaf's `next` pointer
    /// stays valid) and a fresh node takes the right half.
    fn split_child(&mut self, parent: &mut Node, idx: usize) -> Result<()> {
        let mut node = self.load_node(parent.children[idx])?;
        let mid = self.order / 2;
        let split_key = node.keys[mid].clone();

        let mut right = self.allocate_node(node.leaf)?;
        if node.leaf {
            right.keys = node.keys.split_off(mid);
            right.values = node.values.split_off(mid);
            right.next = node.next;
            node.next = Some(right.node_id);
        } else {
            right.keys = node.keys.split_off(mid + 1);
            right.children = node.children.split_off(mid + 1);
            // The split key moves up to the parent.
            node.keys.pop();
        }
        node.dirty = true;
        self.save_node(&node)?;
        self.save_node(&right)?;

        parent.keys.insert(idx, split_key);
        parent.children.insert(idx + 1, right.node_id);
        parent.dirty = true;
        Ok(())
    }

    /// Lazy ordered scan starting at the first key ≥ `start_key` (or at the
    /// smallest key overall), walking the leaf linked list.
    pub fn scan(&mut self, start_key: Option<&Val>) -> Result<Scan<'_>> {
        let mut node = self.load_node(self.root_id)?;
        while !node.leaf {
            let idx = match start_key {
                Some(key) => Self::child_index(&node.keys, key),
                None => 0,
            };
            node = self.load_node(node.children[idx])?;
        }
        let idx = match start_key {
            Some(key) => node.keys.partition_point(|k| k < key),
            None => 0,
        };
        Ok(Scan {
            tree: self,
            node: Some(node),
            idx,
        })
    }
}

/// Lazy iterator over `(key, value)` pairs in ascending key order.
pub struct Scan<'a> {
    tree: &'a mut BPlusTree,
    node: Option<Node>,
    idx: usize,
}

impl Iterator for Scan<'_> {
    type Item = Result<(Val, u64)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let node = self.node.as_ref()?;
            if self.idx < node.keys.len() {
                let item = (node.keys[self.idx].clone(), node.values[self.idx]);
                self.idx += 1;
                return Some(Ok(item));
            }
            match node.next {
                Some(next_id) => match self.tree.load_node(next_id) {
                    Ok(next) => {
                        self.node = Some(next);
                        self.idx = 0;
                    }
                    Err(e) => {
                        self.node = None;
                        return Some(Err(e));
                    }
                },
                None => {
                    self.node = None;
                    return None;
                }
            }
        }
    }
}

fn meta_path_for(path: &Path) -> PathBuf {
    let mut meta = path.as_os_str().to_os_string();
    meta.push(".meta");
    PathBuf::from(meta)
}
