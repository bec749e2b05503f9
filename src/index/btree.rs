use std::cmp::Ordering;
use std::path::PathBuf;

use anyhow::Result;
use tracing::debug;

use super::arena::{IndexHeader, NodeArena, MIN_BLOCK_SIZE};
use super::posting::{PostingRemoval, Postings};
use super::{check_header_codec, Index, KeyCodec};
use crate::catalog::schema::IndexKind;
use crate::common::{NodeOffset, RecordOffset, NULL_NODE};
use crate::error::StorageError;
use crate::storage::utils::{Deserializer, Serializer};
use crate::tuple::value::Value;

const LEAF_TAG: u8 = 1;
const INTERNAL_TAG: u8 = 2;
// tag, key count, next leaf
const NODE_HEADER: usize = 1 + 2 + 8;
const MAX_ORDER: u32 = 1024;
const MAX_HEIGHT: usize = 64;

struct LeafEntry {
    key: Value,
    postings: Postings,
}

enum Node {
    Leaf {
        entries: Vec<LeafEntry>,
        next: NodeOffset,
    },
    Internal {
        keys: Vec<Value>,
        children: Vec<NodeOffset>,
    },
}

impl Node {
    fn key_count(&self) -> usize {
        match self {
            Node::Leaf { entries, .. } => entries.len(),
            Node::Internal { keys, .. } => keys.len(),
        }
    }

    fn first_leaf_key(&self) -> Option<Value> {
        match self {
            Node::Leaf { entries, .. } => entries.first().map(|entry| entry.key.clone()),
            Node::Internal { .. } => None,
        }
    }
}

#[derive(Copy, Clone)]
enum Target {
    Key,
    Offset(RecordOffset),
}

/// Outcome of a delete inside one subtree.
struct Removal {
    removed: Vec<RecordOffset>,
    /// an entry left its leaf, so nodes on the path may underflow
    entry_removed: bool,
    /// the least key of the subtree, if it changed
    new_min: Option<Value>,
    key_count: usize,
}

impl Removal {
    fn untouched(key_count: usize) -> Self {
        Self {
            removed: Vec::new(),
            entry_removed: false,
            new_min: None,
            key_count,
        }
    }
}

/// Number of separators lower or equal to the key, i.e. the child to descend into.
fn child_index(keys: &[Value], key: &Value) -> usize {
    keys.partition_point(|separator| separator.total_cmp(key) != Ordering::Greater)
}

fn block_size(codec: &KeyCodec, order: usize) -> usize {
    let leaf = NODE_HEADER + (order - 1) * (codec.width + Postings::SIZE);
    let internal = NODE_HEADER + (order - 1) * codec.width + order * 8;
    leaf.max(internal).max(MIN_BLOCK_SIZE)
}

/// A B+Tree of order `m`: nodes hold at most `m - 1` keys, leaves are linked
/// left to right, and every separator equals the least key of its right
/// subtree.
pub struct BPlusTreeIndex {
    arena: NodeArena,
    codec: KeyCodec,
    order: usize,
}

impl BPlusTreeIndex {
    pub(crate) fn create(
        path: impl Into<PathBuf>,
        codec: KeyCodec,
        unique: bool,
        order: u32,
    ) -> Result<Self> {
        if !(3..=MAX_ORDER).contains(&order) {
            return Err(StorageError::schema(format!(
                "B+Tree order must be between 3 and {MAX_ORDER}, got {order}"
            )));
        }
        let header = IndexHeader::new(
            IndexKind::BTree,
            codec.type_id,
            codec.width as u16,
            unique,
            block_size(&codec, order as usize),
            order,
        );
        let mut index = Self {
            arena: NodeArena::create(path, header)?,
            codec,
            order: order as usize,
        };
        let root = index.allocate_node(&Node::Leaf {
            entries: Vec::new(),
            next: NULL_NODE,
        })?;
        index.arena.header_mut().root = root;
        index.arena.flush_header()?;
        Ok(index)
    }

    pub(crate) fn open(path: impl Into<PathBuf>, codec: KeyCodec) -> Result<Self> {
        let arena = NodeArena::open(path, IndexKind::BTree)?;
        check_header_codec(arena.header(), &codec)?;
        let order = arena.header().capacity;
        if !(3..=MAX_ORDER).contains(&order)
            || arena.block_size() != block_size(&codec, order as usize)
            || arena.header().root == NULL_NODE
        {
            return Err(StorageError::corruption(format!(
                "B+Tree header is inconsistent: order {}, block size {}",
                order,
                arena.block_size()
            )));
        }
        Ok(Self {
            arena,
            codec,
            order: order as usize,
        })
    }

    pub fn order(&self) -> usize {
        self.order
    }

    fn min_keys(&self) -> usize {
        (self.order + 1) / 2 - 1
    }

    fn encode_node(&self, node: &Node) -> Vec<u8> {
        let mut block = self.arena.empty_block();
        let mut serializer = Serializer::new(&mut block);
        match node {
            Node::Leaf { entries, next } => {
                serializer.serialize_u8(LEAF_TAG);
                serializer.serialize_u16(entries.len() as u16);
                serializer.serialize_u64(*next);
                for entry in entries {
                    self.codec.encode(&entry.key, &mut serializer);
                    entry.postings.serialize(&mut serializer);
                }
            }
            Node::Internal { keys, children } => {
                serializer.serialize_u8(INTERNAL_TAG);
                serializer.serialize_u16(keys.len() as u16);
                serializer.serialize_u64(NULL_NODE);
                for key in keys {
                    self.codec.encode(key, &mut serializer);
                }
                for child in children {
                    serializer.serialize_u64(*child);
                }
            }
        }
        block
    }

    fn read_node(&self, offset: NodeOffset) -> Result<Node> {
        let block = self.arena.read(offset)?;
        let mut deserializer = Deserializer::new(&block);
        let tag = deserializer.deserialize_u8();
        let count = deserializer.deserialize_u16() as usize;
        let next = deserializer.deserialize_u64();
        if count >= self.order {
            return Err(StorageError::corruption(format!(
                "B+Tree node at {offset} holds {count} keys, order is {}",
                self.order
            )));
        }
        match tag {
            LEAF_TAG => {
                let entries = (0..count)
                    .map(|_| LeafEntry {
                        key: self.codec.decode(&mut deserializer),
                        postings: Postings::parse(&mut deserializer),
                    })
                    .collect();
                Ok(Node::Leaf { entries, next })
            }
            INTERNAL_TAG => {
                let keys = (0..count)
                    .map(|_| self.codec.decode(&mut deserializer))
                    .collect();
                let children = (0..=count)
                    .map(|_| deserializer.deserialize_u64())
                    .collect();
                Ok(Node::Internal { keys, children })
            }
            tag => Err(StorageError::corruption(format!(
                "expected a B+Tree node at {offset}, found tag {tag}"
            ))),
        }
    }

    fn write_node(&mut self, offset: NodeOffset, node: &Node) -> Result<()> {
        let block = self.encode_node(node);
        self.arena.write(offset, &block)
    }

    fn allocate_node(&mut self, node: &Node) -> Result<NodeOffset> {
        let block = self.encode_node(node);
        self.arena.allocate(&block)
    }

    fn read_leaf(&self, offset: NodeOffset) -> Result<(Vec<LeafEntry>, NodeOffset)> {
        match self.read_node(offset)? {
            Node::Leaf { entries, next } => Ok((entries, next)),
            Node::Internal { .. } => Err(StorageError::corruption(format!(
                "leaf chain points at internal node {offset}"
            ))),
        }
    }

    /// Descends to the leaf that may contain the key.
    fn find_leaf(&self, key: &Value) -> Result<(Vec<LeafEntry>, NodeOffset)> {
        let mut current = self.arena.header().root;
        for _ in 0..MAX_HEIGHT {
            match self.read_node(current)? {
                Node::Internal { keys, children } => current = children[child_index(&keys, key)],
                Node::Leaf { entries, next } => return Ok((entries, next)),
            }
        }
        Err(StorageError::corruption("B+Tree is deeper than any valid tree"))
    }

    fn leftmost_leaf(&self) -> Result<NodeOffset> {
        let mut current = self.arena.header().root;
        for _ in 0..MAX_HEIGHT {
            match self.read_node(current)? {
                Node::Internal { children, .. } => current = children[0],
                Node::Leaf { .. } => return Ok(current),
            }
        }
        Err(StorageError::corruption("B+Tree is deeper than any valid tree"))
    }

    /// Number of levels, 1 for a tree that is a single leaf.
    pub fn height(&self) -> Result<usize> {
        let mut current = self.arena.header().root;
        let mut height = 1;
        while let Node::Internal { children, .. } = self.read_node(current)? {
            current = children[0];
            height += 1;
            if height > MAX_HEIGHT {
                return Err(StorageError::corruption("B+Tree is deeper than any valid tree"));
            }
        }
        Ok(height)
    }

    /// Keys in leaf chain order.
    pub fn leaf_keys(&self) -> Result<Vec<Value>> {
        let mut keys = Vec::new();
        let mut current = self.leftmost_leaf()?;
        let mut visited = 0;
        while current != NULL_NODE {
            let (entries, next) = self.read_leaf(current)?;
            keys.extend(entries.into_iter().map(|entry| entry.key));
            current = next;
            visited += 1;
            if visited > self.arena.block_count() {
                return Err(StorageError::corruption("B+Tree leaf chain loops"));
            }
        }
        Ok(keys)
    }

    fn insert_entry(&mut self, key: &Value, offset: RecordOffset) -> Result<()> {
        let root = self.arena.header().root;
        if let Some((separator, right)) = self.insert_into(root, key, offset, 0)? {
            let new_root = self.allocate_node(&Node::Internal {
                keys: vec![separator],
                children: vec![root, right],
            })?;
            self.arena.header_mut().root = new_root;
            debug!(root = new_root, "B+Tree root split");
        }
        self.arena.header_mut().entries += 1;
        self.arena.flush_header()
    }

    /// Inserts below `node_offset`. Returns the separator and the new right
    /// sibling when the node had to split.
    fn insert_into(
        &mut self,
        node_offset: NodeOffset,
        key: &Value,
        offset: RecordOffset,
        depth: usize,
    ) -> Result<Option<(Value, NodeOffset)>> {
        if depth >= MAX_HEIGHT {
            return Err(StorageError::corruption("B+Tree is deeper than any valid tree"));
        }
        match self.read_node(node_offset)? {
            Node::Leaf { mut entries, next } => {
                match entries.binary_search_by(|entry| entry.key.total_cmp(key)) {
                    Ok(pos) => {
                        if self.arena.header().unique {
                            return Err(StorageError::duplicate_key(format!(
                                "key {key} is already indexed"
                            )));
                        }
                        if entries[pos].postings.contains(&self.arena, offset)? {
                            return Err(StorageError::duplicate_key(format!(
                                "record {offset} is already indexed under {key}"
                            )));
                        }
                        entries[pos].postings.push(&mut self.arena, offset)?;
                        self.write_node(node_offset, &Node::Leaf { entries, next })?;
                        Ok(None)
                    }
                    Err(pos) => {
                        entries.insert(
                            pos,
                            LeafEntry {
                                key: key.clone(),
                                postings: Postings::single(offset),
                            },
                        );
                        if entries.len() < self.order {
                            self.write_node(node_offset, &Node::Leaf { entries, next })?;
                            return Ok(None);
                        }
                        let right_entries = entries.split_off(entries.len() / 2);
                        let separator = right_entries[0].key.clone();
                        let right = self.allocate_node(&Node::Leaf {
                            entries: right_entries,
                            next,
                        })?;
                        self.write_node(
                            node_offset,
                            &Node::Leaf {
                                entries,
                                next: right,
                            },
                        )?;
                        debug!(left = node_offset, right, "B+Tree leaf split");
                        Ok(Some((separator, right)))
                    }
                }
            }
            Node::Internal {
                mut keys,
                mut children,
            } => {
                let i = child_index(&keys, key);
                let (separator, new_child) =
                    match self.insert_into(children[i], key, offset, depth + 1)? {
                        Some(split) => split,
                        None => return Ok(None),
                    };
                keys.insert(i, separator);
                children.insert(i + 1, new_child);
                if keys.len() < self.order {
                    self.write_node(node_offset, &Node::Internal { keys, children })?;
                    return Ok(None);
                }

                let mid = keys.len() / 2;
                let right_keys = keys.split_off(mid + 1);
                let promoted = keys.remove(mid);
                let right_children = children.split_off(mid + 1);
                let right = self.allocate_node(&Node::Internal {
                    keys: right_keys,
                    children: right_children,
                })?;
                self.write_node(node_offset, &Node::Internal { keys, children })?;
                debug!(left = node_offset, right, "B+Tree internal node split");
                Ok(Some((promoted, right)))
            }
        }
    }

    fn remove_entry(&mut self, key: &Value, target: Target) -> Result<Vec<RecordOffset>> {
        let root = self.arena.header().root;
        let removal = self.remove_from(root, key, target, 0)?;
        if removal.entry_removed && removal.key_count == 0 {
            if let Node::Internal { children, .. } = self.read_node(root)? {
                self.arena.header_mut().root = children[0];
                self.arena.free(root)?;
                debug!(root = children[0], "B+Tree root collapsed");
            }
        }
        let header = self.arena.header_mut();
        header.entries = header.entries.saturating_sub(removal.removed.len() as u64);
        self.arena.flush_header()?;
        Ok(removal.removed)
    }

    fn remove_from(
        &mut self,
        node_offset: NodeOffset,
        key: &Value,
        target: Target,
        depth: usize,
    ) -> Result<Removal> {
        if depth >= MAX_HEIGHT {
            return Err(StorageError::corruption("B+Tree is deeper than any valid tree"));
        }
        match self.read_node(node_offset)? {
            Node::Leaf { mut entries, next } => {
                let pos = match entries.binary_search_by(|entry| entry.key.total_cmp(key)) {
                    Ok(pos) => pos,
                    Err(_) => return Ok(Removal::untouched(entries.len())),
                };
                let removed = match target {
                    Target::Key => {
                        let offsets = entries[pos].postings.collect(&self.arena)?;
                        entries[pos].postings.release(&mut self.arena)?;
                        offsets
                    }
                    Target::Offset(offset) => {
                        match entries[pos].postings.remove(&mut self.arena, offset)? {
                            PostingRemoval::NotPresent => {
                                return Ok(Removal::untouched(entries.len()))
                            }
                            PostingRemoval::Removed => {
                                let key_count = entries.len();
                                self.write_node(node_offset, &Node::Leaf { entries, next })?;
                                return Ok(Removal {
                                    removed: vec![offset],
                                    ..Removal::untouched(key_count)
                                });
                            }
                            PostingRemoval::Emptied => vec![offset],
                        }
                    }
                };
                entries.remove(pos);
                let new_min = if pos == 0 {
                    entries.first().map(|entry| entry.key.clone())
                } else {
                    None
                };
                let key_count = entries.len();
                self.write_node(node_offset, &Node::Leaf { entries, next })?;
                Ok(Removal {
                    removed,
                    entry_removed: true,
                    new_min,
                    key_count,
                })
            }
            Node::Internal {
                mut keys,
                mut children,
            } => {
                let i = child_index(&keys, key);
                let child = self.remove_from(children[i], key, target, depth + 1)?;
                if !child.entry_removed {
                    return Ok(Removal {
                        key_count: keys.len(),
                        ..child
                    });
                }

                let mut new_min = None;
                if let Some(min) = &child.new_min {
                    if i > 0 {
                        keys[i - 1] = min.clone();
                    } else {
                        new_min = Some(min.clone());
                    }
                }
                if child.key_count < self.min_keys() {
                    let first_key = self.rebalance(&mut keys, &mut children, i)?;
                    // an emptied leftmost leaf gets its least key from the sibling
                    if i == 0 && child.key_count == 0 && first_key.is_some() {
                        new_min = first_key;
                    }
                }
                let key_count = keys.len();
                self.write_node(node_offset, &Node::Internal { keys, children })?;
                Ok(Removal {
                    removed: child.removed,
                    entry_removed: true,
                    new_min,
                    key_count,
                })
            }
        }
    }

    /// Fixes an underflowing child by borrowing from a sibling under the same
    /// parent, left first, or by merging with one. Returns the least key of the
    /// leftmost child when it is a leaf and `i` is 0.
    fn rebalance(
        &mut self,
        keys: &mut Vec<Value>,
        children: &mut Vec<NodeOffset>,
        i: usize,
    ) -> Result<Option<Value>> {
        let min = self.min_keys();
        let child_offset = children[i];
        let mut child = self.read_node(child_offset)?;

        if i > 0 {
            let left_offset = children[i - 1];
            let mut left = self.read_node(left_offset)?;
            if left.key_count() > min {
                match (&mut left, &mut child) {
                    (
                        Node::Leaf {
                            entries: left_entries,
                            ..
                        },
                        Node::Leaf { entries, .. },
                    ) => {
                        let moved = left_entries
                            .pop()
                            .ok_or_else(|| StorageError::corruption("empty B+Tree leaf"))?;
                        keys[i - 1] = moved.key.clone();
                        entries.insert(0, moved);
                    }
                    (
                        Node::Internal {
                            keys: left_keys,
                            children: left_children,
                        },
                        Node::Internal {
                            keys: child_keys,
                            children: child_children,
                        },
                    ) => {
                        let moved_child = left_children
                            .pop()
                            .ok_or_else(|| StorageError::corruption("childless B+Tree node"))?;
                        let moved_key = left_keys
                            .pop()
                            .ok_or_else(|| StorageError::corruption("empty B+Tree node"))?;
                        child_keys.insert(0, keys[i - 1].clone());
                        child_children.insert(0, moved_child);
                        keys[i - 1] = moved_key;
                    }
                    _ => return Err(StorageError::corruption("B+Tree siblings on different levels")),
                }
                self.write_node(left_offset, &left)?;
                self.write_node(child_offset, &child)?;
                debug!(from = left_offset, to = child_offset, "B+Tree borrowed from left");
                return Ok(None);
            }
        }

        if i + 1 < children.len() {
            let right_offset = children[i + 1];
            let mut right = self.read_node(right_offset)?;
            if right.key_count() > min {
                match (&mut child, &mut right) {
                    (
                        Node::Leaf { entries, .. },
                        Node::Leaf {
                            entries: right_entries,
                            ..
                        },
                    ) => {
                        entries.push(right_entries.remove(0));
                        keys[i] = right_entries
                            .first()
                            .map(|entry| entry.key.clone())
                            .ok_or_else(|| StorageError::corruption("empty B+Tree leaf"))?;
                        if i > 0 {
                            keys[i - 1] = entries[0].key.clone();
                        }
                    }
                    (
                        Node::Internal {
                            keys: child_keys,
                            children: child_children,
                        },
                        Node::Internal {
                            keys: right_keys,
                            children: right_children,
                        },
                    ) => {
                        child_keys.push(keys[i].clone());
                        child_children.push(right_children.remove(0));
                        keys[i] = right_keys.remove(0);
                    }
                    _ => return Err(StorageError::corruption("B+Tree siblings on different levels")),
                }
                self.write_node(right_offset, &right)?;
                self.write_node(child_offset, &child)?;
                debug!(from = right_offset, to = child_offset, "B+Tree borrowed from right");
                return Ok(child.first_leaf_key());
            }
        }

        // neither sibling can spare a key
        let left_index = if i > 0 { i - 1 } else { i };
        if left_index + 1 >= children.len() {
            return Err(StorageError::corruption("B+Tree node without siblings"));
        }
        let left_offset = children[left_index];
        let right_offset = children[left_index + 1];
        let (mut left, right) = if i > 0 {
            (self.read_node(left_offset)?, child)
        } else {
            (child, self.read_node(right_offset)?)
        };
        let separator = keys.remove(left_index);
        children.remove(left_index + 1);
        match (&mut left, right) {
            (
                Node::Leaf { entries, next },
                Node::Leaf {
                    entries: right_entries,
                    next: right_next,
                },
            ) => {
                entries.extend(right_entries);
                *next = right_next;
            }
            (
                Node::Internal {
                    keys: left_keys,
                    children: left_children,
                },
                Node::Internal {
                    keys: right_keys,
                    children: right_children,
                },
            ) => {
                left_keys.push(separator);
                left_keys.extend(right_keys);
                left_children.extend(right_children);
            }
            _ => return Err(StorageError::corruption("B+Tree siblings on different levels")),
        }
        if left.key_count() >= self.order {
            return Err(StorageError::capacity(format!(
                "merged B+Tree node holds {} keys",
                left.key_count()
            )));
        }
        self.write_node(left_offset, &left)?;
        self.arena.free(right_offset)?;
        debug!(into = left_offset, freed = right_offset, "B+Tree nodes merged");
        Ok(if i == 0 { left.first_leaf_key() } else { None })
    }

    /// Validates the subtree and returns its least key.
    #[allow(clippy::too_many_arguments)]
    fn check_node(
        &self,
        offset: NodeOffset,
        low: Option<&Value>,
        high: Option<&Value>,
        depth: usize,
        leaf_depth: &mut Option<usize>,
        leaves: &mut Vec<(NodeOffset, NodeOffset)>,
        entries_seen: &mut u64,
    ) -> Result<Option<Value>> {
        if depth >= MAX_HEIGHT {
            return Err(StorageError::corruption("B+Tree is deeper than any valid tree"));
        }
        let node = self.read_node(offset)?;
        let is_root = depth == 0;
        if !is_root && node.key_count() < self.min_keys() {
            return Err(StorageError::corruption(format!(
                "B+Tree node at {offset} underflows with {} keys",
                node.key_count()
            )));
        }
        let in_bounds = |key: &Value| {
            low.map_or(true, |low| key.total_cmp(low) != Ordering::Less)
                && high.map_or(true, |high| key.total_cmp(high) == Ordering::Less)
        };

        match node {
            Node::Leaf { entries, next } => {
                if *leaf_depth.get_or_insert(depth) != depth {
                    return Err(StorageError::corruption("B+Tree leaves at different depths"));
                }
                for pair in entries.windows(2) {
                    if pair[0].key.total_cmp(&pair[1].key) != Ordering::Less {
                        return Err(StorageError::corruption(format!(
                            "B+Tree leaf at {offset} is not sorted"
                        )));
                    }
                }
                for entry in &entries {
                    if !in_bounds(&entry.key) {
                        return Err(StorageError::corruption(format!(
                            "key {} of leaf {offset} is outside its separators",
                            entry.key
                        )));
                    }
                    *entries_seen += entry.postings.collect(&self.arena)?.len() as u64;
                }
                leaves.push((offset, next));
                Ok(entries.first().map(|entry| entry.key.clone()))
            }
            Node::Internal { keys, children } => {
                if keys.is_empty() || children.len() != keys.len() + 1 {
                    return Err(StorageError::corruption(format!(
                        "B+Tree node at {offset} has {} keys and {} children",
                        keys.len(),
                        children.len()
                    )));
                }
                for pair in keys.windows(2) {
                    if pair[0].total_cmp(&pair[1]) != Ordering::Less {
                        return Err(StorageError::corruption(format!(
                            "B+Tree node at {offset} is not sorted"
                        )));
                    }
                }
                if !keys.iter().all(in_bounds) {
                    return Err(StorageError::corruption(format!(
                        "separators of {offset} are outside the parent's range"
                    )));
                }
                let mut least = None;
                for (j, child) in children.iter().enumerate() {
                    let child_low = if j == 0 { low } else { Some(&keys[j - 1]) };
                    let child_high = keys.get(j).or(if j == keys.len() { high } else { None });
                    let child_min = self.check_node(
                        *child,
                        child_low,
                        child_high,
                        depth + 1,
                        leaf_depth,
                        leaves,
                        entries_seen,
                    )?;
                    if j == 0 {
                        least = child_min;
                    } else if child_min.as_ref() != Some(&keys[j - 1]) {
                        return Err(StorageError::corruption(format!(
                            "separator {} of {offset} is not the least key of its right subtree",
                            keys[j - 1]
                        )));
                    }
                }
                Ok(least)
            }
        }
    }
}

impl Index for BPlusTreeIndex {
    fn kind(&self) -> IndexKind {
        IndexKind::BTree
    }

    fn is_unique(&self) -> bool {
        self.arena.header().unique
    }

    fn len(&self) -> u64 {
        self.arena.header().entries
    }

    fn insert(&mut self, key: &Value, offset: RecordOffset) -> Result<()> {
        let key = self.codec.prepare(key)?;
        let result = self.insert_entry(&key, offset);
        self.arena.guard(result)
    }

    fn remove(&mut self, key: &Value, offset: RecordOffset) -> Result<bool> {
        let key = self.codec.prepare(key)?;
        let result = self.remove_entry(&key, Target::Offset(offset));
        Ok(!self.arena.guard(result)?.is_empty())
    }

    fn delete(&mut self, key: &Value) -> Result<Vec<RecordOffset>> {
        let key = self.codec.prepare(key)?;
        let result = self.remove_entry(&key, Target::Key);
        self.arena.guard(result)
    }

    fn search(&self, key: &Value) -> Result<Vec<RecordOffset>> {
        let key = self.codec.prepare(key)?;
        let (entries, _) = self.find_leaf(&key)?;
        match entries.binary_search_by(|entry| entry.key.total_cmp(&key)) {
            Ok(pos) => entries[pos].postings.collect(&self.arena),
            Err(_) => Ok(Vec::new()),
        }
    }

    fn range_search(&self, low: &Value, high: &Value) -> Result<Vec<RecordOffset>> {
        let low = self.codec.prepare(low)?;
        let high = self.codec.prepare(high)?;
        let mut offsets = Vec::new();
        if low.total_cmp(&high) == Ordering::Greater {
            return Ok(offsets);
        }

        let (mut entries, mut next) = self.find_leaf(&low)?;
        let mut visited = 0;
        loop {
            for entry in &entries {
                if entry.key.total_cmp(&low) == Ordering::Less {
                    continue;
                }
                if entry.key.total_cmp(&high) == Ordering::Greater {
                    return Ok(offsets);
                }
                offsets.extend(entry.postings.collect(&self.arena)?);
            }
            if next == NULL_NODE {
                return Ok(offsets);
            }
            visited += 1;
            if visited > self.arena.block_count() {
                return Err(StorageError::corruption("B+Tree leaf chain loops"));
            }
            (entries, next) = self.read_leaf(next)?;
        }
    }

    fn check_invariants(&self) -> Result<()> {
        let mut leaf_depth = None;
        let mut leaves = Vec::new();
        let mut entries_seen = 0;
        self.check_node(
            self.arena.header().root,
            None,
            None,
            0,
            &mut leaf_depth,
            &mut leaves,
            &mut entries_seen,
        )?;

        for pair in leaves.windows(2) {
            if pair[0].1 != pair[1].0 {
                return Err(StorageError::corruption(format!(
                    "B+Tree leaf {} links to {} instead of {}",
                    pair[0].0, pair[0].1, pair[1].0
                )));
            }
        }
        if let Some((last, next)) = leaves.last() {
            if *next != NULL_NODE {
                return Err(StorageError::corruption(format!(
                    "last B+Tree leaf {last} links to {next}"
                )));
            }
        }
        if entries_seen != self.arena.header().entries {
            return Err(StorageError::corruption(format!(
                "B+Tree holds {} entries, header says {}",
                entries_seen,
                self.arena.header().entries
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::Path;

    use anyhow::Result;
    use rand::Rng;
    use tempfile::tempdir;

    use super::BPlusTreeIndex;
    use crate::catalog::schema::TypeId;
    use crate::error::StorageError;
    use crate::index::{Index, KeyCodec};
    use crate::tuple::value::Value;

    fn int_tree(dir: &Path, unique: bool, order: u32) -> Result<BPlusTreeIndex> {
        BPlusTreeIndex::create(
            dir.join("t.id.btree.idx"),
            KeyCodec::new(TypeId::Integer, 4),
            unique,
            order,
        )
    }

    fn int(i: i32) -> Value {
        Value::Integer(i)
    }

    #[test]
    fn range_after_delete() -> Result<()> {
        let data_dir = tempdir()?;
        let mut tree = int_tree(data_dir.path(), true, 4)?;
        for key in 1..=10 {
            tree.insert(&int(key), key as u64 * 100)?;
        }
        tree.check_invariants()?;
        assert_eq!(tree.height()?, 3);

        assert_eq!(
            tree.range_search(&int(3), &int(7))?,
            vec![300, 400, 500, 600, 700]
        );
        assert_eq!(tree.delete(&int(5))?, vec![500]);
        tree.check_invariants()?;
        assert_eq!(tree.range_search(&int(3), &int(7))?, vec![300, 400, 600, 700]);
        assert!(tree.search(&int(5))?.is_empty());
        assert!(tree.delete(&int(5))?.is_empty());
        assert_eq!(tree.len(), 9);
        Ok(())
    }

    #[test]
    fn unique_tree_rejects_duplicates_without_damage() -> Result<()> {
        let data_dir = tempdir()?;
        let path = data_dir.path().join("t.id.btree.idx");
        let mut tree = int_tree(data_dir.path(), true, 3)?;
        for key in 0..20 {
            tree.insert(&int(key), key as u64)?;
        }
        let err = tree.insert(&int(7), 99).unwrap_err();
        assert!(matches!(
            StorageError::kind_of(&err),
            Some(StorageError::DuplicateKey(_))
        ));
        drop(tree);

        let tree = BPlusTreeIndex::open(&path, KeyCodec::new(TypeId::Integer, 4))?;
        tree.check_invariants()?;
        assert_eq!(tree.search(&int(7))?, vec![7]);
        Ok(())
    }

    #[test]
    fn duplicates_share_one_entry() -> Result<()> {
        let data_dir = tempdir()?;
        let mut tree = int_tree(data_dir.path(), false, 4)?;
        for offset in 0..50 {
            tree.insert(&int((offset % 3) as i32), offset)?;
        }
        tree.check_invariants()?;
        assert_eq!(tree.leaf_keys()?, vec![int(0), int(1), int(2)]);
        let ones = tree.search(&int(1))?;
        assert_eq!(ones, (0..50).filter(|o| o % 3 == 1).collect::<Vec<_>>());

        assert!(tree.remove(&int(1), 4)?);
        assert!(!tree.remove(&int(1), 4)?);
        assert_eq!(tree.search(&int(1))?.len(), ones.len() - 1);
        assert_eq!(tree.delete(&int(2))?.len(), 16);
        tree.check_invariants()?;
        Ok(())
    }

    #[test]
    fn text_keys_keep_order() -> Result<()> {
        let data_dir = tempdir()?;
        let mut tree = BPlusTreeIndex::create(
            data_dir.path().join("t.name.btree.idx"),
            KeyCodec::new(TypeId::Text, 8),
            false,
            5,
        )?;
        let words = ["pear", "apple", "fig", "banana", "kiwi", "cherry", "date", "lime"];
        for (offset, word) in words.iter().enumerate() {
            tree.insert(&Value::Text(word.to_string()), offset as u64)?;
        }
        let found = tree.range_search(
            &Value::Text("b".to_owned()),
            &Value::Text("f".to_owned()),
        )?;
        // banana, cherry, date
        assert_eq!(found, vec![3, 5, 6]);
        tree.check_invariants()?;
        Ok(())
    }

    #[test]
    fn random_operations_keep_invariants() -> Result<()> {
        let mut rng = rand::thread_rng();
        for order in [3, 4, 5, 8] {
            let data_dir = tempdir()?;
            let mut tree = int_tree(data_dir.path(), false, order)?;
            let mut model: BTreeMap<i32, Vec<u64>> = BTreeMap::new();

            for step in 0..600u64 {
                let key = rng.gen_range(0..80);
                match rng.gen_range(0..10) {
                    0..=5 => {
                        tree.insert(&int(key), step)?;
                        model.entry(key).or_default().push(step);
                    }
                    6..=7 => {
                        let mut removed = tree.delete(&int(key))?;
                        removed.sort();
                        assert_eq!(removed, model.remove(&key).unwrap_or_default());
                    }
                    _ => {
                        if let Some(offsets) = model.get_mut(&key) {
                            let offset = offsets.remove(rng.gen_range(0..offsets.len()));
                            assert!(tree.remove(&int(key), offset)?);
                            if offsets.is_empty() {
                                model.remove(&key);
                            }
                        }
                    }
                }
                if step % 50 == 0 {
                    tree.check_invariants()?;
                }
            }
            tree.check_invariants()?;

            let expected: Vec<u64> = model
                .range(10..=60)
                .flat_map(|(_, offsets)| {
                    let mut offsets = offsets.clone();
                    offsets.sort();
                    offsets
                })
                .collect();
            assert_eq!(tree.range_search(&int(10), &int(60))?, expected);
            assert_eq!(
                tree.leaf_keys()?,
                model.keys().map(|k| int(*k)).collect::<Vec<_>>()
            );
        }
        Ok(())
    }

    #[test]
    fn deleting_everything_collapses_to_a_leaf() -> Result<()> {
        let data_dir = tempdir()?;
        let mut tree = int_tree(data_dir.path(), true, 4)?;
        for key in 0..200 {
            tree.insert(&int(key), key as u64)?;
        }
        assert!(tree.height()? > 2);
        for key in (0..200).rev() {
            assert_eq!(tree.delete(&int(key))?, vec![key as u64]);
        }
        tree.check_invariants()?;
        assert_eq!(tree.height()?, 1);
        assert!(tree.is_empty());
        Ok(())
    }

    #[test]
    fn rejects_tiny_order() {
        let data_dir = tempdir().unwrap();
        let err = int_tree(data_dir.path(), false, 2).err().unwrap();
        assert!(matches!(
            StorageError::kind_of(&err),
            Some(StorageError::Schema(_))
        ));
    }
}
