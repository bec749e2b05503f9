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

const AVL_TAG: u8 = 3;
// tag, height, left, right
const NODE_HEADER: usize = 1 + 2 + 8 + 8;
const MAX_HEIGHT: usize = 96;

struct AvlNode {
    height: u16,
    left: NodeOffset,
    right: NodeOffset,
    key: Value,
    postings: Postings,
}

#[derive(Copy, Clone)]
enum Target {
    Key,
    Offset(RecordOffset),
}

fn block_size(codec: &KeyCodec) -> usize {
    (NODE_HEADER + codec.width + Postings::SIZE).max(MIN_BLOCK_SIZE)
}

fn too_deep() -> anyhow::Error {
    StorageError::corruption("AVL tree is deeper than any balanced tree")
}

/// A height balanced binary search tree with one node per distinct key.
pub struct AvlIndex {
    arena: NodeArena,
    codec: KeyCodec,
}

impl AvlIndex {
    pub(crate) fn create(path: impl Into<PathBuf>, codec: KeyCodec, unique: bool) -> Result<Self> {
        let header = IndexHeader::new(
            IndexKind::Avl,
            codec.type_id,
            codec.width as u16,
            unique,
            block_size(&codec),
            0,
        );
        Ok(Self {
            arena: NodeArena::create(path, header)?,
            codec,
        })
    }

    pub(crate) fn open(path: impl Into<PathBuf>, codec: KeyCodec) -> Result<Self> {
        let arena = NodeArena::open(path, IndexKind::Avl)?;
        check_header_codec(arena.header(), &codec)?;
        if arena.block_size() != block_size(&codec) {
            return Err(StorageError::corruption(format!(
                "AVL node size {} does not match the key width",
                arena.block_size()
            )));
        }
        Ok(Self { arena, codec })
    }

    fn read_node(&self, offset: NodeOffset) -> Result<AvlNode> {
        let block = self.arena.read(offset)?;
        let mut deserializer = Deserializer::new(&block);
        let tag = deserializer.deserialize_u8();
        if tag != AVL_TAG {
            return Err(StorageError::corruption(format!(
                "expected an AVL node at {offset}, found tag {tag}"
            )));
        }
        Ok(AvlNode {
            height: deserializer.deserialize_u16(),
            left: deserializer.deserialize_u64(),
            right: deserializer.deserialize_u64(),
            key: self.codec.decode(&mut deserializer),
            postings: Postings::parse(&mut deserializer),
        })
    }

    fn encode_node(&self, node: &AvlNode) -> Vec<u8> {
        let mut block = self.arena.empty_block();
        let mut serializer = Serializer::new(&mut block);
        serializer.serialize_u8(AVL_TAG);
        serializer.serialize_u16(node.height);
        serializer.serialize_u64(node.left);
        serializer.serialize_u64(node.right);
        self.codec.encode(&node.key, &mut serializer);
        node.postings.serialize(&mut serializer);
        block
    }

    fn write_node(&mut self, offset: NodeOffset, node: &AvlNode) -> Result<()> {
        let block = self.encode_node(node);
        self.arena.write(offset, &block)
    }

    fn height_of(&self, offset: NodeOffset) -> Result<u16> {
        if offset == NULL_NODE {
            Ok(0)
        } else {
            Ok(self.read_node(offset)?.height)
        }
    }

    /// Height of the whole tree, 0 when empty.
    pub fn height(&self) -> Result<u16> {
        self.height_of(self.arena.header().root)
    }

    pub fn root_key(&self) -> Result<Option<Value>> {
        let root = self.arena.header().root;
        if root == NULL_NODE {
            return Ok(None);
        }
        Ok(Some(self.read_node(root)?.key))
    }

    fn rotate_right(&mut self, offset: NodeOffset, mut node: AvlNode) -> Result<NodeOffset> {
        let pivot_offset = node.left;
        let mut pivot = self.read_node(pivot_offset)?;
        node.left = pivot.right;
        node.height = 1 + self.height_of(node.left)?.max(self.height_of(node.right)?);
        self.write_node(offset, &node)?;

        pivot.right = offset;
        pivot.height = 1 + self.height_of(pivot.left)?.max(node.height);
        self.write_node(pivot_offset, &pivot)?;
        debug!(from = offset, to = pivot_offset, "AVL rotated right");
        Ok(pivot_offset)
    }

    fn rotate_left(&mut self, offset: NodeOffset, mut node: AvlNode) -> Result<NodeOffset> {
        let pivot_offset = node.right;
        let mut pivot = self.read_node(pivot_offset)?;
        node.right = pivot.left;
        node.height = 1 + self.height_of(node.left)?.max(self.height_of(node.right)?);
        self.write_node(offset, &node)?;

        pivot.left = offset;
        pivot.height = 1 + node.height.max(self.height_of(pivot.right)?);
        self.write_node(pivot_offset, &pivot)?;
        debug!(from = offset, to = pivot_offset, "AVL rotated left");
        Ok(pivot_offset)
    }

    /// Restores balance at `offset` after one of its subtrees changed height.
    /// Returns the offset of the node now rooting the subtree.
    fn rebalance(&mut self, offset: NodeOffset, mut node: AvlNode) -> Result<NodeOffset> {
        let left_height = self.height_of(node.left)?;
        let right_height = self.height_of(node.right)?;

        if left_height > right_height + 1 {
            let left = self.read_node(node.left)?;
            if self.height_of(left.right)? > self.height_of(left.left)? {
                node.left = self.rotate_left(node.left, left)?;
            }
            return self.rotate_right(offset, node);
        }
        if right_height > left_height + 1 {
            let right = self.read_node(node.right)?;
            if self.height_of(right.left)? > self.height_of(right.right)? {
                node.right = self.rotate_right(node.right, right)?;
            }
            return self.rotate_left(offset, node);
        }

        node.height = 1 + left_height.max(right_height);
        self.write_node(offset, &node)?;
        Ok(offset)
    }

    fn insert_at(
        &mut self,
        offset: NodeOffset,
        key: &Value,
        record: RecordOffset,
        depth: usize,
    ) -> Result<NodeOffset> {
        if depth >= MAX_HEIGHT {
            return Err(too_deep());
        }
        if offset == NULL_NODE {
            let node = AvlNode {
                height: 1,
                left: NULL_NODE,
                right: NULL_NODE,
                key: key.clone(),
                postings: Postings::single(record),
            };
            let block = self.encode_node(&node);
            return self.arena.allocate(&block);
        }

        let mut node = self.read_node(offset)?;
        match key.total_cmp(&node.key) {
            Ordering::Less => node.left = self.insert_at(node.left, key, record, depth + 1)?,
            Ordering::Greater => node.right = self.insert_at(node.right, key, record, depth + 1)?,
            Ordering::Equal => {
                if self.arena.header().unique {
                    return Err(StorageError::duplicate_key(format!(
                        "key {key} is already indexed"
                    )));
                }
                if node.postings.contains(&self.arena, record)? {
                    return Err(StorageError::duplicate_key(format!(
                        "record {record} is already indexed under {key}"
                    )));
                }
                node.postings.push(&mut self.arena, record)?;
                self.write_node(offset, &node)?;
                return Ok(offset);
            }
        }
        self.rebalance(offset, node)
    }

    /// Detaches the least node of the subtree. Returns the new subtree root,
    /// the detached node and its block.
    fn take_min(
        &mut self,
        offset: NodeOffset,
        depth: usize,
    ) -> Result<(NodeOffset, AvlNode, NodeOffset)> {
        if depth >= MAX_HEIGHT {
            return Err(too_deep());
        }
        let mut node = self.read_node(offset)?;
        if node.left == NULL_NODE {
            return Ok((node.right, node, offset));
        }
        let (left, min, min_offset) = self.take_min(node.left, depth + 1)?;
        node.left = left;
        Ok((self.rebalance(offset, node)?, min, min_offset))
    }

    fn remove_at(
        &mut self,
        offset: NodeOffset,
        key: &Value,
        target: Target,
        depth: usize,
    ) -> Result<(NodeOffset, Vec<RecordOffset>)> {
        if depth >= MAX_HEIGHT {
            return Err(too_deep());
        }
        if offset == NULL_NODE {
            return Ok((NULL_NODE, Vec::new()));
        }

        let mut node = self.read_node(offset)?;
        match key.total_cmp(&node.key) {
            Ordering::Less => {
                let (left, removed) = self.remove_at(node.left, key, target, depth + 1)?;
                if removed.is_empty() {
                    return Ok((offset, removed));
                }
                node.left = left;
                Ok((self.rebalance(offset, node)?, removed))
            }
            Ordering::Greater => {
                let (right, removed) = self.remove_at(node.right, key, target, depth + 1)?;
                if removed.is_empty() {
                    return Ok((offset, removed));
                }
                node.right = right;
                Ok((self.rebalance(offset, node)?, removed))
            }
            Ordering::Equal => {
                let removed = match target {
                    Target::Key => {
                        let offsets = node.postings.collect(&self.arena)?;
                        node.postings.release(&mut self.arena)?;
                        offsets
                    }
                    Target::Offset(record) => {
                        match node.postings.remove(&mut self.arena, record)? {
                            PostingRemoval::NotPresent => return Ok((offset, Vec::new())),
                            PostingRemoval::Removed => {
                                self.write_node(offset, &node)?;
                                return Ok((offset, vec![record]));
                            }
                            PostingRemoval::Emptied => vec![record],
                        }
                    }
                };

                if node.left == NULL_NODE || node.right == NULL_NODE {
                    let child = if node.left == NULL_NODE {
                        node.right
                    } else {
                        node.left
                    };
                    self.arena.free(offset)?;
                    return Ok((child, removed));
                }

                // two children: the in-order successor takes this node's place
                let (right, successor, successor_offset) = self.take_min(node.right, depth + 1)?;
                node.right = right;
                node.key = successor.key;
                node.postings = successor.postings;
                self.arena.free(successor_offset)?;
                Ok((self.rebalance(offset, node)?, removed))
            }
        }
    }

    fn insert_entry(&mut self, key: &Value, record: RecordOffset) -> Result<()> {
        let root = self.arena.header().root;
        let root = self.insert_at(root, key, record, 0)?;
        let header = self.arena.header_mut();
        header.root = root;
        header.entries += 1;
        self.arena.flush_header()
    }

    fn remove_entry(&mut self, key: &Value, target: Target) -> Result<Vec<RecordOffset>> {
        let root = self.arena.header().root;
        let (root, removed) = self.remove_at(root, key, target, 0)?;
        let header = self.arena.header_mut();
        header.root = root;
        header.entries = header.entries.saturating_sub(removed.len() as u64);
        self.arena.flush_header()?;
        Ok(removed)
    }

    fn collect_range(
        &self,
        offset: NodeOffset,
        low: &Value,
        high: &Value,
        depth: usize,
        out: &mut Vec<RecordOffset>,
    ) -> Result<()> {
        if offset == NULL_NODE {
            return Ok(());
        }
        if depth >= MAX_HEIGHT {
            return Err(too_deep());
        }
        let node = self.read_node(offset)?;
        let above_low = node.key.total_cmp(low) != Ordering::Less;
        let below_high = node.key.total_cmp(high) != Ordering::Greater;
        if node.key.total_cmp(low) == Ordering::Greater {
            self.collect_range(node.left, low, high, depth + 1, out)?;
        }
        if above_low && below_high {
            out.extend(node.postings.collect(&self.arena)?);
        }
        if node.key.total_cmp(high) == Ordering::Less {
            self.collect_range(node.right, low, high, depth + 1, out)?;
        }
        Ok(())
    }

    /// Checks ordering, stored heights and balance. Returns the subtree height.
    fn check_node(
        &self,
        offset: NodeOffset,
        low: Option<&Value>,
        high: Option<&Value>,
        depth: usize,
        entries_seen: &mut u64,
    ) -> Result<u16> {
        if offset == NULL_NODE {
            return Ok(0);
        }
        if depth >= MAX_HEIGHT {
            return Err(too_deep());
        }
        let node = self.read_node(offset)?;
        let after_low = low.map_or(true, |low| node.key.total_cmp(low) == Ordering::Greater);
        let before_high = high.map_or(true, |high| node.key.total_cmp(high) == Ordering::Less);
        if !after_low || !before_high {
            return Err(StorageError::corruption(format!(
                "AVL key {} at {offset} is out of order",
                node.key
            )));
        }
        let left = self.check_node(node.left, low, Some(&node.key), depth + 1, entries_seen)?;
        let right = self.check_node(node.right, Some(&node.key), high, depth + 1, entries_seen)?;
        if left.abs_diff(right) > 1 {
            return Err(StorageError::corruption(format!(
                "AVL node at {offset} is unbalanced: {left} vs {right}"
            )));
        }
        let height = 1 + left.max(right);
        if node.height != height {
            return Err(StorageError::corruption(format!(
                "AVL node at {offset} stores height {}, actual {height}",
                node.height
            )));
        }
        *entries_seen += node.postings.collect(&self.arena)?.len() as u64;
        Ok(height)
    }
}

impl Index for AvlIndex {
    fn kind(&self) -> IndexKind {
        IndexKind::Avl
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
        let mut current = self.arena.header().root;
        for _ in 0..MAX_HEIGHT {
            if current == NULL_NODE {
                return Ok(Vec::new());
            }
            let node = self.read_node(current)?;
            current = match key.total_cmp(&node.key) {
                Ordering::Less => node.left,
                Ordering::Greater => node.right,
                Ordering::Equal => return node.postings.collect(&self.arena),
            };
        }
        Err(too_deep())
    }

    fn range_search(&self, low: &Value, high: &Value) -> Result<Vec<RecordOffset>> {
        let low = self.codec.prepare(low)?;
        let high = self.codec.prepare(high)?;
        let mut offsets = Vec::new();
        if low.total_cmp(&high) != Ordering::Greater {
            self.collect_range(self.arena.header().root, &low, &high, 0, &mut offsets)?;
        }
        Ok(offsets)
    }

    fn check_invariants(&self) -> Result<()> {
        let mut entries_seen = 0;
        self.check_node(self.arena.header().root, None, None, 0, &mut entries_seen)?;
        if entries_seen != self.arena.header().entries {
            return Err(StorageError::corruption(format!(
                "AVL tree holds {} entries, header says {}",
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

    use super::AvlIndex;
    use crate::catalog::schema::TypeId;
    use crate::index::{Index, KeyCodec};
    use crate::tuple::value::Value;

    fn int_tree(dir: &Path, unique: bool) -> Result<AvlIndex> {
        AvlIndex::create(
            dir.join("t.id.avl.idx"),
            KeyCodec::new(TypeId::Integer, 4),
            unique,
        )
    }

    fn int(i: i32) -> Value {
        Value::Integer(i)
    }

    #[test]
    fn rotates_ascending_inserts() -> Result<()> {
        let data_dir = tempdir()?;
        let mut tree = int_tree(data_dir.path(), true)?;
        for key in 1..=3 {
            tree.insert(&int(key), key as u64)?;
        }
        assert_eq!(tree.root_key()?, Some(int(2)));
        assert_eq!(tree.height()?, 2);
        tree.check_invariants()?;
        Ok(())
    }

    #[test]
    fn double_rotations() -> Result<()> {
        let data_dir = tempdir()?;
        // left-right case
        let mut tree = int_tree(data_dir.path(), true)?;
        for key in [3, 1, 2] {
            tree.insert(&int(key), key as u64)?;
        }
        assert_eq!(tree.root_key()?, Some(int(2)));
        tree.check_invariants()?;

        // right-left case
        let mut tree = AvlIndex::create(
            data_dir.path().join("rl.idx"),
            KeyCodec::new(TypeId::Integer, 4),
            true,
        )?;
        for key in [1, 3, 2] {
            tree.insert(&int(key), key as u64)?;
        }
        assert_eq!(tree.root_key()?, Some(int(2)));
        assert_eq!(tree.height()?, 2);
        Ok(())
    }

    #[test]
    fn delete_with_two_children_uses_successor() -> Result<()> {
        let data_dir = tempdir()?;
        let mut tree = int_tree(data_dir.path(), true)?;
        for key in [50, 30, 70, 20, 40, 60, 80] {
            tree.insert(&int(key), key as u64)?;
        }
        assert_eq!(tree.delete(&int(50))?, vec![50]);
        assert_eq!(tree.root_key()?, Some(int(60)));
        tree.check_invariants()?;
        assert_eq!(
            tree.range_search(&int(0), &int(100))?,
            vec![20, 30, 40, 60, 70, 80]
        );
        Ok(())
    }

    #[test]
    fn freed_nodes_are_reused() -> Result<()> {
        let data_dir = tempdir()?;
        let mut tree = int_tree(data_dir.path(), false)?;
        for key in 0..32 {
            tree.insert(&int(key), key as u64)?;
        }
        let blocks = tree.arena.block_count();
        for key in 0..16 {
            tree.delete(&int(key))?;
        }
        for key in 100..116 {
            tree.insert(&int(key), key as u64)?;
        }
        assert_eq!(tree.arena.block_count(), blocks);
        tree.check_invariants()?;
        Ok(())
    }

    #[test]
    fn random_operations_keep_balance() -> Result<()> {
        let data_dir = tempdir()?;
        let mut tree = int_tree(data_dir.path(), false)?;
        let mut model: BTreeMap<i32, Vec<u64>> = BTreeMap::new();
        let mut rng = rand::thread_rng();

        for step in 0..800u64 {
            let key = rng.gen_range(-50..50);
            match rng.gen_range(0..10) {
                0..=5 => {
                    tree.insert(&int(key), step)?;
                    model.entry(key).or_default().push(step);
                }
                6..=7 => {
                    assert_eq!(tree.delete(&int(key))?, model.remove(&key).unwrap_or_default());
                }
                _ => {
                    if let Some(offsets) = model.get_mut(&key) {
                        let offset = offsets.swap_remove(rng.gen_range(0..offsets.len()));
                        offsets.sort();
                        assert!(tree.remove(&int(key), offset)?);
                        if offsets.is_empty() {
                            model.remove(&key);
                        }
                    }
                }
            }
            if step % 100 == 0 {
                tree.check_invariants()?;
            }
        }
        tree.check_invariants()?;

        for (key, offsets) in &model {
            assert_eq!(&tree.search(&int(*key))?, offsets);
        }
        let expected: Vec<u64> = model
            .range(-10..=10)
            .flat_map(|(_, offsets)| offsets.clone())
            .collect();
        assert_eq!(tree.range_search(&int(-10), &int(10))?, expected);
        Ok(())
    }
}
