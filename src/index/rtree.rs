use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::path::PathBuf;

use anyhow::Result;
use tracing::debug;

use super::arena::{IndexHeader, NodeArena};
use super::Index;
use crate::catalog::schema::{IndexKind, TypeId};
use crate::common::{NodeOffset, RecordOffset, NULL_NODE};
use crate::error::StorageError;
use crate::storage::utils::{Deserializer, Serializer};
use crate::tuple::point::{Point, Rect};
use crate::tuple::value::Value;

const LEAF_TAG: u8 = 5;
const INTERNAL_TAG: u8 = 6;
// tag, entry count
const NODE_HEADER: usize = 1 + 2;
const LEAF_ENTRY_SIZE: usize = Point::SIZE + 8;
const INTERNAL_ENTRY_SIZE: usize = Rect::SIZE + 8;
const MIN_CAPACITY: u32 = 4;
const MAX_CAPACITY: u32 = 1024;
const MAX_HEIGHT: usize = 64;

/// A leaf entry covers a single point and points at a record, an internal
/// entry covers a child node.
#[derive(Copy, Clone, Debug)]
struct Entry {
    rect: Rect,
    pointer: u64,
}

struct RNode {
    leaf: bool,
    entries: Vec<Entry>,
}

#[derive(Copy, Clone)]
enum Target {
    Point,
    Offset(RecordOffset),
}

/// Result of a delete inside one subtree.
struct Shrink {
    removed: Vec<RecordOffset>,
    /// cover of what is left, None once the node is empty
    cover: Option<Rect>,
}

/// Orders search candidates by distance, then by pointer so ties are stable.
#[derive(Copy, Clone, Debug)]
struct Candidate {
    distance: f64,
    pointer: u64,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then_with(|| self.pointer.cmp(&other.pointer))
    }
}

fn cover(entries: &[Entry]) -> Option<Rect> {
    let (first, rest) = entries.split_first()?;
    Some(rest.iter().fold(first.rect, |acc, entry| acc.union(&entry.rect)))
}

fn same_point(a: &Point, b: &Point) -> bool {
    a.total_cmp(b) == Ordering::Equal
}

fn block_size(capacity: usize) -> usize {
    NODE_HEADER + capacity * INTERNAL_ENTRY_SIZE.max(LEAF_ENTRY_SIZE)
}

/// Splits an overflowing node in two groups of at least `min_fill` entries.
/// The seeds are the two entries whose centers lie farthest apart; every other
/// entry goes where it causes the least enlargement, the one with the
/// strongest preference first.
fn quadratic_split(mut entries: Vec<Entry>, min_fill: usize) -> (Vec<Entry>, Vec<Entry>) {
    let mut seeds = (0, 1);
    let mut widest = f64::NEG_INFINITY;
    for i in 0..entries.len() {
        for j in i + 1..entries.len() {
            let distance = entries[i].rect.center().distance_to(&entries[j].rect.center());
            if distance > widest {
                widest = distance;
                seeds = (i, j);
            }
        }
    }
    // remove the later index first so the earlier stays valid
    let second = entries.swap_remove(seeds.1);
    let first = entries.swap_remove(seeds.0);
    let mut left = vec![first];
    let mut right = vec![second];
    let mut left_cover = first.rect;
    let mut right_cover = second.rect;

    while !entries.is_empty() {
        if left.len() + entries.len() <= min_fill {
            left.append(&mut entries);
            break;
        }
        if right.len() + entries.len() <= min_fill {
            right.append(&mut entries);
            break;
        }

        let mut next = 0;
        let mut strongest = f64::NEG_INFINITY;
        for (i, entry) in entries.iter().enumerate() {
            let preference = (left_cover.enlargement(&entry.rect)
                - right_cover.enlargement(&entry.rect))
            .abs();
            if preference > strongest {
                strongest = preference;
                next = i;
            }
        }
        let entry = entries.swap_remove(next);
        let grow_left = left_cover.enlargement(&entry.rect);
        let grow_right = right_cover.enlargement(&entry.rect);
        let to_left = match grow_left.total_cmp(&grow_right) {
            Ordering::Less => true,
            Ordering::Greater => false,
            Ordering::Equal => match left_cover.area().total_cmp(&right_cover.area()) {
                Ordering::Less => true,
                Ordering::Greater => false,
                Ordering::Equal => left.len() <= right.len(),
            },
        };
        if to_left {
            left_cover = left_cover.union(&entry.rect);
            left.push(entry);
        } else {
            right_cover = right_cover.union(&entry.rect);
            right.push(entry);
        }
    }
    (left, right)
}

/// An R-tree over the points of a POINT column.
pub struct SpatialIndex {
    arena: NodeArena,
    capacity: usize,
}

impl SpatialIndex {
    pub(crate) fn create(path: impl Into<PathBuf>, unique: bool, capacity: u32) -> Result<Self> {
        if !(MIN_CAPACITY..=MAX_CAPACITY).contains(&capacity) {
            return Err(StorageError::schema(format!(
                "R-tree node capacity must be between {MIN_CAPACITY} and {MAX_CAPACITY}, got {capacity}"
            )));
        }
        let header = IndexHeader::new(
            IndexKind::RTree,
            TypeId::Point,
            Point::SIZE as u16,
            unique,
            block_size(capacity as usize),
            capacity,
        );
        let mut index = Self {
            arena: NodeArena::create(path, header)?,
            capacity: capacity as usize,
        };
        let root = index.allocate_node(&RNode {
            leaf: true,
            entries: Vec::new(),
        })?;
        index.arena.header_mut().root = root;
        index.arena.flush_header()?;
        Ok(index)
    }

    pub(crate) fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let arena = NodeArena::open(path, IndexKind::RTree)?;
        let header = arena.header();
        let capacity = header.capacity;
        if header.key_type != TypeId::Point
            || !(MIN_CAPACITY..=MAX_CAPACITY).contains(&capacity)
            || arena.block_size() != block_size(capacity as usize)
            || header.root == NULL_NODE
        {
            return Err(StorageError::corruption(format!(
                "R-tree header is inconsistent: capacity {}, block size {}",
                capacity,
                arena.block_size()
            )));
        }
        Ok(Self {
            arena,
            capacity: capacity as usize,
        })
    }

    fn min_fill(&self) -> usize {
        (self.capacity * 2 / 5).max(2)
    }

    fn read_node(&self, offset: NodeOffset) -> Result<RNode> {
        let block = self.arena.read(offset)?;
        let mut deserializer = Deserializer::new(&block);
        let tag = deserializer.deserialize_u8();
        let count = deserializer.deserialize_u16() as usize;
        if count > self.capacity {
            return Err(StorageError::corruption(format!(
                "R-tree node at {offset} holds {count} entries, capacity is {}",
                self.capacity
            )));
        }
        let leaf = match tag {
            LEAF_TAG => true,
            INTERNAL_TAG => false,
            tag => {
                return Err(StorageError::corruption(format!(
                    "expected an R-tree node at {offset}, found tag {tag}"
                )))
            }
        };
        let entries = (0..count)
            .map(|_| {
                let rect = if leaf {
                    Rect::from_point(deserializer.deserialize_point())
                } else {
                    deserializer.deserialize_rect()
                };
                Entry {
                    rect,
                    pointer: deserializer.deserialize_u64(),
                }
            })
            .collect();
        Ok(RNode { leaf, entries })
    }

    fn encode_node(&self, node: &RNode) -> Vec<u8> {
        let mut block = self.arena.empty_block();
        let mut serializer = Serializer::new(&mut block);
        serializer.serialize_u8(if node.leaf { LEAF_TAG } else { INTERNAL_TAG });
        serializer.serialize_u16(node.entries.len() as u16);
        for entry in &node.entries {
            if node.leaf {
                serializer.serialize_point(&entry.rect.min);
            } else {
                serializer.serialize_rect(&entry.rect);
            }
            serializer.serialize_u64(entry.pointer);
        }
        block
    }

    fn write_node(&mut self, offset: NodeOffset, node: &RNode) -> Result<()> {
        let block = self.encode_node(node);
        self.arena.write(offset, &block)
    }

    fn allocate_node(&mut self, node: &RNode) -> Result<NodeOffset> {
        let block = self.encode_node(node);
        self.arena.allocate(&block)
    }

    fn point_of(key: &Value) -> Result<Point> {
        key.check_key(TypeId::Point)?;
        key.as_point()
            .ok_or_else(|| StorageError::schema("R-tree keys must be points"))
    }

    /// Number of levels, 1 for a tree that is a single leaf.
    pub fn height(&self) -> Result<usize> {
        let mut current = self.arena.header().root;
        let mut height = 1;
        loop {
            let node = self.read_node(current)?;
            if node.leaf {
                return Ok(height);
            }
            current = node
                .entries
                .first()
                .map(|entry| entry.pointer)
                .ok_or_else(|| StorageError::corruption("empty internal R-tree node"))?;
            height += 1;
            if height > MAX_HEIGHT {
                return Err(StorageError::corruption("R-tree is deeper than any valid tree"));
            }
        }
    }

    /// Picks the child needing the least enlargement to cover `rect`. Ties go
    /// to the smaller area, then to the child with fewer entries.
    fn choose_subtree(&self, entries: &[Entry], rect: &Rect) -> Result<usize> {
        let score = |entry: &Entry| (entry.rect.enlargement(rect), entry.rect.area());
        let mut best: Vec<usize> = Vec::new();
        let mut best_score = (f64::INFINITY, f64::INFINITY);
        for (i, entry) in entries.iter().enumerate() {
            let (enlargement, area) = score(entry);
            let ordering = enlargement
                .total_cmp(&best_score.0)
                .then_with(|| area.total_cmp(&best_score.1));
            match ordering {
                Ordering::Less => {
                    best_score = (enlargement, area);
                    best = vec![i];
                }
                Ordering::Equal => best.push(i),
                Ordering::Greater => {}
            }
        }
        if best.len() <= 1 {
            return best
                .first()
                .copied()
                .ok_or_else(|| StorageError::corruption("empty internal R-tree node"));
        }
        let mut chosen = best[0];
        let mut fewest = usize::MAX;
        for i in best {
            let children = self.read_node(entries[i].pointer)?.entries.len();
            if children < fewest {
                fewest = children;
                chosen = i;
            }
        }
        Ok(chosen)
    }

    /// Inserts below `offset`. Returns the node's new cover and the entry of the
    /// sibling created when the node split.
    fn insert_into(
        &mut self,
        offset: NodeOffset,
        entry: Entry,
        depth: usize,
    ) -> Result<(Rect, Option<Entry>)> {
        if depth >= MAX_HEIGHT {
            return Err(StorageError::corruption("R-tree is deeper than any valid tree"));
        }
        let mut node = self.read_node(offset)?;
        if node.leaf {
            node.entries.push(entry);
        } else {
            let i = self.choose_subtree(&node.entries, &entry.rect)?;
            let child = node.entries[i].pointer;
            let (child_cover, sibling) = self.insert_into(child, entry, depth + 1)?;
            node.entries[i].rect = child_cover;
            if let Some(sibling) = sibling {
                node.entries.push(sibling);
            }
        }

        if node.entries.len() <= self.capacity {
            let node_cover = cover(&node.entries).unwrap_or(entry.rect);
            self.write_node(offset, &node)?;
            return Ok((node_cover, None));
        }

        let (left, right) = quadratic_split(node.entries, self.min_fill());
        let left_cover = cover(&left).unwrap_or(entry.rect);
        let right_cover = cover(&right).unwrap_or(entry.rect);
        let leaf = node.leaf;
        self.write_node(offset, &RNode { leaf, entries: left })?;
        let sibling = self.allocate_node(&RNode {
            leaf,
            entries: right,
        })?;
        debug!(node = offset, sibling, leaf, "R-tree node split");
        Ok((
            left_cover,
            Some(Entry {
                rect: right_cover,
                pointer: sibling,
            }),
        ))
    }

    fn insert_entry(&mut self, point: Point, record: RecordOffset) -> Result<()> {
        if self.arena.header().unique && !self.search_point(&point)?.is_empty() {
            return Err(StorageError::duplicate_key(format!(
                "point {point} is already indexed"
            )));
        }
        let root = self.arena.header().root;
        let entry = Entry {
            rect: Rect::from_point(point),
            pointer: record,
        };
        let (root_cover, sibling) = self.insert_into(root, entry, 0)?;
        if let Some(sibling) = sibling {
            let new_root = self.allocate_node(&RNode {
                leaf: false,
                entries: vec![
                    Entry {
                        rect: root_cover,
                        pointer: root,
                    },
                    sibling,
                ],
            })?;
            self.arena.header_mut().root = new_root;
            debug!(root = new_root, "R-tree root split");
        }
        self.arena.header_mut().entries += 1;
        self.arena.flush_header()
    }

    fn remove_from(
        &mut self,
        offset: NodeOffset,
        point: &Point,
        target: Target,
        depth: usize,
    ) -> Result<Shrink> {
        if depth >= MAX_HEIGHT {
            return Err(StorageError::corruption("R-tree is deeper than any valid tree"));
        }
        let mut node = self.read_node(offset)?;
        let mut removed = Vec::new();

        if node.leaf {
            let mut i = 0;
            while i < node.entries.len() {
                let entry = node.entries[i];
                let matches = same_point(&entry.rect.min, point)
                    && match target {
                        Target::Point => true,
                        Target::Offset(record) => entry.pointer == record,
                    };
                if matches {
                    removed.push(entry.pointer);
                    node.entries.swap_remove(i);
                    if matches!(target, Target::Offset(_)) {
                        break;
                    }
                } else {
                    i += 1;
                }
            }
        } else {
            let mut i = 0;
            while i < node.entries.len() {
                let entry = node.entries[i];
                if !entry.rect.contains_point(point) {
                    i += 1;
                    continue;
                }
                let shrink = self.remove_from(entry.pointer, point, target, depth + 1)?;
                if shrink.removed.is_empty() {
                    i += 1;
                    continue;
                }
                removed.extend(shrink.removed);
                match shrink.cover {
                    Some(child_cover) => {
                        node.entries[i].rect = child_cover;
                        i += 1;
                    }
                    None => {
                        node.entries.swap_remove(i);
                        self.arena.free(entry.pointer)?;
                        debug!(node = entry.pointer, "emptied R-tree node freed");
                    }
                }
                if matches!(target, Target::Offset(_)) {
                    break;
                }
            }
        }

        if !removed.is_empty() {
            self.write_node(offset, &node)?;
        }
        Ok(Shrink {
            removed,
            cover: cover(&node.entries),
        })
    }

    fn remove_entry(&mut self, point: &Point, target: Target) -> Result<Vec<RecordOffset>> {
        let root = self.arena.header().root;
        let shrink = self.remove_from(root, point, target, 0)?;
        if shrink.removed.is_empty() {
            return Ok(shrink.removed);
        }

        let mut root = self.arena.header().root;
        loop {
            let node = self.read_node(root)?;
            if node.leaf {
                break;
            }
            match node.entries.len() {
                0 => {
                    self.write_node(
                        root,
                        &RNode {
                            leaf: true,
                            entries: Vec::new(),
                        },
                    )?;
                    break;
                }
                1 => {
                    let child = node.entries[0].pointer;
                    self.arena.free(root)?;
                    debug!(root = child, "R-tree root collapsed");
                    root = child;
                }
                _ => break,
            }
        }
        let header = self.arena.header_mut();
        header.root = root;
        header.entries = header.entries.saturating_sub(shrink.removed.len() as u64);
        self.arena.flush_header()?;
        Ok(shrink.removed)
    }

    /// Visits every leaf entry accepted by `leaf_filter` in the subtrees
    /// accepted by `node_filter`.
    fn walk(
        &self,
        offset: NodeOffset,
        depth: usize,
        node_filter: &dyn Fn(&Rect) -> bool,
        leaf_filter: &dyn Fn(&Point) -> bool,
        out: &mut Vec<RecordOffset>,
    ) -> Result<()> {
        if depth >= MAX_HEIGHT {
            return Err(StorageError::corruption("R-tree is deeper than any valid tree"));
        }
        let node = self.read_node(offset)?;
        for entry in &node.entries {
            if node.leaf {
                if leaf_filter(&entry.rect.min) {
                    out.push(entry.pointer);
                }
            } else if node_filter(&entry.rect) {
                self.walk(entry.pointer, depth + 1, node_filter, leaf_filter, out)?;
            }
        }
        Ok(())
    }

    fn collect(
        &self,
        node_filter: &dyn Fn(&Rect) -> bool,
        leaf_filter: &dyn Fn(&Point) -> bool,
    ) -> Result<Vec<RecordOffset>> {
        let mut offsets = Vec::new();
        self.walk(
            self.arena.header().root,
            0,
            node_filter,
            leaf_filter,
            &mut offsets,
        )?;
        offsets.sort_unstable();
        Ok(offsets)
    }

    fn search_point(&self, point: &Point) -> Result<Vec<RecordOffset>> {
        self.collect(&|rect| rect.contains_point(point), &|candidate| {
            same_point(candidate, point)
        })
    }

    /// Records whose point lies inside the closed rectangle.
    pub fn rect_search(&self, rect: &Rect) -> Result<Vec<RecordOffset>> {
        self.collect(&|node| node.intersects(rect), &|point| {
            rect.contains_point(point)
        })
    }

    /// Checks that every internal rectangle covers its subtree and that all
    /// leaves sit at the same depth. Returns the subtree's cover.
    fn check_node(
        &self,
        offset: NodeOffset,
        depth: usize,
        leaf_depth: &mut Option<usize>,
        entries_seen: &mut u64,
    ) -> Result<Option<Rect>> {
        if depth >= MAX_HEIGHT {
            return Err(StorageError::corruption("R-tree is deeper than any valid tree"));
        }
        let node = self.read_node(offset)?;
        if node.leaf {
            if *leaf_depth.get_or_insert(depth) != depth {
                return Err(StorageError::corruption("R-tree leaves at different depths"));
            }
            *entries_seen += node.entries.len() as u64;
            return Ok(cover(&node.entries));
        }
        if node.entries.is_empty() {
            return Err(StorageError::corruption(format!(
                "internal R-tree node at {offset} is empty"
            )));
        }
        for entry in &node.entries {
            let child_cover = self.check_node(entry.pointer, depth + 1, leaf_depth, entries_seen)?;
            match child_cover {
                Some(child_cover) if entry.rect.contains_rect(&child_cover) => {}
                Some(_) => {
                    return Err(StorageError::corruption(format!(
                        "R-tree rectangle in {offset} does not cover child {}",
                        entry.pointer
                    )))
                }
                None => {
                    return Err(StorageError::corruption(format!(
                        "R-tree child {} of {offset} is empty",
                        entry.pointer
                    )))
                }
            }
        }
        Ok(cover(&node.entries))
    }
}

impl Index for SpatialIndex {
    fn kind(&self) -> IndexKind {
        IndexKind::RTree
    }

    fn is_unique(&self) -> bool {
        self.arena.header().unique
    }

    fn len(&self) -> u64 {
        self.arena.header().entries
    }

    fn insert(&mut self, key: &Value, offset: RecordOffset) -> Result<()> {
        let point = Self::point_of(key)?;
        let result = self.insert_entry(point, offset);
        self.arena.guard(result)
    }

    fn remove(&mut self, key: &Value, offset: RecordOffset) -> Result<bool> {
        let point = Self::point_of(key)?;
        let result = self.remove_entry(&point, Target::Offset(offset));
        Ok(!self.arena.guard(result)?.is_empty())
    }

    fn delete(&mut self, key: &Value) -> Result<Vec<RecordOffset>> {
        let point = Self::point_of(key)?;
        let result = self.remove_entry(&point, Target::Point);
        let mut removed = self.arena.guard(result)?;
        removed.sort_unstable();
        Ok(removed)
    }

    fn search(&self, key: &Value) -> Result<Vec<RecordOffset>> {
        let point = Self::point_of(key)?;
        self.search_point(&point)
    }

    /// `low` and `high` are opposite corners of the query rectangle.
    fn range_search(&self, low: &Value, high: &Value) -> Result<Vec<RecordOffset>> {
        let rect = Rect::from_corners(Self::point_of(low)?, Self::point_of(high)?);
        self.rect_search(&rect)
    }

    fn radius_search(&self, center: &Point, radius: f64) -> Result<Vec<RecordOffset>> {
        if radius.is_nan() || radius < 0.0 {
            return Err(StorageError::schema(format!(
                "radius must be a non-negative number, got {radius}"
            )));
        }
        self.collect(&|rect| rect.min_distance(center) <= radius, &|point| {
            point.is_in_circle(center, radius)
        })
    }

    fn knn_search(&self, center: &Point, k: usize) -> Result<Vec<RecordOffset>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let mut nearest: BinaryHeap<Candidate> = BinaryHeap::with_capacity(k + 1);
        let mut queue = BinaryHeap::new();
        queue.push(Reverse((
            Candidate {
                distance: 0.0,
                pointer: self.arena.header().root,
            },
            0usize,
        )));

        while let Some(Reverse((node, depth))) = queue.pop() {
            if let Some(worst) = nearest.peek() {
                if nearest.len() == k && node.distance > worst.distance {
                    break;
                }
            }
            if depth >= MAX_HEIGHT {
                return Err(StorageError::corruption("R-tree is deeper than any valid tree"));
            }
            let current = self.read_node(node.pointer)?;
            for entry in &current.entries {
                if current.leaf {
                    let candidate = Candidate {
                        distance: entry.rect.min.distance_to(center),
                        pointer: entry.pointer,
                    };
                    if nearest.len() < k {
                        nearest.push(candidate);
                    } else if nearest.peek().map_or(false, |worst| candidate < *worst) {
                        nearest.pop();
                        nearest.push(candidate);
                    }
                } else {
                    let distance = entry.rect.min_distance(center);
                    let worth_visiting = nearest.len() < k
                        || nearest.peek().map_or(true, |worst| distance <= worst.distance);
                    if worth_visiting {
                        queue.push(Reverse((
                            Candidate {
                                distance,
                                pointer: entry.pointer,
                            },
                            depth + 1,
                        )));
                    }
                }
            }
        }

        Ok(nearest
            .into_sorted_vec()
            .into_iter()
            .map(|candidate| candidate.pointer)
            .collect())
    }

    fn check_invariants(&self) -> Result<()> {
        let mut leaf_depth = None;
        let mut entries_seen = 0;
        self.check_node(
            self.arena.header().root,
            0,
            &mut leaf_depth,
            &mut entries_seen,
        )?;
        if entries_seen != self.arena.header().entries {
            return Err(StorageError::corruption(format!(
                "R-tree holds {} entries, header says {}",
                entries_seen,
                self.arena.header().entries
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use anyhow::Result;
    use rand::Rng;
    use tempfile::tempdir;

    use super::SpatialIndex;
    use crate::index::Index;
    use crate::tuple::point::{Point, Rect};
    use crate::tuple::value::Value;

    fn rtree(dir: &Path, capacity: u32) -> Result<SpatialIndex> {
        SpatialIndex::create(dir.join("t.location.rtree.idx"), false, capacity)
    }

    fn point(x: f64, y: f64) -> Value {
        Value::Point(Point::new(x, y))
    }

    #[test]
    fn radius_and_nearest() -> Result<()> {
        let data_dir = tempdir()?;
        let mut index = rtree(data_dir.path(), 4)?;
        index.insert(&point(0.0, 0.0), 0)?;
        index.insert(&point(1.0, 1.0), 1)?;
        index.insert(&point(10.0, 10.0), 2)?;

        assert_eq!(index.radius_search(&Point::origin(), 2.0)?, vec![0, 1]);
        assert_eq!(index.knn_search(&Point::origin(), 1)?, vec![0]);
        assert_eq!(index.knn_search(&Point::new(9.0, 9.0), 5)?, vec![2, 1, 0]);
        assert!(index.knn_search(&Point::origin(), 0)?.is_empty());
        Ok(())
    }

    #[test]
    fn rectangle_and_exact_search() -> Result<()> {
        let data_dir = tempdir()?;
        let mut index = rtree(data_dir.path(), 4)?;
        for i in 0..30u64 {
            index.insert(&point(i as f64, (i % 5) as f64), i)?;
        }
        index.insert(&point(3.0, 3.0), 100)?;
        index.check_invariants()?;
        assert!(index.height()? > 1);

        assert_eq!(index.search(&point(3.0, 3.0))?, vec![3, 100]);
        let found = index.range_search(&point(12.0, 4.0), &point(10.0, 1.0))?;
        assert_eq!(found, vec![11, 12]);
        let found = index.rect_search(&Rect::new(Point::new(-1.0, -1.0), Point::new(4.0, 0.5)))?;
        assert_eq!(found, vec![0]);
        Ok(())
    }

    #[test]
    fn deletes_shrink_the_tree() -> Result<()> {
        let data_dir = tempdir()?;
        let mut index = rtree(data_dir.path(), 4)?;
        for i in 0..64u64 {
            index.insert(&point((i % 8) as f64, (i / 8) as f64), i)?;
        }
        assert!(index.height()? >= 3);
        for i in 0..63u64 {
            assert!(index.remove(&point((i % 8) as f64, (i / 8) as f64), i)?);
            if i % 8 == 0 {
                index.check_invariants()?;
            }
        }
        index.check_invariants()?;
        assert_eq!(index.height()?, 1);
        assert_eq!(index.len(), 1);
        assert_eq!(index.knn_search(&Point::origin(), 3)?, vec![63]);
        assert!(!index.remove(&point(0.0, 0.0), 0)?);
        Ok(())
    }

    #[test]
    fn random_points_match_brute_force() -> Result<()> {
        let data_dir = tempdir()?;
        let mut index = rtree(data_dir.path(), 6)?;
        let mut rng = rand::thread_rng();
        let mut points: Vec<(Point, u64)> = Vec::new();

        for offset in 0..400u64 {
            let p = Point::new(rng.gen_range(-100.0..100.0), rng.gen_range(-100.0..100.0));
            index.insert(&Value::Point(p), offset)?;
            points.push((p, offset));
        }
        for _ in 0..100 {
            let (p, offset) = points.swap_remove(rng.gen_range(0..points.len()));
            assert!(index.remove(&Value::Point(p), offset)?);
        }
        index.check_invariants()?;

        for _ in 0..20 {
            let center = Point::new(rng.gen_range(-100.0..100.0), rng.gen_range(-100.0..100.0));
            let radius = rng.gen_range(0.0..40.0);
            let mut expected: Vec<u64> = points
                .iter()
                .filter(|(p, _)| p.distance_to(&center) <= radius)
                .map(|(_, offset)| *offset)
                .collect();
            expected.sort();
            assert_eq!(index.radius_search(&center, radius)?, expected);

            let mut by_distance = points.clone();
            by_distance.sort_by(|(a, oa), (b, ob)| {
                a.distance_to(&center)
                    .total_cmp(&b.distance_to(&center))
                    .then(oa.cmp(ob))
            });
            let expected: Vec<u64> = by_distance.iter().take(7).map(|(_, o)| *o).collect();
            assert_eq!(index.knn_search(&center, 7)?, expected);
        }
        Ok(())
    }

    #[test]
    fn unique_rtree_rejects_same_point() -> Result<()> {
        let data_dir = tempdir()?;
        let mut index = SpatialIndex::create(data_dir.path().join("u.idx"), true, 4)?;
        index.insert(&point(1.0, 2.0), 0)?;
        assert!(index.insert(&point(1.0, 2.0), 1).is_err());
        assert_eq!(index.len(), 1);
        assert!(index.insert(&Value::Integer(3), 2).is_err());
        Ok(())
    }
}
