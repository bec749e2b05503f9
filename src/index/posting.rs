use anyhow::Result;

use super::arena::NodeArena;
use crate::common::{NodeOffset, RecordOffset, NULL_NODE};
use crate::error::StorageError;
use crate::storage::utils::{Deserializer, Serializer};

const POSTING_TAG: u8 = 7;
// tag, next block, number of offsets
const POSTING_BLOCK_HEADER: usize = 1 + 8 + 2;

/// The record offsets stored under one key. The first offset lives inline in
/// the owning node entry; further offsets spill into a chain of posting blocks.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct Postings {
    pub first: RecordOffset,
    pub overflow: NodeOffset,
}

/// What happened when one offset was taken out of a posting list.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum PostingRemoval {
    NotPresent,
    Removed,
    /// the offset was the last one, the owning entry has to go
    Emptied,
}

struct PostingBlock {
    next: NodeOffset,
    offsets: Vec<RecordOffset>,
}

impl Postings {
    pub const SIZE: usize = 16;

    pub fn single(offset: RecordOffset) -> Self {
        Self {
            first: offset,
            overflow: NULL_NODE,
        }
    }

    pub fn serialize(&self, serializer: &mut Serializer) {
        serializer.serialize_u64(self.first);
        serializer.serialize_u64(self.overflow);
    }

    pub fn parse(deserializer: &mut Deserializer) -> Self {
        Self {
            first: deserializer.deserialize_u64(),
            overflow: deserializer.deserialize_u64(),
        }
    }

    /// All offsets, ascending.
    pub fn collect(&self, arena: &NodeArena) -> Result<Vec<RecordOffset>> {
        let mut offsets = vec![self.first];
        let mut current = self.overflow;
        while current != NULL_NODE {
            let block = read_block(arena, current)?;
            offsets.extend_from_slice(&block.offsets);
            current = block.next;
            if offsets.len() as u64 > arena.block_count() * block_capacity(arena) as u64 + 1 {
                return Err(StorageError::corruption("posting chain loops"));
            }
        }
        offsets.sort_unstable();
        Ok(offsets)
    }

    pub fn contains(&self, arena: &NodeArena, offset: RecordOffset) -> Result<bool> {
        Ok(self.collect(arena)?.contains(&offset))
    }

    /// Adds an offset. New blocks are linked in at the head of the chain.
    pub fn push(&mut self, arena: &mut NodeArena, offset: RecordOffset) -> Result<()> {
        if self.overflow != NULL_NODE {
            let mut head = read_block(arena, self.overflow)?;
            if head.offsets.len() < block_capacity(arena) {
                head.offsets.push(offset);
                return write_block(arena, self.overflow, &head);
            }
        }
        let block = PostingBlock {
            next: self.overflow,
            offsets: vec![offset],
        };
        self.overflow = arena.allocate(&encode_block(arena, &block))?;
        Ok(())
    }

    pub fn remove(&mut self, arena: &mut NodeArena, offset: RecordOffset) -> Result<PostingRemoval> {
        if self.first == offset {
            if self.overflow == NULL_NODE {
                return Ok(PostingRemoval::Emptied);
            }
            // refill the inline slot from the head block
            let head_offset = self.overflow;
            let mut head = read_block(arena, head_offset)?;
            self.first = head
                .offsets
                .pop()
                .ok_or_else(|| StorageError::corruption("empty posting block in chain"))?;
            if head.offsets.is_empty() {
                self.overflow = head.next;
                arena.free(head_offset)?;
            } else {
                write_block(arena, head_offset, &head)?;
            }
            return Ok(PostingRemoval::Removed);
        }

        let mut previous: Option<(NodeOffset, PostingBlock)> = None;
        let mut current = self.overflow;
        while current != NULL_NODE {
            let mut block = read_block(arena, current)?;
            if let Some(pos) = block.offsets.iter().position(|o| *o == offset) {
                block.offsets.swap_remove(pos);
                if !block.offsets.is_empty() {
                    write_block(arena, current, &block)?;
                } else {
                    match previous {
                        None => self.overflow = block.next,
                        Some((previous_offset, mut previous_block)) => {
                            previous_block.next = block.next;
                            write_block(arena, previous_offset, &previous_block)?;
                        }
                    }
                    arena.free(current)?;
                }
                return Ok(PostingRemoval::Removed);
            }
            let next = block.next;
            previous = Some((current, block));
            current = next;
        }
        Ok(PostingRemoval::NotPresent)
    }

    /// Frees the whole overflow chain.
    pub fn release(&self, arena: &mut NodeArena) -> Result<()> {
        let mut current = self.overflow;
        while current != NULL_NODE {
            let next = read_block(arena, current)?.next;
            arena.free(current)?;
            current = next;
        }
        Ok(())
    }
}

fn block_capacity(arena: &NodeArena) -> usize {
    (arena.block_size() - POSTING_BLOCK_HEADER) / 8
}

fn read_block(arena: &NodeArena, offset: NodeOffset) -> Result<PostingBlock> {
    let bytes = arena.read(offset)?;
    let mut deserializer = Deserializer::new(&bytes);
    let tag = deserializer.deserialize_u8();
    if tag != POSTING_TAG {
        return Err(StorageError::corruption(format!(
            "expected a posting block at {offset}, found tag {tag}"
        )));
    }
    let next = deserializer.deserialize_u64();
    let len = deserializer.deserialize_u16() as usize;
    if len > block_capacity(arena) {
        return Err(StorageError::corruption(format!(
            "posting block at {offset} claims {len} offsets"
        )));
    }
    let offsets = (0..len).map(|_| deserializer.deserialize_u64()).collect();
    Ok(PostingBlock { next, offsets })
}

fn encode_block(arena: &NodeArena, block: &PostingBlock) -> Vec<u8> {
    let mut bytes = arena.empty_block();
    let mut serializer = Serializer::new(&mut bytes);
    serializer.serialize_u8(POSTING_TAG);
    serializer.serialize_u64(block.next);
    serializer.serialize_u16(block.offsets.len() as u16);
    for offset in &block.offsets {
        serializer.serialize_u64(*offset);
    }
    bytes
}

fn write_block(arena: &mut NodeArena, offset: NodeOffset, block: &PostingBlock) -> Result<()> {
    let bytes = encode_block(arena, block);
    arena.write(offset, &bytes)
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use rand::seq::SliceRandom;
    use tempfile::tempdir;

    use super::{PostingRemoval, Postings};
    use crate::catalog::schema::{IndexKind, TypeId};
    use crate::common::NULL_NODE;
    use crate::index::arena::{IndexHeader, NodeArena};

    fn arena(dir: &std::path::Path) -> Result<NodeArena> {
        // room for two offsets per block, so chains get long quickly
        let header = IndexHeader::new(IndexKind::Hash, TypeId::Integer, 4, false, 32, 0);
        NodeArena::create(dir.join("postings.idx"), header)
    }

    #[test]
    fn spills_into_chained_blocks() -> Result<()> {
        let data_dir = tempdir()?;
        let mut arena = arena(data_dir.path())?;
        let mut postings = Postings::single(100);
        for offset in 101..110 {
            postings.push(&mut arena, offset)?;
        }
        let mut collected = postings.collect(&arena)?;
        collected.sort();
        assert_eq!(collected, (100..110).collect::<Vec<_>>());
        assert!(postings.contains(&arena, 105)?);
        Ok(())
    }

    #[test]
    fn removing_every_offset_frees_the_chain() -> Result<()> {
        let data_dir = tempdir()?;
        let mut arena = arena(data_dir.path())?;
        let mut postings = Postings::single(0);
        let mut offsets: Vec<u64> = (1..40).collect();
        for offset in &offsets {
            postings.push(&mut arena, *offset)?;
        }
        offsets.push(0);
        offsets.shuffle(&mut rand::thread_rng());

        let last = offsets.pop().unwrap();
        for offset in &offsets {
            assert_eq!(postings.remove(&mut arena, *offset)?, PostingRemoval::Removed);
            assert_eq!(postings.remove(&mut arena, *offset)?, PostingRemoval::NotPresent);
        }
        assert_eq!(postings.overflow, NULL_NODE);
        assert_eq!(postings.first, last);
        assert_eq!(postings.remove(&mut arena, last)?, PostingRemoval::Emptied);

        assert_ne!(arena.header().free_head, NULL_NODE);
        Ok(())
    }
}
