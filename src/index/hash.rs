use std::path::PathBuf;

use anyhow::Result;
use tracing::debug;

use super::arena::{IndexHeader, NodeArena, MIN_BLOCK_SIZE};
use super::posting::{PostingRemoval, Postings};
use super::{check_header_codec, Index, KeyCodec};
use crate::catalog::schema::IndexKind;
use crate::common::{NodeOffset, RecordOffset, NULL_NODE};
use crate::error::StorageError;
use crate::storage::file_manager::DataFile;
use crate::storage::utils::{Deserializer, Serializer};
use crate::tuple::value::Value;

const BUCKET_TAG: u8 = 4;
// tag, local depth, entry count, overflow bucket
const BUCKET_HEADER: usize = 1 + 1 + 2 + 8;
const MAX_BUCKET_CAPACITY: u32 = 4096;
/// Buckets at this depth chain overflow buckets instead of splitting.
pub const MAX_DEPTH: u8 = 24;

const DIRECTORY_MAGIC: u32 = 0x4844_4952;
const DIRECTORY_VERSION: u8 = 1;
const DIRECTORY_HEADER: usize = 4 + 1 + 1;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// 64-bit FNV-1a. Stable across runs and platforms, unlike the std hasher.
pub fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ *byte as u64).wrapping_mul(FNV_PRIME)
    })
}

fn same_key(left: &Value, right: &Value) -> bool {
    left.total_cmp(right).is_eq()
}

fn low_bits(hash: u64, depth: u8) -> u64 {
    hash & ((1u64 << depth) - 1)
}

struct BucketEntry {
    key: Value,
    postings: Postings,
}

struct Bucket {
    local_depth: u8,
    overflow: NodeOffset,
    entries: Vec<BucketEntry>,
}

/// The directory file: global depth and `2^global_depth` bucket offsets.
struct Directory {
    file: DataFile,
    global_depth: u8,
    slots: Vec<NodeOffset>,
}

impl Directory {
    fn create(path: impl Into<PathBuf>, first_bucket: NodeOffset) -> Result<Self> {
        let mut directory = Self {
            file: DataFile::create(path)?,
            global_depth: 0,
            slots: vec![first_bucket],
        };
        directory.persist()?;
        Ok(directory)
    }

    fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let file = DataFile::open(path)?;
        let bytes = file.read_all()?;
        if bytes.len() < DIRECTORY_HEADER {
            return Err(StorageError::corruption(format!(
                "hash directory {} is truncated",
                file.path().display()
            )));
        }
        let mut deserializer = Deserializer::new(&bytes);
        let magic = deserializer.deserialize_u32();
        let version = deserializer.deserialize_u8();
        let global_depth = deserializer.deserialize_u8();
        if magic != DIRECTORY_MAGIC || version != DIRECTORY_VERSION || global_depth > MAX_DEPTH {
            return Err(StorageError::corruption(format!(
                "{} is not a hash directory",
                file.path().display()
            )));
        }
        let slot_count = 1usize << global_depth;
        if deserializer.remaining() != slot_count * 8 {
            return Err(StorageError::corruption(format!(
                "hash directory {} should hold {} slots",
                file.path().display(),
                slot_count
            )));
        }
        let slots = (0..slot_count)
            .map(|_| deserializer.deserialize_u64())
            .collect();
        Ok(Self {
            file,
            global_depth,
            slots,
        })
    }

    fn persist(&mut self) -> Result<()> {
        let mut bytes = vec![0u8; DIRECTORY_HEADER + self.slots.len() * 8];
        let mut serializer = Serializer::new(&mut bytes);
        serializer.serialize_u32(DIRECTORY_MAGIC);
        serializer.serialize_u8(DIRECTORY_VERSION);
        serializer.serialize_u8(self.global_depth);
        for slot in &self.slots {
            serializer.serialize_u64(*slot);
        }
        self.file.overwrite(&bytes)
    }

    fn bucket_for(&self, hash: u64) -> NodeOffset {
        self.slots[low_bits(hash, self.global_depth) as usize]
    }

    fn double(&mut self) {
        self.slots.extend_from_within(..);
        self.global_depth += 1;
    }
}

fn block_size(codec: &KeyCodec, capacity: usize) -> usize {
    (BUCKET_HEADER + capacity * (codec.width + Postings::SIZE)).max(MIN_BLOCK_SIZE)
}

/// Extendible hashing over fixed-capacity buckets. Buckets are never merged and
/// the directory never shrinks.
pub struct ExtendibleHashIndex {
    arena: NodeArena,
    directory: Directory,
    codec: KeyCodec,
    capacity: usize,
}

impl ExtendibleHashIndex {
    pub(crate) fn create(
        path: impl Into<PathBuf>,
        directory_path: impl Into<PathBuf>,
        codec: KeyCodec,
        unique: bool,
        capacity: u32,
    ) -> Result<Self> {
        if !(1..=MAX_BUCKET_CAPACITY).contains(&capacity) {
            return Err(StorageError::schema(format!(
                "bucket capacity must be between 1 and {MAX_BUCKET_CAPACITY}, got {capacity}"
            )));
        }
        let header = IndexHeader::new(
            IndexKind::Hash,
            codec.type_id,
            codec.width as u16,
            unique,
            block_size(&codec, capacity as usize),
            capacity,
        );
        let mut arena = NodeArena::create(path, header)?;
        let empty = Bucket {
            local_depth: 0,
            overflow: NULL_NODE,
            entries: Vec::new(),
        };
        let block = encode_bucket(&arena, &codec, &empty);
        let first_bucket = arena.allocate(&block)?;
        arena.header_mut().root = first_bucket;
        arena.flush_header()?;
        Ok(Self {
            arena,
            directory: Directory::create(directory_path, first_bucket)?,
            codec,
            capacity: capacity as usize,
        })
    }

    pub(crate) fn open(
        path: impl Into<PathBuf>,
        directory_path: impl Into<PathBuf>,
        codec: KeyCodec,
    ) -> Result<Self> {
        let arena = NodeArena::open(path, IndexKind::Hash)?;
        check_header_codec(arena.header(), &codec)?;
        let capacity = arena.header().capacity;
        if !(1..=MAX_BUCKET_CAPACITY).contains(&capacity)
            || arena.block_size() != block_size(&codec, capacity as usize)
        {
            return Err(StorageError::corruption(format!(
                "hash bucket capacity {capacity} does not match block size {}",
                arena.block_size()
            )));
        }
        Ok(Self {
            arena,
            directory: Directory::open(directory_path)?,
            codec,
            capacity: capacity as usize,
        })
    }

    pub fn global_depth(&self) -> u8 {
        self.directory.global_depth
    }

    pub fn directory_len(&self) -> usize {
        self.directory.slots.len()
    }

    fn hash(&self, key: &Value) -> u64 {
        fnv1a(&self.codec.to_bytes(key))
    }

    fn read_bucket(&self, offset: NodeOffset) -> Result<Bucket> {
        let block = self.arena.read(offset)?;
        let mut deserializer = Deserializer::new(&block);
        let tag = deserializer.deserialize_u8();
        if tag != BUCKET_TAG {
            return Err(StorageError::corruption(format!(
                "expected a hash bucket at {offset}, found tag {tag}"
            )));
        }
        let local_depth = deserializer.deserialize_u8();
        let count = deserializer.deserialize_u16() as usize;
        let overflow = deserializer.deserialize_u64();
        if count > self.capacity || local_depth > MAX_DEPTH {
            return Err(StorageError::corruption(format!(
                "hash bucket at {offset} is malformed"
            )));
        }
        let entries = (0..count)
            .map(|_| BucketEntry {
                key: self.codec.decode(&mut deserializer),
                postings: Postings::parse(&mut deserializer),
            })
            .collect();
        Ok(Bucket {
            local_depth,
            overflow,
            entries,
        })
    }

    fn write_bucket(&mut self, offset: NodeOffset, bucket: &Bucket) -> Result<()> {
        let block = encode_bucket(&self.arena, &self.codec, bucket);
        self.arena.write(offset, &block)
    }

    /// The bucket and its overflow chain, head first.
    fn read_chain(&self, head: NodeOffset) -> Result<Vec<(NodeOffset, Bucket)>> {
        let mut chain = Vec::new();
        let mut current = head;
        while current != NULL_NODE {
            let bucket = self.read_bucket(current)?;
            let next = bucket.overflow;
            chain.push((current, bucket));
            current = next;
            if chain.len() as u64 > self.arena.block_count() {
                return Err(StorageError::corruption("hash overflow chain loops"));
            }
        }
        Ok(chain)
    }

    fn find(&self, key: &Value) -> Result<Option<Postings>> {
        let head = self.directory.bucket_for(self.hash(key));
        for (_, bucket) in self.read_chain(head)? {
            let mut entries = bucket.entries.into_iter();
            if let Some(entry) = entries.find(|entry| same_key(&entry.key, key)) {
                return Ok(Some(entry.postings));
            }
        }
        Ok(None)
    }

    fn insert_entry(&mut self, key: &Value, record: RecordOffset) -> Result<()> {
        let hash = self.hash(key);
        loop {
            let head = self.directory.bucket_for(hash);
            let mut chain = self.read_chain(head)?;
            if chain.is_empty() {
                return Err(StorageError::corruption("hash directory slot without bucket"));
            }

            for (offset, bucket) in chain.iter_mut() {
                let found = bucket
                    .entries
                    .iter_mut()
                    .find(|entry| same_key(&entry.key, key));
                if let Some(entry) = found {
                    if self.arena.header().unique {
                        return Err(StorageError::duplicate_key(format!(
                            "key {key} is already indexed"
                        )));
                    }
                    if entry.postings.contains(&self.arena, record)? {
                        return Err(StorageError::duplicate_key(format!(
                            "record {record} is already indexed under {key}"
                        )));
                    }
                    entry.postings.push(&mut self.arena, record)?;
                    let offset = *offset;
                    self.write_bucket(offset, bucket)?;
                    return self.count_entry();
                }
            }

            let entry = BucketEntry {
                key: key.clone(),
                postings: Postings::single(record),
            };
            if let Some((offset, bucket)) = chain
                .iter_mut()
                .find(|(_, bucket)| bucket.entries.len() < self.capacity)
            {
                bucket.entries.push(entry);
                let offset = *offset;
                self.write_bucket(offset, bucket)?;
                return self.count_entry();
            }

            let (_, head_bucket) = &mut chain[0];
            if head_bucket.local_depth >= MAX_DEPTH {
                let overflow = Bucket {
                    local_depth: head_bucket.local_depth,
                    overflow: head_bucket.overflow,
                    entries: vec![entry],
                };
                let block = encode_bucket(&self.arena, &self.codec, &overflow);
                head_bucket.overflow = self.arena.allocate(&block)?;
                debug!(bucket = head, "hash bucket at maximum depth chained an overflow bucket");
                self.write_bucket(head, head_bucket)?;
                return self.count_entry();
            }

            let (_, bucket) = chain.swap_remove(0);
            self.split(head, bucket)?;
        }
    }

    fn count_entry(&mut self) -> Result<()> {
        self.arena.header_mut().entries += 1;
        self.arena.flush_header()
    }

    /// Splits a full bucket on its next hash bit, doubling the directory when
    /// the bucket already uses every directory bit.
    fn split(&mut self, offset: NodeOffset, mut bucket: Bucket) -> Result<()> {
        let depth = bucket.local_depth;
        if depth == self.directory.global_depth {
            self.directory.double();
            debug!(
                global_depth = self.directory.global_depth,
                "hash directory doubled"
            );
        }

        let bit = 1u64 << depth;
        let (moved, kept): (Vec<_>, Vec<_>) = bucket
            .entries
            .into_iter()
            .partition(|entry| self.hash(&entry.key) & bit != 0);
        bucket.entries = kept;
        bucket.local_depth = depth + 1;
        let sibling = Bucket {
            local_depth: depth + 1,
            overflow: NULL_NODE,
            entries: moved,
        };
        let block = encode_bucket(&self.arena, &self.codec, &sibling);
        let sibling_offset = self.arena.allocate(&block)?;
        self.write_bucket(offset, &bucket)?;

        for (slot, target) in self.directory.slots.iter_mut().enumerate() {
            if *target == offset && slot as u64 & bit != 0 {
                *target = sibling_offset;
            }
        }
        self.directory.persist()?;
        debug!(
            bucket = offset,
            sibling = sibling_offset,
            local_depth = depth + 1,
            "hash bucket split"
        );
        Ok(())
    }

    fn remove_entry(
        &mut self,
        key: &Value,
        record: Option<RecordOffset>,
    ) -> Result<Vec<RecordOffset>> {
        let head = self.directory.bucket_for(self.hash(key));
        let mut chain = self.read_chain(head)?;

        for i in 0..chain.len() {
            let found = chain[i]
                .1
                .entries
                .iter()
                .position(|entry| same_key(&entry.key, key));
            let position = match found {
                Some(position) => position,
                None => continue,
            };
            let offset = chain[i].0;
            let removed = match record {
                None => {
                    let postings = chain[i].1.entries[position].postings;
                    let offsets = postings.collect(&self.arena)?;
                    postings.release(&mut self.arena)?;
                    offsets
                }
                Some(record) => {
                    let postings = &mut chain[i].1.entries[position].postings;
                    match postings.remove(&mut self.arena, record)? {
                        PostingRemoval::NotPresent => return Ok(Vec::new()),
                        PostingRemoval::Removed => {
                            self.write_bucket(offset, &chain[i].1)?;
                            self.uncount_entries(1)?;
                            return Ok(vec![record]);
                        }
                        PostingRemoval::Emptied => vec![record],
                    }
                }
            };

            chain[i].1.entries.swap_remove(position);
            if i > 0 && chain[i].1.entries.is_empty() {
                // unlink the emptied overflow bucket
                let next = chain[i].1.overflow;
                chain[i - 1].1.overflow = next;
                let previous = chain[i - 1].0;
                self.write_bucket(previous, &chain[i - 1].1)?;
                self.arena.free(offset)?;
            } else {
                self.write_bucket(offset, &chain[i].1)?;
            }
            self.uncount_entries(removed.len() as u64)?;
            return Ok(removed);
        }
        Ok(Vec::new())
    }

    fn uncount_entries(&mut self, count: u64) -> Result<()> {
        let header = self.arena.header_mut();
        header.entries = header.entries.saturating_sub(count);
        self.arena.flush_header()
    }
}

fn encode_bucket(arena: &NodeArena, codec: &KeyCodec, bucket: &Bucket) -> Vec<u8> {
    let mut block = arena.empty_block();
    let mut serializer = Serializer::new(&mut block);
    serializer.serialize_u8(BUCKET_TAG);
    serializer.serialize_u8(bucket.local_depth);
    serializer.serialize_u16(bucket.entries.len() as u16);
    serializer.serialize_u64(bucket.overflow);
    for entry in &bucket.entries {
        codec.encode(&entry.key, &mut serializer);
        entry.postings.serialize(&mut serializer);
    }
    block
}

impl Index for ExtendibleHashIndex {
    fn kind(&self) -> IndexKind {
        IndexKind::Hash
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
        let result = self.remove_entry(&key, Some(offset));
        Ok(!self.arena.guard(result)?.is_empty())
    }

    fn delete(&mut self, key: &Value) -> Result<Vec<RecordOffset>> {
        let key = self.codec.prepare(key)?;
        let result = self.remove_entry(&key, None);
        self.arena.guard(result)
    }

    fn search(&self, key: &Value) -> Result<Vec<RecordOffset>> {
        let key = self.codec.prepare(key)?;
        match self.find(&key)? {
            Some(postings) => postings.collect(&self.arena),
            None => Ok(Vec::new()),
        }
    }

    fn range_search(&self, _low: &Value, _high: &Value) -> Result<Vec<RecordOffset>> {
        Err(StorageError::unsupported(
            "hash index does not support range search",
        ))
    }

    fn check_invariants(&self) -> Result<()> {
        let global_depth = self.directory.global_depth;
        if self.directory.slots.len() != 1usize << global_depth {
            return Err(StorageError::corruption(format!(
                "hash directory has {} slots at global depth {}",
                self.directory.slots.len(),
                global_depth
            )));
        }

        let mut entries_seen = 0;
        for (slot, head) in self.directory.slots.iter().enumerate() {
            let chain = self.read_chain(*head)?;
            let local_depth = chain
                .first()
                .map(|(_, bucket)| bucket.local_depth)
                .ok_or_else(|| StorageError::corruption(format!("slot {slot} has no bucket")))?;
            if local_depth > global_depth {
                return Err(StorageError::corruption(format!(
                    "bucket {head} has local depth {local_depth} above global depth {global_depth}"
                )));
            }
            let home = low_bits(slot as u64, local_depth);
            if self.directory.slots[home as usize] != *head {
                return Err(StorageError::corruption(format!(
                    "slots {slot} and {home} disagree on their bucket"
                )));
            }
            for (_, bucket) in &chain {
                for entry in &bucket.entries {
                    if low_bits(self.hash(&entry.key), local_depth) != home {
                        return Err(StorageError::corruption(format!(
                            "key {} sits in bucket {head} with the wrong hash bits",
                            entry.key
                        )));
                    }
                    // count each bucket once, through its lowest slot
                    if slot as u64 == home {
                        entries_seen += entry.postings.collect(&self.arena)?.len() as u64;
                    }
                }
            }
        }
        if entries_seen != self.arena.header().entries {
            return Err(StorageError::corruption(format!(
                "hash index holds {} entries, header says {}",
                entries_seen,
                self.arena.header().entries
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::Path;

    use anyhow::Result;
    use rand::Rng;
    use tempfile::tempdir;

    use super::{fnv1a, ExtendibleHashIndex};
    use crate::catalog::schema::TypeId;
    use crate::error::StorageError;
    use crate::index::{Index, KeyCodec};
    use crate::tuple::value::Value;

    fn int_index(dir: &Path, capacity: u32) -> Result<ExtendibleHashIndex> {
        ExtendibleHashIndex::create(
            dir.join("t.id.hash.idx"),
            dir.join("t.id.hash.dir"),
            KeyCodec::new(TypeId::Integer, 4),
            false,
            capacity,
        )
    }

    fn int(i: i32) -> Value {
        Value::Integer(i)
    }

    #[test]
    fn fnv_is_stable() {
        assert_eq!(fnv1a(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a(b"a"), 0xaf63_dc4c_8601_ec8c);
    }

    #[test]
    fn overflowing_buckets_grow_the_directory() -> Result<()> {
        let data_dir = tempdir()?;
        let mut index = int_index(data_dir.path(), 2)?;
        assert_eq!(index.global_depth(), 0);
        for key in 0..4 {
            index.insert(&int(key), key as u64 * 8)?;
        }
        assert!(index.global_depth() > 0);
        assert_eq!(index.directory_len(), 1 << index.global_depth());
        for key in 0..4 {
            assert_eq!(index.search(&int(key))?, vec![key as u64 * 8]);
        }
        index.check_invariants()?;
        Ok(())
    }

    #[test]
    fn range_search_is_unsupported() -> Result<()> {
        let data_dir = tempdir()?;
        let index = int_index(data_dir.path(), 4)?;
        let err = index.range_search(&int(1), &int(2)).unwrap_err();
        assert!(matches!(
            StorageError::kind_of(&err),
            Some(StorageError::UnsupportedOperation(_))
        ));
        Ok(())
    }

    #[test]
    fn survives_reopen() -> Result<()> {
        let data_dir = tempdir()?;
        let mut index = int_index(data_dir.path(), 3)?;
        for key in 0..100 {
            index.insert(&int(key), key as u64)?;
        }
        let depth = index.global_depth();
        drop(index);

        let index = ExtendibleHashIndex::open(
            data_dir.path().join("t.id.hash.idx"),
            data_dir.path().join("t.id.hash.dir"),
            KeyCodec::new(TypeId::Integer, 4),
        )?;
        assert_eq!(index.global_depth(), depth);
        index.check_invariants()?;
        for key in 0..100 {
            assert_eq!(index.search(&int(key))?, vec![key as u64]);
        }
        assert!(index.search(&int(100))?.is_empty());
        Ok(())
    }

    #[test]
    fn random_operations_keep_hash_bits_consistent() -> Result<()> {
        let data_dir = tempdir()?;
        let mut index = int_index(data_dir.path(), 2)?;
        let mut model: HashMap<i32, Vec<u64>> = HashMap::new();
        let mut rng = rand::thread_rng();

        for step in 0..500u64 {
            let key = rng.gen_range(0..120);
            if rng.gen_bool(0.7) {
                index.insert(&int(key), step)?;
                model.entry(key).or_default().push(step);
            } else if rng.gen_bool(0.5) {
                assert_eq!(index.delete(&int(key))?, model.remove(&key).unwrap_or_default());
            } else if let Some(offsets) = model.get_mut(&key) {
                let offset = offsets.remove(0);
                assert!(index.remove(&int(key), offset)?);
                if offsets.is_empty() {
                    model.remove(&key);
                }
            }
        }
        index.check_invariants()?;
        for (key, offsets) in &model {
            assert_eq!(&index.search(&int(*key))?, offsets);
        }
        Ok(())
    }
}
