use std::path::PathBuf;

use anyhow::Result;
use tracing::warn;

use crate::catalog::schema::{IndexKind, TypeId};
use crate::common::{NodeOffset, NULL_NODE};
use crate::error::StorageError;
use crate::storage::file_manager::DataFile;
use crate::storage::utils::{Deserializer, Serializer};

const INDEX_MAGIC: u32 = 0x4944_5846;
const INDEX_VERSION: u8 = 1;
const UNIQUE_FLAG: u8 = 0x01;
const UNRELIABLE_FLAG: u8 = 0x02;

/// Every block starts with a tag byte. A freed block carries this tag
/// followed by the offset of the next free block.
pub(crate) const FREE_TAG: u8 = 0;
pub(crate) const MIN_BLOCK_SIZE: usize = 32;

/// First bytes of every index file.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct IndexHeader {
    pub kind: IndexKind,
    pub key_type: TypeId,
    pub key_width: u16,
    pub unique: bool,
    /// set when a mutation failed halfway; the file can't be trusted anymore
    pub unreliable: bool,
    pub block_size: u32,
    pub root: NodeOffset,
    pub free_head: NodeOffset,
    /// B+Tree order, bucket capacity or R-tree node capacity
    pub capacity: u32,
    /// number of (key, record offset) pairs stored
    pub entries: u64,
}

impl IndexHeader {
    pub const SIZE: usize = 64;

    pub fn new(
        kind: IndexKind,
        key_type: TypeId,
        key_width: u16,
        unique: bool,
        block_size: usize,
        capacity: u32,
    ) -> Self {
        Self {
            kind,
            key_type,
            key_width,
            unique,
            unreliable: false,
            block_size: block_size.max(MIN_BLOCK_SIZE) as u32,
            root: NULL_NODE,
            free_head: NULL_NODE,
            capacity,
            entries: 0,
        }
    }

    fn serialize(&self, buffer: &mut [u8]) {
        let mut flags = 0;
        if self.unique {
            flags |= UNIQUE_FLAG;
        }
        if self.unreliable {
            flags |= UNRELIABLE_FLAG;
        }
        let mut serializer = Serializer::new(buffer);
        serializer.serialize_u32(INDEX_MAGIC);
        serializer.serialize_u8(INDEX_VERSION);
        serializer.serialize_u8(self.kind.tag());
        serializer.serialize_u8(self.key_type.tag());
        serializer.serialize_u8(flags);
        serializer.serialize_u16(self.key_width);
        serializer.serialize_u32(self.block_size);
        serializer.serialize_u64(self.root);
        serializer.serialize_u64(self.free_head);
        serializer.serialize_u32(self.capacity);
        serializer.serialize_u64(self.entries);
    }

    fn parse(bytes: &[u8]) -> Result<Self> {
        let mut deserializer = Deserializer::new(bytes);
        let magic = deserializer.deserialize_u32();
        if magic != INDEX_MAGIC {
            return Err(StorageError::corruption(format!(
                "invalid index magic: expected 0x{:08X}, found 0x{:08X}",
                INDEX_MAGIC, magic
            )));
        }
        let version = deserializer.deserialize_u8();
        if version != INDEX_VERSION {
            return Err(StorageError::corruption(format!(
                "unsupported index version {version}"
            )));
        }
        let kind = IndexKind::from_tag(deserializer.deserialize_u8())
            .ok_or_else(|| StorageError::corruption("unknown index kind"))?;
        let key_type = TypeId::from_tag(deserializer.deserialize_u8())
            .ok_or_else(|| StorageError::corruption("unknown index key type"))?;
        let flags = deserializer.deserialize_u8();
        Ok(Self {
            kind,
            key_type,
            key_width: deserializer.deserialize_u16(),
            unique: flags & UNIQUE_FLAG != 0,
            unreliable: flags & UNRELIABLE_FLAG != 0,
            block_size: deserializer.deserialize_u32(),
            root: deserializer.deserialize_u64(),
            free_head: deserializer.deserialize_u64(),
            capacity: deserializer.deserialize_u32(),
            entries: deserializer.deserialize_u64(),
        })
    }
}

/// An index file seen as a header followed by fixed-size blocks. A block is
/// addressed by its byte offset, which stays valid until the block is freed.
pub(crate) struct NodeArena {
    file: DataFile,
    header: IndexHeader,
}

impl NodeArena {
    pub fn create(path: impl Into<PathBuf>, header: IndexHeader) -> Result<Self> {
        let mut arena = Self {
            file: DataFile::create(path)?,
            header,
        };
        arena.flush_header()?;
        Ok(arena)
    }

    /// Opens an index file and checks that it is structurally sound.
    pub fn open(path: impl Into<PathBuf>, kind: IndexKind) -> Result<Self> {
        let file = DataFile::open(path)?;
        let filesize = file.filesize();
        if filesize < IndexHeader::SIZE as u64 {
            return Err(StorageError::corruption(format!(
                "index file {} is shorter than its header",
                file.path().display()
            )));
        }
        let mut bytes = [0u8; IndexHeader::SIZE];
        file.read_at(0, &mut bytes)?;
        let header = IndexHeader::parse(&bytes)?;

        if header.kind != kind {
            return Err(StorageError::corruption(format!(
                "index file {} holds a {} index, expected {}",
                file.path().display(),
                header.kind,
                kind
            )));
        }
        if header.unreliable {
            return Err(StorageError::corruption(format!(
                "index file {} was left inconsistent by a failed mutation",
                file.path().display()
            )));
        }
        if (header.block_size as usize) < MIN_BLOCK_SIZE
            || (filesize - IndexHeader::SIZE as u64) % header.block_size as u64 != 0
        {
            return Err(StorageError::corruption(format!(
                "Boundary check for {} failed. {} is not a header plus blocks of {} bytes",
                file.path().display(),
                filesize,
                header.block_size
            )));
        }
        let arena = Self { file, header };
        if header_points_outside(&arena) {
            return Err(StorageError::corruption(format!(
                "index file {} has a root or free list outside the file",
                arena.file.path().display()
            )));
        }
        Ok(arena)
    }

    pub fn header(&self) -> &IndexHeader {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut IndexHeader {
        &mut self.header
    }

    pub fn flush_header(&mut self) -> Result<()> {
        let mut bytes = [0u8; IndexHeader::SIZE];
        self.header.serialize(&mut bytes);
        self.file.write_at(0, &bytes)
    }

    pub fn block_size(&self) -> usize {
        self.header.block_size as usize
    }

    /// Blocks in the file, used or free. Bounds every walk over node links.
    pub fn block_count(&self) -> u64 {
        (self.file.filesize() - IndexHeader::SIZE as u64) / self.header.block_size as u64
    }

    fn is_block_offset(&self, offset: NodeOffset) -> bool {
        offset >= IndexHeader::SIZE as u64
            && offset < self.file.filesize()
            && (offset - IndexHeader::SIZE as u64) % self.header.block_size as u64 == 0
    }

    fn check_offset(&self, offset: NodeOffset) -> Result<()> {
        if self.is_block_offset(offset) {
            Ok(())
        } else {
            Err(StorageError::corruption(format!(
                "node reference {} in {} does not address a block",
                offset,
                self.file.path().display()
            )))
        }
    }

    pub fn read(&self, offset: NodeOffset) -> Result<Vec<u8>> {
        self.check_offset(offset)?;
        let mut block = vec![0u8; self.block_size()];
        self.file.read_at(offset, &mut block)?;
        Ok(block)
    }

    pub fn write(&mut self, offset: NodeOffset, block: &[u8]) -> Result<()> {
        self.check_offset(offset)?;
        self.check_block_len(block)?;
        self.file.write_at(offset, block)
    }

    /// Stores a new block, reusing the head of the free list if there is one.
    pub fn allocate(&mut self, block: &[u8]) -> Result<NodeOffset> {
        self.check_block_len(block)?;
        if self.header.free_head == NULL_NODE {
            return self.file.append(block);
        }

        let offset = self.header.free_head;
        let free_block = self.read(offset)?;
        let mut deserializer = Deserializer::new(&free_block);
        if deserializer.deserialize_u8() != FREE_TAG {
            return Err(StorageError::corruption(format!(
                "free list of {} points at a used block {}",
                self.file.path().display(),
                offset
            )));
        }
        self.header.free_head = deserializer.deserialize_u64();
        self.file.write_at(offset, block)?;
        self.flush_header()?;
        Ok(offset)
    }

    pub fn free(&mut self, offset: NodeOffset) -> Result<()> {
        self.check_offset(offset)?;
        let mut block = vec![0u8; self.block_size()];
        let mut serializer = Serializer::new(&mut block);
        serializer.serialize_u8(FREE_TAG);
        serializer.serialize_u64(self.header.free_head);
        self.file.write_at(offset, &block)?;
        self.header.free_head = offset;
        self.flush_header()
    }

    /// Returns a zeroed block buffer.
    pub fn empty_block(&self) -> Vec<u8> {
        vec![0u8; self.block_size()]
    }

    /// Passes the result through, marking the file unreliable when a mutation
    /// failed after it may have touched the file. Rejections that happen before
    /// anything is written leave the file as it is.
    pub fn guard<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            let rejected_up_front = matches!(
                StorageError::kind_of(err),
                Some(StorageError::DuplicateKey(_)) | Some(StorageError::Schema(_))
            );
            if !rejected_up_front {
                warn!(
                    file = %self.file.path().display(),
                    error = %err,
                    "index mutation failed, marking the index unreliable"
                );
                self.header.unreliable = true;
                if let Err(flush_err) = self.flush_header() {
                    warn!(error = %flush_err, "could not persist the unreliable flag");
                }
            }
        }
        result
    }

    fn check_block_len(&self, block: &[u8]) -> Result<()> {
        if block.len() != self.block_size() {
            Err(StorageError::capacity(format!(
                "encoded node of {} bytes does not fit blocks of {} bytes",
                block.len(),
                self.block_size()
            )))
        } else {
            Ok(())
        }
    }
}

fn header_points_outside(arena: &NodeArena) -> bool {
    let header = arena.header();
    (header.root != NULL_NODE && !arena.is_block_offset(header.root))
        || (header.free_head != NULL_NODE && !arena.is_block_offset(header.free_head))
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use tempfile::tempdir;

    use super::{IndexHeader, NodeArena};
    use crate::catalog::schema::{IndexKind, TypeId};
    use crate::common::NULL_NODE;
    use crate::error::StorageError;

    fn header() -> IndexHeader {
        IndexHeader::new(IndexKind::Avl, TypeId::Integer, 4, false, 40, 0)
    }

    #[test]
    fn reuses_freed_blocks() -> Result<()> {
        let data_dir = tempdir()?;
        let path = data_dir.path().join("a.idx");
        let mut arena = NodeArena::create(&path, header())?;

        let a = arena.allocate(&[1u8; 40])?;
        let b = arena.allocate(&[2u8; 40])?;
        assert_eq!(a, IndexHeader::SIZE as u64);
        assert_eq!(b, a + 40);

        arena.free(a)?;
        assert_eq!(arena.header().free_head, a);
        let c = arena.allocate(&[3u8; 40])?;
        assert_eq!(c, a);
        assert_eq!(arena.header().free_head, NULL_NODE);
        assert_eq!(arena.read(c)?, vec![3u8; 40]);
        Ok(())
    }

    #[test]
    fn header_survives_reopen() -> Result<()> {
        let data_dir = tempdir()?;
        let path = data_dir.path().join("h.idx");
        let mut arena = NodeArena::create(&path, header())?;
        let root = arena.allocate(&[9u8; 40])?;
        arena.header_mut().root = root;
        arena.header_mut().entries = 17;
        arena.flush_header()?;
        drop(arena);

        let arena = NodeArena::open(&path, IndexKind::Avl)?;
        assert_eq!(arena.header().root, root);
        assert_eq!(arena.header().entries, 17);
        assert!(NodeArena::open(&path, IndexKind::Hash).is_err());
        Ok(())
    }

    #[test]
    fn failed_mutation_poisons_the_file() -> Result<()> {
        let data_dir = tempdir()?;
        let path = data_dir.path().join("p.idx");
        let mut arena = NodeArena::create(&path, header())?;

        let rejected: Result<()> = Err(StorageError::duplicate_key("1"));
        assert!(arena.guard(rejected).is_err());
        assert!(!arena.header().unreliable);

        let broken: Result<()> = Err(StorageError::capacity("split went wrong"));
        assert!(arena.guard(broken).is_err());
        drop(arena);

        let err = NodeArena::open(&path, IndexKind::Avl).err().unwrap();
        assert!(matches!(
            StorageError::kind_of(&err),
            Some(StorageError::Corruption(_))
        ));
        Ok(())
    }

    #[test]
    fn rejects_dangling_references() -> Result<()> {
        let data_dir = tempdir()?;
        let arena = NodeArena::create(data_dir.path().join("d.idx"), header())?;
        assert!(arena.read(IndexHeader::SIZE as u64).is_err());
        assert!(arena.read(3).is_err());
        Ok(())
    }
}
