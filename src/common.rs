/// Byte offset of a record slot inside a table file. It is the record's identity.
pub type RecordOffset = u64;
/// Byte offset of a node block inside an index file.
pub type NodeOffset = u64;

/// Offset 0 of an index file holds its header, so it can never address a node.
pub const NULL_NODE: NodeOffset = 0;
/// Terminates the intrusive free list of a record file.
pub const NO_FREE_SLOT: RecordOffset = u64::MAX;

pub const MAX_COLUMNS: u8 = u8::MAX;
/// The index count of a table is stored in one byte.
pub const MAX_INDEXES: usize = u8::MAX as usize;
pub const MAX_TEXT_WIDTH: u16 = 4096;

pub const TABLE_FILE_EXTENSION: &str = "tbl";
pub const META_FILE_EXTENSION: &str = "meta";
pub const INDEX_FILE_EXTENSION: &str = "idx";
pub const DIRECTORY_FILE_EXTENSION: &str = "dir";

pub const DEFAULT_BTREE_ORDER: u32 = 4;
pub const DEFAULT_HASH_BUCKET_CAPACITY: u32 = 5;
pub const DEFAULT_RTREE_NODE_CAPACITY: u32 = 16;
pub const DEFAULT_POINT_CACHE_CAPACITY: usize = 4096;
