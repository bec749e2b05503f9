use anyhow::Result;

use crate::catalog::schema::{ColumnDefinition, IndexDescriptor, IndexKind, TypeId};
use crate::common::{
    RecordOffset, DEFAULT_BTREE_ORDER, DEFAULT_HASH_BUCKET_CAPACITY, DEFAULT_RTREE_NODE_CAPACITY,
};
use crate::error::StorageError;
use crate::storage::file_manager::FileManager;
use crate::storage::utils::{Deserializer, Serializer};
use crate::tuple::point::Point;
use crate::tuple::value::Value;

pub(crate) mod arena;
pub mod avl;
pub mod btree;
pub mod hash;
pub(crate) mod posting;
pub mod rtree;

use self::arena::IndexHeader;
use self::avl::AvlIndex;
use self::btree::BPlusTreeIndex;
use self::hash::ExtendibleHashIndex;
use self::rtree::SpatialIndex;

/// Structural parameters used when an index file is created. Existing files
/// keep the parameters they were created with.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct IndexOptions {
    pub btree_order: u32,
    pub hash_bucket_capacity: u32,
    pub rtree_node_capacity: u32,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            btree_order: DEFAULT_BTREE_ORDER,
            hash_bucket_capacity: DEFAULT_HASH_BUCKET_CAPACITY,
            rtree_node_capacity: DEFAULT_RTREE_NODE_CAPACITY,
        }
    }
}

/// A persistent mapping from column values to the offsets of the records
/// holding them.
pub trait Index {
    fn kind(&self) -> IndexKind;

    fn is_unique(&self) -> bool;

    /// Number of (key, offset) pairs stored.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&mut self, key: &Value, offset: RecordOffset) -> Result<()>;

    /// Removes one offset from the key. Returns false if it wasn't there.
    fn remove(&mut self, key: &Value, offset: RecordOffset) -> Result<bool>;

    /// Removes the key with all its offsets and returns them.
    fn delete(&mut self, key: &Value) -> Result<Vec<RecordOffset>>;

    fn search(&self, key: &Value) -> Result<Vec<RecordOffset>>;

    /// Offsets of all keys in `[low, high]`, in key order.
    fn range_search(&self, low: &Value, high: &Value) -> Result<Vec<RecordOffset>>;

    fn radius_search(&self, _center: &Point, _radius: f64) -> Result<Vec<RecordOffset>> {
        Err(StorageError::unsupported(format!(
            "{} index does not support radius search",
            self.kind()
        )))
    }

    /// The `k` offsets closest to `center`, nearest first.
    fn knn_search(&self, _center: &Point, _k: usize) -> Result<Vec<RecordOffset>> {
        Err(StorageError::unsupported(format!(
            "{} index does not support nearest neighbour search",
            self.kind()
        )))
    }

    /// Walks the whole structure and reports the first broken invariant as
    /// Corruption.
    fn check_invariants(&self) -> Result<()>;
}

/// How keys of one column are laid out inside index nodes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct KeyCodec {
    pub type_id: TypeId,
    pub width: usize,
}

impl KeyCodec {
    pub fn new(type_id: TypeId, width: usize) -> Self {
        Self { type_id, width }
    }

    pub fn for_column(column: &ColumnDefinition) -> Self {
        Self::new(column.type_id(), column.width() as usize)
    }

    /// Validates a key and returns it the way it reads back from disk, so
    /// over-long text compares like its stored prefix.
    pub fn prepare(&self, key: &Value) -> Result<Value> {
        key.check_key(self.type_id)?;
        match key {
            Value::Text(_) => {
                let mut bytes = vec![0u8; self.width];
                key.serialize_value(&mut bytes, self.width);
                Ok(Value::parse_value(&bytes, self.type_id, self.width))
            }
            _ => Ok(key.clone()),
        }
    }

    pub fn encode(&self, key: &Value, serializer: &mut Serializer) {
        key.serialize_value(serializer.reserve(self.width), self.width);
    }

    pub fn decode(&self, deserializer: &mut Deserializer) -> Value {
        Value::parse_value(deserializer.take(self.width), self.type_id, self.width)
    }

    pub fn to_bytes(&self, key: &Value) -> Vec<u8> {
        let mut bytes = vec![0u8; self.width];
        key.serialize_value(&mut bytes, self.width);
        bytes
    }
}

fn check_column(descriptor: &IndexDescriptor, column: &ColumnDefinition) -> Result<()> {
    if descriptor.kind == IndexKind::RTree && column.type_id() != TypeId::Point {
        return Err(StorageError::schema(format!(
            "rtree index needs a POINT column, {} is {}",
            column.column_name(),
            column.type_id()
        )));
    }
    Ok(())
}

/// Creates the files of a new, empty index.
pub fn create_index(
    file_manager: &FileManager,
    table: &str,
    descriptor: &IndexDescriptor,
    column: &ColumnDefinition,
    options: &IndexOptions,
) -> Result<Box<dyn Index>> {
    check_column(descriptor, column)?;
    let path = file_manager.index_path(table, &descriptor.column, descriptor.kind);
    let codec = KeyCodec::for_column(column);
    let unique = descriptor.unique;
    let index: Box<dyn Index> = match descriptor.kind {
        IndexKind::BTree => Box::new(BPlusTreeIndex::create(
            path,
            codec,
            unique,
            options.btree_order,
        )?),
        IndexKind::Avl => Box::new(AvlIndex::create(path, codec, unique)?),
        IndexKind::Hash => Box::new(ExtendibleHashIndex::create(
            path,
            file_manager.directory_path(table, &descriptor.column),
            codec,
            unique,
            options.hash_bucket_capacity,
        )?),
        IndexKind::RTree => Box::new(SpatialIndex::create(
            path,
            unique,
            options.rtree_node_capacity,
        )?),
    };
    Ok(index)
}

/// Opens the files of an existing index and checks them against the column.
pub fn open_index(
    file_manager: &FileManager,
    table: &str,
    descriptor: &IndexDescriptor,
    column: &ColumnDefinition,
) -> Result<Box<dyn Index>> {
    check_column(descriptor, column)?;
    let path = file_manager.index_path(table, &descriptor.column, descriptor.kind);
    let codec = KeyCodec::for_column(column);
    let index: Box<dyn Index> = match descriptor.kind {
        IndexKind::BTree => Box::new(BPlusTreeIndex::open(&path, codec)?),
        IndexKind::Avl => Box::new(AvlIndex::open(&path, codec)?),
        IndexKind::Hash => Box::new(ExtendibleHashIndex::open(
            &path,
            file_manager.directory_path(table, &descriptor.column),
            codec,
        )?),
        IndexKind::RTree => Box::new(SpatialIndex::open(&path)?),
    };
    if index.is_unique() != descriptor.unique {
        return Err(StorageError::corruption(format!(
            "uniqueness of {} disagrees with the table metadata",
            path.display()
        )));
    }
    Ok(index)
}

/// Rejects a file whose header was written for another key layout.
pub(crate) fn check_header_codec(header: &IndexHeader, codec: &KeyCodec) -> Result<()> {
    if header.key_type != codec.type_id || header.key_width as usize != codec.width {
        return Err(StorageError::corruption(format!(
            "index keys are {} of width {}, column is {} of width {}",
            header.key_type, header.key_width, codec.type_id, codec.width
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use tempfile::tempdir;

    use super::{create_index, open_index, IndexOptions, KeyCodec};
    use crate::catalog::schema::{ColumnDefinition, IndexDescriptor, IndexKind, TypeId};
    use crate::error::StorageError;
    use crate::storage::file_manager::FileManager;
    use crate::tuple::point::Point;
    use crate::tuple::value::Value;

    #[test]
    fn every_kind_answers_exact_lookups() -> Result<()> {
        let data_dir = tempdir()?;
        let file_manager = FileManager::new(data_dir.path())?;
        let column = ColumnDefinition::new(TypeId::Point, "location", 0, false);
        let options = IndexOptions::default();

        for kind in [IndexKind::BTree, IndexKind::Avl, IndexKind::Hash, IndexKind::RTree] {
            let descriptor = IndexDescriptor::new("location", kind, false);
            let mut index = create_index(&file_manager, "places", &descriptor, &column, &options)?;
            for i in 0..20 {
                let key = Value::Point(Point::new(i as f64, (i % 3) as f64));
                index.insert(&key, i * 10)?;
            }
            index.check_invariants()?;
            drop(index);

            let index = open_index(&file_manager, "places", &descriptor, &column)?;
            assert_eq!(index.kind(), kind);
            assert_eq!(index.len(), 20);
            let found = index.search(&Value::Point(Point::new(7.0, 1.0)))?;
            assert_eq!(found, vec![70]);
        }
        Ok(())
    }

    #[test]
    fn rtree_needs_point_column() -> Result<()> {
        let data_dir = tempdir()?;
        let file_manager = FileManager::new(data_dir.path())?;
        let column = ColumnDefinition::new(TypeId::Integer, "id", 0, false);
        let descriptor = IndexDescriptor::new("id", IndexKind::RTree, false);
        let err = create_index(
            &file_manager,
            "t",
            &descriptor,
            &column,
            &IndexOptions::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(
            StorageError::kind_of(&err),
            Some(StorageError::Schema(_))
        ));
        Ok(())
    }

    #[test]
    fn text_keys_are_cut_to_column_width() -> Result<()> {
        let codec = KeyCodec::new(TypeId::Text, 4);
        assert_eq!(
            codec.prepare(&Value::Text("abcdef".to_owned()))?,
            Value::Text("abcd".to_owned())
        );
        assert!(codec.prepare(&Value::Integer(3)).is_err());
        assert!(codec.prepare(&Value::Null).is_err());
        Ok(())
    }
}
