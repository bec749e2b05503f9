use anyhow::Result;

use crate::catalog::schema::{ColumnDefinition, IndexDescriptor, IndexKind, Schema, TypeId};
use crate::common::{RecordOffset, NO_FREE_SLOT};
use crate::error::StorageError;
use crate::storage::utils::{Deserializer, Serializer};

const TABLE_META_MAGIC: u32 = 0x5442_4C4D;
const TABLE_META_VERSION: u8 = 1;
const NO_KEY_COLUMN: u8 = u8::MAX;

/// The side record stored next to every table file.
#[derive(Clone, Debug, PartialEq)]
pub struct TableMeta {
    pub name: String,
    pub schema: Schema,
    /// position of the designated key column
    pub key_column: Option<u8>,
    /// indexes attached to the table, in the order they are maintained
    pub indexes: Vec<IndexDescriptor>,
    /// offset of the first free slot, NO_FREE_SLOT if there is none
    pub free_list_head: RecordOffset,
    /// number of live records
    pub live_count: u64,
}

impl TableMeta {
    pub fn new(name: &str, schema: Schema, key_column: Option<u8>) -> Self {
        Self {
            name: name.to_owned(),
            schema,
            key_column,
            indexes: Vec::new(),
            free_list_head: NO_FREE_SLOT,
            live_count: 0,
        }
    }

    /// Calculates how many bytes the metadata occupies when serialized
    pub fn serialized_size(&self) -> usize {
        let columns: usize = self
            .schema
            .columns()
            .iter()
            .map(|col| 2 + col.column_name().len() + 1 + 1 + 2 + 1)
            .sum();
        let indexes: usize = self.indexes.iter().map(|idx| 2 + idx.column.len() + 2).sum();
        4 + 1 + 2 + self.name.len() + 1 + columns + 1 + 1 + indexes + 8 + 8
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buffer = vec![0u8; self.serialized_size()];
        let mut serializer = Serializer::new(&mut buffer);
        serializer.serialize_u32(TABLE_META_MAGIC);
        serializer.serialize_u8(TABLE_META_VERSION);
        serializer.serialize_str(&self.name);

        serializer.serialize_u8(self.schema.columns().len() as u8);
        for column in self.schema.columns() {
            serializer.serialize_str(column.column_name());
            serializer.serialize_u8(column.type_id().tag());
            serializer.serialize_u8(column.column_offset());
            serializer.serialize_u16(column.width());
            serializer.serialize_u8(column.nullable() as u8);
        }
        serializer.serialize_u8(self.key_column.unwrap_or(NO_KEY_COLUMN));

        serializer.serialize_u8(self.indexes.len() as u8);
        for index in &self.indexes {
            serializer.serialize_str(&index.column);
            serializer.serialize_u8(index.kind.tag());
            serializer.serialize_u8(index.unique as u8);
        }
        serializer.serialize_u64(self.free_list_head);
        serializer.serialize_u64(self.live_count);
        buffer
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut deserializer = Deserializer::new(bytes);
        need(&deserializer, 5)?;
        let magic = deserializer.deserialize_u32();
        if magic != TABLE_META_MAGIC {
            return Err(StorageError::corruption(format!(
                "invalid table metadata magic: expected 0x{:08X}, found 0x{:08X}",
                TABLE_META_MAGIC, magic
            )));
        }
        let version = deserializer.deserialize_u8();
        if version != TABLE_META_VERSION {
            return Err(StorageError::corruption(format!(
                "unsupported table metadata version {version}"
            )));
        }
        let name = read_str(&mut deserializer)?;

        need(&deserializer, 1)?;
        let column_count = deserializer.deserialize_u8();
        let mut columns = Vec::with_capacity(column_count as usize);
        for _ in 0..column_count {
            let column_name = read_str(&mut deserializer)?;
            need(&deserializer, 5)?;
            let type_id = TypeId::from_tag(deserializer.deserialize_u8())
                .ok_or_else(|| StorageError::corruption("unknown column type tag"))?;
            let column_offset = deserializer.deserialize_u8();
            let width = deserializer.deserialize_u16();
            let nullable = deserializer.deserialize_u8() == 1;
            columns.push(ColumnDefinition {
                type_id,
                column_name,
                column_offset,
                width,
                nullable,
            });
        }
        let schema = Schema::new(columns);
        schema
            .validate()
            .map_err(|e| StorageError::corruption(format!("invalid stored schema: {e}")))?;

        need(&deserializer, 2)?;
        let key_column = match deserializer.deserialize_u8() {
            NO_KEY_COLUMN => None,
            position if (position as usize) < schema.columns().len() => Some(position),
            position => {
                return Err(StorageError::corruption(format!(
                    "key column {position} does not exist"
                )))
            }
        };

        let index_count = deserializer.deserialize_u8();
        let mut indexes = Vec::with_capacity(index_count as usize);
        for _ in 0..index_count {
            let column = read_str(&mut deserializer)?;
            need(&deserializer, 2)?;
            let kind = IndexKind::from_tag(deserializer.deserialize_u8())
                .ok_or_else(|| StorageError::corruption("unknown index kind tag"))?;
            let unique = deserializer.deserialize_u8() == 1;
            if schema.find_column(&column).is_none() {
                return Err(StorageError::corruption(format!(
                    "index on unknown column {column}"
                )));
            }
            indexes.push(IndexDescriptor {
                column,
                kind,
                unique,
            });
        }

        need(&deserializer, 16)?;
        let free_list_head = deserializer.deserialize_u64();
        let live_count = deserializer.deserialize_u64();

        Ok(Self {
            name,
            schema,
            key_column,
            indexes,
            free_list_head,
            live_count,
        })
    }
}

fn need(deserializer: &Deserializer, len: usize) -> Result<()> {
    if deserializer.remaining() < len {
        Err(StorageError::corruption("table metadata is truncated"))
    } else {
        Ok(())
    }
}

fn read_str(deserializer: &mut Deserializer) -> Result<String> {
    need(deserializer, 2)?;
    deserializer
        .deserialize_str()
        .ok_or_else(|| StorageError::corruption("table metadata holds a malformed name"))
}

#[cfg(test)]
mod tests {
    use super::TableMeta;
    use crate::catalog::schema::{ColumnDefinition, IndexDescriptor, IndexKind, Schema, TypeId};
    use crate::error::StorageError;

    fn sample() -> TableMeta {
        let schema = Schema::new(vec![
            ColumnDefinition::new(TypeId::Integer, "id", 0, false),
            ColumnDefinition::text("name", 1, 30, true),
            ColumnDefinition::new(TypeId::Point, "location", 2, false),
        ]);
        let mut meta = TableMeta::new("restaurants", schema, Some(0));
        meta.indexes
            .push(IndexDescriptor::new("id", IndexKind::BTree, true));
        meta.indexes
            .push(IndexDescriptor::new("location", IndexKind::RTree, false));
        meta.free_list_head = 123;
        meta.live_count = 9;
        meta
    }

    #[test]
    fn parses_serialized_metadata() {
        let meta = sample();
        let bytes = meta.serialize();
        assert_eq!(bytes.len(), meta.serialized_size());
        assert_eq!(TableMeta::parse(&bytes).unwrap(), meta);
    }

    #[test]
    fn truncated_metadata_is_corruption() {
        let bytes = sample().serialize();
        for len in [0, 3, 10, bytes.len() - 1] {
            let err = TableMeta::parse(&bytes[..len]).unwrap_err();
            assert!(matches!(
                StorageError::kind_of(&err),
                Some(StorageError::Corruption(_))
            ));
        }
    }
}
