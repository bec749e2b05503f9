use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;

use anyhow::{Error, Result};
use lazy_static::lazy_static;

use crate::common::{MAX_COLUMNS, MAX_TEXT_WIDTH};
use crate::error::StorageError;
use crate::tuple::point::Point;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TypeId {
    Integer,
    Decimal,
    Text,
    Boolean,
    Date,
    Point,
}

lazy_static! {
    static ref TYPE_NAMES: HashMap<&'static str, TypeId> = HashMap::from([
        ("INT", TypeId::Integer),
        ("INTEGER", TypeId::Integer),
        ("DECIMAL", TypeId::Decimal),
        ("DOUBLE", TypeId::Decimal),
        ("FLOAT", TypeId::Decimal),
        ("CHAR", TypeId::Text),
        ("VARCHAR", TypeId::Text),
        ("TEXT", TypeId::Text),
        ("BOOL", TypeId::Boolean),
        ("BOOLEAN", TypeId::Boolean),
        ("DATE", TypeId::Date),
        ("POINT", TypeId::Point),
    ]);
    static ref INDEX_KIND_NAMES: HashMap<&'static str, IndexKind> = HashMap::from([
        ("BTREE", IndexKind::BTree),
        ("ISAM", IndexKind::BTree),
        ("AVL", IndexKind::Avl),
        ("HASH", IndexKind::Hash),
        ("RTREE", IndexKind::RTree),
    ]);
}

impl TypeId {
    /// Bytes a non-null value of this type occupies. Text has no intrinsic width.
    pub fn fixed_width(&self) -> Option<u16> {
        match self {
            TypeId::Integer => Some(4),
            TypeId::Decimal => Some(8),
            TypeId::Text => None,
            TypeId::Boolean => Some(1),
            TypeId::Date => Some(8),
            TypeId::Point => Some(Point::SIZE as u16),
        }
    }

    pub fn tag(&self) -> u8 {
        match self {
            TypeId::Integer => 1,
            TypeId::Decimal => 2,
            TypeId::Text => 3,
            TypeId::Boolean => 4,
            TypeId::Date => 5,
            TypeId::Point => 6,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(TypeId::Integer),
            2 => Some(TypeId::Decimal),
            3 => Some(TypeId::Text),
            4 => Some(TypeId::Boolean),
            5 => Some(TypeId::Date),
            6 => Some(TypeId::Point),
            _ => None,
        }
    }
}

impl FromStr for TypeId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TYPE_NAMES
            .get(s.to_ascii_uppercase().as_str())
            .copied()
            .ok_or_else(|| Error::msg(format!("Invalid TypeId {}", s)))
    }
}

impl Display for TypeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ColumnDefinition {
    pub type_id: TypeId,
    pub column_name: String,
    pub column_offset: u8,
    /// Maximum byte length for text, the fixed type width otherwise.
    pub width: u16,
    pub nullable: bool,
}

impl ColumnDefinition {
    /// Creates a column of a fixed-width type.
    pub fn new(type_id: TypeId, column_name: &str, column_offset: u8, nullable: bool) -> Self {
        Self {
            type_id,
            column_name: column_name.to_owned(),
            column_offset,
            width: type_id.fixed_width().unwrap_or(0),
            nullable,
        }
    }

    /// Creates a text column holding at most `width` bytes.
    pub fn text(column_name: &str, column_offset: u8, width: u16, nullable: bool) -> Self {
        Self {
            type_id: TypeId::Text,
            column_name: column_name.to_owned(),
            column_offset,
            width,
            nullable,
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn column_name(&self) -> &str {
        &self.column_name
    }

    pub fn column_offset(&self) -> u8 {
        self.column_offset
    }

    pub fn width(&self) -> u16 {
        self.width
    }

    pub fn nullable(&self) -> bool {
        self.nullable
    }

    /// Bytes the column occupies inside a record slot, including the null flag.
    pub fn slot_width(&self) -> usize {
        self.width as usize + usize::from(self.nullable)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Schema {
    columns: Vec<ColumnDefinition>,
}

impl Schema {
    pub fn new(columns: Vec<ColumnDefinition>) -> Self {
        Self { columns }
    }

    /// Validates the column list of a new table.
    pub fn validate(&self) -> Result<()> {
        if self.columns.is_empty() {
            return Err(StorageError::schema("A table needs at least one column"));
        }
        if self.columns.len() > MAX_COLUMNS as usize {
            return Err(StorageError::schema(format!(
                "A table may have at most {} columns",
                MAX_COLUMNS
            )));
        }
        for (position, column) in self.columns.iter().enumerate() {
            if column.column_name.is_empty() {
                return Err(StorageError::schema(format!(
                    "Column {position} has an empty name"
                )));
            }
            if column.column_offset as usize != position {
                return Err(StorageError::schema(format!(
                    "Column {} is declared at offset {} but listed at position {}",
                    column.column_name, column.column_offset, position
                )));
            }
            if self.columns[..position]
                .iter()
                .any(|other| other.column_name == column.column_name)
            {
                return Err(StorageError::schema(format!(
                    "Duplicate column {}",
                    column.column_name
                )));
            }
            match column.type_id.fixed_width() {
                Some(width) if width != column.width => {
                    return Err(StorageError::schema(format!(
                        "Column {} of type {} must have width {}",
                        column.column_name, column.type_id, width
                    )))
                }
                None if column.width == 0 || column.width > MAX_TEXT_WIDTH => {
                    return Err(StorageError::schema(format!(
                        "Text column {} needs a width between 1 and {}",
                        column.column_name, MAX_TEXT_WIDTH
                    )))
                }
                _ => (),
            }
        }
        Ok(())
    }

    pub fn find_column(&self, name: &str) -> Option<&ColumnDefinition> {
        self.columns.iter().find(|col| col.column_name().eq(name))
    }

    /// Like `find_column`, failing with NotFound.
    pub fn column(&self, name: &str) -> Result<&ColumnDefinition> {
        self.find_column(name)
            .ok_or_else(|| StorageError::not_found(format!("column {name}")))
    }

    pub fn columns(&self) -> &[ColumnDefinition] {
        &self.columns
    }

    /// Sum of all column widths, the payload of a record slot.
    pub fn payload_width(&self) -> usize {
        self.columns.iter().map(|col| col.slot_width()).sum()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IndexKind {
    BTree,
    Avl,
    Hash,
    RTree,
}

impl IndexKind {
    pub fn tag(&self) -> u8 {
        match self {
            IndexKind::BTree => 1,
            IndexKind::Avl => 2,
            IndexKind::Hash => 3,
            IndexKind::RTree => 4,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(IndexKind::BTree),
            2 => Some(IndexKind::Avl),
            3 => Some(IndexKind::Hash),
            4 => Some(IndexKind::RTree),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            IndexKind::BTree => "btree",
            IndexKind::Avl => "avl",
            IndexKind::Hash => "hash",
            IndexKind::RTree => "rtree",
        }
    }

    pub fn supports_range(&self) -> bool {
        matches!(self, IndexKind::BTree | IndexKind::Avl)
    }
}

impl FromStr for IndexKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        INDEX_KIND_NAMES
            .get(s.to_ascii_uppercase().as_str())
            .copied()
            .ok_or_else(|| Error::msg(format!("Invalid index kind {}", s)))
    }
}

impl Display for IndexKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct IndexDescriptor {
    pub column: String,
    pub kind: IndexKind,
    pub unique: bool,
}

impl IndexDescriptor {
    pub fn new(column: &str, kind: IndexKind, unique: bool) -> Self {
        Self {
            column: column.to_owned(),
            kind,
            unique,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ColumnDefinition, IndexKind, Schema, TypeId};
    use crate::error::StorageError;

    #[test]
    fn parses_type_aliases() {
        assert_eq!("int".parse::<TypeId>().unwrap(), TypeId::Integer);
        assert_eq!("VARCHAR".parse::<TypeId>().unwrap(), TypeId::Text);
        assert_eq!("double".parse::<TypeId>().unwrap(), TypeId::Decimal);
        assert!("blob".parse::<TypeId>().is_err());
        assert_eq!("isam".parse::<IndexKind>().unwrap(), IndexKind::BTree);
        assert_eq!("RTree".parse::<IndexKind>().unwrap(), IndexKind::RTree);
    }

    #[test]
    fn rejects_duplicate_columns() {
        let schema = Schema::new(vec![
            ColumnDefinition::new(TypeId::Integer, "id", 0, false),
            ColumnDefinition::new(TypeId::Integer, "id", 1, false),
        ]);
        let err = schema.validate().unwrap_err();
        assert!(matches!(
            StorageError::kind_of(&err),
            Some(StorageError::Schema(_))
        ));
    }

    #[test]
    fn payload_width_counts_null_flags() {
        let schema = Schema::new(vec![
            ColumnDefinition::new(TypeId::Integer, "id", 0, false),
            ColumnDefinition::text("name", 1, 20, true),
            ColumnDefinition::new(TypeId::Point, "location", 2, false),
        ]);
        schema.validate().unwrap();
        assert_eq!(schema.payload_width(), 4 + 21 + 16);
    }
}
