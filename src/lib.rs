pub mod cache;
pub mod catalog;
pub mod common;
pub mod error;
pub mod index;
pub mod printer;
pub mod storage;
pub mod table;
pub mod tuple;

pub use catalog::schema::{ColumnDefinition, IndexDescriptor, IndexKind, Schema, TypeId};
pub use catalog::{Catalog, EngineConfig};
pub use error::StorageError;
pub use index::IndexOptions;
pub use table::{Predicate, TableStore};
pub use tuple::point::Point;
pub use tuple::value::Value;
pub use tuple::Tuple;
