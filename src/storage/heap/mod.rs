pub mod header;
pub mod table;
pub mod tuple;
