use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::info;

use crate::catalog::schema::{IndexDescriptor, IndexKind, Schema};
use crate::common::{RecordOffset, DEFAULT_POINT_CACHE_CAPACITY};
use crate::error::StorageError;
use crate::index::IndexOptions;
use crate::storage::file_manager::FileManager;
use crate::table::{Predicate, TableStore};
use crate::tuple::point::Point;
use crate::tuple::value::Value;
use crate::tuple::Tuple;

pub mod schema;

/// Everything needed to open a data directory.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineConfig {
    pub data_directory: PathBuf,
    /// Points cached per table, 0 disables the cache.
    pub point_cache_capacity: usize,
    /// Used for indexes created from now on.
    pub index_options: IndexOptions,
    /// Rebuild indexes that fail to open instead of refusing the table.
    pub repair_indexes: bool,
}

impl EngineConfig {
    pub fn new(data_directory: impl Into<PathBuf>) -> Self {
        Self {
            data_directory: data_directory.into(),
            point_cache_capacity: DEFAULT_POINT_CACHE_CAPACITY,
            index_options: IndexOptions::default(),
            repair_indexes: false,
        }
    }
}

/// The programmatic surface of the engine. Owns the data directory and every
/// open table.
pub struct Catalog {
    config: EngineConfig,
    file_manager: FileManager,
    tables: DashMap<String, TableStore>,
}

impl Catalog {
    /// Initializes a new data directory. Fails if it already holds tables.
    pub fn create(config: EngineConfig) -> Result<Self> {
        fs::create_dir_all(&config.data_directory).with_context(|| {
            format!(
                "Failed to create data directory {}",
                config.data_directory.display()
            )
        })?;
        let file_manager = FileManager::new(&config.data_directory)?;
        let existing = file_manager.list_tables()?;
        if !existing.is_empty() {
            return Err(StorageError::schema(format!(
                "{} already holds tables: {}",
                config.data_directory.display(),
                existing.join(", ")
            )));
        }
        info!(data = %config.data_directory.display(), "initialized data directory");
        Ok(Self {
            config,
            file_manager,
            tables: DashMap::new(),
        })
    }

    /// Opens an existing data directory and loads every table in it.
    pub fn open(config: EngineConfig) -> Result<Self> {
        let file_manager = FileManager::new(&config.data_directory)?;
        let tables = DashMap::new();
        for name in file_manager.list_tables()? {
            let store = TableStore::open(
                &file_manager,
                &name,
                config.point_cache_capacity,
                config.index_options,
                config.repair_indexes,
            )
            .with_context(|| format!("Failed to load table {name}"))?;
            tables.insert(name, store);
        }
        info!(
            data = %config.data_directory.display(),
            tables = tables.len(),
            "opened data directory"
        );
        Ok(Self {
            config,
            file_manager,
            tables,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn with_table<T>(&self, table: &str, f: impl FnOnce(&TableStore) -> Result<T>) -> Result<T> {
        let store = self
            .tables
            .get(table)
            .ok_or_else(|| StorageError::not_found(format!("table {table}")))?;
        f(store.value())
    }

    fn with_table_mut<T>(
        &self,
        table: &str,
        f: impl FnOnce(&mut TableStore) -> Result<T>,
    ) -> Result<T> {
        let mut store = self
            .tables
            .get_mut(table)
            .ok_or_else(|| StorageError::not_found(format!("table {table}")))?;
        f(store.value_mut())
    }

    pub fn create_table(
        &self,
        name: &str,
        schema: Schema,
        key_column: Option<&str>,
    ) -> Result<()> {
        validate_name("table", name)?;
        for column in schema.columns() {
            validate_name("column", column.column_name())?;
        }
        match self.tables.entry(name.to_owned()) {
            Entry::Occupied(_) => Err(StorageError::schema(format!(
                "table {name} already exists"
            ))),
            Entry::Vacant(entry) => {
                let store = TableStore::create(
                    &self.file_manager,
                    name,
                    schema,
                    key_column,
                    self.config.point_cache_capacity,
                    self.config.index_options,
                )?;
                entry.insert(store);
                Ok(())
            }
        }
    }

    /// Removes the table together with its record, metadata and index files.
    pub fn drop_table(&self, name: &str) -> Result<()> {
        let (_, store) = self
            .tables
            .remove(name)
            .ok_or_else(|| StorageError::not_found(format!("table {name}")))?;
        store.remove_files()
    }

    pub fn list_tables(&self) -> Vec<String> {
        let mut tables: Vec<String> =
            self.tables.iter().map(|entry| entry.key().clone()).collect();
        tables.sort();
        tables
    }

    pub fn schema(&self, table: &str) -> Result<Schema> {
        self.with_table(table, |store| Ok(store.schema().clone()))
    }

    pub fn indexes(&self, table: &str) -> Result<Vec<IndexDescriptor>> {
        self.with_table(table, |store| Ok(store.indexes()))
    }

    pub fn create_index(
        &self,
        table: &str,
        column: &str,
        kind: IndexKind,
        unique: bool,
    ) -> Result<()> {
        self.with_table_mut(table, |store| {
            store.create_index(IndexDescriptor::new(column, kind, unique))
        })
    }

    pub fn drop_index(&self, table: &str, column: &str, kind: IndexKind) -> Result<()> {
        self.with_table_mut(table, |store| store.drop_index(column, kind))
    }

    pub fn rebuild_index(&self, table: &str, column: &str, kind: IndexKind) -> Result<()> {
        self.with_table_mut(table, |store| store.rebuild_index(column, kind))
    }

    pub fn insert_record(&self, table: &str, values: &[Value]) -> Result<RecordOffset> {
        self.with_table_mut(table, |store| store.insert(values))
    }

    pub fn get_record(&self, table: &str, offset: RecordOffset) -> Result<Tuple> {
        self.with_table(table, |store| store.get(offset))
    }

    pub fn scan(&self, table: &str) -> Result<Vec<Tuple>> {
        self.with_table(table, |store| store.scan())
    }

    pub fn update_record(
        &self,
        table: &str,
        offset: RecordOffset,
        values: &[Value],
    ) -> Result<()> {
        self.with_table_mut(table, |store| store.update_record(offset, values))
    }

    pub fn exact_lookup(&self, table: &str, column: &str, key: &Value) -> Result<Vec<Tuple>> {
        self.with_table(table, |store| store.exact_lookup(column, key))
    }

    pub fn range_lookup(
        &self,
        table: &str,
        column: &str,
        low: &Value,
        high: &Value,
    ) -> Result<Vec<Tuple>> {
        self.with_table(table, |store| store.range_lookup(column, low, high))
    }

    pub fn rect_lookup(
        &self,
        table: &str,
        column: &str,
        min: Point,
        max: Point,
    ) -> Result<Vec<Tuple>> {
        self.with_table(table, |store| store.rect_lookup(column, min, max))
    }

    pub fn radius_lookup(
        &self,
        table: &str,
        column: &str,
        center: Point,
        radius: f64,
    ) -> Result<Vec<Tuple>> {
        self.with_table(table, |store| store.radius_lookup(column, center, radius))
    }

    pub fn knn_lookup(
        &self,
        table: &str,
        column: &str,
        center: Point,
        k: usize,
    ) -> Result<Vec<Tuple>> {
        self.with_table(table, |store| store.knn_lookup(column, center, k))
    }

    pub fn knn_with_distance(
        &self,
        table: &str,
        column: &str,
        center: Point,
        k: usize,
    ) -> Result<Vec<(RecordOffset, f64)>> {
        self.with_table_mut(table, |store| store.knn_with_distance(column, center, k))
    }

    pub fn select(&self, table: &str, predicates: &[Predicate]) -> Result<Vec<Tuple>> {
        self.with_table(table, |store| store.select(predicates))
    }

    /// Deletes the records matching every predicate, all records if there are
    /// none. Returns how many were deleted.
    pub fn delete_where(&self, table: &str, predicates: &[Predicate]) -> Result<u64> {
        self.with_table_mut(table, |store| store.delete_where(predicates))
    }

    pub fn verify(&self, table: &str) -> Result<()> {
        self.with_table(table, |store| store.verify())
    }
}

/// Names end up in file names, so they are restricted to ASCII letters,
/// digits and underscores.
fn validate_name(what: &str, name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StorageError::schema(format!("invalid {what} name '{name}'")))
    }
}
