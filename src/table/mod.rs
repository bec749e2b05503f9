use std::cmp::Ordering;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::cache::PointCache;
use crate::catalog::schema::{IndexDescriptor, IndexKind, Schema, TypeId};
use crate::common::{RecordOffset, MAX_INDEXES};
use crate::error::StorageError;
use crate::index::{create_index, open_index, Index, IndexOptions};
use crate::storage::file_manager::{DataFile, FileManager};
use crate::storage::heap::header::TableMeta;
use crate::storage::heap::table::HeapFile;
use crate::storage::heap::tuple::{parse_column, parse_record, serialize_record, validate_values};
use crate::tuple::point::Point;
use crate::tuple::value::Value;
use crate::tuple::Tuple;

pub mod predicate;

pub use self::predicate::Predicate;

const EXACT_PREFERENCE: [IndexKind; 4] = [
    IndexKind::Hash,
    IndexKind::BTree,
    IndexKind::Avl,
    IndexKind::RTree,
];
const RANGE_PREFERENCE: [IndexKind; 2] = [IndexKind::BTree, IndexKind::Avl];
const SPATIAL_PREFERENCE: [IndexKind; 1] = [IndexKind::RTree];

struct AttachedIndex {
    descriptor: IndexDescriptor,
    position: usize,
    index: Box<dyn Index>,
}

/// A table: one record file, its metadata and every index attached to it.
///
/// Indexes are kept ordered by (column position, kind) and every insert,
/// update and delete visits them in that order. Record offsets handed out by
/// a lookup always point at live records.
pub struct TableStore {
    file_manager: FileManager,
    options: IndexOptions,
    meta: TableMeta,
    meta_file: DataFile,
    heap: HeapFile,
    indexes: Vec<AttachedIndex>,
    point_cache: PointCache,
}

impl TableStore {
    /// Creates the files of a new, empty table.
    pub fn create(
        file_manager: &FileManager,
        name: &str,
        schema: Schema,
        key_column: Option<&str>,
        point_cache_capacity: usize,
        options: IndexOptions,
    ) -> Result<Self> {
        schema.validate()?;
        let key_column = match key_column {
            Some(column) => Some(schema.column(column)?.column_offset()),
            None => None,
        };
        let meta = TableMeta::new(name, schema, key_column);
        let heap = HeapFile::create(file_manager.table_path(name), meta.schema.payload_width())?;
        let mut meta_file = DataFile::create(file_manager.meta_path(name))?;
        meta_file.overwrite(&meta.serialize())?;
        info!(table = name, "created table");

        Ok(Self {
            file_manager: file_manager.clone(),
            options,
            meta,
            meta_file,
            heap,
            indexes: Vec::new(),
            point_cache: PointCache::new(point_cache_capacity),
        })
    }

    /// Opens an existing table and all of its indexes. With `repair` set, an
    /// index that fails to open is rebuilt from the records instead of
    /// failing the whole table.
    pub fn open(
        file_manager: &FileManager,
        name: &str,
        point_cache_capacity: usize,
        options: IndexOptions,
        repair: bool,
    ) -> Result<Self> {
        let meta_file = DataFile::open(file_manager.meta_path(name))?;
        let meta = TableMeta::parse(&meta_file.read_all()?)
            .with_context(|| format!("Failed to load metadata of table {name}"))?;
        if meta.name != name {
            return Err(StorageError::corruption(format!(
                "metadata file of {name} describes table {}",
                meta.name
            )));
        }
        let heap = HeapFile::open(file_manager.table_path(name), meta.schema.payload_width())?;

        let mut store = Self {
            file_manager: file_manager.clone(),
            options,
            meta,
            meta_file,
            heap,
            indexes: Vec::new(),
            point_cache: PointCache::new(point_cache_capacity),
        };
        for descriptor in store.meta.indexes.clone() {
            let position = store.column_position(&descriptor.column)?;
            let column = &store.meta.schema.columns()[position];
            let index = match open_index(file_manager, name, &descriptor, column) {
                Ok(index) => index,
                Err(err) if repair => {
                    warn!(
                        table = name,
                        column = %descriptor.column,
                        kind = %descriptor.kind,
                        "rebuilding index that failed to open: {err:#}"
                    );
                    store.build_index(&descriptor, position)?
                }
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!(
                            "Failed to open {} index on {name}.{}",
                            descriptor.kind, descriptor.column
                        )
                    })
                }
            };
            store.attach(descriptor, position, index);
        }
        debug!(
            table = name,
            records = store.meta.live_count,
            indexes = store.indexes.len(),
            "opened table"
        );
        Ok(store)
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn schema(&self) -> &Schema {
        &self.meta.schema
    }

    pub fn key_column(&self) -> Option<&str> {
        self.meta
            .key_column
            .map(|position| self.meta.schema.columns()[position as usize].column_name())
    }

    pub fn indexes(&self) -> Vec<IndexDescriptor> {
        self.indexes
            .iter()
            .map(|attached| attached.descriptor.clone())
            .collect()
    }

    /// Number of live records.
    pub fn len(&self) -> u64 {
        self.meta.live_count
    }

    pub fn is_empty(&self) -> bool {
        self.meta.live_count == 0
    }

    pub fn point_cache(&self) -> &PointCache {
        &self.point_cache
    }

    fn column_position(&self, column: &str) -> Result<usize> {
        self.meta
            .schema
            .column(column)
            .map(|definition| definition.column_offset() as usize)
            .with_context(|| format!("Table {} has no such column", self.meta.name))
    }

    fn persist_meta(&mut self) -> Result<()> {
        self.meta_file.overwrite(&self.meta.serialize())
    }

    fn attach(&mut self, descriptor: IndexDescriptor, position: usize, index: Box<dyn Index>) {
        let at = self.indexes.partition_point(|other| {
            (other.position, other.descriptor.kind) < (position, descriptor.kind)
        });
        self.indexes.insert(
            at,
            AttachedIndex {
                descriptor,
                position,
                index,
            },
        );
    }

    /// Validates a row and returns its payload together with the values as
    /// they will read back.
    fn encode(&self, values: &[Value]) -> Result<(Vec<u8>, Vec<Value>)> {
        validate_values(values, &self.meta.schema)?;
        let mut payload = vec![0u8; self.meta.schema.payload_width()];
        serialize_record(&mut payload, values, &self.meta.schema);
        let normalized = parse_record(&payload, &self.meta.schema);
        Ok((payload, normalized))
    }

    /// Columns whose values must be unique: the key column and every column
    /// with a unique index.
    fn unique_columns(&self) -> Vec<usize> {
        let mut columns: Vec<usize> = self
            .indexes
            .iter()
            .filter(|attached| attached.descriptor.unique)
            .map(|attached| attached.position)
            .chain(self.meta.key_column.map(|position| position as usize))
            .collect();
        columns.sort_unstable();
        columns.dedup();
        columns
    }

    fn check_unique(&self, values: &[Value], ignore: Option<RecordOffset>) -> Result<()> {
        for position in self.unique_columns() {
            let value = &values[position];
            if value.is_null() {
                continue;
            }
            let holders = self.find_equal(position, value)?;
            if holders.iter().any(|offset| Some(*offset) != ignore) {
                return Err(StorageError::duplicate_key(format!(
                    "{}.{} already holds {}",
                    self.meta.name,
                    self.meta.schema.columns()[position].column_name(),
                    value
                )));
            }
        }
        Ok(())
    }

    /// Offsets of the records whose column equals `value`, through an index
    /// when the column has one, else by scanning.
    fn find_equal(&self, position: usize, value: &Value) -> Result<Vec<RecordOffset>> {
        let indexed = EXACT_PREFERENCE
            .iter()
            .find_map(|kind| self.attached_at(position, *kind));
        if let Some(attached) = indexed {
            return attached.index.search(value);
        }
        let mut found = Vec::new();
        for record in self.heap.iter() {
            let (offset, payload) = record?;
            let stored = parse_column(&payload, &self.meta.schema, position);
            if !stored.is_null() && stored.total_cmp(value) == Ordering::Equal {
                found.push(offset);
            }
        }
        Ok(found)
    }

    fn point_columns(&self) -> impl Iterator<Item = usize> + '_ {
        self.meta
            .schema
            .columns()
            .iter()
            .filter(|column| column.type_id() == TypeId::Point)
            .map(|column| column.column_offset() as usize)
    }

    /// Stores a new record and adds it to every index. Returns its offset.
    pub fn insert(&mut self, values: &[Value]) -> Result<RecordOffset> {
        let (payload, values) = self.encode(values)?;
        self.check_unique(&values, None)?;

        let offset = self
            .heap
            .insert_record(&payload, &mut self.meta.free_list_head)?;
        self.meta.live_count += 1;
        self.persist_meta()?;

        for attached in self.indexes.iter_mut() {
            let key = &values[attached.position];
            if key.is_null() {
                continue;
            }
            attached.index.insert(key, offset).with_context(|| {
                format!(
                    "Failed to add record {offset} to {} index on {}",
                    attached.descriptor.kind, attached.descriptor.column
                )
            })?;
        }
        for position in self.point_columns().collect::<Vec<_>>() {
            if let Some(point) = values[position].as_point() {
                self.point_cache.insert(position, offset, point);
            }
        }
        debug!(table = %self.meta.name, offset, "inserted record");
        Ok(offset)
    }

    pub fn get(&self, offset: RecordOffset) -> Result<Tuple> {
        let payload = self
            .heap
            .read_record(offset)?
            .ok_or_else(|| StorageError::not_found(format!("record at offset {offset}")))?;
        Ok(Tuple::new(offset, parse_record(&payload, &self.meta.schema)))
    }

    /// Every live record in offset order.
    pub fn scan(&self) -> Result<Vec<Tuple>> {
        self.heap
            .iter()
            .map(|record| {
                let (offset, payload) = record?;
                Ok(Tuple::new(offset, parse_record(&payload, &self.meta.schema)))
            })
            .collect()
    }

    fn materialize(&self, offsets: &[RecordOffset]) -> Result<Vec<Tuple>> {
        offsets
            .iter()
            .map(|offset| {
                let payload = self.heap.read_record(*offset)?.ok_or_else(|| {
                    StorageError::corruption(format!(
                        "an index of {} points at free slot {offset}",
                        self.meta.name
                    ))
                })?;
                Ok(Tuple::new(*offset, parse_record(&payload, &self.meta.schema)))
            })
            .collect()
    }

    /// Picks the first index on `column` whose kind appears in `preference`.
    fn pick_index(
        &self,
        column: &str,
        preference: &[IndexKind],
        operation: &str,
    ) -> Result<&dyn Index> {
        let position = self.column_position(column)?;
        preference
            .iter()
            .find_map(|kind| self.attached_at(position, *kind))
            .map(|attached| attached.index.as_ref())
            .ok_or_else(|| {
                StorageError::unsupported(format!(
                    "no index on {}.{column} answers {operation}",
                    self.meta.name
                ))
            })
    }

    fn is_point_column(&self, column: &str) -> Result<bool> {
        Ok(self.meta.schema.column(column)?.type_id() == TypeId::Point)
    }

    /// Runs one predicate against its index. Offsets come back in the order
    /// the index produces them.
    fn resolve(&self, predicate: &Predicate) -> Result<Vec<RecordOffset>> {
        match predicate {
            Predicate::Equals { column, value } => self
                .pick_index(column, &EXACT_PREFERENCE, "exact lookups")?
                .search(value),
            Predicate::Between { column, low, high } => {
                let preference: &[IndexKind] = if self.is_point_column(column)? {
                    &SPATIAL_PREFERENCE
                } else {
                    &RANGE_PREFERENCE
                };
                self.pick_index(column, preference, "range lookups")?
                    .range_search(low, high)
            }
            Predicate::WithinRadius {
                column,
                center,
                radius,
            } => self
                .pick_index(column, &SPATIAL_PREFERENCE, "radius lookups")?
                .radius_search(center, *radius),
            Predicate::Nearest { column, center, k } => self
                .pick_index(column, &SPATIAL_PREFERENCE, "nearest neighbour lookups")?
                .knn_search(center, *k),
            Predicate::WithinRect { column, min, max } => self
                .pick_index(column, &SPATIAL_PREFERENCE, "rectangle lookups")?
                .range_search(&Value::Point(*min), &Value::Point(*max)),
        }
    }

    /// Offsets matching every predicate. A single predicate keeps its index
    /// order; several are intersected in ascending offset order. No
    /// predicates at all match every live record.
    fn matching_offsets(&self, predicates: &[Predicate]) -> Result<Vec<RecordOffset>> {
        match predicates {
            [] => self
                .heap
                .iter()
                .map(|record| record.map(|(offset, _)| offset))
                .collect(),
            [predicate] => self.resolve(predicate),
            [first, rest @ ..] => {
                let mut offsets = sorted(self.resolve(first)?);
                for predicate in rest {
                    if offsets.is_empty() {
                        break;
                    }
                    let other = sorted(self.resolve(predicate)?);
                    offsets = intersect(&offsets, &other);
                }
                Ok(offsets)
            }
        }
    }

    pub fn exact_lookup(&self, column: &str, key: &Value) -> Result<Vec<Tuple>> {
        self.select(&[Predicate::equals(column, key.clone())])
    }

    pub fn range_lookup(&self, column: &str, low: &Value, high: &Value) -> Result<Vec<Tuple>> {
        self.select(&[Predicate::between(column, low.clone(), high.clone())])
    }

    pub fn rect_lookup(&self, column: &str, min: Point, max: Point) -> Result<Vec<Tuple>> {
        self.select(&[Predicate::within_rect(column, min, max)])
    }

    pub fn radius_lookup(&self, column: &str, center: Point, radius: f64) -> Result<Vec<Tuple>> {
        self.select(&[Predicate::within_radius(column, center, radius)])
    }

    /// The `k` records nearest to `center`, nearest first.
    pub fn knn_lookup(&self, column: &str, center: Point, k: usize) -> Result<Vec<Tuple>> {
        self.select(&[Predicate::nearest(column, center, k)])
    }

    /// Like `knn_lookup`, but returns offsets with their distance to
    /// `center`. Points are read through the point cache.
    pub fn knn_with_distance(
        &mut self,
        column: &str,
        center: Point,
        k: usize,
    ) -> Result<Vec<(RecordOffset, f64)>> {
        let position = self.column_position(column)?;
        let offsets = self.resolve(&Predicate::nearest(column, center, k))?;
        offsets
            .into_iter()
            .map(|offset| {
                let point = self.point_at(position, offset)?;
                Ok((offset, point.distance_to(&center)))
            })
            .collect()
    }

    fn point_at(&mut self, position: usize, offset: RecordOffset) -> Result<Point> {
        if let Some(point) = self.point_cache.get(position, offset) {
            return Ok(point);
        }
        let payload = self
            .heap
            .read_record(offset)?
            .ok_or_else(|| StorageError::not_found(format!("record at offset {offset}")))?;
        let point = parse_column(&payload, &self.meta.schema, position)
            .as_point()
            .ok_or_else(|| {
                StorageError::corruption(format!(
                    "record {offset} holds no point in column {position}"
                ))
            })?;
        self.point_cache.insert(position, offset, point);
        Ok(point)
    }

    pub fn select(&self, predicates: &[Predicate]) -> Result<Vec<Tuple>> {
        let offsets = self.matching_offsets(predicates)?;
        self.materialize(&offsets)
    }

    /// Deletes every record matching all predicates and returns how many went.
    pub fn delete_where(&mut self, predicates: &[Predicate]) -> Result<u64> {
        let offsets = sorted(self.matching_offsets(predicates)?);
        for offset in &offsets {
            self.delete_record(*offset)?;
        }
        if !offsets.is_empty() {
            info!(table = %self.meta.name, deleted = offsets.len(), "deleted records");
        }
        Ok(offsets.len() as u64)
    }

    /// Removes the record from every index, then frees its slot.
    pub fn delete_record(&mut self, offset: RecordOffset) -> Result<()> {
        let values = self.get(offset)?.into_values();
        for attached in self.indexes.iter_mut() {
            let key = &values[attached.position];
            if key.is_null() {
                continue;
            }
            if !attached.index.remove(key, offset)? {
                warn!(
                    table = %self.meta.name,
                    column = %attached.descriptor.column,
                    kind = %attached.descriptor.kind,
                    offset,
                    "record was missing from index"
                );
            }
        }
        for position in self.point_columns().collect::<Vec<_>>() {
            self.point_cache.invalidate(position, offset);
        }
        self.heap
            .free_record(offset, &mut self.meta.free_list_head)?;
        self.meta.live_count -= 1;
        self.persist_meta()
    }

    /// Rewrites a live record in place and moves it between index keys where
    /// its values changed.
    pub fn update_record(&mut self, offset: RecordOffset, values: &[Value]) -> Result<()> {
        let (payload, values) = self.encode(values)?;
        let old = self.get(offset)?.into_values();
        self.check_unique(&values, Some(offset))?;

        for attached in self.indexes.iter_mut() {
            let before = &old[attached.position];
            let after = &values[attached.position];
            if before.is_null() == after.is_null() && before.total_cmp(after) == Ordering::Equal {
                continue;
            }
            if !before.is_null() {
                attached.index.remove(before, offset)?;
            }
            if !after.is_null() {
                attached.index.insert(after, offset)?;
            }
        }
        self.heap.update_record(offset, &payload)?;
        for position in self.point_columns().collect::<Vec<_>>() {
            self.point_cache.invalidate(position, offset);
            if let Some(point) = values[position].as_point() {
                self.point_cache.insert(position, offset, point);
            }
        }
        debug!(table = %self.meta.name, offset, "updated record");
        Ok(())
    }

    /// Creates a fresh index file and loads every live record into it. The
    /// files are removed again if loading fails.
    fn build_index(&self, descriptor: &IndexDescriptor, position: usize) -> Result<Box<dyn Index>> {
        let name = self.meta.name.clone();
        self.file_manager
            .remove_index_files(&name, &descriptor.column, descriptor.kind)?;
        let column = &self.meta.schema.columns()[position];
        let mut index = create_index(&self.file_manager, &name, descriptor, column, &self.options)?;

        let loaded = self.heap.iter().try_for_each(|record| {
            let (offset, payload) = record?;
            let key = parse_column(&payload, &self.meta.schema, position);
            if key.is_null() {
                return Ok(());
            }
            index.insert(&key, offset)
        });
        if let Err(err) = loaded {
            drop(index);
            self.file_manager
                .remove_index_files(&name, &descriptor.column, descriptor.kind)?;
            return Err(err).with_context(|| {
                format!(
                    "Failed to build {} index on {name}.{}",
                    descriptor.kind, descriptor.column
                )
            });
        }
        Ok(index)
    }

    fn find_attached(&self, column: &str, kind: IndexKind) -> Option<usize> {
        self.indexes.iter().position(|attached| {
            attached.descriptor.column == column && attached.descriptor.kind == kind
        })
    }

    fn attached_at(&self, position: usize, kind: IndexKind) -> Option<&AttachedIndex> {
        self.indexes
            .iter()
            .find(|attached| attached.position == position && attached.descriptor.kind == kind)
    }

    /// Attaches a new index to the table and fills it from the existing records.
    pub fn create_index(&mut self, descriptor: IndexDescriptor) -> Result<()> {
        let position = self.column_position(&descriptor.column)?;
        if self.find_attached(&descriptor.column, descriptor.kind).is_some() {
            return Err(StorageError::schema(format!(
                "{}.{} already has a {} index",
                self.meta.name, descriptor.column, descriptor.kind
            )));
        }
        if self.meta.indexes.len() >= MAX_INDEXES {
            return Err(StorageError::capacity(format!(
                "{} already has {MAX_INDEXES} indexes",
                self.meta.name
            )));
        }
        let index = self.build_index(&descriptor, position)?;
        self.meta.indexes.push(descriptor.clone());
        self.persist_meta()?;
        info!(
            table = %self.meta.name,
            column = %descriptor.column,
            kind = %descriptor.kind,
            unique = descriptor.unique,
            entries = index.len(),
            "created index"
        );
        self.attach(descriptor, position, index);
        Ok(())
    }

    pub fn drop_index(&mut self, column: &str, kind: IndexKind) -> Result<()> {
        let at = self.find_attached(column, kind).ok_or_else(|| {
            StorageError::not_found(format!("{kind} index on {}.{column}", self.meta.name))
        })?;
        let attached = self.indexes.remove(at);
        drop(attached.index);
        self.meta
            .indexes
            .retain(|descriptor| !(descriptor.column == column && descriptor.kind == kind));
        self.persist_meta()?;
        self.file_manager
            .remove_index_files(&self.meta.name, column, kind)?;
        info!(table = %self.meta.name, column, %kind, "dropped index");
        Ok(())
    }

    /// Throws the index files away and builds them again from the records.
    pub fn rebuild_index(&mut self, column: &str, kind: IndexKind) -> Result<()> {
        let at = self.find_attached(column, kind).ok_or_else(|| {
            StorageError::not_found(format!("{kind} index on {}.{column}", self.meta.name))
        })?;
        let AttachedIndex {
            descriptor,
            position,
            index,
        } = self.indexes.remove(at);
        drop(index);
        let index = self.build_index(&descriptor, position)?;
        info!(
            table = %self.meta.name,
            column,
            %kind,
            entries = index.len(),
            "rebuilt index"
        );
        self.attach(descriptor, position, index);
        Ok(())
    }

    /// Checks the live count and the structure and contents of every index.
    pub fn verify(&self) -> Result<()> {
        let mut live = 0u64;
        let mut non_null = vec![0u64; self.meta.schema.columns().len()];
        for record in self.heap.iter() {
            let (_, payload) = record?;
            live += 1;
            for (position, count) in non_null.iter_mut().enumerate() {
                if !parse_column(&payload, &self.meta.schema, position).is_null() {
                    *count += 1;
                }
            }
        }
        if live != self.meta.live_count {
            return Err(StorageError::corruption(format!(
                "{} counts {} live records but holds {live}",
                self.meta.name, self.meta.live_count
            )));
        }
        for attached in &self.indexes {
            let IndexDescriptor { column, kind, .. } = &attached.descriptor;
            attached.index.check_invariants().with_context(|| {
                format!("{kind} index on {}.{column} is broken", self.meta.name)
            })?;
            if attached.index.len() != non_null[attached.position] {
                return Err(StorageError::corruption(format!(
                    "{kind} index on {}.{column} holds {} entries for {} records",
                    self.meta.name,
                    attached.index.len(),
                    non_null[attached.position]
                )));
            }
        }
        Ok(())
    }

    /// Closes the table and removes all of its files.
    pub fn remove_files(self) -> Result<()> {
        let Self {
            file_manager,
            meta,
            indexes,
            ..
        } = self;
        for attached in indexes {
            drop(attached.index);
            let IndexDescriptor { column, kind, .. } = &attached.descriptor;
            file_manager.remove_index_files(&meta.name, column, *kind)?;
        }
        file_manager.remove_table_files(&meta.name)?;
        info!(table = %meta.name, "dropped table");
        Ok(())
    }
}

fn sorted(mut offsets: Vec<RecordOffset>) -> Vec<RecordOffset> {
    offsets.sort_unstable();
    offsets.dedup();
    offsets
}

/// Intersection of two ascending offset lists.
fn intersect(left: &[RecordOffset], right: &[RecordOffset]) -> Vec<RecordOffset> {
    let mut result = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < left.len() && j < right.len() {
        match left[i].cmp(&right[j]) {
            Ordering::Less => i += 1,
            Ordering::Greater => j += 1,
            Ordering::Equal => {
                result.push(left[i]);
                i += 1;
                j += 1;
            }
        }
    }
    result
}
