use anyhow::Result;
use rand::Rng;
use tempfile::{tempdir, TempDir};

use indexdb::{
    Catalog, ColumnDefinition, EngineConfig, IndexKind, IndexOptions, Point, Predicate, Schema,
    StorageError, Tuple, TypeId, Value,
};

fn config(dir: &TempDir) -> EngineConfig {
    let mut config = EngineConfig::new(dir.path());
    config.point_cache_capacity = 32;
    config.index_options = IndexOptions {
        btree_order: 4,
        hash_bucket_capacity: 2,
        rtree_node_capacity: 4,
    };
    config
}

fn restaurants_schema() -> Schema {
    Schema::new(vec![
        ColumnDefinition::new(TypeId::Integer, "id", 0, false),
        ColumnDefinition::text("name", 1, 16, false),
        ColumnDefinition::new(TypeId::Decimal, "rating", 2, true),
        ColumnDefinition::new(TypeId::Point, "location", 3, false),
    ])
}

fn restaurant(id: i32, name: &str, rating: Option<f64>, x: f64, y: f64) -> Vec<Value> {
    vec![
        Value::Integer(id),
        Value::Text(name.to_owned()),
        rating.map_or(Value::Null, Value::Decimal),
        Value::Point(Point::new(x, y)),
    ]
}

fn ids(tuples: &[Tuple]) -> Vec<i32> {
    tuples.iter().map(|tuple| tuple.value(0).as_i32().unwrap()).collect()
}

fn sorted_ids(tuples: &[Tuple]) -> Vec<i32> {
    let mut ids = ids(tuples);
    ids.sort();
    ids
}

fn kind_of(err: &anyhow::Error) -> StorageError {
    StorageError::kind_of(err)
        .cloned()
        .unwrap_or_else(|| panic!("no storage error in {err:#}"))
}

fn setup(dir: &TempDir) -> Result<Catalog> {
    let catalog = Catalog::create(config(dir))?;
    catalog.create_table("restaurants", restaurants_schema(), Some("id"))?;
    catalog.create_index("restaurants", "id", IndexKind::BTree, true)?;
    catalog.create_index("restaurants", "name", IndexKind::Hash, false)?;
    catalog.create_index("restaurants", "rating", IndexKind::Avl, false)?;
    catalog.create_index("restaurants", "location", IndexKind::RTree, false)?;
    Ok(catalog)
}

#[test]
fn btree_range_before_and_after_delete() -> Result<()> {
    let dir = tempdir()?;
    let catalog = setup(&dir)?;
    for id in 1..=10 {
        catalog.insert_record("restaurants", &restaurant(id, "r", None, 0.0, 0.0))?;
    }
    let range = |catalog: &Catalog| {
        catalog.range_lookup("restaurants", "id", &Value::Integer(3), &Value::Integer(7))
    };
    assert_eq!(ids(&range(&catalog)?), vec![3, 4, 5, 6, 7]);

    let five = Predicate::equals("id", Value::Integer(5));
    let deleted = catalog.delete_where("restaurants", &[five])?;
    assert_eq!(deleted, 1);
    assert_eq!(ids(&range(&catalog)?), vec![3, 4, 6, 7]);
    catalog.verify("restaurants")
}

#[test]
fn hash_lookups_survive_bucket_splits() -> Result<()> {
    let dir = tempdir()?;
    let catalog = setup(&dir)?;
    let names = ["ant", "bee", "cat", "dog", "eel", "fox", "gnu", "hen"];
    for (id, name) in names.iter().enumerate() {
        catalog.insert_record("restaurants", &restaurant(id as i32, name, None, 0.0, 0.0))?;
    }
    for (id, name) in names.iter().enumerate() {
        let found = catalog.exact_lookup("restaurants", "name", &Value::Text(name.to_string()))?;
        assert_eq!(ids(&found), vec![id as i32]);
    }
    catalog.verify("restaurants")
}

#[test]
fn spatial_radius_and_nearest() -> Result<()> {
    let dir = tempdir()?;
    let catalog = setup(&dir)?;
    catalog.insert_record("restaurants", &restaurant(1, "origin", None, 0.0, 0.0))?;
    catalog.insert_record("restaurants", &restaurant(2, "near", None, 1.0, 1.0))?;
    catalog.insert_record("restaurants", &restaurant(3, "far", None, 10.0, 10.0))?;

    let within = catalog.radius_lookup("restaurants", "location", Point::origin(), 2.0)?;
    assert_eq!(sorted_ids(&within), vec![1, 2]);
    let nearest = catalog.knn_lookup("restaurants", "location", Point::origin(), 1)?;
    assert_eq!(ids(&nearest), vec![1]);

    let with_distance =
        catalog.knn_with_distance("restaurants", "location", Point::new(10.0, 7.0), 2)?;
    assert_eq!(with_distance.len(), 2);
    assert_eq!(with_distance[0].1, 3.0);
    assert!(with_distance[0].1 <= with_distance[1].1);

    let (min, max) = (Point::new(0.5, 0.5), Point::new(20.0, 20.0));
    let inside = catalog.rect_lookup("restaurants", "location", min, max)?;
    assert_eq!(sorted_ids(&inside), vec![2, 3]);
    Ok(())
}

#[test]
fn queries_return_the_same_after_reopen() -> Result<()> {
    let dir = tempdir()?;
    let catalog = setup(&dir)?;
    let mut rng = rand::thread_rng();
    for id in 0..200 {
        let rating = if id % 7 == 0 {
            None
        } else {
            Some(rng.gen_range(0..50) as f64 / 10.0)
        };
        let (x, y) = (rng.gen_range(-100.0..100.0), rng.gen_range(-100.0..100.0));
        let name = format!("r{}", id % 13);
        catalog.insert_record("restaurants", &restaurant(id, &name, rating, x, y))?;
    }
    let middle = Predicate::between("id", Value::Integer(50), Value::Integer(80));
    catalog.delete_where("restaurants", &[middle])?;

    let queries = |catalog: &Catalog| -> Result<Vec<Vec<Tuple>>> {
        Ok(vec![
            catalog.exact_lookup("restaurants", "name", &Value::Text("r4".to_owned()))?,
            catalog.range_lookup(
                "restaurants",
                "rating",
                &Value::Decimal(1.0),
                &Value::Decimal(3.5),
            )?,
            catalog.radius_lookup("restaurants", "location", Point::new(10.0, -10.0), 40.0)?,
            catalog.knn_lookup("restaurants", "location", Point::new(-50.0, 50.0), 5)?,
            catalog.scan("restaurants")?,
        ])
    };
    let before = queries(&catalog)?;
    drop(catalog);

    let catalog = Catalog::open(config(&dir))?;
    assert_eq!(catalog.indexes("restaurants")?.len(), 4);
    assert_eq!(queries(&catalog)?, before);
    assert_eq!(before[4].len(), 200 - 31);
    catalog.verify("restaurants")
}

#[test]
fn multiple_predicates_intersect() -> Result<()> {
    let dir = tempdir()?;
    let catalog = setup(&dir)?;
    for id in 0..30 {
        let name = if id % 3 == 0 { "fizz" } else { "plain" };
        let row = restaurant(id, name, Some((id % 5) as f64), id as f64, 0.0);
        catalog.insert_record("restaurants", &row)?;
    }
    let selected = catalog.select(
        "restaurants",
        &[
            Predicate::equals("name", Value::Text("fizz".to_owned())),
            Predicate::between("rating", Value::Decimal(1.0), Value::Decimal(2.0)),
            Predicate::within_radius("location", Point::origin(), 20.0),
        ],
    )?;
    // fizz: multiples of 3, rating 1 or 2: id % 5 in {1, 2}, within 20 of origin
    assert_eq!(ids(&selected), vec![6, 12]);

    let offsets: Vec<u64> = selected.iter().map(|tuple| tuple.tuple_id).collect();
    let mut ascending = offsets.clone();
    ascending.sort();
    assert_eq!(offsets, ascending);
    Ok(())
}

#[test]
fn delete_without_predicates_empties_the_table() -> Result<()> {
    let dir = tempdir()?;
    let catalog = setup(&dir)?;
    for id in 0..12 {
        catalog.insert_record("restaurants", &restaurant(id, "x", Some(1.0), 1.0, 1.0))?;
    }
    assert_eq!(catalog.delete_where("restaurants", &[])?, 12);
    assert!(catalog.scan("restaurants")?.is_empty());
    assert!(catalog.knn_lookup("restaurants", "location", Point::origin(), 3)?.is_empty());
    catalog.verify("restaurants")?;

    let offset = catalog.insert_record("restaurants", &restaurant(99, "back", None, 0.0, 0.0))?;
    assert_eq!(catalog.get_record("restaurants", offset)?.value(0), &Value::Integer(99));
    Ok(())
}

#[test]
fn update_rekeys_every_index() -> Result<()> {
    let dir = tempdir()?;
    let catalog = setup(&dir)?;
    let old = restaurant(1, "old", Some(2.0), 0.0, 0.0);
    let offset = catalog.insert_record("restaurants", &old)?;
    catalog.update_record("restaurants", offset, &restaurant(7, "new", None, 5.0, 5.0))?;

    assert!(catalog.exact_lookup("restaurants", "id", &Value::Integer(1))?.is_empty());
    assert_eq!(ids(&catalog.exact_lookup("restaurants", "id", &Value::Integer(7))?), vec![7]);
    assert!(catalog
        .exact_lookup("restaurants", "name", &Value::Text("old".to_owned()))?
        .is_empty());
    assert!(catalog
        .range_lookup("restaurants", "rating", &Value::Decimal(0.0), &Value::Decimal(9.0))?
        .is_empty());
    let nearest = catalog.knn_with_distance("restaurants", "location", Point::origin(), 1)?;
    assert_eq!(nearest, vec![(offset, 50f64.sqrt())]);
    catalog.verify("restaurants")
}

#[test]
fn errors_carry_their_kind() -> Result<()> {
    let dir = tempdir()?;
    let catalog = setup(&dir)?;
    catalog.insert_record("restaurants", &restaurant(1, "a", None, 0.0, 0.0))?;

    let err = catalog
        .insert_record("restaurants", &restaurant(1, "b", None, 0.0, 0.0))
        .unwrap_err();
    assert!(matches!(kind_of(&err), StorageError::DuplicateKey(_)));

    let err = catalog
        .range_lookup("restaurants", "name", &Value::Integer(1), &Value::Integer(2))
        .unwrap_err();
    assert!(matches!(kind_of(&err), StorageError::UnsupportedOperation(_)));

    let err = catalog
        .exact_lookup("restaurants", "id", &Value::Text("1".to_owned()))
        .unwrap_err();
    assert!(matches!(kind_of(&err), StorageError::Schema(_)));

    let err = catalog
        .create_index("restaurants", "name", IndexKind::RTree, false)
        .unwrap_err();
    assert!(matches!(kind_of(&err), StorageError::Schema(_)));

    let err = catalog.get_record("restaurants", 1 << 20).unwrap_err();
    assert!(matches!(kind_of(&err), StorageError::NotFound(_)));

    let err = catalog.scan("nowhere").unwrap_err();
    assert!(matches!(kind_of(&err), StorageError::NotFound(_)));

    let err = catalog
        .radius_lookup("restaurants", "location", Point::origin(), -1.0)
        .unwrap_err();
    assert!(matches!(kind_of(&err), StorageError::Schema(_)));

    // nothing above may have changed the table
    assert_eq!(catalog.scan("restaurants")?.len(), 1);
    catalog.verify("restaurants")
}

#[test]
fn drop_table_removes_its_files() -> Result<()> {
    let dir = tempdir()?;
    let catalog = setup(&dir)?;
    catalog.insert_record("restaurants", &restaurant(1, "a", Some(1.0), 0.0, 0.0))?;
    catalog.drop_table("restaurants")?;
    assert!(catalog.list_tables().is_empty());
    assert_eq!(std::fs::read_dir(dir.path())?.count(), 0);

    catalog.create_table("restaurants", restaurants_schema(), None)?;
    assert!(catalog.indexes("restaurants")?.is_empty());
    Ok(())
}
