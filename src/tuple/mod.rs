use self::value::Value;
use crate::common::RecordOffset;

pub mod point;
pub mod value;

/// A materialized record. `tuple_id` is the record offset it was read from.
#[derive(Clone, Debug, PartialEq)]
pub struct Tuple {
    pub tuple_id: RecordOffset,
    values: Vec<Value>,
}

impl Tuple {
    pub fn new(tuple_id: RecordOffset, values: Vec<Value>) -> Self {
        Self { tuple_id, values }
    }

    pub fn has_null(&self) -> bool {
        self.values.iter().any(|val| val.is_null())
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn value(&self, column: usize) -> &Value {
        &self.values[column]
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}
