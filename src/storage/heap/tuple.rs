use anyhow::Result;

use crate::catalog::schema::Schema;
use crate::error::StorageError;
use crate::tuple::value::Value;

const NULL_FLAG: u8 = 1;

/// Checks a row against the schema before it is encoded.
pub fn validate_values(values: &[Value], schema: &Schema) -> Result<()> {
    if values.len() != schema.columns().len() {
        return Err(StorageError::schema(format!(
            "Expected {} values but got {}",
            schema.columns().len(),
            values.len()
        )));
    }
    for (value, column) in values.iter().zip(schema.columns()) {
        value.check_column(column)?;
    }
    Ok(())
}

/// Parses the payload of a record slot, i.e. without the tombstone byte.
pub fn parse_record(bytes: &[u8], schema: &Schema) -> Vec<Value> {
    let mut offset = 0;
    let mut values = Vec::with_capacity(schema.columns().len());
    for column in schema.columns() {
        let is_null = column.nullable() && bytes[offset] == NULL_FLAG;
        if column.nullable() {
            offset += 1;
        }
        let width = column.width() as usize;
        let value = if is_null {
            Value::Null
        } else {
            Value::parse_value(&bytes[offset..offset + width], column.type_id(), width)
        };
        offset += width;
        values.push(value);
    }
    values
}

/// Parses a single column of a record payload without decoding the others.
pub fn parse_column(bytes: &[u8], schema: &Schema, column: usize) -> Value {
    let offset: usize = schema.columns()[..column]
        .iter()
        .map(|col| col.slot_width())
        .sum();
    let definition = &schema.columns()[column];
    let mut offset = offset;
    if definition.nullable() {
        if bytes[offset] == NULL_FLAG {
            return Value::Null;
        }
        offset += 1;
    }
    let width = definition.width() as usize;
    Value::parse_value(&bytes[offset..offset + width], definition.type_id(), width)
}

/// Serializes validated values into a record payload.
pub fn serialize_record(buffer: &mut [u8], values: &[Value], schema: &Schema) {
    let mut offset = 0;
    for (value, column) in values.iter().zip(schema.columns()) {
        if column.nullable() {
            buffer[offset] = if value.is_null() { NULL_FLAG } else { 0 };
            offset += 1;
        }
        let width = column.width() as usize;
        value.serialize_value(&mut buffer[offset..offset + width], width);
        offset += width;
    }
}
