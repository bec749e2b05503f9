use std::cmp::Ordering;
use std::fmt::Display;

use anyhow::Result;

use super::point::Point;
use crate::catalog::schema::{ColumnDefinition, TypeId};
use crate::error::StorageError;

#[derive(Clone, PartialEq, Debug)]
pub enum Value {
    Integer(i32),
    Decimal(f64),
    Text(String),
    Boolean(bool),
    /// Seconds since the unix epoch.
    Date(i64),
    Point(Point),
    Null,
}

impl Value {
    /// parses a non-null value of the given type from exactly `width` bytes
    pub fn parse_value(bytes: &[u8], type_id: TypeId, width: usize) -> Self {
        match type_id {
            TypeId::Integer => Value::Integer(i32::from_be_bytes(bytes[..4].try_into().unwrap())),
            TypeId::Decimal => Value::Decimal(f64::from_be_bytes(bytes[..8].try_into().unwrap())),
            TypeId::Text => {
                let raw = &bytes[..width];
                let len = raw.iter().rposition(|b| *b != 0).map_or(0, |pos| pos + 1);
                Value::Text(String::from_utf8_lossy(&raw[..len]).into_owned())
            }
            TypeId::Boolean => Value::Boolean(bytes[0] == 1),
            TypeId::Date => Value::Date(i64::from_be_bytes(bytes[..8].try_into().unwrap())),
            TypeId::Point => {
                let x = f64::from_be_bytes(bytes[..8].try_into().unwrap());
                let y = f64::from_be_bytes(bytes[8..16].try_into().unwrap());
                Value::Point(Point::new(x, y))
            }
        }
    }

    /// Writes the value into `buffer[..width]`. Text is zero padded, or cut at
    /// the last character boundary that fits.
    pub fn serialize_value(&self, buffer: &mut [u8], width: usize) {
        match self {
            Value::Integer(val) => buffer[..4].copy_from_slice(val.to_be_bytes().as_slice()),
            Value::Decimal(val) => buffer[..8].copy_from_slice(val.to_be_bytes().as_slice()),
            Value::Text(val) => {
                let bytes = truncate_to_width(val, width).as_bytes();
                buffer[..bytes.len()].copy_from_slice(bytes);
                buffer[bytes.len()..width].fill(0);
            }
            Value::Boolean(b) => buffer[0] = *b as u8,
            Value::Date(val) => buffer[..8].copy_from_slice(val.to_be_bytes().as_slice()),
            Value::Point(point) => {
                buffer[..8].copy_from_slice(point.x.to_be_bytes().as_slice());
                buffer[8..16].copy_from_slice(point.y.to_be_bytes().as_slice());
            }
            Value::Null => buffer[..width].fill(0),
        }
    }

    pub fn is_null(&self) -> bool {
        *self == Value::Null
    }

    pub fn type_id(&self) -> Option<TypeId> {
        match self {
            Value::Integer(_) => Some(TypeId::Integer),
            Value::Decimal(_) => Some(TypeId::Decimal),
            Value::Text(_) => Some(TypeId::Text),
            Value::Boolean(_) => Some(TypeId::Boolean),
            Value::Date(_) => Some(TypeId::Date),
            Value::Point(_) => Some(TypeId::Point),
            Value::Null => None,
        }
    }

    /// Checks that the value may be stored in `column`.
    pub fn check_column(&self, column: &ColumnDefinition) -> Result<()> {
        match self.type_id() {
            None if column.nullable() => Ok(()),
            None => Err(StorageError::schema(format!(
                "Column {} is not nullable",
                column.column_name()
            ))),
            Some(type_id) if type_id == column.type_id() => self.check_finite(column.column_name()),
            Some(type_id) => Err(StorageError::schema(format!(
                "Column {} expects {} but got {}",
                column.column_name(),
                column.type_id(),
                type_id
            ))),
        }
    }

    /// Checks that the value is a non-null key of the given type.
    pub fn check_key(&self, type_id: TypeId) -> Result<()> {
        match self.type_id() {
            Some(actual) if actual == type_id => self.check_finite("key"),
            Some(actual) => Err(StorageError::schema(format!(
                "Cannot compare {} with a {} key",
                actual, type_id
            ))),
            None => Err(StorageError::schema("NULL is not a valid key")),
        }
    }

    /// Points must have finite coordinates. Decimals may be NaN, `total_cmp`
    /// gives them a fixed place in the order.
    fn check_finite(&self, what: &str) -> Result<()> {
        match self {
            Value::Point(point) if !point.is_finite() => Err(StorageError::schema(format!(
                "{what} must be a point with finite coordinates, got {point}"
            ))),
            _ => Ok(()),
        }
    }

    /// Orders values of the same type. Values of different types are ordered
    /// by their type tag, callers validate types before relying on this.
    pub fn total_cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Decimal(a), Value::Decimal(b)) => a.total_cmp(b),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (Value::Date(a), Value::Date(b)) => a.cmp(b),
            (Value::Point(a), Value::Point(b)) => a.total_cmp(b),
            (a, b) => tag(a).cmp(&tag(b)),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(val) => Some(val),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::Integer(val) => Some(*val),
            _ => None,
        }
    }

    pub fn as_point(&self) -> Option<Point> {
        match self {
            Value::Point(point) => Some(*point),
            _ => None,
        }
    }
}

fn tag(value: &Value) -> u8 {
    value.type_id().map_or(0, |type_id| type_id.tag())
}

fn truncate_to_width(val: &str, width: usize) -> &str {
    if val.len() <= width {
        return val;
    }
    let mut end = width;
    while !val.is_char_boundary(end) {
        end -= 1;
    }
    &val[..end]
}

impl Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Integer(val) => write!(f, "{val}"),
            Value::Decimal(val) => write!(f, "{val}"),
            Value::Text(val) => write!(f, "{val}"),
            Value::Boolean(val) => write!(f, "{val}"),
            Value::Date(val) => write!(f, "{val}"),
            Value::Point(point) => write!(f, "{point}"),
            Value::Null => f.write_str("NULL"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cmp::Ordering;

    use super::Value;
    use crate::catalog::schema::{ColumnDefinition, TypeId};
    use crate::error::StorageError;
    use crate::tuple::point::Point;

    fn serialize_parse_test_helper(type_id: TypeId, width: usize, value: Value) {
        let mut buffer = [0xFFu8; 32];
        value.serialize_value(&mut buffer, width);
        let parsed_value = Value::parse_value(&buffer, type_id, width);
        assert_eq!(parsed_value, value);
    }

    #[test]
    fn serialize_parse_test() {
        serialize_parse_test_helper(TypeId::Integer, 4, Value::Integer(-42));
        serialize_parse_test_helper(TypeId::Decimal, 8, Value::Decimal(2.5));
        serialize_parse_test_helper(TypeId::Boolean, 1, Value::Boolean(true));
        serialize_parse_test_helper(TypeId::Date, 8, Value::Date(1_700_000_000));
        serialize_parse_test_helper(TypeId::Text, 10, Value::Text("indexdb".to_owned()));
        serialize_parse_test_helper(TypeId::Point, 16, Value::Point(Point::new(1.0, -3.5)));
    }

    #[test]
    fn text_is_truncated_on_char_boundary() {
        let mut buffer = [0u8; 4];
        Value::Text("añbc".to_owned()).serialize_value(&mut buffer, 2);
        assert_eq!(Value::parse_value(&buffer, TypeId::Text, 2), Value::Text("a".to_owned()));
    }

    #[test]
    fn checks_column_types() {
        let column = ColumnDefinition::new(TypeId::Integer, "count", 0, false);
        assert!(Value::Integer(1).check_column(&column).is_ok());
        assert!(Value::Text("1".to_owned()).check_column(&column).is_err());
        assert!(Value::Null.check_column(&column).is_err());
    }

    #[test]
    fn rejects_points_that_are_not_finite() {
        let column = ColumnDefinition::new(TypeId::Point, "location", 0, false);
        for point in [
            Point::new(f64::NAN, 0.0),
            Point::new(1.0, f64::INFINITY),
            Point::new(f64::NEG_INFINITY, f64::NAN),
        ] {
            let value = Value::Point(point);
            let err = value.check_column(&column).unwrap_err();
            assert!(matches!(
                StorageError::kind_of(&err),
                Some(StorageError::Schema(_))
            ));
            assert!(value.check_key(TypeId::Point).is_err());
        }
        assert!(Value::Point(Point::new(1.0, 2.0)).check_column(&column).is_ok());

        let decimal = ColumnDefinition::new(TypeId::Decimal, "rating", 1, false);
        assert!(Value::Decimal(f64::NAN).check_column(&decimal).is_ok());
    }

    #[test]
    fn accessors_return_none_for_other_variants() {
        assert_eq!(Value::Integer(7).as_i32(), Some(7));
        assert_eq!(Value::Text("x".to_owned()).as_i32(), None);
        assert_eq!(Value::Text("x".to_owned()).as_str(), Some("x"));
        assert_eq!(Value::Null.as_str(), None);
    }

    #[test]
    fn orders_points_by_distance_to_origin() {
        let near = Value::Point(Point::new(1.0, 1.0));
        let far = Value::Point(Point::new(-5.0, 0.0));
        assert_eq!(near.total_cmp(&far), Ordering::Less);
    }
}
