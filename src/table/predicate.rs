use std::fmt::Display;

use crate::tuple::point::Point;
use crate::tuple::value::Value;

/// One condition of a selection. Every predicate is answered by an index on
/// its column.
#[derive(Clone, Debug, PartialEq)]
pub enum Predicate {
    Equals {
        column: String,
        value: Value,
    },
    /// Inclusive on both ends.
    Between {
        column: String,
        low: Value,
        high: Value,
    },
    WithinRadius {
        column: String,
        center: Point,
        radius: f64,
    },
    Nearest {
        column: String,
        center: Point,
        k: usize,
    },
    WithinRect {
        column: String,
        min: Point,
        max: Point,
    },
}

impl Predicate {
    pub fn equals(column: &str, value: Value) -> Self {
        Predicate::Equals {
            column: column.to_owned(),
            value,
        }
    }

    pub fn between(column: &str, low: Value, high: Value) -> Self {
        Predicate::Between {
            column: column.to_owned(),
            low,
            high,
        }
    }

    pub fn within_radius(column: &str, center: Point, radius: f64) -> Self {
        Predicate::WithinRadius {
            column: column.to_owned(),
            center,
            radius,
        }
    }

    pub fn nearest(column: &str, center: Point, k: usize) -> Self {
        Predicate::Nearest {
            column: column.to_owned(),
            center,
            k,
        }
    }

    pub fn within_rect(column: &str, min: Point, max: Point) -> Self {
        Predicate::WithinRect {
            column: column.to_owned(),
            min,
            max,
        }
    }

    pub fn column(&self) -> &str {
        match self {
            Predicate::Equals { column, .. }
            | Predicate::Between { column, .. }
            | Predicate::WithinRadius { column, .. }
            | Predicate::Nearest { column, .. }
            | Predicate::WithinRect { column, .. } => column,
        }
    }
}

impl Display for Predicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Predicate::Equals { column, value } => write!(f, "{column} = {value}"),
            Predicate::Between { column, low, high } => {
                write!(f, "{column} BETWEEN {low} AND {high}")
            }
            Predicate::WithinRadius {
                column,
                center,
                radius,
            } => write!(f, "{column} WITHIN {radius} OF {center}"),
            Predicate::Nearest { column, center, k } => {
                write!(f, "{column} NEAREST {k} TO {center}")
            }
            Predicate::WithinRect { column, min, max } => {
                write!(f, "{column} INSIDE {min} {max}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Predicate;
    use crate::tuple::point::Point;
    use crate::tuple::value::Value;

    #[test]
    fn displays_like_a_where_clause() {
        let predicate = Predicate::between("id", Value::Integer(3), Value::Integer(7));
        assert_eq!(predicate.to_string(), "id BETWEEN 3 AND 7");
        assert_eq!(predicate.column(), "id");

        let predicate = Predicate::nearest("location", Point::new(1.0, 2.0), 3);
        assert_eq!(predicate.to_string(), "location NEAREST 3 TO (1, 2)");
    }
}
