use std::cmp::Ordering;
use std::fmt::Display;
use std::str::FromStr;

use anyhow::Error;

/// A coordinate on the plane.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const SIZE: usize = 16;

    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn origin() -> Self {
        Self::new(0.0, 0.0)
    }

    /// NaN or infinite coordinates can't be bounded by a rectangle.
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }

    pub fn distance_to(&self, other: &Point) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }

    pub fn distance_to_origin(&self) -> f64 {
        self.distance_to(&Point::origin())
    }

    /// Whether the point lies inside the closed rectangle spanned by `min` and `max`.
    pub fn is_in_range(&self, min: &Point, max: &Point) -> bool {
        min.x <= self.x && self.x <= max.x && min.y <= self.y && self.y <= max.y
    }

    pub fn is_in_circle(&self, center: &Point, radius: f64) -> bool {
        self.distance_to(center) <= radius
    }

    /// Total order used when points are keys of an ordered index:
    /// distance to the origin first, then x, then y.
    pub fn total_cmp(&self, other: &Point) -> Ordering {
        self.distance_to_origin()
            .total_cmp(&other.distance_to_origin())
            .then_with(|| self.x.total_cmp(&other.x))
            .then_with(|| self.y.total_cmp(&other.y))
    }
}

impl Display for Point {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

impl FromStr for Point {
    type Err = anyhow::Error;

    /// Accepts `(x, y)`, `x, y`, `x y` and `x;y`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cleaned = s.trim().trim_start_matches('(').trim_end_matches(')');
        let parts = [',', ';', ' ']
            .iter()
            .find(|delimiter| cleaned.contains(**delimiter))
            .map(|delimiter| cleaned.split(*delimiter).collect::<Vec<_>>())
            .ok_or_else(|| Error::msg(format!("Invalid point {s}. Expected '(x, y)'")))?;

        match parts.as_slice() {
            [x, y] => {
                let x = x.trim().parse::<f64>()?;
                let y = y.trim().parse::<f64>()?;
                Ok(Point::new(x, y))
            }
            _ => Err(Error::msg(format!("Invalid point {s}. Expected '(x, y)'"))),
        }
    }
}

/// Minimum bounding rectangle.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Rect {
    pub min: Point,
    pub max: Point,
}

impl Rect {
    pub const SIZE: usize = 2 * Point::SIZE;

    pub fn new(min: Point, max: Point) -> Self {
        Self { min, max }
    }

    pub fn from_point(point: Point) -> Self {
        Self::new(point, point)
    }

    /// Normalizes two arbitrary corners into a rectangle.
    pub fn from_corners(a: Point, b: Point) -> Self {
        Self::new(
            Point::new(a.x.min(b.x), a.y.min(b.y)),
            Point::new(a.x.max(b.x), a.y.max(b.y)),
        )
    }

    pub fn area(&self) -> f64 {
        (self.max.x - self.min.x) * (self.max.y - self.min.y)
    }

    pub fn center(&self) -> Point {
        Point::new(
            (self.min.x + self.max.x) / 2.0,
            (self.min.y + self.max.y) / 2.0,
        )
    }

    pub fn union(&self, other: &Rect) -> Rect {
        Rect::new(
            Point::new(self.min.x.min(other.min.x), self.min.y.min(other.min.y)),
            Point::new(self.max.x.max(other.max.x), self.max.y.max(other.max.y)),
        )
    }

    /// Area growth needed to also cover `other`.
    pub fn enlargement(&self, other: &Rect) -> f64 {
        self.union(other).area() - self.area()
    }

    pub fn contains_point(&self, point: &Point) -> bool {
        point.is_in_range(&self.min, &self.max)
    }

    pub fn contains_rect(&self, other: &Rect) -> bool {
        self.contains_point(&other.min) && self.contains_point(&other.max)
    }

    pub fn intersects(&self, other: &Rect) -> bool {
        self.min.x <= other.max.x
            && other.min.x <= self.max.x
            && self.min.y <= other.max.y
            && other.min.y <= self.max.y
    }

    /// Distance from `point` to the nearest point of the rectangle, 0 when inside.
    pub fn min_distance(&self, point: &Point) -> f64 {
        let dx = (self.min.x - point.x).max(0.0).max(point.x - self.max.x);
        let dy = (self.min.y - point.y).max(0.0).max(point.y - self.max.y);
        (dx * dx + dy * dy).sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::{Point, Rect};

    #[test]
    fn parses_common_notations() {
        assert_eq!("(1.5, -2)".parse::<Point>().unwrap(), Point::new(1.5, -2.0));
        assert_eq!("3 4".parse::<Point>().unwrap(), Point::new(3.0, 4.0));
        assert_eq!("3;4".parse::<Point>().unwrap(), Point::new(3.0, 4.0));
        assert!("(1, 2, 3)".parse::<Point>().is_err());
        assert!("nowhere".parse::<Point>().is_err());
    }

    #[test]
    fn distances_and_containment() {
        let p = Point::new(3.0, 4.0);
        assert_eq!(p.distance_to_origin(), 5.0);
        assert!(p.is_in_circle(&Point::origin(), 5.0));
        assert!(!p.is_in_circle(&Point::origin(), 4.99));
        assert!(p.is_in_range(&Point::new(0.0, 0.0), &Point::new(3.0, 4.0)));
        assert!(p.is_finite());
        assert!(!Point::new(f64::NAN, 0.0).is_finite());
        assert!(!Point::new(0.0, f64::NEG_INFINITY).is_finite());
    }

    #[test]
    fn rect_min_distance() {
        let rect = Rect::new(Point::new(0.0, 0.0), Point::new(2.0, 2.0));
        assert_eq!(rect.min_distance(&Point::new(1.0, 1.0)), 0.0);
        assert_eq!(rect.min_distance(&Point::new(5.0, 2.0)), 3.0);
        assert_eq!(rect.min_distance(&Point::new(5.0, 6.0)), 5.0);
        assert_eq!(rect.enlargement(&Rect::from_point(Point::new(4.0, 2.0))), 4.0);
    }
}
