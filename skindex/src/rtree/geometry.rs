//! Points and axis-aligned rectangles in longitude/latitude space.

use serde::{Deserialize, Serialize};

/// Mean Earth radius in meters, used for great-circle distances.
pub const EARTH_RADIUS: f64 = 6.371229e6;

/// Coordinate comparison tolerance in degrees.
pub const EPSILON: f32 = 0.00001;

/// A longitude/latitude coordinate. `x` is longitude, `y` is latitude.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Equality within [`EPSILON`] on both axes.
    pub fn approx_eq(&self, other: &Point) -> bool {
        (self.x - other.x).abs() <= EPSILON && (self.y - other.y).abs() <= EPSILON
    }
}

/// An axis-aligned bounding rectangle.
///
/// A degenerate (point) rectangle stores only its southwest corner; the
/// northeast corner is implied. Leaf entries are always points, so this
/// halves the serialized size of leaf pages.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rectangle {
    southwest: Point,
    northeast: Option<Point>,
}

impl Rectangle {
    /// Builds a rectangle from its corners. Invariant: southwest <= northeast
    /// component-wise.
    pub fn new(southwest: Point, northeast: Point) -> Self {
        debug_assert!(southwest.x <= northeast.x && southwest.y <= northeast.y);

        if southwest.approx_eq(&northeast) {
            Self {
                southwest,
                northeast: None,
            }
        } else {
            Self {
                southwest,
                northeast: Some(northeast),
            }
        }
    }

    /// A degenerate rectangle covering a single point.
    pub fn point(p: Point) -> Self {
        Self {
            southwest: p,
            northeast: None,
        }
    }

    pub fn southwest(&self) -> Point {
        self.southwest
    }

    pub fn northeast(&self) -> Point {
        self.northeast.unwrap_or(self.southwest)
    }

    /// Smallest rectangle enclosing both `self` and `other`.
    pub fn min_bounding(&self, other: &Rectangle) -> Rectangle {
        let ne = self.northeast();
        let other_ne = other.northeast();

        Rectangle::new(
            Point::new(
                self.southwest.x.min(other.southwest.x),
                self.southwest.y.min(other.southwest.y),
            ),
            Point::new(ne.x.max(other_ne.x), ne.y.max(other_ne.y)),
        )
    }

    /// Area in squared degrees. Only used for relative comparisons during
    /// node splitting, so no spherical correction is applied.
    pub fn area(&self) -> f64 {
        let ne = self.northeast();
        (ne.x - self.southwest.x) as f64 * (ne.y - self.southwest.y) as f64
    }

    /// Great-circle distance in meters from `point` to the nearest edge of
    /// the rectangle (zero when the point lies inside).
    pub fn distance(&self, point: &Point) -> f64 {
        let ne = self.northeast();
        let x = point.x.clamp(self.southwest.x, ne.x);
        let y = point.y.clamp(self.southwest.y, ne.y);

        let lon1 = (x as f64).to_radians();
        let lon2 = (point.x as f64).to_radians();
        let lat1 = (y as f64).to_radians();
        let lat2 = (point.y as f64).to_radians();

        // Rounding can push the argument just outside [-1, 1] when the two
        // points coincide; clamp before acos.
        let acos_arg = (lat1.cos() * lat2.cos() * (lon1 - lon2).cos()
            + lat1.sin() * lat2.sin())
        .clamp(-1.0, 1.0);

        EARTH_RADIUS * acos_arg.acos()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_approx_eq() {
        let p = Point::new(1.0, 2.0);
        assert!(p.approx_eq(&Point::new(1.000001, 2.000001)));
        assert!(!p.approx_eq(&Point::new(1.1, 2.0)));
    }

    #[test]
    fn test_point_rectangle_has_no_stored_northeast() {
        let r = Rectangle::new(Point::new(3.0, 4.0), Point::new(3.0, 4.0));
        assert_eq!(r.northeast(), r.southwest());
        assert_eq!(r.area(), 0.0);
    }

    #[test]
    fn test_min_bounding() {
        let a = Rectangle::point(Point::new(0.0, 0.0));
        let b = Rectangle::point(Point::new(2.0, 3.0));
        let mbr = a.min_bounding(&b);
        assert_eq!(mbr.southwest(), Point::new(0.0, 0.0));
        assert_eq!(mbr.northeast(), Point::new(2.0, 3.0));
        assert_eq!(mbr.area(), 6.0);

        // Commutative.
        let mbr2 = b.min_bounding(&a);
        assert_eq!(mbr, mbr2);
    }

    #[test]
    fn test_distance_zero_inside() {
        let r = Rectangle::new(Point::new(-1.0, -1.0), Point::new(1.0, 1.0));
        assert_eq!(r.distance(&Point::new(0.5, 0.5)), 0.0);
        // Coincident point, degenerate rectangle.
        let p = Rectangle::point(Point::new(10.0, 20.0));
        assert_eq!(p.distance(&Point::new(10.0, 20.0)), 0.0);
    }

    #[test]
    fn test_distance_one_degree_longitude_at_equator() {
        let r = Rectangle::point(Point::new(0.0, 0.0));
        let d = r.distance(&Point::new(1.0, 0.0));
        // One degree of arc at the Earth's radius, ~111 km.
        let expected = EARTH_RADIUS * 1.0_f64.to_radians();
        assert!((d - expected).abs() < 1.0);
    }

    #[test]
    fn test_distance_clamps_to_nearest_edge() {
        let r = Rectangle::new(Point::new(0.0, 0.0), Point::new(2.0, 2.0));
        let from_east = r.distance(&Point::new(3.0, 1.0));
        let from_point = Rectangle::point(Point::new(2.0, 1.0)).distance(&Point::new(3.0, 1.0));
        assert!((from_east - from_point).abs() < 1e-6);
    }
}
