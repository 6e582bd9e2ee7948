use serde::{Deserialize, Serialize};

/// A point on the map in world units. `y` grows northwards.
#[derive(Clone, Copy, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance_to(&self, other: &Position) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }

    /// Point `distance` units along `heading_deg` (0 = north, clockwise).
    pub fn advance(&self, heading_deg: f64, distance: f64) -> Position {
        let rad = heading_deg.to_radians();
        Position {
            x: self.x + rad.sin() * distance,
            y: self.y + rad.cos() * distance,
        }
    }
}

/// The playable square `[0, size] x [0, size]`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MapBounds {
    pub size: f64,
}

impl MapBounds {
    pub const fn new(size: f64) -> Self {
        Self { size }
    }

    pub fn center(&self) -> Position {
        Position::new(self.size / 2.0, self.size / 2.0)
    }

    /// Distance to the nearest edge. Negative when outside the map.
    pub fn distance_to_edge(&self, pos: &Position) -> f64 {
        let dx = pos.x.min(self.size - pos.x);
        let dy = pos.y.min(self.size - pos.y);
        dx.min(dy)
    }

    pub fn is_near_edge(&self, pos: &Position, margin: f64) -> bool {
        self.distance_to_edge(pos) <= margin
    }

    pub fn contains(&self, pos: &Position) -> bool {
        self.distance_to_edge(pos) >= 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_is_euclidean() {
        let a = Position::new(0.0, 0.0);
        let b = Position::new(3.0, 4.0);
        assert!((a.distance_to(&b) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn advance_follows_compass_heading() {
        let origin = Position::new(100.0, 100.0);
        let north = origin.advance(0.0, 10.0);
        assert!((north.x - 100.0).abs() < 1e-9);
        assert!((north.y - 110.0).abs() < 1e-9);

        let east = origin.advance(90.0, 10.0);
        assert!((east.x - 110.0).abs() < 1e-9);
        assert!((east.y - 100.0).abs() < 1e-9);
    }

    #[test]
    fn edge_distance() {
        let bounds = MapBounds::new(4000.0);
        assert!((bounds.distance_to_edge(&bounds.center()) - 2000.0).abs() < 1e-9);
        assert!(bounds.is_near_edge(&Position::new(3950.0, 2000.0), 100.0));
        assert!(!bounds.is_near_edge(&bounds.center(), 100.0));
        assert!(!bounds.contains(&Position::new(-10.0, 2000.0)));
        assert!(bounds.is_near_edge(&Position::new(-10.0, 2000.0), 100.0));
    }

    #[test]
    fn non_finite_positions_detected() {
        assert!(!Position::new(f64::NAN, 0.0).is_finite());
        assert!(Position::new(1.0, 2.0).is_finite());
    }
}
