//! Map grid labelling and landmark lookup.
//!
//! The map is divided into square cells of [`GRID_CELL_SIZE`] units. Columns
//! are lettered from the west edge (`A`..`Z`, `AA`..), rows are numbered from
//! the north edge starting at 0. A label reads `G12`.

use serde::{Deserialize, Serialize};

use crate::geometry::{MapBounds, Position};

pub const GRID_CELL_SIZE: f64 = 146.25;

/// A named monument on the map.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Landmark {
    pub token: String,
    pub position: Position,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LandmarkKind {
    OilRigSmall,
    OilRigLarge,
    Harbor,
    Other,
}

impl Landmark {
    pub fn new(token: impl Into<String>, position: Position) -> Self {
        Self {
            token: token.into(),
            position,
        }
    }

    pub fn kind(&self) -> LandmarkKind {
        match self.token.as_str() {
            "oil_rig_small" => LandmarkKind::OilRigSmall,
            "large_oil_rig" => LandmarkKind::OilRigLarge,
            t if t.starts_with("harbor") => LandmarkKind::Harbor,
            _ => LandmarkKind::Other,
        }
    }

    pub fn is_oil_rig(&self) -> bool {
        matches!(self.kind(), LandmarkKind::OilRigSmall | LandmarkKind::OilRigLarge)
    }

    /// Human-readable name derived from the token.
    pub fn display_name(&self) -> String {
        match self.kind() {
            LandmarkKind::OilRigSmall => "Oil Rig".to_string(),
            LandmarkKind::OilRigLarge => "Large Oil Rig".to_string(),
            _ => {
                let trimmed = self.token.trim_end_matches("_display_name");
                trimmed
                    .split('_')
                    .filter(|w| !w.is_empty())
                    .map(|w| {
                        let mut chars = w.chars();
                        match chars.next() {
                            Some(c) => c.to_uppercase().chain(chars).collect::<String>(),
                            None => String::new(),
                        }
                    })
                    .collect::<Vec<_>>()
                    .join(" ")
            }
        }
    }
}

/// Static information about the connected server, fetched once per connect.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorldInfo {
    pub name: String,
    pub map_size: f64,
    #[serde(default)]
    pub landmarks: Vec<Landmark>,
}

impl WorldInfo {
    pub fn bounds(&self) -> MapBounds {
        MapBounds::new(self.map_size)
    }

    pub fn landmarks_of(&self, kind: LandmarkKind) -> impl Iterator<Item = &Landmark> {
        self.landmarks.iter().filter(move |l| l.kind() == kind)
    }

    pub fn oil_rigs(&self) -> impl Iterator<Item = &Landmark> {
        self.landmarks.iter().filter(|l| l.is_oil_rig())
    }

    pub fn nearest_landmark(&self, pos: &Position) -> Option<&Landmark> {
        self.landmarks.iter().min_by(|a, b| {
            a.position
                .distance_to(pos)
                .total_cmp(&b.position.distance_to(pos))
        })
    }
}

/// Spreadsheet-style column letters: 0 -> A, 25 -> Z, 26 -> AA.
pub fn column_letters(mut index: usize) -> String {
    let mut out = Vec::new();
    loop {
        out.push(b'A' + (index % 26) as u8);
        if index < 26 {
            break;
        }
        index = index / 26 - 1;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

/// Grid label for a position, clamped into the map's grid.
pub fn grid_label(pos: &Position, map_size: f64) -> String {
    let cells = (map_size / GRID_CELL_SIZE).ceil().max(1.0) as usize;
    let clamp = |v: f64| -> usize {
        if v.is_nan() || v < 0.0 {
            0
        } else {
            (v as usize).min(cells - 1)
        }
    };
    let col = clamp(pos.x / GRID_CELL_SIZE);
    let row = clamp((map_size - pos.y) / GRID_CELL_SIZE);
    format!("{}{}", column_letters(col), row)
}

/// Display label for a position.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PositionLabel {
    pub grid: String,
    pub landmark: Option<String>,
}

impl std::fmt::Display for PositionLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.landmark {
            Some(name) => write!(f, "{} ({})", self.grid, name),
            None => f.write_str(&self.grid),
        }
    }
}

/// Converts raw positions into a grid label and nearest-landmark name.
pub trait PositionLabeler: Send + Sync {
    fn label(&self, pos: &Position) -> PositionLabel;
}

/// Default labeler over a server's [`WorldInfo`].
pub struct GridLabeler {
    world: WorldInfo,
    landmark_radius: f64,
}

impl GridLabeler {
    pub fn new(world: WorldInfo, landmark_radius: f64) -> Self {
        Self {
            world,
            landmark_radius,
        }
    }
}

impl PositionLabeler for GridLabeler {
    fn label(&self, pos: &Position) -> PositionLabel {
        let landmark = self
            .world
            .nearest_landmark(pos)
            .filter(|l| l.position.distance_to(pos) <= self.landmark_radius)
            .map(Landmark::display_name);
        PositionLabel {
            grid: grid_label(pos, self.world.map_size),
            landmark,
        }
    }
}
