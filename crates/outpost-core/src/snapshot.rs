use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::MonitorError;
use crate::geometry::Position;
use crate::ids::{MarkerId, SubjectId};

/// Kind of map marker reported by the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerKind {
    Player,
    Explosion,
    VendingMachine,
    /// Twin-rotor transport helicopter.
    Transport,
    CargoShip,
    LockedCrate,
    GenericRadius,
    PatrolHelicopter,
    TravelingVendor,
}

impl MarkerKind {
    /// Kinds diffed by the engine, in emission order.
    pub const DIFFED: [MarkerKind; 7] = [
        MarkerKind::CargoShip,
        MarkerKind::Transport,
        MarkerKind::PatrolHelicopter,
        MarkerKind::TravelingVendor,
        MarkerKind::LockedCrate,
        MarkerKind::Explosion,
        MarkerKind::VendingMachine,
    ];

    /// Entities that move across the map and leave it on their own.
    pub fn is_mobile(&self) -> bool {
        matches!(
            self,
            Self::Transport | Self::CargoShip | Self::PatrolHelicopter | Self::TravelingVendor
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Player => "player",
            Self::Explosion => "explosion",
            Self::VendingMachine => "vending_machine",
            Self::Transport => "transport",
            Self::CargoShip => "cargo_ship",
            Self::LockedCrate => "locked_crate",
            Self::GenericRadius => "generic_radius",
            Self::PatrolHelicopter => "patrol_helicopter",
            Self::TravelingVendor => "traveling_vendor",
        }
    }
}

impl std::fmt::Display for MarkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MarkerAttributes {
    /// Heading in degrees, 0 = north, clockwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub out_of_stock: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntityMarker {
    pub id: MarkerId,
    pub kind: MarkerKind,
    pub position: Position,
    #[serde(default)]
    pub attributes: MarkerAttributes,
}

impl EntityMarker {
    pub fn new(id: u32, kind: MarkerKind, position: Position) -> Self {
        Self {
            id: MarkerId(id),
            kind,
            position,
            attributes: MarkerAttributes::default(),
        }
    }

    pub fn with_heading(mut self, heading: f64) -> Self {
        self.attributes.heading = Some(heading);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TeamMember {
    pub subject_id: SubjectId,
    pub name: String,
    pub online: bool,
    pub alive: bool,
    pub position: Position,
    /// Monotonically increasing; a change signals a new death.
    #[serde(default)]
    pub death_marker: Option<u64>,
    /// Monotonically increasing; a change signals a new spawn.
    #[serde(default)]
    pub spawn_marker: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TeamRoster {
    #[serde(default)]
    pub leader: Option<SubjectId>,
    #[serde(default)]
    pub members: Vec<TeamMember>,
}

impl TeamRoster {
    pub fn member(&self, id: SubjectId) -> Option<&TeamMember> {
        self.members.iter().find(|m| m.subject_id == id)
    }
}

/// Immutable point-in-time capture of markers and team roster from one poll.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub taken_at: DateTime<Utc>,
    pub markers: Vec<EntityMarker>,
    pub team: TeamRoster,
}

impl Snapshot {
    pub fn new(taken_at: DateTime<Utc>, markers: Vec<EntityMarker>, team: TeamRoster) -> Self {
        Self {
            taken_at,
            markers,
            team,
        }
    }

    pub fn markers_of(&self, kind: MarkerKind) -> impl Iterator<Item = &EntityMarker> {
        self.markers.iter().filter(move |m| m.kind == kind)
    }

    /// Reject payloads the diff engine cannot reason about.
    pub fn validate(&self) -> Result<(), MonitorError> {
        let mut seen = HashSet::new();
        for marker in &self.markers {
            if !seen.insert((marker.kind, marker.id)) {
                return Err(MonitorError::Protocol(format!(
                    "duplicate {} marker id {}",
                    marker.kind, marker.id
                )));
            }
            if !marker.position.is_finite() {
                return Err(MonitorError::Protocol(format!(
                    "non-finite position for {} marker {}",
                    marker.kind, marker.id
                )));
            }
        }
        let mut subjects = HashSet::new();
        for member in &self.team.members {
            if !subjects.insert(member.subject_id) {
                return Err(MonitorError::Protocol(format!(
                    "duplicate team member {}",
                    member.subject_id
                )));
            }
            if !member.position.is_finite() {
                return Err(MonitorError::Protocol(format!(
                    "non-finite position for team member {}",
                    member.subject_id
                )));
            }
        }
        Ok(())
    }
}
