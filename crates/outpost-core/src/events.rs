use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::geometry::Position;
use crate::ids::{ConnectionId, MarkerId, SubjectId};
use crate::snapshot::MarkerKind;

/// How a tracked mobile entity left tracking.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Departure {
    /// Last seen within the boundary margin: it flew/sailed off the map.
    Departed,
    /// Last seen inland: removed by some other cause.
    Terminated,
}

impl Departure {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Departed => "departed",
            Self::Terminated => "terminated",
        }
    }
}

/// World events inferred from snapshot diffs, timers and the link.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorldEvent {
    CargoShipSpawned {
        marker_id: MarkerId,
        position: Position,
    },
    CargoShipDocked {
        marker_id: MarkerId,
        position: Position,
        harbor: String,
    },
    CargoShipEgressWarning {
        marker_id: MarkerId,
        remaining_secs: u64,
    },
    CargoShipEgress {
        marker_id: MarkerId,
    },
    TransportSpawned {
        marker_id: MarkerId,
        position: Position,
        heading_to: Option<Position>,
    },
    PatrolHelicopterSpawned {
        marker_id: MarkerId,
        position: Position,
        heading_to: Option<Position>,
    },
    TravelingVendorSpawned {
        marker_id: MarkerId,
        position: Position,
    },
    OilRigCalled {
        marker_id: MarkerId,
        position: Position,
        rig: String,
    },
    OilRigCrateWarning {
        rig: String,
        remaining_secs: u64,
    },
    OilRigCrateUnlocked {
        rig: String,
        position: Position,
    },
    EntityGone {
        marker_id: MarkerId,
        kind: MarkerKind,
        position: Position,
        outcome: Departure,
    },
    LockedCrateSpawned {
        marker_id: MarkerId,
        position: Position,
        landmark: Option<String>,
    },
    LockedCrateRemoved {
        marker_id: MarkerId,
        position: Position,
    },
    ExplosionDetected {
        marker_id: MarkerId,
        position: Position,
    },
    VendingMachineAdded {
        marker_id: MarkerId,
        position: Position,
    },
    VendingMachineRemoved {
        marker_id: MarkerId,
        position: Position,
    },
    MemberJoined {
        subject_id: SubjectId,
        name: String,
    },
    MemberLeft {
        subject_id: SubjectId,
        name: String,
    },
    MemberOnline {
        subject_id: SubjectId,
        name: String,
        position: Position,
    },
    MemberOffline {
        subject_id: SubjectId,
        name: String,
        position: Position,
    },
    MemberDied {
        subject_id: SubjectId,
        name: String,
        position: Position,
        death_marker: u64,
    },
    MemberRespawned {
        subject_id: SubjectId,
        name: String,
        position: Position,
    },
    LeaderChanged {
        subject_id: SubjectId,
        name: String,
    },
    MemberIdle {
        subject_id: SubjectId,
        name: String,
        position: Position,
        idle_secs: u64,
    },
    MemberActive {
        subject_id: SubjectId,
        name: String,
        position: Position,
        idle_secs: u64,
    },
    ConnectionLost,
    ConnectionRestored {
        attempts: u32,
    },
    ReconnectExhausted {
        attempts: u32,
    },
}

impl WorldEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CargoShipSpawned { .. } => "cargo_ship_spawned",
            Self::CargoShipDocked { .. } => "cargo_ship_docked",
            Self::CargoShipEgressWarning { .. } => "cargo_ship_egress_warning",
            Self::CargoShipEgress { .. } => "cargo_ship_egress",
            Self::TransportSpawned { .. } => "transport_spawned",
            Self::PatrolHelicopterSpawned { .. } => "patrol_helicopter_spawned",
            Self::TravelingVendorSpawned { .. } => "traveling_vendor_spawned",
            Self::OilRigCalled { .. } => "oil_rig_called",
            Self::OilRigCrateWarning { .. } => "oil_rig_crate_warning",
            Self::OilRigCrateUnlocked { .. } => "oil_rig_crate_unlocked",
            Self::EntityGone { .. } => "entity_gone",
            Self::LockedCrateSpawned { .. } => "locked_crate_spawned",
            Self::LockedCrateRemoved { .. } => "locked_crate_removed",
            Self::ExplosionDetected { .. } => "explosion_detected",
            Self::VendingMachineAdded { .. } => "vending_machine_added",
            Self::VendingMachineRemoved { .. } => "vending_machine_removed",
            Self::MemberJoined { .. } => "member_joined",
            Self::MemberLeft { .. } => "member_left",
            Self::MemberOnline { .. } => "member_online",
            Self::MemberOffline { .. } => "member_offline",
            Self::MemberDied { .. } => "member_died",
            Self::MemberRespawned { .. } => "member_respawned",
            Self::LeaderChanged { .. } => "leader_changed",
            Self::MemberIdle { .. } => "member_idle",
            Self::MemberActive { .. } => "member_active",
            Self::ConnectionLost => "connection_lost",
            Self::ConnectionRestored { .. } => "connection_restored",
            Self::ReconnectExhausted { .. } => "reconnect_exhausted",
        }
    }

    pub fn marker_id(&self) -> Option<MarkerId> {
        match self {
            Self::CargoShipSpawned { marker_id, .. }
            | Self::CargoShipDocked { marker_id, .. }
            | Self::CargoShipEgressWarning { marker_id, .. }
            | Self::CargoShipEgress { marker_id }
            | Self::TransportSpawned { marker_id, .. }
            | Self::PatrolHelicopterSpawned { marker_id, .. }
            | Self::TravelingVendorSpawned { marker_id, .. }
            | Self::OilRigCalled { marker_id, .. }
            | Self::EntityGone { marker_id, .. }
            | Self::LockedCrateSpawned { marker_id, .. }
            | Self::LockedCrateRemoved { marker_id, .. }
            | Self::ExplosionDetected { marker_id, .. }
            | Self::VendingMachineAdded { marker_id, .. }
            | Self::VendingMachineRemoved { marker_id, .. } => Some(*marker_id),
            _ => None,
        }
    }

    pub fn subject_id(&self) -> Option<SubjectId> {
        match self {
            Self::MemberJoined { subject_id, .. }
            | Self::MemberLeft { subject_id, .. }
            | Self::MemberOnline { subject_id, .. }
            | Self::MemberOffline { subject_id, .. }
            | Self::MemberDied { subject_id, .. }
            | Self::MemberRespawned { subject_id, .. }
            | Self::LeaderChanged { subject_id, .. }
            | Self::MemberIdle { subject_id, .. }
            | Self::MemberActive { subject_id, .. } => Some(*subject_id),
            _ => None,
        }
    }

    pub fn position(&self) -> Option<Position> {
        match self {
            Self::CargoShipSpawned { position, .. }
            | Self::CargoShipDocked { position, .. }
            | Self::TransportSpawned { position, .. }
            | Self::PatrolHelicopterSpawned { position, .. }
            | Self::TravelingVendorSpawned { position, .. }
            | Self::OilRigCalled { position, .. }
            | Self::OilRigCrateUnlocked { position, .. }
            | Self::EntityGone { position, .. }
            | Self::LockedCrateSpawned { position, .. }
            | Self::LockedCrateRemoved { position, .. }
            | Self::ExplosionDetected { position, .. }
            | Self::VendingMachineAdded { position, .. }
            | Self::VendingMachineRemoved { position, .. }
            | Self::MemberOnline { position, .. }
            | Self::MemberOffline { position, .. }
            | Self::MemberDied { position, .. }
            | Self::MemberRespawned { position, .. }
            | Self::MemberIdle { position, .. }
            | Self::MemberActive { position, .. } => Some(*position),
            _ => None,
        }
    }
}

/// A detected transition, stamped with its connection and time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub connection_id: ConnectionId,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: WorldEvent,
}

impl EventRecord {
    pub fn new(connection_id: ConnectionId, at: DateTime<Utc>, event: WorldEvent) -> Self {
        Self {
            connection_id,
            at,
            event,
        }
    }

    pub fn kind(&self) -> &'static str {
        self.event.kind()
    }
}
