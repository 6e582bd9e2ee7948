use std::collections::{BTreeSet, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use outpost_core::{MarkerId, MarkerKind, Position, SubjectId, TeamMember};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrajectorySample {
    pub position: Position,
    pub at: DateTime<Utc>,
}

/// Bounded trajectory buffer limits.
#[derive(Clone, Copy, Debug)]
pub struct TrajectoryLimits {
    pub capacity: usize,
    pub max_age: Duration,
}

/// Mutable record of one live map entity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackedEntity {
    pub marker_id: MarkerId,
    pub kind: MarkerKind,
    pub first_seen: DateTime<Utc>,
    trajectory: VecDeque<TrajectorySample>,
    /// Names of timers started on behalf of this entity.
    pub timers: BTreeSet<String>,
    /// Proximity zones the entity is currently dwelling in.
    zones: BTreeSet<String>,
}

impl TrackedEntity {
    pub fn new(marker_id: MarkerId, kind: MarkerKind, position: Position, at: DateTime<Utc>) -> Self {
        Self {
            marker_id,
            kind,
            first_seen: at,
            trajectory: VecDeque::from([TrajectorySample { position, at }]),
            timers: BTreeSet::new(),
            zones: BTreeSet::new(),
        }
    }

    /// Append a sample, then prune by length and age. The newest sample is
    /// always kept.
    pub fn record(&mut self, position: Position, at: DateTime<Utc>, limits: TrajectoryLimits) {
        self.trajectory.push_back(TrajectorySample { position, at });
        while self.trajectory.len() > limits.capacity.max(1) {
            let _ = self.trajectory.pop_front();
        }
        let max_age = chrono::Duration::from_std(limits.max_age).unwrap_or(chrono::Duration::MAX);
        let cutoff = at.checked_sub_signed(max_age);
        while self.trajectory.len() > 1 {
            match (self.trajectory.front(), cutoff) {
                (Some(oldest), Some(cutoff)) if oldest.at < cutoff => {
                    let _ = self.trajectory.pop_front();
                }
                _ => break,
            }
        }
    }

    pub fn last(&self) -> Option<&TrajectorySample> {
        self.trajectory.back()
    }

    pub fn last_position(&self) -> Option<Position> {
        self.last().map(|s| s.position)
    }

    pub fn trajectory(&self) -> impl Iterator<Item = &TrajectorySample> {
        self.trajectory.iter()
    }

    pub fn samples(&self) -> usize {
        self.trajectory.len()
    }

    /// Mark the entity inside `zone`. True only on entry.
    pub fn enter_zone(&mut self, zone: &str) -> bool {
        self.zones.insert(zone.to_string())
    }

    /// Re-arm `zone` once the entity is seen outside it.
    pub fn leave_zone(&mut self, zone: &str) {
        let _ = self.zones.remove(zone);
    }

    pub fn in_zone(&self, zone: &str) -> bool {
        self.zones.contains(zone)
    }
}

/// Mutable record of one team member.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackedSubject {
    pub subject_id: SubjectId,
    pub name: String,
    pub position: Position,
    pub online: bool,
    pub alive: bool,
    pub death_marker: Option<u64>,
    pub spawn_marker: Option<u64>,
}

impl From<&TeamMember> for TrackedSubject {
    fn from(m: &TeamMember) -> Self {
        Self {
            subject_id: m.subject_id,
            name: m.name.clone(),
            position: m.position,
            online: m.online,
            alive: m.alive,
            death_marker: m.death_marker,
            spawn_marker: m.spawn_marker,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntityView {
    pub marker_id: MarkerId,
    pub kind: MarkerKind,
    pub position: Option<Position>,
    pub samples: usize,
    pub timers: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubjectView {
    #[serde(flatten)]
    pub subject: TrackedSubject,
    pub idle_secs: Option<u64>,
}

/// Read-only view of a connection's tracked state.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackedState {
    pub world: Option<String>,
    pub last_snapshot: Option<DateTime<Utc>>,
    pub entities: Vec<EntityView>,
    pub subjects: Vec<SubjectView>,
}
