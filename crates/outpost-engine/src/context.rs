//! Per-connection detection state.
//!
//! [`ConnectionContext::advance`] is the only way snapshots enter the engine:
//! it validates the snapshot, diffs it against the previous one kind by kind,
//! derives every event, and only then moves the previous-snapshot pointer.
//! A snapshot that fails validation leaves the context untouched.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use outpost_core::{
    ConnectionId, Departure, EntityMarker, Landmark, LandmarkKind, MarkerId, MarkerKind,
    MonitorError, Position, Snapshot, SubjectId, TeamRoster, WorldEvent, WorldInfo,
};
use outpost_settings::{OutpostSettings, TimerSettings, TrackingSettings};

use crate::activity::{ActivityTracker, ActivityTransition};
use crate::diff::diff;
use crate::dispatch::EventSink;
use crate::timers::{TimerKey, TimerService};
use crate::tracking::{
    EntityView, SubjectView, TrackedEntity, TrackedState, TrackedSubject, TrajectoryLimits,
};

/// Stable identity for a landmark. Tokens repeat (two small rigs), positions don't.
fn landmark_id(landmark: &Landmark) -> String {
    format!(
        "{}@{:.0},{:.0}",
        landmark.token, landmark.position.x, landmark.position.y
    )
}

fn cargo_timer(id: MarkerId) -> String {
    format!("cargo_egress:{id}")
}

fn crate_timer(rig: &Landmark) -> String {
    format!("oil_rig_crate:{}", landmark_id(rig))
}

pub struct ConnectionContext {
    connection_id: ConnectionId,
    scope: String,
    timer_settings: TimerSettings,
    tracking: TrackingSettings,
    world: Option<Arc<WorldInfo>>,
    previous: Option<Snapshot>,
    entities: HashMap<(MarkerKind, MarkerId), TrackedEntity>,
    subjects: BTreeMap<SubjectId, TrackedSubject>,
    leader: Option<SubjectId>,
    activity: ActivityTracker,
    timers: Arc<TimerService>,
    sink: EventSink,
}

impl ConnectionContext {
    pub fn new(settings: &OutpostSettings, timers: Arc<TimerService>, sink: EventSink) -> Self {
        let connection_id = sink.connection_id().clone();
        Self {
            scope: connection_id.as_str().to_string(),
            connection_id,
            timer_settings: settings.timers.clone(),
            tracking: settings.tracking.clone(),
            world: None,
            previous: None,
            entities: HashMap::new(),
            subjects: BTreeMap::new(),
            leader: None,
            activity: ActivityTracker::from_settings(&settings.activity),
            timers,
            sink,
        }
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    pub fn set_world(&mut self, world: WorldInfo) {
        debug!(
            connection_id = %self.connection_id,
            world = %world.name,
            map_size = world.map_size,
            landmarks = world.landmarks.len(),
            "world info loaded"
        );
        self.world = Some(Arc::new(world));
    }

    pub fn world(&self) -> Option<&WorldInfo> {
        self.world.as_deref()
    }

    pub fn previous(&self) -> Option<&Snapshot> {
        self.previous.as_ref()
    }

    pub fn entity(&self, kind: MarkerKind, id: MarkerId) -> Option<&TrackedEntity> {
        self.entities.get(&(kind, id))
    }

    pub fn subject(&self, id: SubjectId) -> Option<&TrackedSubject> {
        self.subjects.get(&id)
    }

    pub fn activity(&self) -> &ActivityTracker {
        &self.activity
    }

    /// Poll-and-diff. Returns the derived events in emission order.
    pub fn advance(&mut self, snapshot: Snapshot) -> Result<Vec<WorldEvent>, MonitorError> {
        snapshot.validate()?;
        if let Some(previous) = &self.previous {
            if snapshot.taken_at < previous.taken_at {
                return Err(MonitorError::Protocol(format!(
                    "snapshot at {} is older than previous at {}",
                    snapshot.taken_at, previous.taken_at
                )));
            }
        }
        let world = self
            .world
            .clone()
            .ok_or_else(|| MonitorError::Config("world info not loaded".into()))?;

        let mut events = Vec::new();
        match self.previous.take() {
            None => self.seed(&snapshot, &world),
            Some(previous) => {
                for kind in MarkerKind::DIFFED {
                    let partition = diff(&previous, &snapshot, kind);
                    for marker in partition.created {
                        self.on_created(marker, snapshot.taken_at, &world, &mut events);
                    }
                    for marker in partition.removed {
                        self.on_removed(marker, &world, &mut events);
                    }
                    for marker in partition.updated {
                        self.on_updated(marker, snapshot.taken_at, &world, &mut events);
                    }
                }
                self.diff_team(&snapshot.team, snapshot.taken_at, &mut events);
            }
        }
        self.previous = Some(snapshot);
        Ok(events)
    }

    /// Cancel this connection's timers and drop all tracked state.
    pub fn teardown(&mut self) -> usize {
        let stopped = self.timers.stop_scope(&self.scope);
        self.entities.clear();
        self.subjects.clear();
        self.activity.reset();
        self.leader = None;
        self.previous = None;
        self.world = None;
        info!(connection_id = %self.connection_id, timers = stopped, "context torn down");
        stopped
    }

    pub fn tracked_state(&self, now: DateTime<Utc>) -> TrackedState {
        let mut entities: Vec<EntityView> = self
            .entities
            .values()
            .map(|e| EntityView {
                marker_id: e.marker_id,
                kind: e.kind,
                position: e.last_position(),
                samples: e.samples(),
                timers: e.timers.iter().cloned().collect(),
            })
            .collect();
        entities.sort_by_key(|e| (e.kind, e.marker_id));
        TrackedState {
            world: self.world.as_ref().map(|w| w.name.clone()),
            last_snapshot: self.previous.as_ref().map(|s| s.taken_at),
            entities,
            subjects: self
                .subjects
                .values()
                .map(|s| SubjectView {
                    subject: s.clone(),
                    idle_secs: self
                        .activity
                        .idle_duration(s.subject_id, now)
                        .map(|d| d.as_secs()),
                })
                .collect(),
        }
    }

    fn limits(&self) -> TrajectoryLimits {
        TrajectoryLimits {
            capacity: self.tracking.trajectory_capacity,
            max_age: Duration::from_secs(self.tracking.trajectory_max_age_secs),
        }
    }

    /// First snapshot after connect: track everything, announce nothing.
    fn seed(&mut self, snapshot: &Snapshot, world: &WorldInfo) {
        for kind in MarkerKind::DIFFED {
            for marker in snapshot.markers_of(kind) {
                let mut entity =
                    TrackedEntity::new(marker.id, marker.kind, marker.position, snapshot.taken_at);
                for landmark in self.zones_for(kind, world) {
                    if self.in_zone(kind, landmark, &marker.position) {
                        let _ = entity.enter_zone(&landmark_id(landmark));
                    }
                }
                let _ = self.entities.insert((kind, marker.id), entity);
            }
        }
        for member in &snapshot.team.members {
            let _ = self
                .subjects
                .insert(member.subject_id, TrackedSubject::from(member));
            let _ = self.activity.update(
                member.subject_id,
                member.position,
                member.online,
                snapshot.taken_at,
            );
        }
        self.leader = snapshot.team.leader;
        debug!(
            connection_id = %self.connection_id,
            entities = self.entities.len(),
            subjects = self.subjects.len(),
            "baseline snapshot"
        );
    }

    fn zones_for<'w>(&self, kind: MarkerKind, world: &'w WorldInfo) -> Vec<&'w Landmark> {
        match kind {
            MarkerKind::CargoShip => world.landmarks_of(LandmarkKind::Harbor).collect(),
            MarkerKind::Transport => world.oil_rigs().collect(),
            _ => Vec::new(),
        }
    }

    fn in_zone(&self, kind: MarkerKind, landmark: &Landmark, pos: &Position) -> bool {
        let radius = match kind {
            MarkerKind::CargoShip => self.tracking.dock_radius,
            _ => self.tracking.oil_rig_radius,
        };
        landmark.position.distance_to(pos) <= radius
    }

    fn predict(&self, marker: &EntityMarker) -> Option<Position> {
        marker
            .attributes
            .heading
            .filter(|h| h.is_finite())
            .map(|h| marker.position.advance(h, self.tracking.prediction_distance))
    }

    fn nearby_landmark(&self, world: &WorldInfo, pos: &Position) -> Option<String> {
        world
            .nearest_landmark(pos)
            .filter(|l| l.position.distance_to(pos) <= self.tracking.landmark_label_radius)
            .map(Landmark::display_name)
    }

    fn on_created(
        &mut self,
        marker: &EntityMarker,
        at: DateTime<Utc>,
        world: &WorldInfo,
        events: &mut Vec<WorldEvent>,
    ) {
        let mut entity = TrackedEntity::new(marker.id, marker.kind, marker.position, at);
        let (marker_id, position) = (marker.id, marker.position);
        match marker.kind {
            MarkerKind::CargoShip => {
                events.push(WorldEvent::CargoShipSpawned {
                    marker_id,
                    position,
                });
                self.start_egress_timer(&mut entity);
            }
            MarkerKind::Transport => {
                events.push(WorldEvent::TransportSpawned {
                    marker_id,
                    position,
                    heading_to: self.predict(marker),
                });
                self.check_zones(&mut entity, world, events);
            }
            MarkerKind::PatrolHelicopter => events.push(WorldEvent::PatrolHelicopterSpawned {
                marker_id,
                position,
                heading_to: self.predict(marker),
            }),
            MarkerKind::TravelingVendor => events.push(WorldEvent::TravelingVendorSpawned {
                marker_id,
                position,
            }),
            MarkerKind::LockedCrate => events.push(WorldEvent::LockedCrateSpawned {
                marker_id,
                position,
                landmark: self.nearby_landmark(world, &position),
            }),
            MarkerKind::Explosion => events.push(WorldEvent::ExplosionDetected {
                marker_id,
                position,
            }),
            MarkerKind::VendingMachine => events.push(WorldEvent::VendingMachineAdded {
                marker_id,
                position,
            }),
            MarkerKind::Player | MarkerKind::GenericRadius => {}
        }
        let _ = self.entities.insert((marker.kind, marker.id), entity);
    }

    fn on_removed(&mut self, marker: &EntityMarker, world: &WorldInfo, events: &mut Vec<WorldEvent>) {
        let entity = self.entities.remove(&(marker.kind, marker.id));
        let last = entity
            .as_ref()
            .and_then(TrackedEntity::last_position)
            .unwrap_or(marker.position);
        if let Some(entity) = &entity {
            for name in &entity.timers {
                let _ = self.timers.stop(&TimerKey::new(self.scope.as_str(), name.as_str()));
            }
        }

        let marker_id = marker.id;
        match marker.kind {
            kind if kind.is_mobile() => {
                let outcome = if world
                    .bounds()
                    .is_near_edge(&last, self.tracking.boundary_margin)
                {
                    Departure::Departed
                } else {
                    Departure::Terminated
                };
                debug!(
                    connection_id = %self.connection_id,
                    %marker_id,
                    kind = kind.as_str(),
                    outcome = outcome.as_str(),
                    "entity gone"
                );
                events.push(WorldEvent::EntityGone {
                    marker_id,
                    kind,
                    position: last,
                    outcome,
                });
            }
            MarkerKind::LockedCrate => events.push(WorldEvent::LockedCrateRemoved {
                marker_id,
                position: last,
            }),
            MarkerKind::VendingMachine => events.push(WorldEvent::VendingMachineRemoved {
                marker_id,
                position: last,
            }),
            _ => {}
        }
    }

    fn on_updated(
        &mut self,
        marker: &EntityMarker,
        at: DateTime<Utc>,
        world: &WorldInfo,
        events: &mut Vec<WorldEvent>,
    ) {
        let key = (marker.kind, marker.id);
        let mut entity = match self.entities.remove(&key) {
            Some(mut entity) => {
                entity.record(marker.position, at, self.limits());
                entity
            }
            None => TrackedEntity::new(marker.id, marker.kind, marker.position, at),
        };
        self.check_zones(&mut entity, world, events);
        let _ = self.entities.insert(key, entity);
    }

    /// Proximity zones: docking for cargo ships, rig calls for transports.
    /// One event per continuous dwell; leaving the zone re-arms it.
    fn check_zones(&mut self, entity: &mut TrackedEntity, world: &WorldInfo, events: &mut Vec<WorldEvent>) {
        let Some(position) = entity.last_position() else {
            return;
        };
        for landmark in self.zones_for(entity.kind, world) {
            let zone = landmark_id(landmark);
            if !self.in_zone(entity.kind, landmark, &position) {
                entity.leave_zone(&zone);
                continue;
            }
            if !entity.enter_zone(&zone) {
                continue;
            }
            match entity.kind {
                MarkerKind::CargoShip => events.push(WorldEvent::CargoShipDocked {
                    marker_id: entity.marker_id,
                    position,
                    harbor: landmark.display_name(),
                }),
                MarkerKind::Transport => {
                    events.push(WorldEvent::OilRigCalled {
                        marker_id: entity.marker_id,
                        position,
                        rig: landmark.display_name(),
                    });
                    self.start_crate_timer(landmark);
                }
                _ => {}
            }
        }
    }

    fn start_egress_timer(&mut self, entity: &mut TrackedEntity) {
        let marker_id = entity.marker_id;
        let name = cargo_timer(marker_id);
        let key = TimerKey::new(self.scope.as_str(), name.as_str());
        let sink = self.sink.clone();
        let started = self.timers.start(
            key.clone(),
            Duration::from_secs(self.timer_settings.cargo_egress_secs),
            move || sink.emit(WorldEvent::CargoShipEgress { marker_id }),
        );
        if started {
            let sink = self.sink.clone();
            let _ = self.timers.add_warning(
                &key,
                Duration::from_secs(self.timer_settings.cargo_egress_warning_secs),
                move |left| {
                    sink.emit(WorldEvent::CargoShipEgressWarning {
                        marker_id,
                        remaining_secs: left.as_secs(),
                    })
                },
            );
        }
        let _ = entity.timers.insert(name);
    }

    /// Crate timers belong to the rig, not the transport, and outlive it.
    fn start_crate_timer(&self, rig: &Landmark) {
        let key = TimerKey::new(self.scope.as_str(), crate_timer(rig));
        let name = rig.display_name();
        let position = rig.position;
        let sink = self.sink.clone();
        let rig_name = name.clone();
        let started = self.timers.start(
            key.clone(),
            Duration::from_secs(self.timer_settings.oil_rig_unlock_secs),
            move || {
                sink.emit(WorldEvent::OilRigCrateUnlocked {
                    rig: rig_name,
                    position,
                })
            },
        );
        if !started {
            debug!(connection_id = %self.connection_id, rig = %name, "crate timer already running");
            return;
        }
        let sink = self.sink.clone();
        let _ = self.timers.add_warning(
            &key,
            Duration::from_secs(self.timer_settings.oil_rig_warning_secs),
            move |left| {
                sink.emit(WorldEvent::OilRigCrateWarning {
                    rig: name,
                    remaining_secs: left.as_secs(),
                })
            },
        );
    }

    fn diff_team(&mut self, roster: &TeamRoster, at: DateTime<Utc>, events: &mut Vec<WorldEvent>) {
        for member in &roster.members {
            let subject_id = member.subject_id;
            let name = member.name.clone();
            let position = member.position;
            if !self.subjects.contains_key(&subject_id) {
                events.push(WorldEvent::MemberJoined { subject_id, name });
                let _ = self.subjects.insert(subject_id, TrackedSubject::from(member));
                continue;
            }
            let Some(previous) = self.subjects.get_mut(&subject_id) else {
                continue;
            };

            if !previous.online && member.online {
                events.push(WorldEvent::MemberOnline {
                    subject_id,
                    name: name.clone(),
                    position,
                });
            } else if previous.online && !member.online {
                events.push(WorldEvent::MemberOffline {
                    subject_id,
                    name: name.clone(),
                    position,
                });
            }
            if let Some(death_marker) = member.death_marker {
                // The marker only grows; a lower value is a server reset, not a death.
                if previous.death_marker.map_or(true, |seen| death_marker > seen) {
                    events.push(WorldEvent::MemberDied {
                        subject_id,
                        name: name.clone(),
                        position,
                        death_marker,
                    });
                }
            }
            let new_spawn = member.spawn_marker.is_some() && member.spawn_marker != previous.spawn_marker;
            if new_spawn || (!previous.alive && member.alive) {
                events.push(WorldEvent::MemberRespawned {
                    subject_id,
                    name,
                    position,
                });
            }
            *previous = TrackedSubject::from(member);
        }

        let present: HashSet<SubjectId> = roster.members.iter().map(|m| m.subject_id).collect();
        let departed: Vec<SubjectId> = self
            .subjects
            .keys()
            .filter(|id| !present.contains(id))
            .copied()
            .collect();
        for subject_id in departed {
            if let Some(subject) = self.subjects.remove(&subject_id) {
                self.activity.forget(subject_id);
                events.push(WorldEvent::MemberLeft {
                    subject_id,
                    name: subject.name,
                });
            }
        }

        if roster.leader != self.leader {
            if let Some(leader) = roster.leader.and_then(|id| roster.member(id)) {
                events.push(WorldEvent::LeaderChanged {
                    subject_id: leader.subject_id,
                    name: leader.name.clone(),
                });
            }
            self.leader = roster.leader;
        }

        for member in &roster.members {
            let transition =
                self.activity
                    .update(member.subject_id, member.position, member.online, at);
            let (subject_id, name, position) =
                (member.subject_id, member.name.clone(), member.position);
            match transition {
                Some(ActivityTransition::IdleStarted { idle_for }) => {
                    events.push(WorldEvent::MemberIdle {
                        subject_id,
                        name,
                        position,
                        idle_secs: idle_for.as_secs(),
                    })
                }
                Some(ActivityTransition::IdleEnded { idle_for }) => {
                    events.push(WorldEvent::MemberActive {
                        subject_id,
                        name,
                        position,
                        idle_secs: idle_for.as_secs(),
                    })
                }
                None => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use outpost_core::TeamMember;
    use tokio::sync::mpsc;

    const MAP: f64 = 4000.0;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn world() -> WorldInfo {
        WorldInfo {
            name: "test".into(),
            map_size: MAP,
            landmarks: vec![
                Landmark::new("harbor_display_name", Position::new(2000.0, 400.0)),
                Landmark::new("large_oil_rig", Position::new(3000.0, 3000.0)),
                Landmark::new("oil_rig_small", Position::new(1000.0, 3000.0)),
                Landmark::new("airfield_display_name", Position::new(1200.0, 1200.0)),
            ],
        }
    }

    fn settings() -> OutpostSettings {
        let mut s = OutpostSettings::default();
        s.timers.cargo_egress_secs = 120;
        s.timers.cargo_egress_warning_secs = 60;
        s.timers.oil_rig_unlock_secs = 300;
        s.timers.oil_rig_warning_secs = 100;
        s
    }

    struct Fixture {
        ctx: ConnectionContext,
        timers: Arc<TimerService>,
        queue: mpsc::UnboundedReceiver<outpost_core::EventRecord>,
    }

    fn fixture() -> Fixture {
        let settings = settings();
        let timers = Arc::new(TimerService::new(settings.timers.warning_cadence()));
        let (sink, queue) = EventSink::new(ConnectionId::from_raw("conn_t"));
        let mut ctx = ConnectionContext::new(&settings, timers.clone(), sink);
        ctx.set_world(world());
        Fixture { ctx, timers, queue }
    }

    fn marker(id: u32, kind: MarkerKind, x: f64, y: f64) -> EntityMarker {
        EntityMarker::new(id, kind, Position::new(x, y))
    }

    fn snap(at: i64, markers: Vec<EntityMarker>) -> Snapshot {
        Snapshot::new(t(at), markers, TeamRoster::default())
    }

    fn team_snap(at: i64, members: Vec<TeamMember>, leader: Option<u64>) -> Snapshot {
        Snapshot::new(
            t(at),
            vec![],
            TeamRoster {
                leader: leader.map(SubjectId),
                members,
            },
        )
    }

    fn member(id: u64, online: bool, alive: bool, death: Option<u64>) -> TeamMember {
        TeamMember {
            subject_id: SubjectId(id),
            name: format!("p{id}"),
            online,
            alive,
            position: Position::new(500.0, 500.0),
            death_marker: death,
            spawn_marker: None,
        }
    }

    fn kinds(events: &[WorldEvent]) -> Vec<&'static str> {
        events.iter().map(WorldEvent::kind).collect()
    }

    #[tokio::test]
    async fn baseline_then_created_and_updated() {
        let mut f = fixture();
        let ship = marker(1, MarkerKind::CargoShip, 2000.0, 2000.0);
        assert!(f.ctx.advance(snap(0, vec![ship.clone()])).unwrap().is_empty());

        let events = f
            .ctx
            .advance(snap(10, vec![ship, marker(2, MarkerKind::CargoShip, 3900.0, 2000.0)]))
            .unwrap();
        assert_eq!(
            events,
            vec![WorldEvent::CargoShipSpawned {
                marker_id: MarkerId(2),
                position: Position::new(3900.0, 2000.0),
            }]
        );
        assert_eq!(f.ctx.entity(MarkerKind::CargoShip, MarkerId(1)).unwrap().samples(), 2);
        assert_eq!(f.ctx.previous().unwrap().taken_at, t(10));
    }

    #[tokio::test(start_paused = true)]
    async fn cargo_ship_egress_warning_and_expiry() {
        let mut f = fixture();
        f.ctx.advance(snap(0, vec![])).unwrap();
        f.ctx
            .advance(snap(10, vec![marker(5, MarkerKind::CargoShip, 3900.0, 2000.0)]))
            .unwrap();
        assert!(f.timers.is_running(&TimerKey::new("conn_t", "cargo_egress:5")));

        let warning = f.queue.recv().await.unwrap();
        assert_eq!(
            warning.event,
            WorldEvent::CargoShipEgressWarning {
                marker_id: MarkerId(5),
                remaining_secs: 60,
            }
        );
        let egress = f.queue.recv().await.unwrap();
        assert_eq!(egress.event, WorldEvent::CargoShipEgress { marker_id: MarkerId(5) });
        assert_eq!(egress.connection_id.as_str(), "conn_t");
    }

    #[tokio::test]
    async fn departed_near_edge_terminated_inland() {
        let mut f = fixture();
        f.ctx
            .advance(snap(
                0,
                vec![
                    marker(1, MarkerKind::PatrolHelicopter, 2000.0, 2000.0),
                    marker(2, MarkerKind::PatrolHelicopter, 2000.0, 2000.0),
                ],
            ))
            .unwrap();
        f.ctx
            .advance(snap(
                10,
                vec![
                    marker(1, MarkerKind::PatrolHelicopter, 60.0, 2000.0),
                    marker(2, MarkerKind::PatrolHelicopter, MAP / 2.0, MAP / 2.0),
                ],
            ))
            .unwrap();
        let events = f.ctx.advance(snap(20, vec![])).unwrap();
        let outcomes: Vec<(MarkerId, Departure)> = events
            .iter()
            .filter_map(|e| match e {
                WorldEvent::EntityGone {
                    marker_id, outcome, ..
                } => Some((*marker_id, *outcome)),
                _ => None,
            })
            .collect();
        assert_eq!(
            outcomes,
            vec![
                (MarkerId(1), Departure::Departed),
                (MarkerId(2), Departure::Terminated),
            ]
        );
        assert!(f.ctx.entity(MarkerKind::PatrolHelicopter, MarkerId(1)).is_none());
    }

    #[tokio::test]
    async fn docking_fires_once_per_dwell() {
        let mut f = fixture();
        f.ctx
            .advance(snap(0, vec![marker(1, MarkerKind::CargoShip, 2000.0, 1500.0)]))
            .unwrap();
        let path = [
            (2000.0, 600.0, 1), // docked
            (2000.0, 450.0, 0), // still docked
            (2000.0, 1500.0, 0),
            (2050.0, 500.0, 1), // back again
        ];
        for (i, (x, y, expected)) in path.into_iter().enumerate() {
            let events = f
                .ctx
                .advance(snap(10 * (i as i64 + 1), vec![marker(1, MarkerKind::CargoShip, x, y)]))
                .unwrap();
            let docked = events
                .iter()
                .filter(|e| matches!(e, WorldEvent::CargoShipDocked { .. }))
                .count();
            assert_eq!(docked, expected, "step {i}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transport_at_rig_starts_one_crate_timer() {
        let mut f = fixture();
        f.ctx.advance(snap(0, vec![])).unwrap();
        let events = f
            .ctx
            .advance(snap(
                10,
                vec![marker(7, MarkerKind::Transport, 100.0, 100.0).with_heading(45.0)],
            ))
            .unwrap();
        match &events[0] {
            WorldEvent::TransportSpawned { heading_to, .. } => {
                let to = heading_to.unwrap();
                assert!((to.x - (100.0 + 1000.0 * 45f64.to_radians().sin())).abs() < 1e-6);
            }
            other => panic!("unexpected {other:?}"),
        }

        let events = f
            .ctx
            .advance(snap(20, vec![marker(7, MarkerKind::Transport, 3050.0, 3050.0)]))
            .unwrap();
        assert_eq!(
            events,
            vec![WorldEvent::OilRigCalled {
                marker_id: MarkerId(7),
                position: Position::new(3050.0, 3050.0),
                rig: "Large Oil Rig".into(),
            }]
        );
        let key = TimerKey::new("conn_t", "oil_rig_crate:large_oil_rig@3000,3000");
        assert_eq!(f.timers.time_left(&key), Some(Duration::from_secs(300)));

        // A second transport arriving does not reset the running timer.
        tokio::time::sleep(Duration::from_secs(50)).await;
        let events = f
            .ctx
            .advance(snap(
                30,
                vec![
                    marker(7, MarkerKind::Transport, 3050.0, 3050.0),
                    marker(8, MarkerKind::Transport, 3000.0, 2950.0),
                ],
            ))
            .unwrap();
        assert_eq!(kinds(&events), vec!["transport_spawned", "oil_rig_called"]);
        assert_eq!(f.timers.time_left(&key), Some(Duration::from_secs(250)));

        // The crate timer outlives the transport.
        f.ctx.advance(snap(40, vec![])).unwrap();
        let warning = f.queue.recv().await.unwrap();
        assert_eq!(warning.kind(), "oil_rig_crate_warning");
        let unlocked = f.queue.recv().await.unwrap();
        assert_eq!(
            unlocked.event,
            WorldEvent::OilRigCrateUnlocked {
                rig: "Large Oil Rig".into(),
                position: Position::new(3000.0, 3000.0),
            }
        );
    }

    #[tokio::test]
    async fn each_death_marker_increase_is_a_death() {
        let mut f = fixture();
        f.ctx
            .advance(team_snap(0, vec![member(1, true, false, None)], None))
            .unwrap();
        let first = f
            .ctx
            .advance(team_snap(10, vec![member(1, true, false, Some(100))], None))
            .unwrap();
        let second = f
            .ctx
            .advance(team_snap(20, vec![member(1, true, false, Some(200))], None))
            .unwrap();
        let same = f
            .ctx
            .advance(team_snap(30, vec![member(1, true, false, Some(200))], None))
            .unwrap();
        assert_eq!(kinds(&first), vec!["member_died"]);
        assert!(matches!(
            second[0],
            WorldEvent::MemberDied { death_marker: 200, .. }
        ));
        assert!(same.is_empty());

        // A wipe resets the marker; only growth past the new value counts.
        let reset = f
            .ctx
            .advance(team_snap(40, vec![member(1, true, false, Some(3))], None))
            .unwrap();
        assert!(reset.is_empty());
        let after_reset = f
            .ctx
            .advance(team_snap(50, vec![member(1, true, false, Some(4))], None))
            .unwrap();
        assert_eq!(kinds(&after_reset), vec!["member_died"]);
    }

    #[tokio::test]
    async fn team_roster_transitions() {
        let mut f = fixture();
        f.ctx
            .advance(team_snap(
                0,
                vec![member(1, true, true, None), member(2, true, false, Some(5))],
                Some(1),
            ))
            .unwrap();
        let events = f
            .ctx
            .advance(team_snap(
                10,
                vec![
                    member(1, false, true, None),
                    member(2, true, true, Some(5)),
                    member(3, true, true, None),
                ],
                Some(2),
            ))
            .unwrap();
        assert_eq!(
            kinds(&events),
            vec!["member_offline", "member_respawned", "member_joined", "leader_changed"]
        );

        let events = f
            .ctx
            .advance(team_snap(20, vec![member(2, true, true, Some(5))], Some(2)))
            .unwrap();
        assert_eq!(kinds(&events), vec!["member_left", "member_left"]);
        assert!(f.ctx.subject(SubjectId(1)).is_none());
    }

    #[tokio::test]
    async fn idle_member_reported_through_advance() {
        let mut f = fixture();
        f.ctx
            .advance(team_snap(0, vec![member(1, true, true, None)], None))
            .unwrap();
        let quiet = f
            .ctx
            .advance(team_snap(100, vec![member(1, true, true, None)], None))
            .unwrap();
        assert!(quiet.is_empty());
        let idle = f
            .ctx
            .advance(team_snap(200, vec![member(1, true, true, None)], None))
            .unwrap();
        assert_eq!(
            idle,
            vec![WorldEvent::MemberIdle {
                subject_id: SubjectId(1),
                name: "p1".into(),
                position: Position::new(500.0, 500.0),
                idle_secs: 200,
            }]
        );
        let view = f.ctx.tracked_state(t(200));
        assert_eq!(view.subjects[0].idle_secs, Some(200));
    }

    #[tokio::test]
    async fn events_follow_kind_order_then_team() {
        let mut f = fixture();
        f.ctx
            .advance(Snapshot::new(
                t(0),
                vec![
                    marker(9, MarkerKind::LockedCrate, 1200.0, 1210.0),
                    marker(1, MarkerKind::CargoShip, 2000.0, 2000.0),
                ],
                TeamRoster::default(),
            ))
            .unwrap();
        let events = f
            .ctx
            .advance(Snapshot::new(
                t(10),
                vec![
                    marker(4, MarkerKind::VendingMachine, 10.0, 10.0),
                    marker(3, MarkerKind::Explosion, 10.0, 10.0),
                    marker(2, MarkerKind::CargoShip, 3900.0, 100.0),
                ],
                TeamRoster {
                    leader: None,
                    members: vec![member(1, true, true, None)],
                },
            ))
            .unwrap();
        assert_eq!(
            kinds(&events),
            vec![
                "cargo_ship_spawned",
                "entity_gone",
                "locked_crate_removed",
                "explosion_detected",
                "vending_machine_added",
                "member_joined",
            ]
        );
    }

    #[tokio::test]
    async fn locked_crate_names_nearby_landmark() {
        let mut f = fixture();
        f.ctx.advance(snap(0, vec![])).unwrap();
        let events = f
            .ctx
            .advance(snap(10, vec![marker(9, MarkerKind::LockedCrate, 1210.0, 1190.0)]))
            .unwrap();
        assert!(matches!(
            &events[0],
            WorldEvent::LockedCrateSpawned { landmark: Some(l), .. } if l == "Airfield"
        ));
    }

    #[tokio::test]
    async fn invalid_snapshot_leaves_pointer_unadvanced() {
        let mut f = fixture();
        f.ctx
            .advance(snap(0, vec![marker(1, MarkerKind::CargoShip, 2000.0, 2000.0)]))
            .unwrap();

        let duplicate = snap(
            10,
            vec![
                marker(2, MarkerKind::Transport, 1.0, 1.0),
                marker(2, MarkerKind::Transport, 2.0, 2.0),
            ],
        );
        assert!(matches!(f.ctx.advance(duplicate), Err(MonitorError::Protocol(_))));
        assert_eq!(f.ctx.previous().unwrap().taken_at, t(0));
        assert!(f.ctx.entity(MarkerKind::CargoShip, MarkerId(1)).is_some());

        assert!(matches!(
            f.ctx.advance(snap(-5, vec![])),
            Err(MonitorError::Protocol(_))
        ));
        assert_eq!(f.ctx.previous().unwrap().taken_at, t(0));

        // The next good snapshot diffs against the last good one.
        let events = f.ctx.advance(snap(20, vec![])).unwrap();
        assert_eq!(kinds(&events), vec!["entity_gone"]);
    }

    #[tokio::test]
    async fn advance_requires_world_info() {
        let settings = settings();
        let timers = Arc::new(TimerService::new(Duration::from_secs(10)));
        let (sink, _queue) = EventSink::new(ConnectionId::from_raw("conn_t"));
        let mut ctx = ConnectionContext::new(&settings, timers, sink);
        assert!(matches!(
            ctx.advance(snap(0, vec![])),
            Err(MonitorError::Config(_))
        ));
        assert!(ctx.previous().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn removal_stops_entity_timers() {
        let mut f = fixture();
        f.ctx.advance(snap(0, vec![])).unwrap();
        f.ctx
            .advance(snap(10, vec![marker(5, MarkerKind::CargoShip, 2000.0, 2000.0)]))
            .unwrap();
        assert_eq!(f.timers.len(), 1);
        f.ctx.advance(snap(20, vec![])).unwrap();
        assert!(f.timers.is_empty());

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert!(f.queue.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_cancels_connection_timers() {
        let mut f = fixture();
        f.ctx.advance(snap(0, vec![])).unwrap();
        f.ctx
            .advance(snap(
                10,
                vec![
                    marker(5, MarkerKind::CargoShip, 2000.0, 2000.0),
                    marker(7, MarkerKind::Transport, 1000.0, 3010.0),
                ],
            ))
            .unwrap();
        assert_eq!(f.timers.active("conn_t").len(), 2);

        assert_eq!(f.ctx.teardown(), 2);
        assert!(f.timers.is_empty());
        assert!(f.ctx.previous().is_none());
        assert!(f.ctx.world().is_none());
        assert!(f.ctx.tracked_state(t(0)).entities.is_empty());

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(f.queue.try_recv().is_err());
    }
}
