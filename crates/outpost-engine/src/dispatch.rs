//! Ordered event queue, event stream fan-out and rate-limited notifications.
//!
//! Records flow through two tasks per connection:
//! 1. the publisher drains the unbounded queue, publishes every record on the
//!    connection's event stream, filters by kind and renders text;
//! 2. the sender delivers rendered text, keeping at least `min_interval`
//!    between two deliveries.
//!
//! Neither stage drops records, and producers never wait on either.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use outpost_core::{
    ConnectionId, Departure, EventRecord, GameLink, GridLabeler, MessageFormatter, MonitorError,
    Notifier, Position, PositionLabel, PositionLabeler, WorldEvent, WorldInfo,
};
use outpost_settings::NotificationSettings;
use outpost_telemetry::MetricsRecorder;

/// Producer side of a connection's event queue.
#[derive(Clone)]
pub struct EventSink {
    connection_id: ConnectionId,
    tx: mpsc::UnboundedSender<EventRecord>,
}

impl EventSink {
    pub fn new(connection_id: ConnectionId) -> (Self, mpsc::UnboundedReceiver<EventRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { connection_id, tx }, rx)
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    pub fn emit(&self, event: WorldEvent) {
        self.emit_at(event, Utc::now());
    }

    pub fn emit_at(&self, event: WorldEvent, at: DateTime<Utc>) {
        let record = EventRecord::new(self.connection_id.clone(), at, event);
        if self.tx.send(record).is_err() {
            debug!(connection_id = %self.connection_id, "event queue closed, record discarded");
        }
    }
}

/// Labeler that follows the connection's current world info.
pub struct WorldLabels {
    landmark_radius: f64,
    inner: RwLock<Option<GridLabeler>>,
}

impl WorldLabels {
    pub fn new(landmark_radius: f64) -> Self {
        Self {
            landmark_radius,
            inner: RwLock::new(None),
        }
    }

    pub fn set_world(&self, world: WorldInfo) {
        *self.inner.write() = Some(GridLabeler::new(world, self.landmark_radius));
    }

    pub fn clear(&self) {
        *self.inner.write() = None;
    }
}

impl PositionLabeler for WorldLabels {
    fn label(&self, pos: &Position) -> PositionLabel {
        match self.inner.read().as_ref() {
            Some(labeler) => labeler.label(pos),
            None => PositionLabel {
                grid: format!("({:.0}, {:.0})", pos.x, pos.y),
                landmark: None,
            },
        }
    }
}

const DEFAULT_TEMPLATES: &[(&str, &str)] = &[
    ("cargo_ship_spawned", "Cargo ship entered the map at {grid}"),
    ("cargo_ship_docked", "Cargo ship docked at {landmark}"),
    ("cargo_ship_egress_warning", "Cargo ship leaves in {minutes} min"),
    ("cargo_ship_egress", "Cargo ship is leaving the map"),
    ("transport_spawned", "Transport helicopter entered the map at {grid}"),
    ("patrol_helicopter_spawned", "Patrol helicopter entered the map at {grid}"),
    ("traveling_vendor_spawned", "Traveling vendor spotted at {grid}"),
    ("oil_rig_called", "{landmark} was called, crate unlocks in {minutes} min"),
    ("oil_rig_crate_warning", "{landmark} crate unlocks in {minutes} min"),
    ("oil_rig_crate_unlocked", "{landmark} crate is unlocked"),
    ("entity_gone", "{name} {outcome} at {grid}"),
    ("locked_crate_spawned", "Locked crate at {location}"),
    ("locked_crate_removed", "Locked crate at {grid} is gone"),
    ("explosion_detected", "Explosion at {location}"),
    ("vending_machine_added", "New vending machine at {grid}"),
    ("vending_machine_removed", "Vending machine at {grid} was removed"),
    ("member_joined", "{name} joined the team"),
    ("member_left", "{name} left the team"),
    ("member_online", "{name} is online"),
    ("member_offline", "{name} went offline at {grid}"),
    ("member_died", "{name} died at {location}"),
    ("member_respawned", "{name} respawned at {grid}"),
    ("leader_changed", "{name} is now team leader"),
    ("member_idle", "{name} has been idle for {minutes} min at {grid}"),
    ("member_active", "{name} is back after {minutes} min idle"),
];

fn minutes_ceil(secs: u64) -> u64 {
    secs.div_ceil(60)
}

fn kind_name(kind: outpost_core::MarkerKind) -> &'static str {
    use outpost_core::MarkerKind::*;
    match kind {
        CargoShip => "Cargo ship",
        Transport => "Transport helicopter",
        PatrolHelicopter => "Patrol helicopter",
        TravelingVendor => "Traveling vendor",
        LockedCrate => "Locked crate",
        Explosion => "Explosion",
        VendingMachine => "Vending machine",
        Player => "Player",
        GenericRadius => "Marker",
    }
}

fn outcome_text(outcome: Departure) -> &'static str {
    match outcome {
        Departure::Departed => "left the map",
        Departure::Terminated => "went down",
    }
}

/// Kind-keyed template table. Placeholders: `{grid}`, `{landmark}`,
/// `{location}`, `{name}`, `{minutes}`, `{outcome}`. An empty template
/// silences its kind.
pub struct TemplateFormatter {
    templates: HashMap<String, String>,
    oil_rig_unlock_secs: u64,
}

impl TemplateFormatter {
    pub fn new(overrides: &HashMap<String, String>, oil_rig_unlock_secs: u64) -> Self {
        let mut templates: HashMap<String, String> = DEFAULT_TEMPLATES
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        templates.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        Self {
            templates,
            oil_rig_unlock_secs,
        }
    }
}

impl Default for TemplateFormatter {
    fn default() -> Self {
        Self::new(&HashMap::new(), 15 * 60)
    }
}

impl MessageFormatter for TemplateFormatter {
    fn format(&self, record: &EventRecord, labels: &dyn PositionLabeler) -> Option<String> {
        let template = self.templates.get(record.kind())?;
        if template.is_empty() {
            return None;
        }

        let label = record.event.position().map(|p| labels.label(&p));
        let mut name = None;
        let mut landmark = label.as_ref().and_then(|l| l.landmark.clone());
        let mut minutes = None;
        let mut outcome = None;

        match &record.event {
            WorldEvent::CargoShipDocked { harbor, .. } => landmark = Some(harbor.clone()),
            WorldEvent::CargoShipEgressWarning { remaining_secs, .. } => {
                minutes = Some(minutes_ceil(*remaining_secs));
            }
            WorldEvent::OilRigCalled { rig, .. } => {
                landmark = Some(rig.clone());
                minutes = Some(minutes_ceil(self.oil_rig_unlock_secs));
            }
            WorldEvent::OilRigCrateWarning { rig, remaining_secs } => {
                landmark = Some(rig.clone());
                minutes = Some(minutes_ceil(*remaining_secs));
            }
            WorldEvent::OilRigCrateUnlocked { rig, .. } => landmark = Some(rig.clone()),
            WorldEvent::LockedCrateSpawned { landmark: Some(l), .. } => {
                landmark = Some(l.clone());
            }
            WorldEvent::EntityGone {
                kind, outcome: o, ..
            } => {
                name = Some(kind_name(*kind).to_string());
                outcome = Some(outcome_text(*o));
            }
            WorldEvent::MemberIdle { name: n, idle_secs, .. }
            | WorldEvent::MemberActive { name: n, idle_secs, .. } => {
                name = Some(n.clone());
                minutes = Some(idle_secs / 60);
            }
            WorldEvent::MemberJoined { name: n, .. }
            | WorldEvent::MemberLeft { name: n, .. }
            | WorldEvent::MemberOnline { name: n, .. }
            | WorldEvent::MemberOffline { name: n, .. }
            | WorldEvent::MemberDied { name: n, .. }
            | WorldEvent::MemberRespawned { name: n, .. }
            | WorldEvent::LeaderChanged { name: n, .. } => name = Some(n.clone()),
            _ => {}
        }

        let grid = label.as_ref().map(|l| l.grid.clone());
        let location = match (&grid, &landmark) {
            (Some(g), Some(l)) => Some(format!("{g} ({l})")),
            (Some(g), None) => Some(g.clone()),
            (None, l) => l.clone(),
        };

        let mut text = template.clone();
        for (placeholder, value) in [
            ("{grid}", grid),
            ("{landmark}", landmark),
            ("{location}", location),
            ("{name}", name),
            ("{minutes}", minutes.map(|m| m.to_string())),
            ("{outcome}", outcome.map(str::to_string)),
        ] {
            if text.contains(placeholder) {
                text = text.replace(placeholder, value.as_deref().unwrap_or("?"));
            }
        }
        Some(text)
    }
}

/// Writes messages to the log only.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn deliver(&self, text: &str) -> Result<(), MonitorError> {
        info!(target: "outpost::notify", text, "notification");
        Ok(())
    }
}

/// Posts messages into the in-game team chat.
pub struct TeamChatNotifier {
    link: Arc<dyn GameLink>,
    timeout: Duration,
}

impl TeamChatNotifier {
    pub fn new(link: Arc<dyn GameLink>, timeout: Duration) -> Self {
        Self { link, timeout }
    }
}

#[async_trait]
impl Notifier for TeamChatNotifier {
    async fn deliver(&self, text: &str) -> Result<(), MonitorError> {
        self.link.send_team_message(text.to_string(), self.timeout).await
    }
}

pub struct DispatchParts {
    pub connection_id: ConnectionId,
    pub queue: mpsc::UnboundedReceiver<EventRecord>,
    pub events: broadcast::Sender<EventRecord>,
    pub settings: NotificationSettings,
    pub formatter: Arc<dyn MessageFormatter>,
    pub labels: Arc<dyn PositionLabeler>,
    pub notifier: Arc<dyn Notifier>,
    pub metrics: Option<Arc<MetricsRecorder>>,
}

/// Spawn the publisher and sender tasks for one connection.
pub fn spawn_dispatcher(parts: DispatchParts, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
    let (text_tx, text_rx) = mpsc::unbounded_channel::<String>();
    let min_interval = Duration::from_millis(parts.settings.min_interval_ms);
    let sender = tokio::spawn(run_sender(
        parts.connection_id.clone(),
        text_rx,
        parts.notifier.clone(),
        min_interval,
        parts.metrics.clone(),
        cancel.clone(),
    ));
    let publisher = tokio::spawn(run_publisher(parts, text_tx, cancel));
    vec![publisher, sender]
}

async fn run_publisher(
    mut parts: DispatchParts,
    text_tx: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
) {
    loop {
        let record = tokio::select! {
            () = cancel.cancelled() => break,
            record = parts.queue.recv() => match record {
                Some(record) => record,
                None => break,
            },
        };

        let kind = record.kind();
        debug!(connection_id = %parts.connection_id, kind, "event");
        if let Some(metrics) = &parts.metrics {
            metrics.counter_inc(
                "events_total",
                &[("connection", parts.connection_id.as_str()), ("kind", kind)],
                1,
            );
        }
        // No subscribers is fine; the stream is optional.
        let _ = parts.events.send(record.clone());

        if !parts.settings.is_enabled(kind) {
            continue;
        }
        if let Some(text) = parts.formatter.format(&record, parts.labels.as_ref()) {
            if text_tx.send(text).is_err() {
                break;
            }
        }
    }
}

async fn run_sender(
    connection_id: ConnectionId,
    mut text_rx: mpsc::UnboundedReceiver<String>,
    notifier: Arc<dyn Notifier>,
    min_interval: Duration,
    metrics: Option<Arc<MetricsRecorder>>,
    cancel: CancellationToken,
) {
    let mut last_sent: Option<Instant> = None;
    loop {
        let text = tokio::select! {
            () = cancel.cancelled() => break,
            text = text_rx.recv() => match text {
                Some(text) => text,
                None => break,
            },
        };

        if let Some(last) = last_sent {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep_until(last + min_interval) => {}
            }
        }

        let outcome = match notifier.deliver(&text).await {
            Ok(()) => "ok",
            Err(e) => {
                warn!(connection_id = %connection_id, error = %e, "notification delivery failed");
                e.error_kind()
            }
        };
        last_sent = Some(Instant::now());
        if let Some(metrics) = &metrics {
            metrics.counter_inc(
                "notifications_total",
                &[("connection", connection_id.as_str()), ("outcome", outcome)],
                1,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outpost_core::{Landmark, MarkerId, MarkerKind, SubjectId};
    use parking_lot::Mutex;

    fn world() -> WorldInfo {
        WorldInfo {
            name: "test".into(),
            map_size: 4500.0,
            landmarks: vec![Landmark::new("large_oil_rig", Position::new(4000.0, 4000.0))],
        }
    }

    fn labels() -> WorldLabels {
        let labels = WorldLabels::new(250.0);
        labels.set_world(world());
        labels
    }

    fn record(event: WorldEvent) -> EventRecord {
        EventRecord::new(ConnectionId::from_raw("conn_a"), Utc::now(), event)
    }

    /// Notifier that records delivery times.
    #[derive(Default)]
    struct Recording {
        sent: Mutex<Vec<(Instant, String)>>,
    }

    #[async_trait]
    impl Notifier for Recording {
        async fn deliver(&self, text: &str) -> Result<(), MonitorError> {
            self.sent.lock().push((Instant::now(), text.to_string()));
            if text.contains("fail") {
                return Err(MonitorError::Transport("chat down".into()));
            }
            Ok(())
        }
    }

    #[test]
    fn formats_grid_and_landmark() {
        let f = TemplateFormatter::default();
        let text = f
            .format(
                &record(WorldEvent::ExplosionDetected {
                    marker_id: MarkerId(1),
                    position: Position::new(4010.0, 3990.0),
                }),
                &labels(),
            )
            .unwrap();
        assert_eq!(text, "Explosion at AB3 (Large Oil Rig)");
    }

    #[test]
    fn formats_minutes_and_outcome() {
        let f = TemplateFormatter::default();
        let l = labels();
        let warn = f
            .format(
                &record(WorldEvent::CargoShipEgressWarning {
                    marker_id: MarkerId(3),
                    remaining_secs: 590,
                }),
                &l,
            )
            .unwrap();
        assert_eq!(warn, "Cargo ship leaves in 10 min");

        let gone = f
            .format(
                &record(WorldEvent::EntityGone {
                    marker_id: MarkerId(4),
                    kind: MarkerKind::PatrolHelicopter,
                    position: Position::new(2250.0, 2250.0),
                    outcome: Departure::Terminated,
                }),
                &l,
            )
            .unwrap();
        assert_eq!(gone, "Patrol helicopter went down at P15");
    }

    #[test]
    fn overrides_and_silencing() {
        let overrides = HashMap::from([
            ("member_died".to_string(), "RIP {name}".to_string()),
            ("member_online".to_string(), String::new()),
        ]);
        let f = TemplateFormatter::new(&overrides, 900);
        let died = record(WorldEvent::MemberDied {
            subject_id: SubjectId(1),
            name: "alice".into(),
            position: Position::new(1.0, 1.0),
            death_marker: 5,
        });
        assert_eq!(f.format(&died, &labels()).as_deref(), Some("RIP alice"));
        let online = record(WorldEvent::MemberOnline {
            subject_id: SubjectId(1),
            name: "alice".into(),
            position: Position::new(1.0, 1.0),
        });
        assert_eq!(f.format(&online, &labels()), None);
        assert_eq!(f.format(&record(WorldEvent::ConnectionLost), &labels()), None);
    }

    #[test]
    fn labels_without_world_fall_back_to_coordinates() {
        let l = WorldLabels::new(250.0);
        assert_eq!(l.label(&Position::new(12.4, 99.6)).grid, "(12, 100)");
        l.set_world(world());
        assert_eq!(l.label(&Position::new(10.0, 4490.0)).grid, "A0");
        l.clear();
        assert!(l.label(&Position::new(10.0, 4490.0)).grid.starts_with('('));
    }

    fn parts(
        queue: mpsc::UnboundedReceiver<EventRecord>,
        notifier: Arc<dyn Notifier>,
        settings: NotificationSettings,
    ) -> (DispatchParts, broadcast::Receiver<EventRecord>) {
        let (events, events_rx) = broadcast::channel(64);
        let parts = DispatchParts {
            connection_id: ConnectionId::from_raw("conn_a"),
            queue,
            events,
            settings,
            formatter: Arc::new(TemplateFormatter::default()),
            labels: Arc::new(labels()),
            notifier,
            metrics: None,
        };
        (parts, events_rx)
    }

    fn joined(n: u64) -> WorldEvent {
        WorldEvent::MemberJoined {
            subject_id: SubjectId(n),
            name: format!("p{n}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn messages_are_spaced_and_never_dropped() {
        let (sink, queue) = EventSink::new(ConnectionId::from_raw("conn_a"));
        let notifier = Arc::new(Recording::default());
        let (parts, mut events) = parts(queue, notifier.clone(), NotificationSettings::default());
        let cancel = CancellationToken::new();
        let _tasks = spawn_dispatcher(parts, cancel.clone());

        let started = Instant::now();
        for n in 0..5 {
            sink.emit(joined(n));
        }
        // The stream sees every record right away.
        for n in 0..5 {
            assert_eq!(events.recv().await.unwrap().event, joined(n));
        }

        tokio::time::sleep(Duration::from_secs(30)).await;
        let sent = notifier.sent.lock().clone();
        let texts: Vec<_> = sent.iter().map(|(_, t)| t.as_str()).collect();
        assert_eq!(
            texts,
            vec![
                "p0 joined the team",
                "p1 joined the team",
                "p2 joined the team",
                "p3 joined the team",
                "p4 joined the team",
            ]
        );
        for pair in sent.windows(2) {
            assert!(pair[1].0 - pair[0].0 >= Duration::from_millis(3_000));
        }
        assert!(sent[0].0 - started < Duration::from_millis(3_000));
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_kinds_reach_stream_but_not_notifier() {
        let (sink, queue) = EventSink::new(ConnectionId::from_raw("conn_a"));
        let notifier = Arc::new(Recording::default());
        let settings = NotificationSettings {
            enabled: vec!["member_left".into()],
            ..NotificationSettings::default()
        };
        let (parts, mut events) = parts(queue, notifier.clone(), settings);
        let _tasks = spawn_dispatcher(parts, CancellationToken::new());

        sink.emit(joined(1));
        sink.emit(WorldEvent::MemberLeft {
            subject_id: SubjectId(1),
            name: "p1".into(),
        });
        assert_eq!(events.recv().await.unwrap().kind(), "member_joined");
        assert_eq!(events.recv().await.unwrap().kind(), "member_left");
        tokio::time::sleep(Duration::from_secs(1)).await;
        let sent = notifier.sent.lock().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, "p1 left the team");
    }

    #[tokio::test(start_paused = true)]
    async fn delivery_failures_do_not_stop_the_sender() {
        let (sink, queue) = EventSink::new(ConnectionId::from_raw("conn_a"));
        let notifier = Arc::new(Recording::default());
        let overrides = HashMap::from([("member_left".to_string(), "fail {name}".to_string())]);
        let metrics = Arc::new(MetricsRecorder::new());
        let (mut parts, _events) = parts(queue, notifier.clone(), NotificationSettings::default());
        parts.formatter = Arc::new(TemplateFormatter::new(&overrides, 900));
        parts.metrics = Some(metrics.clone());
        let _tasks = spawn_dispatcher(parts, CancellationToken::new());

        sink.emit(WorldEvent::MemberLeft {
            subject_id: SubjectId(1),
            name: "p1".into(),
        });
        sink.emit(joined(2));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(notifier.sent.lock().len(), 2);
        assert_eq!(
            metrics.counter_value(
                "notifications_total",
                &[("connection", "conn_a"), ("outcome", "transport")]
            ),
            1
        );
        assert_eq!(
            metrics.counter_value("events_total", &[("connection", "conn_a"), ("kind", "member_joined")]),
            1
        );
    }
}
