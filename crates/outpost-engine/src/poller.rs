//! Fixed-interval snapshot poll loop for one connection.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use outpost_core::{
    Broadcast, ConnectionId, GameLink, LinkNotice, MonitorError, Snapshot, TeamRoster, WorldEvent,
};
use outpost_settings::PollingSettings;
use outpost_telemetry::MetricsRecorder;

use crate::context::ConnectionContext;
use crate::dispatch::{EventSink, WorldLabels};

pub struct PollerParts {
    pub link: Arc<dyn GameLink>,
    pub context: Arc<Mutex<ConnectionContext>>,
    pub labels: Arc<WorldLabels>,
    pub sink: EventSink,
    pub settings: PollingSettings,
    pub hint: Arc<Notify>,
    pub metrics: Option<Arc<MetricsRecorder>>,
}

pub fn spawn_poller(parts: PollerParts, cancel: CancellationToken) -> JoinHandle<()> {
    let poller = Poller {
        connection_id: parts.sink.connection_id().clone(),
        parts,
        need_world: true,
        cancel,
    };
    tokio::spawn(poller.run())
}

struct Poller {
    connection_id: ConnectionId,
    parts: PollerParts,
    /// World info is (re)fetched on the first poll after every connect.
    need_world: bool,
    cancel: CancellationToken,
}

impl Poller {
    async fn run(mut self) {
        let cancel = self.cancel.clone();
        let mut broadcasts = self.parts.link.subscribe();
        let mut notices = self.parts.link.notices();
        let (mut broadcasts_open, mut notices_open) = (true, true);
        let hint = self.parts.hint.clone();

        let mut ticker = tokio::time::interval(self.parts.settings.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(
            connection_id = %self.connection_id,
            interval_ms = self.parts.settings.interval_ms,
            "poller started"
        );

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                notice = notices.recv(), if notices_open => match notice {
                    Ok(notice) => match self.on_notice(notice) {
                        Err(e) if e.is_terminal() => {
                            self.close(&e);
                            break;
                        }
                        Err(e) => self.report(&e),
                        Ok(()) => {}
                    },
                    Err(RecvError::Lagged(n)) => {
                        warn!(connection_id = %self.connection_id, skipped = n, "link notices lagged");
                    }
                    Err(RecvError::Closed) => notices_open = false,
                },
                _ = ticker.tick() => self.tick().await,
                () = hint.notified() => {
                    trace!(connection_id = %self.connection_id, "poll hint");
                    self.tick().await;
                    ticker.reset();
                }
                message = broadcasts.recv(), if broadcasts_open => match message {
                    Ok(Broadcast::TeamChanged) => {
                        trace!(connection_id = %self.connection_id, "team changed, polling early");
                        self.tick().await;
                        ticker.reset();
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => {
                        debug!(connection_id = %self.connection_id, skipped = n, "broadcasts lagged");
                    }
                    Err(RecvError::Closed) => broadcasts_open = false,
                },
            }
        }
        debug!(connection_id = %self.connection_id, "poller stopped");
    }

    /// Terminal notices come back as errors; the loop tears down and exits.
    fn on_notice(&mut self, notice: LinkNotice) -> Result<(), MonitorError> {
        let sink = &self.parts.sink;
        match notice {
            LinkNotice::Connected => self.need_world = true,
            LinkNotice::Disconnected { manual: false } => sink.emit(WorldEvent::ConnectionLost),
            LinkNotice::Disconnected { manual: true } => return Err(MonitorError::Closed),
            LinkNotice::Reconnecting { attempt, delay_ms } => {
                debug!(connection_id = %self.connection_id, attempt, delay_ms, "link reconnecting");
            }
            LinkNotice::Reconnected { attempts } => {
                self.need_world = true;
                sink.emit(WorldEvent::ConnectionRestored { attempts });
            }
            LinkNotice::ReconnectExhausted { attempts } => {
                sink.emit(WorldEvent::ReconnectExhausted { attempts });
                return Err(MonitorError::ReconnectExhausted { attempts });
            }
        }
        Ok(())
    }

    /// The connection is gone for good: drop its timers and tracked state.
    fn close(&self, reason: &MonitorError) {
        let timers = self.parts.context.lock().teardown();
        self.parts.labels.clear();
        if matches!(reason, MonitorError::Closed) {
            debug!(connection_id = %self.connection_id, timers, "link closed locally, poller stopped");
        } else {
            warn!(
                connection_id = %self.connection_id,
                error = %reason,
                timers,
                "connection terminated, poller stopped"
            );
        }
    }

    async fn tick(&mut self) {
        if !self.parts.link.is_connected() {
            trace!(connection_id = %self.connection_id, "link down, poll skipped");
            self.record("skipped", None);
            return;
        }
        let started = Instant::now();
        let outcome = match self.poll_once().await {
            Ok(events) => {
                trace!(connection_id = %self.connection_id, events, "poll complete");
                "ok"
            }
            Err(e) => {
                self.report(&e);
                e.error_kind()
            }
        };
        self.record(outcome, Some(started));
    }

    async fn poll_once(&mut self) -> Result<usize, MonitorError> {
        let link = &self.parts.link;
        let timeout = self.parts.settings.request_timeout();

        // Cancellation is checked under the context lock: a stopping monitor
        // cancels before it tears the context down.
        if self.need_world {
            let world = link.world_info(timeout).await?;
            let mut context = self.parts.context.lock();
            if self.cancel.is_cancelled() {
                return Ok(0);
            }
            self.parts.labels.set_world(world.clone());
            context.set_world(world);
            self.need_world = false;
        }

        let markers = link.markers(timeout).await?;
        let team = match link.team(timeout).await {
            Ok(roster) => roster,
            Err(e) if e.is_silent() => {
                trace!(connection_id = %self.connection_id, error = %e, "no team");
                TeamRoster::default()
            }
            Err(e) => return Err(e),
        };

        let snapshot = Snapshot::new(Utc::now(), markers, team);
        let at = snapshot.taken_at;
        let events = {
            let mut context = self.parts.context.lock();
            if self.cancel.is_cancelled() {
                return Ok(0);
            }
            context.advance(snapshot)?
        };
        let count = events.len();
        for event in events {
            self.parts.sink.emit_at(event, at);
        }
        Ok(count)
    }

    fn report(&self, e: &MonitorError) {
        let connection_id = &self.connection_id;
        if e.is_silent() {
            trace!(%connection_id, error = %e, "poll absorbed");
        } else if e.is_transient() {
            debug!(%connection_id, error = %e, "poll failed, retrying next tick");
        } else if matches!(e, MonitorError::Protocol(_)) {
            warn!(%connection_id, error = %e, "snapshot rejected");
        } else {
            error!(%connection_id, error = %e, "poll failed");
        }
    }

    fn record(&self, outcome: &str, started: Option<Instant>) {
        let Some(metrics) = &self.parts.metrics else {
            return;
        };
        let connection = self.connection_id.as_str();
        metrics.counter_inc(
            "polls_total",
            &[("connection", connection), ("outcome", outcome)],
            1,
        );
        if let Some(started) = started {
            metrics.histogram_observe(
                "poll_duration_ms",
                &[("connection", connection)],
                started.elapsed().as_secs_f64() * 1000.0,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use outpost_core::{
        EntityMarker, EventRecord, Landmark, MarkerKind, Position, Request, Response, SubjectId,
        TeamMember,
    };
    use outpost_settings::OutpostSettings;
    use tokio::sync::{broadcast, mpsc};

    use crate::timers::TimerService;

    /// In-memory server answering requests from mutable state.
    struct FakeServer {
        markers: Mutex<Vec<EntityMarker>>,
        team: Mutex<Result<TeamRoster, MonitorError>>,
        fail_markers: Mutex<Option<MonitorError>>,
        /// Requests with this name wait on the gate before answering.
        hold: Mutex<Option<(&'static str, Arc<Notify>)>>,
        connected: AtomicBool,
        seen: Mutex<HashMap<&'static str, usize>>,
        broadcast_tx: broadcast::Sender<Broadcast>,
        notice_tx: broadcast::Sender<LinkNotice>,
    }

    impl FakeServer {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                markers: Mutex::new(Vec::new()),
                team: Mutex::new(Ok(TeamRoster::default())),
                fail_markers: Mutex::new(None),
                hold: Mutex::new(None),
                connected: AtomicBool::new(true),
                seen: Mutex::new(HashMap::new()),
                broadcast_tx: broadcast::channel(8).0,
                notice_tx: broadcast::channel(8).0,
            })
        }

        fn count(&self, name: &str) -> usize {
            self.seen.lock().get(name).copied().unwrap_or(0)
        }

        fn set_markers(&self, markers: Vec<EntityMarker>) {
            *self.markers.lock() = markers;
        }
    }

    #[async_trait]
    impl GameLink for FakeServer {
        async fn request(&self, request: Request, _timeout: Duration) -> Result<Response, MonitorError> {
            *self.seen.lock().entry(request.name()).or_default() += 1;
            let hold = self.hold.lock().clone();
            if let Some((name, gate)) = hold {
                if name == request.name() {
                    gate.notified().await;
                }
            }
            match request {
                Request::GetInfo => Ok(Response::Info {
                    name: "fake".into(),
                    map_size: 4000.0,
                }),
                Request::GetMap => Ok(Response::Map {
                    landmarks: vec![Landmark::new("large_oil_rig", Position::new(3000.0, 3000.0))],
                }),
                Request::GetMarkers => match self.fail_markers.lock().take() {
                    Some(e) => Err(e),
                    None => Ok(Response::Markers {
                        markers: self.markers.lock().clone(),
                    }),
                },
                Request::GetTeam => self
                    .team
                    .lock()
                    .clone()
                    .map(|roster| Response::Team { roster }),
                Request::SendTeamMessage { .. } => Ok(Response::Ack),
            }
        }

        fn subscribe(&self) -> broadcast::Receiver<Broadcast> {
            self.broadcast_tx.subscribe()
        }

        fn notices(&self) -> broadcast::Receiver<LinkNotice> {
            self.notice_tx.subscribe()
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }

    struct Harness {
        server: Arc<FakeServer>,
        context: Arc<Mutex<ConnectionContext>>,
        hint: Arc<Notify>,
        queue: mpsc::UnboundedReceiver<EventRecord>,
        metrics: Arc<MetricsRecorder>,
        cancel: CancellationToken,
        timers: Arc<TimerService>,
    }

    const INTERVAL: Duration = Duration::from_secs(10);

    fn harness() -> Harness {
        let settings = OutpostSettings::default();
        let server = FakeServer::new();
        let timers = Arc::new(TimerService::new(settings.timers.warning_cadence()));
        let (sink, queue) = EventSink::new(ConnectionId::from_raw("conn_p"));
        let context = Arc::new(Mutex::new(ConnectionContext::new(
            &settings,
            timers.clone(),
            sink.clone(),
        )));
        let hint = Arc::new(Notify::new());
        let metrics = Arc::new(MetricsRecorder::new());
        let cancel = CancellationToken::new();
        let _task = spawn_poller(
            PollerParts {
                link: server.clone(),
                context: context.clone(),
                labels: Arc::new(WorldLabels::new(settings.tracking.landmark_label_radius)),
                sink,
                settings: settings.polling.clone(),
                hint: hint.clone(),
                metrics: Some(metrics.clone()),
            },
            cancel.clone(),
        );
        Harness {
            server,
            context,
            hint,
            queue,
            metrics,
            cancel,
            timers,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    fn ship(id: u32) -> EntityMarker {
        EntityMarker::new(id, MarkerKind::CargoShip, Position::new(2000.0, 2000.0))
    }

    #[tokio::test(start_paused = true)]
    async fn first_poll_is_baseline_then_hint_polls_early() {
        let mut h = harness();
        h.server.set_markers(vec![ship(1)]);
        settle().await;
        assert_eq!(h.server.count("get_info"), 1);
        assert_eq!(h.server.count("get_markers"), 1);
        assert!(h.queue.try_recv().is_err());

        h.server.set_markers(vec![ship(1), ship(2)]);
        let started = Instant::now();
        h.hint.notify_one();
        let record = h.queue.recv().await.unwrap();
        assert!(started.elapsed() < INTERVAL);
        assert_eq!(record.kind(), "cargo_ship_spawned");
        assert_eq!(record.event.marker_id().map(|m| m.0), Some(2));
        assert_eq!(h.server.count("get_info"), 1);
        h.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn team_changed_broadcast_triggers_poll() {
        let mut h = harness();
        settle().await;
        *h.server.team.lock() = Ok(TeamRoster {
            leader: None,
            members: vec![TeamMember {
                subject_id: SubjectId(7),
                name: "scout".into(),
                online: true,
                alive: true,
                position: Position::new(10.0, 10.0),
                death_marker: None,
                spawn_marker: None,
            }],
        });
        let started = Instant::now();
        let _ = h.server.broadcast_tx.send(Broadcast::TeamChanged);
        let record = h.queue.recv().await.unwrap();
        assert!(started.elapsed() < INTERVAL);
        assert_eq!(record.kind(), "member_joined");
    }

    #[tokio::test(start_paused = true)]
    async fn polls_on_interval() {
        let h = harness();
        settle().await;
        tokio::time::sleep(INTERVAL * 3).await;
        assert_eq!(h.server.count("get_markers"), 4);
        assert_eq!(
            h.metrics
                .counter_value("polls_total", &[("connection", "conn_p"), ("outcome", "ok")]),
            4
        );
    }

    #[tokio::test(start_paused = true)]
    async fn disconnected_link_skips_poll() {
        let h = harness();
        h.server.connected.store(false, Ordering::SeqCst);
        settle().await;
        tokio::time::sleep(INTERVAL).await;
        assert_eq!(h.server.count("get_markers"), 0);
        assert!(h.context.lock().previous().is_none());
        assert_eq!(
            h.metrics.counter_value(
                "polls_total",
                &[("connection", "conn_p"), ("outcome", "skipped")]
            ),
            2
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_polls_are_absorbed_and_loop_continues() {
        let mut h = harness();
        h.server.set_markers(vec![ship(1)]);
        settle().await;
        let baseline = h.context.lock().previous().map(|s| s.taken_at);

        // Transient failure.
        *h.server.fail_markers.lock() = Some(MonitorError::Timeout(Duration::from_secs(10)));
        h.hint.notify_one();
        settle().await;
        // Invalid snapshot.
        h.server.set_markers(vec![ship(3), ship(3)]);
        h.hint.notify_one();
        settle().await;
        assert_eq!(h.context.lock().previous().map(|s| s.taken_at), baseline);
        assert_eq!(
            h.metrics.counter_value(
                "polls_total",
                &[("connection", "conn_p"), ("outcome", "protocol")]
            ),
            1
        );

        h.server.set_markers(vec![]);
        h.hint.notify_one();
        let record = h.queue.recv().await.unwrap();
        assert_eq!(record.kind(), "entity_gone");
    }

    #[tokio::test(start_paused = true)]
    async fn missing_team_is_an_empty_roster() {
        let h = harness();
        *h.server.team.lock() = Err(MonitorError::NotFound("team".into()));
        settle().await;
        let context = h.context.lock();
        let previous = context.previous().unwrap();
        assert!(previous.team.members.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn link_notices_become_events_and_refetch_world() {
        let mut h = harness();
        settle().await;
        assert_eq!(h.server.count("get_info"), 1);

        let _ = h
            .server
            .notice_tx
            .send(LinkNotice::Disconnected { manual: false });
        assert_eq!(h.queue.recv().await.unwrap().event, WorldEvent::ConnectionLost);

        let _ = h.server.notice_tx.send(LinkNotice::Reconnected { attempts: 2 });
        assert_eq!(
            h.queue.recv().await.unwrap().event,
            WorldEvent::ConnectionRestored { attempts: 2 }
        );
        h.hint.notify_one();
        settle().await;
        assert_eq!(h.server.count("get_info"), 2);

        let _ = h
            .server
            .notice_tx
            .send(LinkNotice::ReconnectExhausted { attempts: 5 });
        assert_eq!(
            h.queue.recv().await.unwrap().event,
            WorldEvent::ReconnectExhausted { attempts: 5 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_polling() {
        let h = harness();
        settle().await;
        h.cancel.cancel();
        settle().await;
        tokio::time::sleep(INTERVAL * 2).await;
        assert_eq!(h.server.count("get_markers"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_reconnect_tears_down_and_stops() {
        let mut h = harness();
        settle().await;
        h.server.set_markers(vec![ship(9)]);
        h.hint.notify_one();
        assert_eq!(h.queue.recv().await.unwrap().kind(), "cargo_ship_spawned");
        assert_eq!(h.timers.active("conn_p").len(), 1);

        let _ = h
            .server
            .notice_tx
            .send(LinkNotice::Disconnected { manual: false });
        let _ = h
            .server
            .notice_tx
            .send(LinkNotice::ReconnectExhausted { attempts: 5 });
        assert_eq!(h.queue.recv().await.unwrap().event, WorldEvent::ConnectionLost);
        assert_eq!(
            h.queue.recv().await.unwrap().event,
            WorldEvent::ReconnectExhausted { attempts: 5 }
        );
        settle().await;

        assert!(h.timers.active("conn_p").is_empty());
        let state = h.context.lock().tracked_state(Utc::now());
        assert!(state.entities.is_empty());
        assert!(h.context.lock().world().is_none());

        let polls = h.server.count("get_markers");
        tokio::time::sleep(INTERVAL * 3).await;
        assert_eq!(h.server.count("get_markers"), polls);
    }

    #[tokio::test(start_paused = true)]
    async fn local_close_tears_down_and_stops() {
        let h = harness();
        h.server.set_markers(vec![ship(1)]);
        settle().await;
        assert!(h.context.lock().previous().is_some());

        let _ = h
            .server
            .notice_tx
            .send(LinkNotice::Disconnected { manual: true });
        settle().await;
        assert!(h.context.lock().previous().is_none());

        tokio::time::sleep(INTERVAL * 3).await;
        assert_eq!(h.server.count("get_markers"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_in_flight_at_cancel_leaves_context_untouched() {
        let h = harness();
        settle().await;
        // Next poll refetches the world; hold it mid-request.
        let _ = h.server.notice_tx.send(LinkNotice::Connected);
        settle().await;
        let hold = Arc::new(Notify::new());
        *h.server.hold.lock() = Some(("get_info", hold.clone()));
        h.hint.notify_one();
        settle().await;
        assert_eq!(h.server.count("get_info"), 2);

        // Same order as a stopping monitor: cancel, then tear down.
        h.cancel.cancel();
        let _ = h.context.lock().teardown();
        h.server.set_markers(vec![ship(1)]);
        hold.notify_one();
        settle().await;

        assert!(h.context.lock().world().is_none());
        assert!(h.context.lock().previous().is_none());
        assert!(h.timers.active("conn_p").is_empty());
    }
}
