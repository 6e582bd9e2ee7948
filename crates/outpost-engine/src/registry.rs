//! Owns one running monitor per connection.
//!
//! A monitor is the poller task, the two dispatcher tasks, the connection's
//! [`ConnectionContext`] and its timers. Nothing is shared between monitors.

use std::sync::Arc;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use outpost_core::{ConnectionId, EventRecord, GameLink, MessageFormatter, MonitorError, Notifier};
use outpost_settings::OutpostSettings;
use outpost_telemetry::{HistogramSummary, MetricsRecorder};

use crate::context::ConnectionContext;
use crate::dispatch::{
    spawn_dispatcher, DispatchParts, EventSink, LogNotifier, TeamChatNotifier, TemplateFormatter,
    WorldLabels,
};
use crate::poller::{spawn_poller, PollerParts};
use crate::timers::{TimerService, TimerView};
use crate::tracking::TrackedState;

const EVENT_STREAM_CAPACITY: usize = 1024;

struct MonitorHandle {
    context: Arc<Mutex<ConnectionContext>>,
    timers: Arc<TimerService>,
    labels: Arc<WorldLabels>,
    events: broadcast::Sender<EventRecord>,
    hint: Arc<Notify>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl MonitorHandle {
    fn shutdown(self, connection_id: &ConnectionId) {
        self.cancel.cancel();
        for task in &self.tasks {
            task.abort();
        }
        let timers = self.context.lock().teardown();
        self.labels.clear();
        info!(%connection_id, timers, "monitor stopped");
    }
}

#[derive(Default)]
pub struct MonitorRegistry {
    monitors: DashMap<ConnectionId, MonitorHandle>,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl MonitorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Start monitoring `link` with the notifier and formatter the settings
    /// select. Returns the connection's event stream.
    pub fn start(
        &self,
        connection_id: ConnectionId,
        link: Arc<dyn GameLink>,
        settings: &OutpostSettings,
    ) -> Result<broadcast::Receiver<EventRecord>, MonitorError> {
        let notifier: Arc<dyn Notifier> = if settings.notifications.team_chat {
            Arc::new(TeamChatNotifier::new(
                link.clone(),
                settings.polling.request_timeout(),
            ))
        } else {
            Arc::new(LogNotifier)
        };
        let formatter = Arc::new(TemplateFormatter::new(
            &settings.notifications.templates,
            settings.timers.oil_rig_unlock_secs,
        ));
        self.start_with(connection_id, link, settings, notifier, formatter)
    }

    pub fn start_with(
        &self,
        connection_id: ConnectionId,
        link: Arc<dyn GameLink>,
        settings: &OutpostSettings,
        notifier: Arc<dyn Notifier>,
        formatter: Arc<dyn MessageFormatter>,
    ) -> Result<broadcast::Receiver<EventRecord>, MonitorError> {
        let slot = match self.monitors.entry(connection_id.clone()) {
            Entry::Occupied(_) => {
                return Err(MonitorError::Config(format!(
                    "monitor for {connection_id} is already running"
                )))
            }
            Entry::Vacant(slot) => slot,
        };

        let timers = Arc::new(TimerService::new(settings.timers.warning_cadence()));
        let (sink, queue) = EventSink::new(connection_id.clone());
        let context = Arc::new(Mutex::new(ConnectionContext::new(
            settings,
            timers.clone(),
            sink.clone(),
        )));
        let labels = Arc::new(WorldLabels::new(settings.tracking.landmark_label_radius));
        let (events, stream) = broadcast::channel(EVENT_STREAM_CAPACITY);
        let hint = Arc::new(Notify::new());
        let cancel = CancellationToken::new();

        let mut tasks = spawn_dispatcher(
            DispatchParts {
                connection_id: connection_id.clone(),
                queue,
                events: events.clone(),
                settings: settings.notifications.clone(),
                formatter,
                labels: labels.clone(),
                notifier,
                metrics: self.metrics.clone(),
            },
            cancel.clone(),
        );
        tasks.push(spawn_poller(
            PollerParts {
                link,
                context: context.clone(),
                labels: labels.clone(),
                sink,
                settings: settings.polling.clone(),
                hint: hint.clone(),
                metrics: self.metrics.clone(),
            },
            cancel.clone(),
        ));

        let _ = slot.insert(MonitorHandle {
            context,
            timers,
            labels,
            events,
            hint,
            cancel,
            tasks,
        });
        self.track_active(1.0);
        info!(%connection_id, "monitor started");
        Ok(stream)
    }

    /// Stop a monitor. Its timers are cancelled before this returns.
    pub fn stop(&self, connection_id: &ConnectionId) -> bool {
        match self.monitors.remove(connection_id) {
            Some((id, handle)) => {
                handle.shutdown(&id);
                self.track_active(-1.0);
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) -> usize {
        let ids = self.ids();
        ids.iter().filter(|id| self.stop(id)).count()
    }

    pub fn subscribe(&self, connection_id: &ConnectionId) -> Option<broadcast::Receiver<EventRecord>> {
        self.monitors.get(connection_id).map(|m| m.events.subscribe())
    }

    /// Ask the poller to poll now instead of waiting for its next tick.
    pub fn hint(&self, connection_id: &ConnectionId) -> bool {
        match self.monitors.get(connection_id) {
            Some(m) => {
                m.hint.notify_one();
                true
            }
            None => false,
        }
    }

    pub fn timers(&self, connection_id: &ConnectionId) -> Option<Vec<TimerView>> {
        self.monitors
            .get(connection_id)
            .map(|m| m.timers.active(connection_id.as_str()))
    }

    pub fn tracked_state(&self, connection_id: &ConnectionId) -> Option<TrackedState> {
        self.monitors
            .get(connection_id)
            .map(|m| m.context.lock().tracked_state(Utc::now()))
    }

    /// Poll latency for a running monitor. `None` without a metrics recorder.
    pub fn poll_summary(&self, connection_id: &ConnectionId) -> Option<HistogramSummary> {
        let metrics = self.metrics.as_ref()?;
        if !self.monitors.contains_key(connection_id) {
            return None;
        }
        Some(metrics.histogram_summary(
            "poll_duration_ms",
            &[("connection", connection_id.as_str())],
        ))
    }

    fn track_active(&self, delta: f64) {
        if let Some(metrics) = &self.metrics {
            metrics.gauge_inc("monitors_active", &[], delta);
        }
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.monitors.iter().map(|m| m.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.monitors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.monitors.is_empty()
    }
}

impl Drop for MonitorRegistry {
    fn drop(&mut self) {
        let _ = self.stop_all();
    }
}
