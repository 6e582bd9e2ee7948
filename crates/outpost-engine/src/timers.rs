//! Named countdown timers with one-shot warnings.
//!
//! Every live timer owns a tokio task that sleeps until its deadline and
//! checks warning thresholds on a coarse cadence. Warnings fire within one
//! cadence of the remaining time crossing their threshold.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

type ExpireFn = Box<dyn FnOnce() + Send + 'static>;
type WarnFn = Box<dyn FnOnce(Duration) + Send + 'static>;

/// Timer identity. `scope` is the owning connection id.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimerKey {
    pub scope: String,
    pub name: String,
}

impl TimerKey {
    pub fn new(scope: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for TimerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.scope, self.name)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WarningView {
    pub threshold_secs: u64,
    pub fired: bool,
}

/// Read-only view of a live timer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimerView {
    pub key: TimerKey,
    pub duration_secs: u64,
    pub remaining_secs: u64,
    pub warnings: Vec<WarningView>,
}

struct Warning {
    threshold: Duration,
    fired: bool,
    on_warning: Option<WarnFn>,
}

struct Entry {
    generation: u64,
    duration: Duration,
    deadline: Instant,
    warnings: Arc<Mutex<Vec<Warning>>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Entry {
    fn cancel(self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

type Entries = Arc<Mutex<HashMap<TimerKey, Entry>>>;

pub struct TimerService {
    cadence: Duration,
    entries: Entries,
    generation: AtomicU64,
}

impl TimerService {
    pub fn new(cadence: Duration) -> Self {
        Self {
            cadence: cadence.max(Duration::from_millis(1)),
            entries: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        }
    }

    /// Start a timer unless one is already live for `key`. A live timer keeps
    /// its deadline and callback; returns `false` in that case.
    pub fn start<F>(&self, key: TimerKey, duration: Duration, on_expire: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let mut entries = self.entries.lock();
        if entries.contains_key(&key) {
            trace!(timer = %key, "timer already running");
            return false;
        }
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + duration;
        let warnings = Arc::new(Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_timer(
            self.entries.clone(),
            key.clone(),
            generation,
            deadline,
            self.cadence,
            warnings.clone(),
            cancel.clone(),
            Box::new(on_expire),
        ));
        debug!(timer = %key, duration_secs = duration.as_secs(), "timer started");
        let _ = entries.insert(
            key,
            Entry {
                generation,
                duration,
                deadline,
                warnings,
                cancel,
                task,
            },
        );
        true
    }

    /// Register a one-shot warning on a live timer. Fires the first time the
    /// remaining time is observed at or below `threshold`.
    pub fn add_warning<F>(&self, key: &TimerKey, threshold: Duration, on_warning: F) -> bool
    where
        F: FnOnce(Duration) + Send + 'static,
    {
        let entries = self.entries.lock();
        let Some(entry) = entries.get(key) else {
            return false;
        };
        entry.warnings.lock().push(Warning {
            threshold,
            fired: false,
            on_warning: Some(Box::new(on_warning)),
        });
        true
    }

    /// Cancel a timer and its warnings. The key is free again immediately.
    pub fn stop(&self, key: &TimerKey) -> bool {
        let removed = self.entries.lock().remove(key);
        match removed {
            Some(entry) => {
                debug!(timer = %key, "timer stopped");
                entry.cancel();
                true
            }
            None => false,
        }
    }

    pub fn time_left(&self, key: &TimerKey) -> Option<Duration> {
        self.entries
            .lock()
            .get(key)
            .map(|e| e.deadline.saturating_duration_since(Instant::now()))
    }

    pub fn is_running(&self, key: &TimerKey) -> bool {
        self.entries.lock().contains_key(key)
    }

    /// Cancel every timer in `scope`. Returns how many were stopped.
    pub fn stop_scope(&self, scope: &str) -> usize {
        let removed: Vec<Entry> = {
            let mut entries = self.entries.lock();
            let keys: Vec<TimerKey> = entries.keys().filter(|k| k.scope == scope).cloned().collect();
            keys.iter().filter_map(|k| entries.remove(k)).collect()
        };
        let count = removed.len();
        removed.into_iter().for_each(Entry::cancel);
        if count > 0 {
            debug!(scope, count, "timers stopped for scope");
        }
        count
    }

    pub fn stop_all(&self) -> usize {
        let removed: Vec<Entry> = self.entries.lock().drain().map(|(_, e)| e).collect();
        let count = removed.len();
        removed.into_iter().for_each(Entry::cancel);
        count
    }

    /// Live timers in `scope`, ordered by name.
    pub fn active(&self, scope: &str) -> Vec<TimerView> {
        let now = Instant::now();
        let entries = self.entries.lock();
        let mut views: Vec<TimerView> = entries
            .iter()
            .filter(|(k, _)| k.scope == scope)
            .map(|(k, e)| TimerView {
                key: k.clone(),
                duration_secs: e.duration.as_secs(),
                remaining_secs: e.deadline.saturating_duration_since(now).as_secs(),
                warnings: e
                    .warnings
                    .lock()
                    .iter()
                    .map(|w| WarningView {
                        threshold_secs: w.threshold.as_secs(),
                        fired: w.fired,
                    })
                    .collect(),
            })
            .collect();
        views.sort_by(|a, b| a.key.cmp(&b.key));
        views
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        let _ = self.stop_all();
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_timer(
    entries: Entries,
    key: TimerKey,
    generation: u64,
    deadline: Instant,
    cadence: Duration,
    warnings: Arc<Mutex<Vec<Warning>>>,
    cancel: CancellationToken,
    on_expire: ExpireFn,
) {
    let mut ticker = tokio::time::interval(cadence);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            () = tokio::time::sleep_until(deadline) => break,
            _ = ticker.tick() => check_warnings(&warnings, deadline),
        }
    }

    let live = {
        let mut map = entries.lock();
        match map.get(&key) {
            Some(entry) if entry.generation == generation => map.remove(&key).is_some(),
            _ => false,
        }
    };
    if live {
        debug!(timer = %key, "timer expired");
        on_expire();
    }
}

fn check_warnings(warnings: &Mutex<Vec<Warning>>, deadline: Instant) {
    let remaining = deadline.saturating_duration_since(Instant::now());
    let due: Vec<WarnFn> = warnings
        .lock()
        .iter_mut()
        .filter(|w| !w.fired && remaining <= w.threshold)
        .filter_map(|w| {
            w.fired = true;
            w.on_warning.take()
        })
        .collect();
    for on_warning in due {
        on_warning(remaining);
    }
}
