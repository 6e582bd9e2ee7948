//! Per-player idle detection.
//!
//! A subject is idle once it has not moved more than `movement_threshold`
//! between two consecutive observations for longer than `idle_dwell`.
//! Transitions are edge-triggered off a stored `was_idle` flag, so slow
//! polling never produces a second "idle" for the same stretch. Time spent
//! offline is not stillness: it is cut out of the clock when a subject comes
//! back, while stillness accumulated before going offline is kept.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use outpost_core::{Position, SubjectId};
use outpost_settings::ActivitySettings;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActivityTransition {
    IdleStarted { idle_for: Duration },
    IdleEnded { idle_for: Duration },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub last_position: Position,
    pub last_movement: DateTime<Utc>,
    pub was_idle: bool,
    #[serde(default)]
    pub offline_since: Option<DateTime<Utc>>,
}

fn elapsed(from: DateTime<Utc>, to: DateTime<Utc>) -> Duration {
    (to - from).to_std().unwrap_or_default()
}

pub struct ActivityTracker {
    movement_threshold: f64,
    idle_dwell: Duration,
    records: HashMap<SubjectId, ActivityRecord>,
}

impl ActivityTracker {
    pub fn new(movement_threshold: f64, idle_dwell: Duration) -> Self {
        Self {
            movement_threshold,
            idle_dwell,
            records: HashMap::new(),
        }
    }

    pub fn from_settings(settings: &ActivitySettings) -> Self {
        Self::new(
            settings.movement_threshold,
            Duration::from_secs(settings.idle_dwell_secs),
        )
    }

    /// Feed one observation. Offline observations only mark the record as
    /// away; the first online one after that skips the clock past the gap.
    pub fn update(
        &mut self,
        subject: SubjectId,
        position: Position,
        online: bool,
        now: DateTime<Utc>,
    ) -> Option<ActivityTransition> {
        if !online {
            if let Some(record) = self.records.get_mut(&subject) {
                let _ = record.offline_since.get_or_insert(now);
            }
            return None;
        }
        let Some(record) = self.records.get_mut(&subject) else {
            let _ = self.records.insert(
                subject,
                ActivityRecord {
                    last_position: position,
                    last_movement: now,
                    was_idle: false,
                    offline_since: None,
                },
            );
            return None;
        };

        if let Some(since) = record.offline_since.take() {
            if now > since {
                record.last_movement = record.last_movement + (now - since);
            }
        }

        let moved = record.last_position.distance_to(&position) > self.movement_threshold;
        record.last_position = position;
        let still_for = elapsed(record.last_movement, now);

        if moved {
            record.last_movement = now;
            if record.was_idle {
                record.was_idle = false;
                return Some(ActivityTransition::IdleEnded { idle_for: still_for });
            }
            return None;
        }

        if !record.was_idle && still_for > self.idle_dwell {
            record.was_idle = true;
            return Some(ActivityTransition::IdleStarted { idle_for: still_for });
        }
        None
    }

    /// How long the subject has been still, if that exceeds the dwell.
    pub fn idle_duration(&self, subject: SubjectId, now: DateTime<Utc>) -> Option<Duration> {
        let record = self.records.get(&subject)?;
        let still_for = elapsed(record.last_movement, now);
        (still_for > self.idle_dwell).then_some(still_for)
    }

    pub fn is_idle(&self, subject: SubjectId) -> bool {
        self.records.get(&subject).is_some_and(|r| r.was_idle)
    }

    pub fn record(&self, subject: SubjectId) -> Option<&ActivityRecord> {
        self.records.get(&subject)
    }

    pub fn forget(&mut self, subject: SubjectId) {
        let _ = self.records.remove(&subject);
    }

    pub fn reset(&mut self) {
        self.records.clear();
    }
}
