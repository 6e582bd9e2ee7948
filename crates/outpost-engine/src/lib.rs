//! # outpost-engine
//!
//! Turns periodic server snapshots into world events:
//!
//! - [`poller`] polls a [`GameLink`](outpost_core::GameLink) on a fixed interval
//! - [`context`] diffs each snapshot against the last one and derives events
//! - [`timers`] runs countdowns (cargo egress, crate unlocks) with warnings
//! - [`activity`] detects idle team members
//! - [`dispatch`] publishes, filters, renders and rate-limits notifications
//! - [`registry`] owns one running monitor per connection

#![deny(unsafe_code)]

pub mod activity;
pub mod context;
mod diff;
pub mod dispatch;
pub mod poller;
pub mod registry;
pub mod timers;
pub mod tracking;

pub use activity::{ActivityRecord, ActivityTracker, ActivityTransition};
pub use context::ConnectionContext;
pub use dispatch::{
    spawn_dispatcher, DispatchParts, EventSink, LogNotifier, TeamChatNotifier, TemplateFormatter,
    WorldLabels,
};
pub use poller::{spawn_poller, PollerParts};
pub use registry::MonitorRegistry;
pub use timers::{TimerKey, TimerService, TimerView, WarningView};
pub use tracking::{
    EntityView, SubjectView, TrackedEntity, TrackedState, TrackedSubject, TrajectoryLimits,
    TrajectorySample,
};
