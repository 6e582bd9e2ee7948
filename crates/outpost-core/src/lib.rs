pub mod errors;
pub mod events;
pub mod geometry;
pub mod grid;
pub mod ids;
pub mod link;
pub mod notify;
pub mod snapshot;

pub use errors::MonitorError;
pub use events::{Departure, EventRecord, WorldEvent};
pub use geometry::{MapBounds, Position};
pub use grid::{GridLabeler, Landmark, LandmarkKind, PositionLabel, PositionLabeler, WorldInfo};
pub use ids::{ConnectionId, MarkerId, SubjectId};
pub use link::{Broadcast, GameLink, LinkNotice, Request, Response};
pub use notify::{MessageFormatter, Notifier};
pub use snapshot::{EntityMarker, MarkerAttributes, MarkerKind, Snapshot, TeamMember, TeamRoster};
