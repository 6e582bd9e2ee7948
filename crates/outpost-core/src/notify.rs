use async_trait::async_trait;

use crate::errors::MonitorError;
use crate::events::EventRecord;
use crate::grid::PositionLabeler;

/// Renders a typed event into display text. `None` means "do not announce".
pub trait MessageFormatter: Send + Sync {
    fn format(&self, record: &EventRecord, labels: &dyn PositionLabeler) -> Option<String>;
}

/// Delivers rendered messages to their audience.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, text: &str) -> Result<(), MonitorError>;
}
