//! Boundary between the engine and a live server session.
//!
//! The engine only talks to a server through [`GameLink`]; the connection
//! manager in `outpost-link` is the production implementation.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::errors::MonitorError;
use crate::grid::{Landmark, WorldInfo};
use crate::ids::SubjectId;
use crate::snapshot::{EntityMarker, TeamRoster};

/// Calls the engine can make against a server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    GetInfo,
    GetMap,
    GetMarkers,
    GetTeam,
    SendTeamMessage { text: String },
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Self::GetInfo => "get_info",
            Self::GetMap => "get_map",
            Self::GetMarkers => "get_markers",
            Self::GetTeam => "get_team",
            Self::SendTeamMessage { .. } => "send_team_message",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Info { name: String, map_size: f64 },
    Map { landmarks: Vec<Landmark> },
    Markers { markers: Vec<EntityMarker> },
    Team { roster: TeamRoster },
    Ack,
    Error { code: String },
}

/// Unsolicited messages pushed by the server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Broadcast {
    TeamChanged,
    TeamMessage {
        sender: SubjectId,
        name: String,
        text: String,
    },
    EntityChanged {
        entity_id: u32,
        value: bool,
    },
    #[serde(other)]
    Unknown,
}

/// Session lifecycle transitions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LinkNotice {
    Connected,
    Disconnected { manual: bool },
    Reconnecting { attempt: u32, delay_ms: u64 },
    Reconnected { attempts: u32 },
    ReconnectExhausted { attempts: u32 },
}

fn unexpected(request: &str, response: &Response) -> MonitorError {
    MonitorError::Protocol(format!("unexpected response to {request}: {response:?}"))
}

#[async_trait]
pub trait GameLink: Send + Sync {
    /// Send a correlated request and wait for the matching response.
    async fn request(&self, request: Request, timeout: Duration) -> Result<Response, MonitorError>;

    /// Unsolicited inbound messages.
    fn subscribe(&self) -> broadcast::Receiver<Broadcast>;

    /// Lifecycle notices (drops, reconnects, terminal failure).
    fn notices(&self) -> broadcast::Receiver<LinkNotice>;

    fn is_connected(&self) -> bool;

    async fn world_info(&self, timeout: Duration) -> Result<WorldInfo, MonitorError> {
        let (name, map_size) = match self.request(Request::GetInfo, timeout).await? {
            Response::Info { name, map_size } => (name, map_size),
            other => return Err(unexpected("get_info", &other)),
        };
        if !(map_size.is_finite() && map_size > 0.0) {
            return Err(MonitorError::Protocol(format!("invalid map size {map_size}")));
        }
        let landmarks = match self.request(Request::GetMap, timeout).await? {
            Response::Map { landmarks } => landmarks,
            other => return Err(unexpected("get_map", &other)),
        };
        Ok(WorldInfo {
            name,
            map_size,
            landmarks,
        })
    }

    async fn markers(&self, timeout: Duration) -> Result<Vec<EntityMarker>, MonitorError> {
        match self.request(Request::GetMarkers, timeout).await? {
            Response::Markers { markers } => Ok(markers),
            other => Err(unexpected("get_markers", &other)),
        }
    }

    async fn team(&self, timeout: Duration) -> Result<TeamRoster, MonitorError> {
        match self.request(Request::GetTeam, timeout).await? {
            Response::Team { roster } => Ok(roster),
            other => Err(unexpected("get_team", &other)),
        }
    }

    async fn send_team_message(&self, text: String, timeout: Duration) -> Result<(), MonitorError> {
        match self.request(Request::SendTeamMessage { text }, timeout).await? {
            Response::Ack => Ok(()),
            other => Err(unexpected("send_team_message", &other)),
        }
    }
}
