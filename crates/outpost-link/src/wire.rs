//! JSON text frames exchanged with the game server.
//!
//! ```text
//! client:    {"v":1,"seq":N,"player_id":..,"player_token":..,"request":{"type":..}}
//! response:  {"v":1,"seq":N,"response":{"type":..}}
//! broadcast: {"v":1,"broadcast":{"type":..}}
//! ```

use serde::{Deserialize, Serialize};

use outpost_core::link::{Broadcast, Request, Response};
use outpost_core::MonitorError;

pub const PROTOCOL_VERSION: u32 = 1;

/// Player credentials attached to every request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub player_id: u64,
    pub player_token: i64,
}

#[derive(Serialize)]
struct ClientFrame<'a> {
    v: u32,
    seq: u64,
    player_id: u64,
    player_token: i64,
    request: &'a Request,
}

#[derive(Deserialize)]
struct ServerFrame {
    v: u32,
    #[serde(default)]
    seq: Option<u64>,
    #[serde(default)]
    response: Option<Response>,
    #[serde(default)]
    broadcast: Option<Broadcast>,
}

/// A decoded server frame.
#[derive(Debug, PartialEq)]
pub enum Inbound {
    Response { seq: u64, response: Response },
    Broadcast(Broadcast),
}

pub fn encode_request(seq: u64, credentials: Credentials, request: &Request) -> Result<String, MonitorError> {
    let frame = ClientFrame {
        v: PROTOCOL_VERSION,
        seq,
        player_id: credentials.player_id,
        player_token: credentials.player_token,
        request,
    };
    Ok(serde_json::to_string(&frame)?)
}

/// Decode one inbound text frame. Frames without a `seq` are broadcasts.
pub fn decode(text: &str) -> Result<Inbound, MonitorError> {
    let frame: ServerFrame = serde_json::from_str(text)?;
    if frame.v != PROTOCOL_VERSION {
        return Err(MonitorError::Protocol(format!(
            "unsupported protocol version {}",
            frame.v
        )));
    }
    match (frame.seq, frame.response, frame.broadcast) {
        (Some(seq), Some(response), _) => Ok(Inbound::Response { seq, response }),
        (_, _, Some(broadcast)) => Ok(Inbound::Broadcast(broadcast)),
        (Some(seq), None, None) => Err(MonitorError::Protocol(format!(
            "frame with seq {seq} has no response body"
        ))),
        (None, _, None) => Err(MonitorError::Protocol("frame has neither seq nor broadcast".into())),
    }
}
