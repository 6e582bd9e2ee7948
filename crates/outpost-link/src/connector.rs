//! Socket layer behind the session.
//!
//! A [`Connector`] turns an endpoint into a pair of text-frame channels. The
//! session never touches the socket directly, so tests can swap in an
//! in-memory pipe.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use outpost_core::MonitorError;

const FRAME_BUFFER: usize = 64;

/// Text frame channels of one live connection. Dropping `tx` closes the
/// socket; `rx` yields `None` once the remote side is gone.
pub struct Frames {
    pub tx: mpsc::Sender<String>,
    pub rx: mpsc::Receiver<String>,
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, endpoint: &str) -> Result<Frames, MonitorError>;
}

/// Production connector over `tokio-tungstenite`.
pub struct WsConnector {
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, endpoint: &str) -> Result<Frames, MonitorError> {
        let (ws, _) = tokio::time::timeout(self.connect_timeout, connect_async(endpoint))
            .await
            .map_err(|_| MonitorError::Timeout(self.connect_timeout))?
            .map_err(|e| MonitorError::Transport(format!("websocket connect: {e}")))?;

        let (mut ws_tx, mut ws_rx) = ws.split();
        let (out_tx, mut out_rx) = mpsc::channel::<String>(FRAME_BUFFER);
        let (in_tx, in_rx) = mpsc::channel::<String>(FRAME_BUFFER);

        let _writer = tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                    debug!(error = %e, "websocket write failed");
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        let _reader = tokio::spawn(async move {
            while let Some(msg) = ws_rx.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if in_tx.send(text.as_str().to_owned()).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        debug!(?frame, "websocket closed by server");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "websocket read failed");
                        break;
                    }
                }
            }
        });

        Ok(Frames {
            tx: out_tx,
            rx: in_rx,
        })
    }
}
