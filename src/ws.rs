//! Websocket transport: bridges an async `ocpp1.6` websocket onto the
//! synchronous [`Connection`] capability.
//!
//! The socket lives on a tokio runtime; frames cross into the poll-driven
//! core through channels, so the core itself stays single-threaded and
//! non-blocking. Reconnection with exponential backoff is handled here —
//! from the core's point of view a reconnect is just `is_connected`
//! flipping.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{
        handshake::client::Request,
        http::{header, Uri},
        protocol::WebSocketConfig,
        Message,
    },
};
use tracing::{debug, error, info, warn};

use crate::connection::Connection;

/// OCPP 1.6 websocket subprotocol.
const OCPP_SUBPROTOCOL: &str = "ocpp1.6";

#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Central system URL without the charge point id.
    pub backend_url: String,
    /// Charge point identity, appended as the URL path segment.
    pub charge_point_id: String,
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
}

impl WsConfig {
    pub fn new(backend_url: impl Into<String>, charge_point_id: impl Into<String>) -> WsConfig {
        WsConfig {
            backend_url: backend_url.into(),
            charge_point_id: charge_point_id.into(),
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_delay: Duration::from_secs(300),
        }
    }

    fn url(&self) -> String {
        format!(
            "{}/{}",
            self.backend_url.trim_end_matches('/'),
            self.charge_point_id
        )
    }
}

/// [`Connection`] backed by a tokio-tungstenite client task.
pub struct WsConnection {
    outgoing: mpsc::UnboundedSender<String>,
    incoming: std_mpsc::Receiver<String>,
    connected: Arc<AtomicBool>,
}

impl WsConnection {
    /// Spawns the socket task on the given runtime and returns the handle
    /// the core polls.
    pub fn connect(handle: &tokio::runtime::Handle, config: WsConfig) -> WsConnection {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = std_mpsc::channel();
        let connected = Arc::new(AtomicBool::new(false));

        handle.spawn(run_socket(config, outgoing_rx, incoming_tx, connected.clone()));

        WsConnection { outgoing: outgoing_tx, incoming: incoming_rx, connected }
    }
}

impl Connection for WsConnection {
    fn try_send(&mut self, msg: &str) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.outgoing.send(msg.to_string()).is_ok()
    }

    fn try_recv(&mut self) -> Option<String> {
        self.incoming.try_recv().ok()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

async fn run_socket(
    config: WsConfig,
    mut outgoing: mpsc::UnboundedReceiver<String>,
    incoming: std_mpsc::Sender<String>,
    connected: Arc<AtomicBool>,
) {
    let mut delay = config.reconnect_delay;

    loop {
        info!(url = %config.url(), "connecting to central system");
        match run_session(&config, &mut outgoing, &incoming, &connected).await {
            Ok(()) => {
                info!("websocket closed by central system");
                delay = config.reconnect_delay;
            }
            Err(err) => {
                error!(%err, "websocket session failed");
            }
        }
        connected.store(false, Ordering::Relaxed);

        info!(?delay, "reconnecting");
        tokio::time::sleep(delay).await;
        delay = std::cmp::min(delay * 2, config.max_reconnect_delay);
    }
}

async fn run_session(
    config: &WsConfig,
    outgoing: &mut mpsc::UnboundedReceiver<String>,
    incoming: &std_mpsc::Sender<String>,
    connected: &Arc<AtomicBool>,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let url = config.url();
    let uri: Uri = url
        .parse()
        .map_err(|_| tokio_tungstenite::tungstenite::Error::Url(
            tokio_tungstenite::tungstenite::error::UrlError::NoPathOrQuery,
        ))?;

    let request = Request::builder()
        .uri(&url)
        .header(header::SEC_WEBSOCKET_PROTOCOL, OCPP_SUBPROTOCOL)
        .header(header::HOST, uri.host().unwrap_or_default())
        .header(header::CONNECTION, "Upgrade")
        .header(header::UPGRADE, "websocket")
        .header(header::SEC_WEBSOCKET_VERSION, "13")
        .header(header::SEC_WEBSOCKET_KEY, tokio_tungstenite::tungstenite::handshake::client::generate_key())
        .body(())
        .map_err(|_| tokio_tungstenite::tungstenite::Error::Url(
            tokio_tungstenite::tungstenite::error::UrlError::NoPathOrQuery,
        ))?;

    let ws_config = WebSocketConfig {
        max_message_size: Some(64 * 1024),
        max_frame_size: Some(16 * 1024),
        ..Default::default()
    };

    let (ws_stream, response) = connect_async_with_config(request, Some(ws_config), false).await?;

    let accepted = response
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok());
    if accepted != Some(OCPP_SUBPROTOCOL) {
        warn!(?accepted, "central system did not accept the ocpp1.6 subprotocol");
    }

    info!(%url, "websocket connected");
    connected.store(true, Ordering::Relaxed);

    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    loop {
        tokio::select! {
            frame = outgoing.recv() => {
                let Some(text) = frame else { return Ok(()) };
                debug!(%text, "ws send");
                ws_tx.send(Message::Text(text)).await?;
            }
            frame = ws_rx.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        debug!(%text, "ws recv");
                        if incoming.send(text).is_err() {
                            // the core side is gone
                            return Ok(());
                        }
                    }
                    Some(Ok(Message::Ping(_))) => {
                        // pong is answered by tungstenite itself
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => warn!("non-text websocket frame ignored"),
                    Some(Err(err)) => return Err(err),
                }
            }
        }
    }
}
