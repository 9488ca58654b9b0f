//! Gemini Live WebSocket client
//!
//! The socket is split after the setup handshake. A writer task owns the sink
//! and serialises outbound messages; a reader task parses inbound frames and
//! forwards them on a bounded channel. The session sees only a
//! [`LiveChannel`].

use crate::gemini::{
    BidiGenerateContentSetup, Blob, ClientMessage, Result, ServerMessage, TransportError,
    LIVE_ENDPOINT,
};
use async_trait::async_trait;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const SETUP_TIMEOUT: Duration = Duration::from_secs(10);
const INBOUND_QUEUE: usize = 100;

type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Work item for the writer task.
#[derive(Debug)]
pub enum Outbound {
    Message(ClientMessage),
    /// Send a close frame and stop writing.
    Close,
}

/// An open, set-up Live API session.
pub struct LiveChannel {
    outbound: mpsc::UnboundedSender<Outbound>,
    inbound: mpsc::Receiver<Result<ServerMessage>>,
}

impl LiveChannel {
    pub fn new(
        outbound: mpsc::UnboundedSender<Outbound>,
        inbound: mpsc::Receiver<Result<ServerMessage>>,
    ) -> Self {
        Self { outbound, inbound }
    }

    /// Queue a message without waiting for it to be written.
    pub fn send(&self, message: ClientMessage) -> Result<()> {
        self.outbound
            .send(Outbound::Message(message))
            .map_err(|_| TransportError::Closing)
    }

    pub fn send_audio(&self, blob: Blob) -> Result<()> {
        self.send(ClientMessage::audio(blob))
    }

    /// Next inbound message; `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<Result<ServerMessage>> {
        self.inbound.recv().await
    }

    /// End the audio stream and ask the writer to close the socket.
    /// Nothing further is delivered.
    pub fn close(&mut self) -> Result<()> {
        self.inbound.close();
        self.send(ClientMessage::audio_stream_end())?;
        self.outbound
            .send(Outbound::Close)
            .map_err(|_| TransportError::Closing)
    }
}

/// Opens Live API sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect, send `setup` and wait until the server acknowledges it.
    async fn connect(&self, api_key: &str, setup: BidiGenerateContentSetup)
        -> Result<LiveChannel>;
}

/// Connector for the hosted Gemini Live endpoint.
#[derive(Debug, Clone)]
pub struct GeminiConnector {
    endpoint: String,
}

impl Default for GeminiConnector {
    fn default() -> Self {
        Self::with_endpoint(LIVE_ENDPOINT)
    }
}

impl GeminiConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl Connector for GeminiConnector {
    async fn connect(
        &self,
        api_key: &str,
        setup: BidiGenerateContentSetup,
    ) -> Result<LiveChannel> {
        info!("🌐 Connecting to Gemini Live ({})", setup.model);

        let url = format!("{}?key={}", self.endpoint, api_key);
        let (ws_stream, response) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url))
            .await
            .map_err(|_| {
                error!("Timeout opening WebSocket connection");
                TransportError::Timeout
            })??;
        debug!("WebSocket handshake status: {}", response.status());

        let (mut sink, mut stream) = ws_stream.split();

        let setup_json = serde_json::to_string(&ClientMessage::Setup(setup))?;
        sink.send(Message::Text(setup_json.into())).await?;
        debug!("Setup message sent, waiting for acknowledgment");

        tokio::time::timeout(SETUP_TIMEOUT, wait_for_setup_complete(&mut stream))
            .await
            .map_err(|_| {
                error!("Timeout waiting for setup complete message");
                TransportError::Timeout
            })??;
        info!("✅ Gemini session setup complete");

        let (inbound_tx, inbound_rx) = mpsc::channel::<Result<ServerMessage>>(INBOUND_QUEUE);
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();

        let reader_tx = inbound_tx.clone();
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                let message = match frame {
                    Ok(Message::Text(text)) => parse_frame(text.as_str()),
                    Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                        Ok(text) => parse_frame(text),
                        Err(_) => {
                            debug!("Ignoring non-UTF-8 binary frame ({} bytes)", bytes.len());
                            None
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        info!("WebSocket closed by server: {:?}", frame);
                        let _ = reader_tx.send(Err(TransportError::ConnectionClosed)).await;
                        break;
                    }
                    Ok(_) => None,
                    Err(e) => {
                        error!("WebSocket error: {}", e);
                        let _ = reader_tx.send(Err(e.into())).await;
                        break;
                    }
                };

                if let Some(message) = message {
                    if reader_tx.send(Ok(message)).await.is_err() {
                        break;
                    }
                }
            }
            debug!("Inbound message task terminated");
        });

        tokio::spawn(async move {
            while let Some(item) = outbound_rx.recv().await {
                match item {
                    Outbound::Message(message) => {
                        let json = match serde_json::to_string(&message) {
                            Ok(json) => json,
                            Err(e) => {
                                error!("Failed to serialize outbound message: {}", e);
                                continue;
                            }
                        };
                        if let Err(e) = sink.send(Message::Text(json.into())).await {
                            let err = match e {
                                WsError::AlreadyClosed | WsError::ConnectionClosed => {
                                    TransportError::Closing
                                }
                                other => TransportError::WebSocket(other),
                            };
                            warn!("Failed to send message: {}", err);
                            let _ = inbound_tx.send(Err(err)).await;
                            break;
                        }
                    }
                    Outbound::Close => {
                        if let Err(e) = sink.close().await {
                            debug!("WebSocket close failed: {}", e);
                        }
                        break;
                    }
                }
            }
            debug!("Outbound message task terminated");
        });

        Ok(LiveChannel::new(outbound_tx, inbound_rx))
    }
}

async fn wait_for_setup_complete(stream: &mut WsStream) -> Result<()> {
    while let Some(frame) = stream.next().await {
        let message = match frame? {
            Message::Text(text) => parse_frame(text.as_str()),
            Message::Binary(bytes) => std::str::from_utf8(&bytes).ok().and_then(parse_frame),
            Message::Close(frame) => {
                let reason = frame
                    .map(|f| f.reason.as_str().to_string())
                    .filter(|reason| !reason.is_empty())
                    .unwrap_or_else(|| "connection closed during setup".to_string());
                error!("Setup rejected: {}", reason);
                return Err(TransportError::Rejected(reason));
            }
            _ => None,
        };

        match message {
            Some(message) if message.setup_complete.is_some() => return Ok(()),
            Some(_) => debug!("Ignoring message received before setup completed"),
            None => {}
        }
    }
    Err(TransportError::ConnectionClosed)
}

fn parse_frame(text: &str) -> Option<ServerMessage> {
    match serde_json::from_str::<ServerMessage>(text) {
        Ok(message) => Some(message),
        Err(e) => {
            error!("Failed to parse server message: {}", e);
            debug!("Raw message: {}", text);
            None
        }
    }
}
