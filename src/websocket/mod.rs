//! Websocket adapter
//!
//! A thin capability layer over `tokio-tungstenite`: dial with subprotocol
//! offers and a read limit, send/receive single JSON messages, ping with a
//! bounded deadline, and close with a normal status. Library errors funnel
//! through the `From<tungstenite::Error>` conversion on the crate error
//! type, and [`close_code`] holds the numeric statuses, so every retry/fatal
//! decision upstream keys off one classification.
//!
//! Concurrency contract: the reader half is used only by the session's read
//! loop; the writer half is behind a mutex so subscribe/unsubscribe/ping
//! frames from different tasks are serialized.

use crate::error::{GraphQLClientError, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use tungstenite::client::IntoClientRequest;
use tungstenite::error::Error as WsError;
use tungstenite::protocol::frame::coding::CloseCode;
use tungstenite::protocol::{CloseFrame, Message, WebSocketConfig};

/// Close status codes the client reacts to
pub mod close_code {
    /// Close status could not be determined
    pub const UNKNOWN: i32 = -1;
    pub const NORMAL_CLOSURE: i32 = 1000;
    pub const NO_STATUS_RECEIVED: i32 = 1005;
    pub const ABNORMAL_CLOSURE: i32 = 1006;
    pub const INTERNAL_ERROR: i32 = 1011;
    pub const BAD_GATEWAY: i32 = 1014;

    // graphql websocket protocol codes
    pub const INVALID_MESSAGE: i32 = 4400;
    pub const UNAUTHORIZED: i32 = 4401;
    pub const CONNECTION_INITIALISATION_TIMEOUT: i32 = 4408;
    pub const SUBSCRIBER_ALREADY_EXISTS: i32 = 4409;
    pub const TOO_MANY_INITIALISATION_REQUESTS: i32 = 4429;
}

/// Deadline applied to a control ping
const PING_TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Dial options for the websocket connection
#[derive(Debug, Clone)]
pub struct WebSocketOptions {
    /// Handshake timeout
    pub connect_timeout: Duration,
    /// Maximum inbound message size in bytes (`None` keeps the library default)
    pub read_limit: Option<usize>,
}

impl Default for WebSocketOptions {
    fn default() -> Self {
        WebSocketOptions {
            connect_timeout: Duration::from_secs(10),
            read_limit: None,
        }
    }
}

impl WebSocketOptions {
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn with_read_limit(mut self, read_limit: usize) -> Self {
        self.read_limit = Some(read_limit);
        self
    }
}

/// An established websocket connection with split reader/writer halves
pub struct WebSocketConn {
    reader: Mutex<SplitStream<WsStream>>,
    writer: Mutex<SplitSink<WsStream, Message>>,
}

impl WebSocketConn {
    /// Dial `url`, offering the given `Sec-WebSocket-Protocol` values
    pub async fn connect(
        url: &str,
        subprotocols: &[&str],
        options: &WebSocketOptions,
    ) -> Result<Self> {
        let mut request = url
            .into_client_request()
            .map_err(|e| GraphQLClientError::Configuration(format!("invalid websocket URL: {e}")))?;
        if !subprotocols.is_empty() {
            let value = subprotocols
                .join(", ")
                .parse()
                .map_err(|_| GraphQLClientError::Configuration("invalid subprotocol name".into()))?;
            request.headers_mut().insert("Sec-WebSocket-Protocol", value);
        }

        let mut config = WebSocketConfig::default();
        if let Some(limit) = options.read_limit {
            config.max_message_size = Some(limit);
            config.max_frame_size = Some(limit);
        }

        let (stream, response) = timeout(
            options.connect_timeout,
            connect_async_with_config(request, Some(config), false),
        )
        .await
        .map_err(|_| GraphQLClientError::WebSocket("connection timeout".into()))?
        .map_err(|e| GraphQLClientError::WebSocket(format!("connection failed: {e}")))?;

        debug!(url, status = %response.status(), "websocket connected");

        let (writer, reader) = stream.split();
        Ok(WebSocketConn {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        })
    }

    /// Read frames until one JSON message decodes into `T`
    ///
    /// Control frames are skipped; a close frame surfaces as
    /// [`GraphQLClientError::CloseStatus`] with the peer's code and reason.
    pub async fn receive<T: DeserializeOwned>(&self) -> Result<T> {
        let mut reader = self.reader.lock().await;
        loop {
            let message = match reader.next().await {
                Some(Ok(message)) => message,
                Some(Err(err)) => return Err(err.into()),
                None => return Err(GraphQLClientError::WebSocket("connection closed (eof)".into())),
            };

            match message {
                Message::Text(text) => {
                    return serde_json::from_str(&text)
                        .map_err(|e| GraphQLClientError::Serialization(e.to_string()));
                }
                Message::Binary(data) => {
                    return serde_json::from_slice(&data)
                        .map_err(|e| GraphQLClientError::Serialization(e.to_string()));
                }
                Message::Close(frame) => {
                    let (code, reason) = match frame {
                        Some(frame) => (u16::from(frame.code) as i32, frame.reason.to_string()),
                        None => (close_code::NO_STATUS_RECEIVED, String::new()),
                    };
                    return Err(GraphQLClientError::CloseStatus { code, reason });
                }
                // control frames: tungstenite answers pings on its own
                _ => continue,
            }
        }
    }

    /// Serialize `value` as JSON and send it as one text frame
    pub async fn send_json<T: Serialize>(&self, value: &T) -> Result<()> {
        let text = serde_json::to_string(value)?;
        let mut writer = self.writer.lock().await;
        writer.send(Message::Text(text.into())).await?;
        Ok(())
    }

    /// Send a control ping with a bounded deadline
    ///
    /// A missed deadline maps to `NO_STATUS_RECEIVED`: the peer is treated as
    /// silently gone.
    pub async fn ping(&self) -> Result<()> {
        let send = async {
            let mut writer = self.writer.lock().await;
            writer.send(Message::Ping(Vec::new().into())).await
        };
        match timeout(PING_TIMEOUT, send).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(GraphQLClientError::CloseStatus {
                code: close_code::NO_STATUS_RECEIVED,
                reason: "ping deadline exceeded".into(),
            }),
        }
    }

    /// Close the connection with a normal-closure status; already-closed
    /// connections are not an error
    pub async fn close(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        };
        match writer.send(Message::Close(Some(frame))).await {
            Ok(()) => Ok(()),
            Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
