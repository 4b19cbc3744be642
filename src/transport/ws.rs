//! WebSocket transport adapter.
//!
//! DESIGN
//! ======
//! One task per socket runs a `select!` loop:
//! - frames queued on the link → encode → socket
//! - socket messages → decode → deliver to the link
//! - local close → flush queued frames, send a close message, stop
//!
//! Frames travel as JSON text or protobuf binary depending on [`WireCodec`];
//! inbound accepts both. A message that cannot be decoded ends the link as a
//! transport failure.

use std::fmt;
use std::str::FromStr;

use frames::Frame;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{DisconnectReason, TransportChannel, Wire, channel};

#[derive(Debug, thiserror::Error)]
pub enum WsError {
    #[error("websocket connect failed: {0}")]
    Connect(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("websocket handshake failed: {0}")]
    Handshake(Box<tokio_tungstenite::tungstenite::Error>),
}

/// Outbound frame encoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WireCodec {
    #[default]
    Json,
    Protobuf,
}

impl FromStr for WireCodec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "protobuf" | "proto" => Ok(Self::Protobuf),
            other => Err(other.to_owned()),
        }
    }
}

impl fmt::Display for WireCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json => f.write_str("json"),
            Self::Protobuf => f.write_str("protobuf"),
        }
    }
}

// =============================================================================
// ENTRY POINTS
// =============================================================================

/// Connect to a background listening at `url`. `name` labels the connection.
///
/// # Errors
///
/// Returns [`WsError::Connect`] if the socket cannot be opened.
pub async fn connect(url: &str, name: &str, codec: WireCodec) -> Result<TransportChannel, WsError> {
    let (socket, _) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|error| WsError::Connect(Box::new(error)))?;
    Ok(spawn_socket(socket, name, codec))
}

/// Accept a link on an already-connected stream (the background side).
///
/// # Errors
///
/// Returns [`WsError::Handshake`] if the WebSocket upgrade fails.
pub async fn accept<S>(stream: S, name: &str, codec: WireCodec) -> Result<TransportChannel, WsError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let socket = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|error| WsError::Handshake(Box::new(error)))?;
    Ok(spawn_socket(socket, name, codec))
}

/// Drive an established socket as a link.
pub fn spawn_socket<S>(socket: WebSocketStream<S>, name: &str, codec: WireCodec) -> TransportChannel
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (transport, wire) = channel(format!("{name}:{}", Uuid::new_v4()));
    tokio::spawn(run_socket(socket, wire, codec));
    transport
}

// =============================================================================
// SOCKET LOOP
// =============================================================================

async fn run_socket<S>(socket: WebSocketStream<S>, mut wire: Wire, codec: WireCodec)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut source) = socket.split();
    let closed = wire.signal();
    info!(peer = %wire.peer(), %codec, "ws: link open");

    loop {
        tokio::select! {
            biased;
            Some(frame) = wire.next_outbound() => {
                if let Err(reason) = send_frame(&mut sink, &frame, codec).await {
                    wire.disconnect(reason);
                    break;
                }
            }
            () = closed.wait() => {
                while let Some(frame) = wire.try_next_outbound() {
                    if send_frame(&mut sink, &frame, codec).await.is_err() {
                        break;
                    }
                }
                if let Err(error) = sink.send(Message::Close(None)).await {
                    debug!(peer = %wire.peer(), %error, "ws: close message not sent");
                }
                break;
            }
            msg = source.next() => {
                let Some(msg) = msg else {
                    wire.disconnect(DisconnectReason::PeerClosed);
                    break;
                };
                let msg = match msg {
                    Ok(msg) => msg,
                    Err(error) => {
                        wire.disconnect(DisconnectReason::TransportFailure(error.to_string()));
                        break;
                    }
                };
                match decode_message(msg) {
                    Ok(Some(frame)) => wire.deliver(frame),
                    Ok(None) => {}
                    Err(reason) => {
                        warn!(peer = %wire.peer(), %reason, "ws: ending link");
                        wire.disconnect(reason);
                        break;
                    }
                }
            }
        }
    }

    info!(peer = %wire.peer(), "ws: link closed");
}

async fn send_frame<S>(
    sink: &mut SplitSink<WebSocketStream<S>, Message>,
    frame: &Frame,
    codec: WireCodec,
) -> Result<(), DisconnectReason>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let message = encode_message(frame, codec)?;
    sink.send(message)
        .await
        .map_err(|error| DisconnectReason::TransportFailure(error.to_string()))
}

fn encode_message(frame: &Frame, codec: WireCodec) -> Result<Message, DisconnectReason> {
    match codec {
        WireCodec::Json => frames::encode_frame_json(frame)
            .map(Message::text)
            .map_err(|error| DisconnectReason::TransportFailure(error.to_string())),
        WireCodec::Protobuf => Ok(Message::binary(frames::encode_frame(frame))),
    }
}

/// Decode one socket message. Control messages yield `Ok(None)`.
fn decode_message(message: Message) -> Result<Option<Frame>, DisconnectReason> {
    match message {
        Message::Text(text) => frames::decode_frame_json(text.as_str())
            .map(Some)
            .map_err(|error| DisconnectReason::TransportFailure(error.to_string())),
        Message::Binary(bytes) => frames::decode_frame(&bytes)
            .map(Some)
            .map_err(|error| DisconnectReason::TransportFailure(error.to_string())),
        Message::Close(_) => Err(DisconnectReason::PeerClosed),
        _ => Ok(None),
    }
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
