//! Transport seam between the client state machine and the socket library.

use std::pin::Pin;

use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt, future};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use crate::errors::TransportError;
use crate::protocol::CLOSE_ABNORMAL;

/// One frame on an open socket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WireFrame {
    /// UTF-8 text (every protocol message).
    Text(String),
    /// Binary data; not part of the protocol and ignored on receipt.
    Binary(Vec<u8>),
    /// Transport-level ping.
    Ping(Vec<u8>),
    /// Transport-level pong.
    Pong(Vec<u8>),
    /// Close handshake.
    Close {
        /// Close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
}

/// Outgoing half of an open transport.
pub type FrameSink = Pin<Box<dyn Sink<WireFrame, Error = TransportError> + Send>>;
/// Incoming half of an open transport. The stream ends when the socket drops.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<WireFrame, TransportError>> + Send>>;

/// Opens sockets.
///
/// The client only ever talks to this trait, so tests can substitute an
/// in-memory transport for the network.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a socket to `url`. The returned future is raced against the
    /// connect timeout.
    async fn connect(&self, url: &str) -> Result<(FrameSink, FrameStream), TransportError>;
}

/// [`Connector`] backed by `tokio-tungstenite`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TungsteniteConnector;

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self, url: &str) -> Result<(FrameSink, FrameStream), TransportError> {
        let (ws, _response) = connect_async(url).await.map_err(TransportError::new)?;
        let (sink, stream) = ws.split();

        let sink = sink
            .sink_map_err(TransportError::new)
            .with(|frame: WireFrame| future::ready(Ok::<_, TransportError>(to_tungstenite(frame))));
        let stream = stream.filter_map(|msg| {
            future::ready(match msg {
                Ok(msg) => from_tungstenite(msg).map(Ok),
                Err(err) => Some(Err(TransportError::new(err))),
            })
        });

        Ok((Box::pin(sink), Box::pin(stream)))
    }
}

fn to_tungstenite(frame: WireFrame) -> WsMessage {
    match frame {
        WireFrame::Text(text) => WsMessage::Text(text.into()),
        WireFrame::Binary(data) => WsMessage::Binary(data.into()),
        WireFrame::Ping(data) => WsMessage::Ping(data.into()),
        WireFrame::Pong(data) => WsMessage::Pong(data.into()),
        WireFrame::Close { code, reason } => WsMessage::Close(Some(CloseFrame {
            code: CloseCode::from(code),
            reason: reason.into(),
        })),
    }
}

fn from_tungstenite(msg: WsMessage) -> Option<WireFrame> {
    match msg {
        WsMessage::Text(text) => Some(WireFrame::Text(text.as_str().to_owned())),
        WsMessage::Binary(data) => Some(WireFrame::Binary(data.to_vec())),
        WsMessage::Ping(data) => Some(WireFrame::Ping(data.to_vec())),
        WsMessage::Pong(data) => Some(WireFrame::Pong(data.to_vec())),
        WsMessage::Close(frame) => Some(match frame {
            Some(frame) => WireFrame::Close {
                code: u16::from(frame.code),
                reason: frame.reason.as_str().to_owned(),
            },
            None => WireFrame::Close {
                code: CLOSE_ABNORMAL,
                reason: String::new(),
            },
        }),
        WsMessage::Frame(_) => None,
    }
}
