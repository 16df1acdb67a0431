//! Per-connection I/O loop.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, warn};

use crate::heartbeat::Liveness;
use crate::metrics::WsMetrics;
use crate::protocol::CLOSE_ABNORMAL;
use crate::transport::{FrameSink, FrameStream, WireFrame};

/// How long a close handshake may take before the socket is dropped.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Work queued for the I/O loop.
#[derive(Debug)]
pub(crate) enum Outbound {
    /// Write a frame.
    Frame(WireFrame),
    /// Send a close frame and end the loop.
    Close { code: u16, reason: String },
}

/// Why the I/O loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CloseInfo {
    pub(crate) code: u16,
    pub(crate) reason: String,
    /// Transport failure that ended the connection, if any.
    pub(crate) error: Option<String>,
}

impl CloseInfo {
    fn clean(code: u16, reason: String) -> Self {
        Self {
            code,
            reason,
            error: None,
        }
    }

    fn failed(error: String) -> Self {
        Self {
            code: CLOSE_ABNORMAL,
            reason: "connection lost".to_owned(),
            error: Some(error),
        }
    }
}

/// Pump frames between the transport and the client until either side
/// closes.
///
/// Queued writes are drained before the next read. Inbound text frames are
/// handed to `on_text` in arrival order and every inbound frame refreshes
/// `liveness`.
pub(crate) async fn pump(
    mut sink: FrameSink,
    mut stream: FrameStream,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    liveness: &Liveness,
    metrics: &WsMetrics,
    mut on_text: impl FnMut(String),
) -> CloseInfo {
    loop {
        tokio::select! {
            biased;

            cmd = outbound.recv() => match cmd {
                Some(Outbound::Frame(frame)) => {
                    if let Err(err) = sink.send(frame).await {
                        WsMetrics::incr(&metrics.send_errors);
                        warn!(error = %err, "websocket write failed");
                        return CloseInfo::failed(err.to_string());
                    }
                    WsMetrics::incr(&metrics.messages_sent);
                }
                Some(Outbound::Close { code, reason }) => {
                    let frame = WireFrame::Close { code, reason: reason.clone() };
                    let _ = time::timeout(CLOSE_GRACE, sink.send(frame)).await;
                    let _ = time::timeout(CLOSE_GRACE, sink.close()).await;
                    return CloseInfo::clean(code, reason);
                }
                None => {
                    let _ = time::timeout(CLOSE_GRACE, sink.close()).await;
                    return CloseInfo::clean(CLOSE_ABNORMAL, "client dropped".to_owned());
                }
            },
            frame = stream.next() => match frame {
                Some(Ok(frame)) => {
                    liveness.mark_alive();
                    match frame {
                        WireFrame::Text(text) => {
                            WsMetrics::incr(&metrics.messages_received);
                            on_text(text);
                        }
                        WireFrame::Close { code, reason } => {
                            debug!(code, reason = %reason, "peer closed websocket");
                            return CloseInfo::clean(code, reason);
                        }
                        WireFrame::Binary(_) | WireFrame::Ping(_) | WireFrame::Pong(_) => {}
                    }
                }
                Some(Err(err)) => {
                    warn!(error = %err, "websocket read failed");
                    return CloseInfo::failed(err.to_string());
                }
                None => return CloseInfo::failed("stream ended".to_owned()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::TransportError;
    use futures::channel::mpsc as fmpsc;

    struct Harness {
        sent: fmpsc::UnboundedReceiver<WireFrame>,
        inbound: fmpsc::UnboundedSender<Result<WireFrame, TransportError>>,
        outbound: mpsc::UnboundedSender<Outbound>,
        sink: FrameSink,
        stream: FrameStream,
        rx: mpsc::UnboundedReceiver<Outbound>,
    }

    fn harness() -> Harness {
        let (sent_tx, sent) = fmpsc::unbounded::<WireFrame>();
        let (inbound, in_rx) = fmpsc::unbounded();
        let (outbound, rx) = mpsc::unbounded_channel();
        Harness {
            sent,
            inbound,
            outbound,
            sink: Box::pin(sent_tx.sink_map_err(TransportError::new)),
            stream: Box::pin(in_rx),
            rx,
        }
    }

    #[tokio::test]
    async fn writes_outbound_and_delivers_inbound() {
        let Harness { mut sent, inbound, outbound, sink, stream, rx } = harness();
        let liveness = Liveness::new();
        let metrics = WsMetrics::default();
        let mut texts = Vec::new();

        outbound.send(Outbound::Frame(WireFrame::Text("out".into()))).unwrap();
        inbound.unbounded_send(Ok(WireFrame::Text("in".into()))).unwrap();
        inbound
            .unbounded_send(Ok(WireFrame::Close { code: 1001, reason: "bye".into() }))
            .unwrap();

        let info = pump(sink, stream, rx, &liveness, &metrics, |t| texts.push(t)).await;
        assert_eq!(info.code, 1001);
        assert_eq!(info.reason, "bye");
        assert!(info.error.is_none());
        assert_eq!(texts, vec!["in"]);
        assert_eq!(sent.next().await, Some(WireFrame::Text("out".into())));
        assert_eq!(metrics.snapshot().messages_received, 1);
    }

    #[tokio::test]
    async fn close_command_sends_close_frame() {
        let Harness { mut sent, inbound: _inbound, outbound, sink, stream, rx } = harness();
        let liveness = Liveness::new();
        let metrics = WsMetrics::default();
        outbound
            .send(Outbound::Close { code: 1000, reason: "client disconnect".into() })
            .unwrap();

        let info = pump(sink, stream, rx, &liveness, &metrics, |_| {}).await;
        assert_eq!(info.code, 1000);
        assert_eq!(
            sent.next().await,
            Some(WireFrame::Close { code: 1000, reason: "client disconnect".into() })
        );
    }

    #[tokio::test]
    async fn dropped_transport_is_abnormal() {
        let Harness { inbound, outbound: _outbound, sink, stream, rx, .. } = harness();
        drop(inbound);
        let info = pump(sink, stream, rx, &Liveness::new(), &WsMetrics::default(), |_| {}).await;
        assert_eq!(info.code, CLOSE_ABNORMAL);
        assert!(info.error.is_some());
    }

    #[tokio::test]
    async fn read_error_is_abnormal() {
        let Harness { inbound, outbound: _outbound, sink, stream, rx, .. } = harness();
        inbound
            .unbounded_send(Err(TransportError::new("reset by peer")))
            .unwrap();
        let info = pump(sink, stream, rx, &Liveness::new(), &WsMetrics::default(), |_| {}).await;
        assert_eq!(info.code, CLOSE_ABNORMAL);
        assert_eq!(info.error.as_deref(), Some("reset by peer"));
    }
}
