//! WebSocket transport over `tokio-tungstenite`, one JSON protocol message
//! per text frame.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};
use url::Url;

use super::{
    Transport, TransportEvent, TransportFactory, TransportFailure, TransportParams, TransportSink,
};
use crate::error::{codes, ErrorInfo};
use crate::protocol::{Action, ProtocolMessage};

pub const KIND: &str = "web_socket";

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketTransportFactory;

#[async_trait]
impl TransportFactory for WebSocketTransportFactory {
    fn kind(&self) -> &str {
        KIND
    }

    async fn try_connect(
        &self,
        params: TransportParams,
        sink: TransportSink,
    ) -> Result<Box<dyn Transport>, TransportFailure> {
        let url = connect_url(&params)?;
        info!(host = %url.host_str().unwrap_or(""), id = sink.id(), "Opening WebSocket transport");

        match tokio::time::timeout(
            params.connect_timeout,
            tokio_tungstenite::connect_async(url.as_str()),
        )
        .await
        {
            Ok(Ok((ws_stream, _))) => {
                let (ws_write, ws_read) = ws_stream.split();
                let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

                let writer = tokio::spawn(writer_task(ws_write, outbound_rx));
                let reader = tokio::spawn(reader_task(ws_read, sink.clone()));

                Ok(Box::new(WebSocketTransport {
                    outbound: outbound_tx,
                    reader,
                    writer: Some(writer),
                    sink,
                    finished: false,
                }))
            }
            Ok(Err(e)) => {
                error!(error = %e, "Failed to open WebSocket transport");
                Err(TransportFailure::Disconnected(
                    ErrorInfo::disconnected()
                        .with_cause(ErrorInfo::new(0, 0, format!("WebSocket error: {e}"))),
                ))
            }
            Err(_elapsed) => {
                error!(
                    timeout_ms = params.connect_timeout.as_millis() as u64,
                    "WebSocket transport timed out opening"
                );
                Err(TransportFailure::Disconnected(ErrorInfo::new(
                    codes::CONNECTION_DISCONNECTED,
                    400,
                    "Timed out opening WebSocket transport",
                )))
            }
        }
    }
}

fn connect_url(params: &TransportParams) -> Result<Url, TransportFailure> {
    let mut url = Url::parse(&params.endpoint.ws_url()).map_err(|e| {
        TransportFailure::Failed(ErrorInfo::new(
            codes::BAD_REQUEST,
            400,
            format!("invalid realtime endpoint: {e}"),
        ))
    })?;
    url.query_pairs_mut().extend_pairs(params.connect_query());
    Ok(url)
}

// ---------------------------------------------------------------------------
// Socket Tasks
// ---------------------------------------------------------------------------

async fn writer_task<S>(mut ws_write: S, mut outbound: mpsc::UnboundedReceiver<WsMessage>)
where
    S: futures_util::Sink<WsMessage> + Unpin,
{
    while let Some(frame) = outbound.recv().await {
        let closing = matches!(frame, WsMessage::Close(_));
        if ws_write.send(frame).await.is_err() || closing {
            break;
        }
    }
}

async fn reader_task<R>(mut ws_read: R, sink: TransportSink)
where
    R: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + Unpin,
{
    let mut reason = None;
    while let Some(frame) = ws_read.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => match serde_json::from_str::<ProtocolMessage>(&text) {
                Ok(message) => {
                    if !sink.emit(TransportEvent::Message(message)) {
                        return;
                    }
                }
                Err(e) => debug!(error = %e, "Unparseable protocol frame"),
            },
            Ok(WsMessage::Close(frame)) => {
                info!(id = sink.id(), frame = ?frame, "Server closed WebSocket");
                break;
            }
            Err(e) => {
                warn!(error = %e, "WebSocket error");
                reason = Some(
                    ErrorInfo::disconnected()
                        .with_cause(ErrorInfo::new(0, 0, format!("WebSocket error: {e}"))),
                );
                break;
            }
            _ => {}
        }
    }
    sink.emit(TransportEvent::Disconnected(
        reason.or_else(|| Some(ErrorInfo::disconnected())),
    ));
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

pub struct WebSocketTransport {
    outbound: mpsc::UnboundedSender<WsMessage>,
    reader: JoinHandle<()>,
    writer: Option<JoinHandle<()>>,
    sink: TransportSink,
    finished: bool,
}

impl WebSocketTransport {
    fn write(&self, message: &ProtocolMessage) -> Result<(), ErrorInfo> {
        let json = serde_json::to_string(message).map_err(|e| {
            ErrorInfo::new(codes::BAD_REQUEST, 400, format!("unable to encode message: {e}"))
        })?;
        self.outbound
            .send(WsMessage::Text(json.into()))
            .map_err(|_| ErrorInfo::disconnected())
    }

    /// Stop reading and let the writer flush a close frame.
    fn shutdown(&mut self) {
        self.finished = true;
        self.reader.abort();
        let _ = self.outbound.send(WsMessage::Close(None));
        self.writer.take();
    }
}

impl Transport for WebSocketTransport {
    fn kind(&self) -> &str {
        KIND
    }

    fn send(&mut self, message: &ProtocolMessage) -> Result<(), ErrorInfo> {
        if self.finished {
            return Err(ErrorInfo::disconnected());
        }
        self.write(message)
    }

    fn disconnect(&mut self, error: Option<ErrorInfo>) {
        if self.finished {
            return;
        }
        let _ = self.write(&ProtocolMessage::new(Action::Disconnect));
        self.shutdown();
        self.sink.emit(TransportEvent::Disconnected(error));
    }

    fn close(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = self.write(&ProtocolMessage::new(Action::Close)) {
            debug!(error = %e, "Unable to send CLOSE");
        }
    }

    fn dispose(&mut self) {
        if !self.finished {
            debug!(id = self.sink.id(), "Disposing WebSocket transport");
            self.shutdown();
        }
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
