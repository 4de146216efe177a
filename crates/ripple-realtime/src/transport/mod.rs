//! Transports: interchangeable links that carry protocol messages.
//!
//! A [`TransportFactory`] opens a link of one kind; the opened [`Transport`]
//! reports everything it receives through its [`TransportSink`]. The engine
//! decides which transport is active and drops events from any it has
//! disposed.

mod registry;
pub mod websocket;

use std::time::Duration;

use async_trait::async_trait;
use ripple_config::EndpointConfig;
use tokio::sync::mpsc;

use crate::auth::AuthParams;
use crate::engine::Input;
use crate::error::ErrorInfo;
use crate::protocol::ProtocolMessage;

pub use registry::TransportRegistry;
pub use websocket::WebSocketTransportFactory;

pub type TransportId = u64;

/// Wire protocol version requested on connect.
pub const PROTOCOL_VERSION: &str = "2";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectMode {
    /// A brand new connection.
    Clean,
    /// Continue the current connection after a transport drop.
    Resume,
    /// Continue a connection from a previous client instance.
    Recover,
}

/// Everything a factory needs to open a link.
#[derive(Debug, Clone)]
pub struct TransportParams {
    pub mode: ConnectMode,
    /// Connection key to resume or recover.
    pub connection_key: Option<String>,
    pub client_id: Option<String>,
    pub echo_messages: bool,
    pub auth: AuthParams,
    pub endpoint: EndpointConfig,
    pub connect_timeout: Duration,
}

impl TransportParams {
    /// Query parameters for the connect request.
    pub fn connect_query(&self) -> Vec<(String, String)> {
        let mut query: Vec<(String, String)> = self
            .auth
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        query.push(("v".into(), PROTOCOL_VERSION.into()));
        query.push(("format".into(), "json".into()));
        if !self.echo_messages {
            query.push(("echo".into(), "false".into()));
        }
        if let Some(client_id) = &self.client_id {
            query.push(("clientId".into(), client_id.clone()));
        }
        match (self.mode, &self.connection_key) {
            (ConnectMode::Resume, Some(key)) => query.push(("resume".into(), key.clone())),
            (ConnectMode::Recover, Some(key)) => query.push(("recover".into(), key.clone())),
            _ => {}
        }
        query
    }
}

/// Lifecycle and traffic reported by a transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Message(ProtocolMessage),
    /// The link dropped; the connection may be resumed.
    Disconnected(Option<ErrorInfo>),
    /// The link ended after a graceful close.
    Closed,
    /// The link ended in a way that must not be retried.
    Failed(ErrorInfo),
}

/// Why a connect attempt did not produce a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportFailure {
    Disconnected(ErrorInfo),
    Failed(ErrorInfo),
}

impl TransportFailure {
    pub fn error(&self) -> &ErrorInfo {
        match self {
            TransportFailure::Disconnected(err) | TransportFailure::Failed(err) => err,
        }
    }
}

/// Where a transport reports its events.
#[derive(Clone)]
pub struct TransportSink {
    id: TransportId,
    inbox: mpsc::UnboundedSender<Input>,
}

impl TransportSink {
    pub(crate) fn new(id: TransportId, inbox: mpsc::UnboundedSender<Input>) -> Self {
        Self { id, inbox }
    }

    pub fn id(&self) -> TransportId {
        self.id
    }

    /// Returns false once the engine has shut down.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.inbox
            .send(Input::Transport {
                id: self.id,
                event,
            })
            .is_ok()
    }
}

impl std::fmt::Debug for TransportSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSink").field("id", &self.id).finish()
    }
}

/// An open link.
pub trait Transport: Send {
    fn kind(&self) -> &str;

    fn send(&mut self, message: &ProtocolMessage) -> Result<(), ErrorInfo>;

    /// Drop the link; reports `Disconnected` with `error`.
    fn disconnect(&mut self, error: Option<ErrorInfo>);

    /// Ask the server to close the connection; its CLOSED arrives as a message.
    fn close(&mut self);

    /// Release the link without reporting anything further.
    fn dispose(&mut self);
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    fn kind(&self) -> &str;

    async fn try_connect(
        &self,
        params: TransportParams,
        sink: TransportSink,
    ) -> Result<Box<dyn Transport>, TransportFailure>;
}
