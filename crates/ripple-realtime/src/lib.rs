//! Realtime pub/sub client core.
//!
//! Maintains one logical connection over interchangeable transports,
//! multiplexes named channels over it, and keeps a presence set per channel.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use ripple_config::ClientOptions;
//! use ripple_realtime::{ConnectionState, RealtimeClient, StaticAuth, TransportRegistry};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let client = RealtimeClient::new(
//!     ClientOptions::default(),
//!     TransportRegistry::with_defaults(),
//!     Arc::new(StaticAuth::key("app.key:secret")),
//! )?;
//! client.wait_for_state(ConnectionState::Connected).await?;
//!
//! let channel = client.channel("updates");
//! let mut messages = channel.subscribe();
//! channel.attach().await?;
//! channel.publish("greeting", serde_json::json!("hello")).await?;
//! let received = messages.recv().await?;
//! println!("{received:?}");
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod channel;
pub mod codec;
pub mod connection;
pub mod error;
pub mod presence;
pub mod protocol;
pub mod transport;

mod backoff;
mod client;
mod engine;
mod timers;

#[cfg(test)]
mod testing;

pub use auth::{AuthParams, AuthProvider, StaticAuth};
pub use channel::{
    ChannelEvent, ChannelMode, ChannelOptions, ChannelProperties, ChannelState, ChannelStateChange,
};
pub use client::{ChannelHandle, PresenceHandle, RealtimeClient};
pub use codec::{DecodeFailure, JsonCodec, MessageCodec};
pub use connection::{ConnectionEvent, ConnectionState, ConnectionStateChange, RecoveryContext};
pub use error::ErrorInfo;
pub use presence::PresenceQuery;
pub use protocol::{Message, PresenceAction, PresenceMessage, ProtocolMessage};
pub use transport::{Transport, TransportFactory, TransportRegistry};
