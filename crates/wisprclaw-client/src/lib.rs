//! Client for the WisprClaw agent gateway.
//!
//! A [`GatewayClient`] keeps one WebSocket open to the gateway, performs the
//! signed `connect.challenge` → `connect` → `hello-ok` handshake, and
//! multiplexes any number of concurrent requests over it:
//!
//! ```no_run
//! # async fn demo() -> Result<(), wisprclaw_client::Error> {
//! use wisprclaw_client::{GatewayClient, GatewayConfig};
//! use wisprclaw_core::IdentityStore;
//!
//! let identity = IdentityStore::new("/tmp/device.json").load_or_create();
//! let client = GatewayClient::new(GatewayConfig::new("http://127.0.0.1:18789"), identity);
//! let reply = client.send_request("summarize my inbox").await?;
//! client.disconnect().await;
//! # let _ = reply;
//! # Ok(())
//! # }
//! ```

pub mod agent;
mod client;
mod config;
mod error;
pub mod handshake;
mod receiver;
pub mod router;

pub use client::GatewayClient;
pub use config::{GatewayConfig, websocket_url};
pub use error::Error;
pub use router::ResponseRouter;
pub use wisprclaw_core::ConnectionState;
