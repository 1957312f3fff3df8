//! Core types for the WisprClaw gateway protocol.
//!
//! This crate holds the pieces that need no runtime: the device identity
//! used to authenticate the client, and the JSON envelope spoken on the
//! wire. The async client lives in `wisprclaw-client`.

mod identity;
pub mod message;

pub use identity::{
    DeviceIdentity, IdentityError, IdentityStore, derive_device_id, encode_url_safe, sign,
};
pub use message::{ErrorShape, EventFrame, Frame, RequestFrame, ResponseFrame};

/// Gateway protocol version this client speaks (both min and max).
pub const PROTOCOL_VERSION: u32 = 3;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No socket.
    #[default]
    Disconnected,
    /// Opening the socket.
    Connecting,
    /// Socket open, waiting for `connect.challenge`.
    AwaitingChallenge,
    /// Building and sending the signed `connect` request.
    SendingConnect,
    /// Waiting for `hello-ok`.
    AwaitingHelloOk,
    /// Handshake complete; requests may flow.
    Authenticated,
}

impl ConnectionState {
    /// True while a handshake is in progress.
    pub fn is_connecting(self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::AwaitingChallenge | Self::SendingConnect | Self::AwaitingHelloOk
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_handshake_phases_are_connecting() {
        assert!(!ConnectionState::default().is_connecting());
        assert!(ConnectionState::Connecting.is_connecting());
        assert!(ConnectionState::AwaitingHelloOk.is_connecting());
        assert!(!ConnectionState::Authenticated.is_connecting());
    }
}
