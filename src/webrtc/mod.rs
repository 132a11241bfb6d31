//! WebRTC viewer implementation
//!
//! This module provides the receive-only side of a live stream:
//! - Peer connection construction (recvonly audio/video)
//! - SDP offer/answer exchange with the signaling service
//! - Inbound track readers
//! - Connection supervision with bounded retry

pub mod media_track;
pub mod peer_connection;
pub mod session;
pub mod signaling;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use media_track::{MediaPacket, MediaStream};
pub use peer_connection::PeerConnectionFactory;
pub use session::{ConnectionState, RetryPolicy, ViewerConnectionManager, ViewerStatus};
pub use signaling::{ConsumerRequest, ConsumerResponse, HttpSignalingClient, SignalingClient};
pub use transport::{IceState, InboundTrack, MediaKind, Transport, TransportEvent, TransportFactory};

/// Errors produced while viewing a stream
#[derive(Debug, Clone, thiserror::Error)]
pub enum ViewerError {
    /// Stream identifier was empty or blank
    #[error("Invalid stream id: {0:?}")]
    InvalidStreamId(String),
    /// Peer connection creation or teardown failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    /// SDP processing failed
    #[error("SDP error: {0}")]
    SdpError(String),
    /// ICE candidate processing failed or ICE dropped
    #[error("ICE error: {0}")]
    IceError(String),
    /// Media track error
    #[error("Media error: {0}")]
    MediaError(String),
    /// Signaling service request failed or returned a malformed payload
    #[error("Signaling error: {0}")]
    SignalingError(String),
    /// Every allowed attempt failed
    #[error("Retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
    /// The connection manager is no longer running
    #[error("Viewer connection manager has shut down")]
    ManagerClosed,
}

impl ViewerError {
    /// Whether the supervisor may retry after this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ViewerError::ConnectionFailed(_)
                | ViewerError::SdpError(_)
                | ViewerError::IceError(_)
                | ViewerError::MediaError(_)
                | ViewerError::SignalingError(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::ViewerError;

    #[test]
    fn signaling_and_transport_errors_are_retryable() {
        assert!(ViewerError::SignalingError("missing sdp".into()).is_retryable());
        assert!(ViewerError::IceError("failed".into()).is_retryable());
        assert!(!ViewerError::InvalidStreamId(String::new()).is_retryable());
        assert!(!ViewerError::ManagerClosed.is_retryable());
    }

    #[test]
    fn exhaustion_message_names_attempts() {
        let err = ViewerError::RetriesExhausted { attempts: 3, last: "ICE error: failed".into() };
        assert_eq!(err.to_string(), "Retries exhausted after 3 attempts: ICE error: failed");
    }
}
