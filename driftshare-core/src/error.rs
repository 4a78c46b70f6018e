use thiserror::Error;

/// Framing and payload violations.
///
/// Every variant is fatal to the connection it was raised on: the stream is
/// no longer aligned on a frame boundary, so the handler closes it.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The length prefix announced more than [`MAX_PAYLOAD_LEN`](crate::protocol::MAX_PAYLOAD_LEN) bytes.
    #[error("declared frame length {declared} exceeds the {max} byte limit")]
    OversizeMessage { declared: usize, max: usize },

    /// The stream ended in the middle of a frame.
    #[error("stream closed before the full frame arrived")]
    Truncated,

    /// The payload is not a JSON object with a string `type`, or a known
    /// message is missing required fields.
    #[error("malformed message payload: {0}")]
    Malformed(String),
}

/// Failures surfaced by the driftshare runtime.
#[derive(Debug, Error)]
pub enum ShareError {
    /// Binding, advertising, accepting or connecting failed.
    #[error("transport error: {0:#}")]
    Transport(anyhow::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The address does not advertise the file-sharing service.
    #[error("file-sharing service not found on {address}")]
    ServiceNotFound { address: String },

    /// The peer answered with `success: false`.
    #[error("peer reported an error: {0}")]
    Remote(String),

    /// The connection closed before the announced number of bytes arrived.
    #[error("incomplete transfer: received {received} of {expected} bytes")]
    IncompleteTransfer { received: u64, expected: u64 },

    #[error("timed out during {operation}")]
    Timeout { operation: &'static str },

    /// The peer sent a well-formed message that does not answer the request.
    #[error("unexpected response: expected {expected}, got {actual}")]
    UnexpectedResponse {
        expected: &'static str,
        actual: String,
    },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl ShareError {
    /// Wraps a transport-level failure.
    pub fn transport(err: impl Into<anyhow::Error>) -> Self {
        Self::Transport(err.into())
    }
}

pub type Result<T, E = ShareError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn given_incomplete_transfer_when_displayed_then_counts_are_shown() {
        let err = ShareError::IncompleteTransfer {
            received: 10,
            expected: 4096,
        };
        assert_eq!(
            err.to_string(),
            "incomplete transfer: received 10 of 4096 bytes"
        );
    }

    #[test]
    fn given_protocol_error_when_converted_then_display_is_transparent() {
        let err: ShareError = ProtocolError::Truncated.into();
        assert_eq!(err.to_string(), "stream closed before the full frame arrived");
        assert!(matches!(err, ShareError::Protocol(ProtocolError::Truncated)));
    }

    #[test]
    fn given_anyhow_context_when_wrapped_as_transport_then_chain_is_rendered() {
        let err = ShareError::transport(
            anyhow::anyhow!("connection refused").context("failed to connect to 10.0.0.2:7000"),
        );
        let rendered = err.to_string();
        assert!(rendered.contains("failed to connect to 10.0.0.2:7000"));
        assert!(rendered.contains("connection refused"));
    }

    #[test]
    fn given_service_not_found_when_displayed_then_address_is_named() {
        let err = ShareError::ServiceNotFound {
            address: "AA:BB:CC:DD:EE:FF".into(),
        };
        assert!(err.to_string().contains("AA:BB:CC:DD:EE:FF"));
    }
}
