//! Forwarder error types.

use std::time::Duration;

/// Why a forwarder stopped being usable.
#[derive(Debug, thiserror::Error)]
pub enum ForwarderError {
    #[error("Connect timed out after {timeout:?}")]
    ConnectTimeout { timeout: Duration },

    #[error("Connect failed: {0}")]
    ConnectFailed(#[source] std::io::Error),

    #[error("Connection lost: {0}")]
    ConnectionLost(#[source] std::io::Error),
}

impl ForwarderError {
    /// Whether the destination was never reached.
    pub const fn is_connect_failure(&self) -> bool {
        matches!(self, Self::ConnectTimeout { .. } | Self::ConnectFailed(_))
    }

    pub(crate) fn closed_by_peer() -> Self {
        Self::ConnectionLost(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "closed by peer",
        ))
    }
}
