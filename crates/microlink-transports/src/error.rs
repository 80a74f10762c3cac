// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Error types for the transport layer.

/// Result type alias using LinkError
pub type Result<T> = std::result::Result<T, LinkError>;

/// Errors produced by link variants and the connection supervisor.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// Opening the underlying device or socket failed
    #[error("{path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// OS-level I/O error on an established connection
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial port driver error
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// The peer closed the connection
    #[error("connection closed by peer")]
    Broken,

    /// The link has no open connection
    #[error("link is closed")]
    Closed,

    /// Operation not available on this link variant
    #[error("{0} is not supported on this link")]
    Unsupported(&'static str),
}

impl LinkError {
    /// Check whether the error should put the link into the Broken state
    /// (as opposed to a configuration or usage error).
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            LinkError::Io(_) | LinkError::Serial(_) | LinkError::Broken | LinkError::Closed
        )
    }
}
