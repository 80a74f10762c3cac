// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Error types for the switchboard and its command handlers.

/// Result type alias using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors surfaced while resolving and transferring firmware images.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Reading a local image file failed
    #[error("{path}: {source}")]
    File {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Fetching a firmware URL failed outright
    #[error("fetch failed: {0}")]
    Fetch(#[from] reqwest::Error),

    /// The server answered a firmware fetch with a failure status
    #[error("{status}: {body}")]
    FetchStatus { status: String, body: String },

    /// A numeric argument matched no built-in image
    #[error("no built-in image {0}; '!u' lists them")]
    NoSuchImage(String),
}
