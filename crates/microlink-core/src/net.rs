// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Network input adapter protocol.
//!
//! A remote client opens an authenticated bidirectional channel and names a
//! session mode: an interactive shell, or one of the exec-style one-shot
//! commands. This module maps those requests onto typed [`NetInput`]
//! messages for the switchboard; the transport glue (accepting channels,
//! authentication) lives with the SSH listener in the CLI.

use std::sync::Arc;

use microlink_transports::{BufferPool, BUF_LEN};

use crate::switchboard::NetInput;

/// What a remote channel asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// Interactive raw byte stream (the default "shell" request).
    Shell,
    /// One-shot microcontroller reset.
    Reset,
    /// Send a block of Forth source, echo-matched line by line.
    SourceBlock,
    /// Flash a firmware image.
    Flash,
    /// Send a binary packet rendered as Forth number words.
    Packet,
}

impl SessionMode {
    /// Map a channel request onto a mode. `None` means a plain "shell"
    /// request; any unknown exec command is rejected.
    pub fn parse(exec: Option<&str>) -> Option<SessionMode> {
        match exec {
            None => Some(SessionMode::Shell),
            Some("reset") => Some(SessionMode::Reset),
            Some("cmd") => Some(SessionMode::SourceBlock),
            Some("flash") => Some(SessionMode::Flash),
            Some("packet") => Some(SessionMode::Packet),
            Some(_) => None,
        }
    }

    /// Whether the channel body must be read to EOF before dispatch.
    pub fn wants_body(self) -> bool {
        matches!(
            self,
            SessionMode::SourceBlock | SessionMode::Flash | SessionMode::Packet
        )
    }
}

/// Render a binary packet as Forth source: one `$XX ` number word per byte
/// with a terminating `.v` word, so the target interpreter consumes it
/// like any other typed line.
pub fn encode_packet(data: &[u8]) -> Vec<u8> {
    use std::io::Write;
    let mut out = Vec::with_capacity(4 * data.len() + 3);
    for &b in data {
        let _ = write!(out, "${:02X} ", b);
    }
    out.extend_from_slice(b".v\n");
    out
}

/// Build the one-shot input for an exec-style mode once the channel body
/// has been collected. Shell mode streams instead; see [`raw_inputs`].
pub fn exec_input(mode: SessionMode, body: Vec<u8>) -> Option<NetInput> {
    match mode {
        SessionMode::Shell => None,
        SessionMode::Reset => Some(NetInput::Reset),
        SessionMode::SourceBlock => Some(NetInput::SourceBlock(body)),
        SessionMode::Flash => Some(NetInput::Flash(body)),
        SessionMode::Packet => Some(NetInput::SourceBlock(encode_packet(&body))),
    }
}

/// Chop a shell-mode read into pooled raw-byte inputs.
pub fn raw_inputs(pool: &Arc<BufferPool>, data: &[u8]) -> Vec<NetInput> {
    data.chunks(BUF_LEN)
        .map(|chunk| {
            let mut buf = pool.get();
            buf.copy_from(chunk);
            NetInput::RawBytes(buf)
        })
        .collect()
}
