// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! The shared link contract implemented by every transport variant.

use std::time::Duration;

use crate::error::{LinkError, Result};

/// Lifecycle of a link's underlying connection, tracked by the supervisor.
///
/// `Closed → Opening → Open → Broken → (backoff) → Opening`. Any read or
/// write error moves the link to `Broken`; the supervisor then closes and
/// reopens it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Closed,
    Opening,
    Open,
    Broken,
}

/// A bidirectional byte stream to a microcontroller plus out-of-band
/// control of its reset and boot lines.
///
/// The link object is created once per process; its underlying connection
/// may be opened and closed many times. Implementations use interior
/// mutability so a single link can be shared between the supervisor's
/// reader thread and the switchboard's writers.
pub trait MicroLink: Send + Sync {
    /// (Re-)acquire the underlying resource and perform variant-specific
    /// initialisation. Idempotent after a prior `close`.
    fn open(&self) -> Result<()>;

    /// Release the underlying connection.
    fn close(&self) -> Result<()>;

    /// Read available bytes into `buf`.
    ///
    /// Returns `Ok(0)` when nothing arrived within the poll interval, and
    /// an error when the connection is broken or half-closed.
    fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// Send the whole buffer.
    ///
    /// Writes are atomic with respect to each other: the entire buffer is
    /// written before any concurrent writer observes the lock free.
    fn write(&self, buf: &[u8]) -> Result<usize>;

    /// Reset the attached microcontroller. With `enter_bootloader` the
    /// BOOT0 line is held so the chip starts its ROM boot loader: parity
    /// switches to even and RTS is deasserted. Otherwise parity is none
    /// and RTS is asserted.
    ///
    /// Sequence: assert DTR, set parity and RTS for the chosen mode, wait
    /// 1 ms, deassert DTR, wait 1 ms.
    ///
    /// Returns false if the reset cannot be issued (link broken, or the
    /// variant has no control lines).
    fn reset(&self, enter_bootloader: bool) -> bool;

    /// How long a protocol reply is worth waiting for on this transport.
    /// Tunnelled links override this with a more patient value.
    fn reply_timeout(&self) -> Duration {
        Duration::from_secs(1)
    }

    /// Whether `flash` delegates flashing to the remote end of the link.
    /// Only the tunnel variant does; everything else runs the local
    /// boot-protocol uploader instead.
    fn supports_remote_flash(&self) -> bool {
        false
    }

    /// Hand a firmware image to the remote end for flashing.
    fn flash(&self, _image: &[u8]) -> Result<()> {
        Err(LinkError::Unsupported("remote flash"))
    }

    /// Human-readable description of the link target, for messages.
    fn describe(&self) -> String;
}
