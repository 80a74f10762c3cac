// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! # microlink-transports
//!
//! Transport layer for talking to a serial-attached microcontroller. A link
//! is a bidirectional byte stream plus out-of-band control of the reset and
//! boot lines, with three concrete variants:
//!
//! - [`SerialLink`] — a local serial port
//! - [`TelnetLink`] — a ser2net / esp-link style telnet serial gateway
//!   (optionally in raw-TCP mode without telnet escapes)
//! - a remote tunnel, implemented by the CLI on top of an SSH session
//!
//! All variants share the [`MicroLink`] contract. The [`Supervisor`] owns
//! the read side of a link: it opens the connection, pumps received bytes
//! into a bounded channel using buffers from the [`BufferPool`], and
//! reconnects with backoff when the link breaks.

pub mod error;
pub mod link;
pub mod pool;
pub mod serial;
pub mod supervisor;
pub mod telnet;

pub use error::{LinkError, Result};
pub use link::{LinkState, MicroLink};
pub use pool::{BufferPool, PooledBuf, BUF_LEN};
pub use serial::SerialLink;
pub use supervisor::Supervisor;
pub use telnet::TelnetLink;
