// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! # microlink-core
//!
//! The heart of the microlink console: the switchboard event loop that
//! routes bytes between the microcontroller link, local and remote
//! consoles; the `!`-command handlers; the Forth source include engine
//! with echo matching; and the STM32 USART boot-protocol uploader.
//!
//! The switchboard owns the link's received-bytes channel. Privileged
//! operations (firmware upload, source include) borrow the receiver for
//! their whole run, so nothing else can consume device output while they
//! are talking to the boot loader or waiting for line echoes.

pub mod error;
pub mod firmware;
pub mod hexfile;
pub mod include;
pub mod net;
pub mod switchboard;
pub mod uploader;

mod commands;

pub use error::{CoreError, Result};
pub use include::{IncludeEngine, IncludeError};
pub use net::SessionMode;
pub use switchboard::{AssetBundle, ConsoleRegistry, NetInput, Switchboard};
pub use uploader::{UploadReport, Uploader};
