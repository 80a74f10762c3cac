// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! SSH access: the listener that lets remote clients reach the local
//! microcontroller, and the tunnel link that makes a remote microlink
//! instance look like a local device.

pub mod client;
pub mod server;
