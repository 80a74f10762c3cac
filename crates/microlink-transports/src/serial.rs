// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Local serial port link.

use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;

use parking_lot::Mutex;
use serialport::{Parity, SerialPort};
use tracing::debug;

use crate::error::{LinkError, Result};
use crate::link::MicroLink;

/// Directory of stable device aliases on Linux. A `/dev/ttyACM0` style path
/// changes identity when the board is unplugged and replugged; the by-id
/// alias does not, so reconnects keep working.
const BY_ID_DIR: &str = "/dev/serial/by-id";

/// How long a single read call waits before reporting an empty poll.
const READ_POLL: Duration = Duration::from_millis(500);

/// A microcontroller attached to a local serial port.
pub struct SerialLink {
    path: String,
    baud: u32,
    /// Path after switching to the by-id alias, resolved on first open.
    resolved: Mutex<Option<String>>,
    reader: Mutex<Option<Box<dyn SerialPort>>>,
    writer: Mutex<Option<Box<dyn SerialPort>>>,
}

impl SerialLink {
    pub fn new(path: impl Into<String>, baud: u32) -> Self {
        Self {
            path: path.into(),
            baud: if baud == 0 { 115200 } else { baud },
            resolved: Mutex::new(None),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
        }
    }
}

impl MicroLink for SerialLink {
    fn open(&self) -> Result<()> {
        let path = {
            let mut resolved = self.resolved.lock();
            resolved
                .get_or_insert_with(|| stable_alias(&self.path))
                .clone()
        };

        let mut port = serialport::new(&path, self.baud)
            .timeout(READ_POLL)
            .open()
            .map_err(|e| LinkError::Open {
                path: path.clone(),
                source: std::io::Error::new(std::io::ErrorKind::Other, e),
            })?;
        port.write_request_to_send(true)?;
        port.write_data_terminal_ready(false)?;

        let reader = port.try_clone()?;
        debug!(port = %path, baud = self.baud, "serial port open");
        *self.reader.lock() = Some(reader);
        *self.writer.lock() = Some(port);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.reader.lock().take();
        self.writer.lock().take();
        Ok(())
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut guard = self.reader.lock();
        let port = guard.as_mut().ok_or(LinkError::Closed)?;
        match port.read(buf) {
            Ok(n) => Ok(n),
            Err(e)
                if e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::WouldBlock =>
            {
                Ok(0)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, buf: &[u8]) -> Result<usize> {
        let mut guard = self.writer.lock();
        let port = guard.as_mut().ok_or(LinkError::Closed)?;
        port.write_all(buf)?;
        Ok(buf.len())
    }

    fn reset(&self, enter_bootloader: bool) -> bool {
        let mut guard = self.writer.lock();
        let port = match guard.as_mut() {
            Some(p) => p,
            None => return false,
        };
        if port.write_data_terminal_ready(true).is_err() {
            return false;
        }
        if enter_bootloader {
            let _ = port.set_parity(Parity::Even);
            let _ = port.write_request_to_send(false);
        } else {
            let _ = port.set_parity(Parity::None);
            let _ = port.write_request_to_send(true);
        }
        std::thread::sleep(Duration::from_millis(1));
        let _ = port.write_data_terminal_ready(false);
        std::thread::sleep(Duration::from_millis(1));
        true
    }

    fn describe(&self) -> String {
        self.path.clone()
    }
}

/// Map a `/dev/ttyXXX` path to its `/dev/serial/by-id/` alias so the device
/// can be reopened after a reset or unplug/replug cycle. Returns the input
/// path unchanged when no alias matches (or the platform has no alias
/// directory).
fn stable_alias(device_path: &str) -> String {
    let device_name = match Path::new(device_path).file_name() {
        Some(n) => n.to_owned(),
        None => return device_path.to_string(),
    };
    let entries = match std::fs::read_dir(BY_ID_DIR) {
        Ok(e) => e,
        Err(_) => return device_path.to_string(),
    };
    for entry in entries.flatten() {
        if let Ok(target) = std::fs::read_link(entry.path()) {
            if target.file_name() == Some(&device_name) {
                return entry.path().to_string_lossy().into_owned();
            }
        }
    }
    device_path.to_string()
}

/// Enumerate candidate serial devices for the port chooser. The
/// `/dev/tty.*` entries on macOS shadow the `/dev/cu.*` ones and are
/// filtered out.
pub fn available_ports() -> Vec<String> {
    let mut ports: Vec<String> = serialport::available_ports()
        .unwrap_or_default()
        .into_iter()
        .map(|p| p.port_name)
        .filter(|name| !name.starts_with("/dev/tty."))
        .collect();
    ports.sort();
    ports
}
