// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Telnet serial gateway link.
//!
//! Connects to a ser2net or esp-link style server that maps a TCP socket
//! onto a remote serial port and understands in-band com-port-control
//! escapes for parity, flow control and the DTR/RTS lines. A raw mode is
//! available for plain TCP bridges that speak no escapes at all; such
//! bridges cannot toggle control lines, so resets are not issuable there.

pub mod codec;

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{LinkError, Result};
use crate::link::MicroLink;
use codec::{
    double_iac, escape, Sanitiser, COM_PORT_OPT, DTR_OFF, DTR_ON, FLOW_OFF, IAC, PAR_EVEN,
    PAR_NONE, RTS_OFF, RTS_ON, SET_CONTROL, SET_PARITY, WILL,
};

/// How long a single read call waits before reporting an empty poll.
const READ_POLL: Duration = Duration::from_millis(500);

/// A microcontroller reached through a telnet serial gateway.
pub struct TelnetLink {
    addr: String,
    raw: bool,
    reader: Mutex<Option<TcpStream>>,
    writer: Mutex<Option<TcpStream>>,
    sanitiser: Mutex<Sanitiser>,
}

impl TelnetLink {
    pub fn new(addr: impl Into<String>, raw: bool) -> Self {
        Self {
            addr: addr.into(),
            raw,
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            sanitiser: Mutex::new(Sanitiser::new()),
        }
    }

    /// Send bytes without IAC doubling (command sequences).
    fn write_unescaped(&self, buf: &[u8]) -> Result<usize> {
        let mut guard = self.writer.lock();
        let stream = guard.as_mut().ok_or(LinkError::Closed)?;
        stream.write_all(buf)?;
        Ok(buf.len())
    }
}

impl MicroLink for TelnetLink {
    fn open(&self) -> Result<()> {
        let stream = TcpStream::connect(&self.addr).map_err(|e| LinkError::Open {
            path: self.addr.clone(),
            source: e,
        })?;
        stream.set_read_timeout(Some(READ_POLL))?;
        stream.set_nodelay(true)?;

        let reader = stream.try_clone()?;
        *self.reader.lock() = Some(reader);
        *self.writer.lock() = Some(stream);
        self.sanitiser.lock().clear();

        if !self.raw {
            // Announce the com-port option, then put the remote serial
            // side into the same state a freshly opened local port gets.
            self.write_unescaped(&[IAC, WILL, COM_PORT_OPT])?;
            self.write_unescaped(&escape(SET_PARITY, PAR_NONE))?;
            self.write_unescaped(&escape(SET_CONTROL, FLOW_OFF))?;
            self.write_unescaped(&escape(SET_CONTROL, RTS_ON))?;
            self.write_unescaped(&escape(SET_CONTROL, DTR_OFF))?;
        }
        debug!(addr = %self.addr, raw = self.raw, "telnet gateway connected");
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if let Some(stream) = self.writer.lock().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.reader.lock().take();
        Ok(())
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let n = {
            let mut guard = self.reader.lock();
            let stream = guard.as_mut().ok_or(LinkError::Closed)?;
            match stream.read(buf) {
                Ok(0) => return Err(LinkError::Broken),
                Ok(n) => n,
                Err(e)
                    if e.kind() == std::io::ErrorKind::TimedOut
                        || e.kind() == std::io::ErrorKind::WouldBlock =>
                {
                    return Ok(0)
                }
                Err(e) => return Err(e.into()),
            }
        };
        if self.raw {
            Ok(n)
        } else {
            Ok(self.sanitiser.lock().sanitise(&mut buf[..n]))
        }
    }

    fn write(&self, buf: &[u8]) -> Result<usize> {
        if self.raw || !buf.contains(&IAC) {
            self.write_unescaped(buf)?;
        } else {
            self.write_unescaped(&double_iac(buf))?;
        }
        Ok(buf.len())
    }

    fn reset(&self, enter_bootloader: bool) -> bool {
        if self.raw {
            return false;
        }
        if self.write_unescaped(&escape(SET_CONTROL, DTR_ON)).is_err() {
            return false;
        }
        if enter_bootloader {
            let _ = self.write_unescaped(&escape(SET_CONTROL, RTS_OFF));
            let _ = self.write_unescaped(&escape(SET_PARITY, PAR_EVEN));
        } else {
            let _ = self.write_unescaped(&escape(SET_CONTROL, RTS_ON));
            let _ = self.write_unescaped(&escape(SET_PARITY, PAR_NONE));
        }
        std::thread::sleep(Duration::from_millis(1));
        let _ = self.write_unescaped(&escape(SET_CONTROL, DTR_OFF));
        std::thread::sleep(Duration::from_millis(1));
        true
    }

    fn describe(&self) -> String {
        self.addr.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn open_sends_init_sequence() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let link = TelnetLink::new(addr.to_string(), false);
        link.open().unwrap();

        let (mut server, _) = listener.accept().unwrap();
        let mut expected = Vec::new();
        expected.extend_from_slice(&[IAC, WILL, COM_PORT_OPT]);
        expected.extend_from_slice(&escape(SET_PARITY, PAR_NONE));
        expected.extend_from_slice(&escape(SET_CONTROL, FLOW_OFF));
        expected.extend_from_slice(&escape(SET_CONTROL, RTS_ON));
        expected.extend_from_slice(&escape(SET_CONTROL, DTR_OFF));

        let mut got = vec![0u8; expected.len()];
        server.read_exact(&mut got).unwrap();
        assert_eq!(got, expected);
        link.close().unwrap();
    }

    #[test]
    fn write_doubles_iac_and_read_folds_it() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let link = TelnetLink::new(addr.to_string(), false);
        link.open().unwrap();
        let (mut server, _) = listener.accept().unwrap();

        // Drain the init sequence first.
        let mut init = vec![0u8; 3 + 4 * 7];
        server.read_exact(&mut init).unwrap();

        link.write(&[b'a', IAC, b'b']).unwrap();
        let mut got = [0u8; 4];
        server.read_exact(&mut got).unwrap();
        assert_eq!(got, [b'a', IAC, IAC, b'b']);

        // And the reverse direction: doubled IAC comes back as one byte.
        server.write_all(&[b'x', IAC, IAC, b'y']).unwrap();
        let mut buf = [0u8; 16];
        let mut data = Vec::new();
        while data.len() < 3 {
            let n = link.read(&mut buf).unwrap();
            data.extend_from_slice(&buf[..n]);
        }
        assert_eq!(data, [b'x', IAC, b'y']);
        link.close().unwrap();
    }

    #[test]
    fn raw_mode_has_no_control_lines() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let link = TelnetLink::new(addr.to_string(), true);
        link.open().unwrap();
        let _conn = listener.accept().unwrap();
        assert!(!link.reset(false));
        link.close().unwrap();
    }
}
