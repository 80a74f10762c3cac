// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Shared fixtures: a recording mock link, a byte-sink writer, and a
//! scripted STM32 boot loader that answers the upload protocol.

#![allow(dead_code)]

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use microlink_transports::{BufferPool, LinkError, MicroLink, PooledBuf};

/// A link that records everything written to it and forwards each write
/// to a channel so scripted peers can react.
pub struct MockLink {
    pub writes: Mutex<Vec<Vec<u8>>>,
    pub resets: Mutex<Vec<bool>>,
    write_tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl MockLink {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                writes: Mutex::new(Vec::new()),
                resets: Mutex::new(Vec::new()),
                write_tx,
            }),
            write_rx,
        )
    }

    /// Everything written, flattened in order.
    pub fn written(&self) -> Vec<u8> {
        self.writes.lock().iter().flatten().copied().collect()
    }

    pub fn last_write(&self) -> Option<Vec<u8>> {
        self.writes.lock().last().cloned()
    }
}

impl MicroLink for MockLink {
    fn open(&self) -> Result<(), LinkError> {
        Ok(())
    }
    fn close(&self) -> Result<(), LinkError> {
        Ok(())
    }
    fn read(&self, _buf: &mut [u8]) -> Result<usize, LinkError> {
        Ok(0)
    }
    fn write(&self, buf: &[u8]) -> Result<usize, LinkError> {
        self.writes.lock().push(buf.to_vec());
        let _ = self.write_tx.send(buf.to_vec());
        Ok(buf.len())
    }
    fn reset(&self, enter_bootloader: bool) -> bool {
        self.resets.lock().push(enter_bootloader);
        true
    }
    fn describe(&self) -> String {
        "mock".to_string()
    }
}

/// A `Write` implementation tests can read back.
#[derive(Clone)]
pub struct SharedSink(pub Arc<Mutex<Vec<u8>>>);

impl SharedSink {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(Vec::new())))
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl std::io::Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Echo peer for include tests: every `\r`-terminated line written to the
/// link is answered through `reply` (defaults to `<line>  ok.\n`).
pub fn spawn_echo(
    mut writes: mpsc::UnboundedReceiver<Vec<u8>>,
    replies: mpsc::Sender<PooledBuf>,
    pool: Arc<BufferPool>,
    reply: impl Fn(&[u8]) -> Vec<u8> + Send + 'static,
) {
    tokio::spawn(async move {
        let mut acc: Vec<u8> = Vec::new();
        while let Some(chunk) = writes.recv().await {
            acc.extend_from_slice(&chunk);
            while let Some(pos) = acc.iter().position(|&b| b == b'\r') {
                let line: Vec<u8> = acc.drain(..=pos).collect();
                let answer = reply(&line[..line.len() - 1]);
                for part in answer.chunks(microlink_transports::BUF_LEN) {
                    let mut buf = pool.get();
                    buf.copy_from(part);
                    if replies.send(buf).await.is_err() {
                        return;
                    }
                }
            }
        }
    });
}

/// The standard well-behaved echo: `<line>  ok.\n`.
pub fn ok_echo(line: &[u8]) -> Vec<u8> {
    let mut out = line.to_vec();
    out.extend_from_slice(b"  ok.\n");
    out
}

pub const ACK: u8 = 0x79;
pub const NAK: u8 = 0x1F;

#[derive(Default)]
pub struct BootOptions {
    /// Answer the write-unprotect completion with a NAK.
    pub nak_write_unprotect: bool,
}

enum BootState {
    Idle,
    Complement(u8),
    EraseCount(Vec<u8>),
    ErasePages { need: usize },
    PlainErase { need: usize },
    WriteAddr(Vec<u8>),
    WriteData {
        addr: u32,
        len: Option<usize>,
        got: Vec<u8>,
    },
}

/// A scripted STM32 ROM boot loader on the far side of the mock link.
/// Returns the flash writes it accepted as `(address, data)` pairs.
pub fn spawn_bootloader(
    mut writes: mpsc::UnboundedReceiver<Vec<u8>>,
    replies: mpsc::Sender<PooledBuf>,
    pool: Arc<BufferPool>,
    opts: BootOptions,
) -> Arc<Mutex<Vec<(u32, Vec<u8>)>>> {
    let flash: Arc<Mutex<Vec<(u32, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
    let flash_out = Arc::clone(&flash);

    tokio::spawn(async move {
        let mut state = BootState::Idle;
        let send = |bytes: Vec<u8>| {
            let replies = replies.clone();
            let pool = Arc::clone(&pool);
            async move {
                let mut buf = pool.get();
                buf.copy_from(&bytes);
                replies.send(buf).await.is_ok()
            }
        };

        while let Some(chunk) = writes.recv().await {
            for b in chunk {
                state = match state {
                    BootState::Idle => {
                        if b == 0x7F {
                            if !send(vec![ACK]).await {
                                return;
                            }
                            BootState::Idle
                        } else {
                            BootState::Complement(b)
                        }
                    }
                    BootState::Complement(cmd) => {
                        if b != !cmd {
                            BootState::Idle
                        } else {
                            let reply: Vec<u8> = match cmd {
                                // GET: version 3.1 plus the full command set,
                                // extended erase included.
                                0x00 => vec![
                                    ACK, 0x0C, 0x31, 0x00, 0x01, 0x02, 0x11, 0x21, 0x31, 0x43,
                                    0x44, 0x63, 0x73, 0x82, 0x92, ACK,
                                ],
                                // GETID: device family 0x417.
                                0x02 => vec![ACK, 0x01, 0x04, 0x17, ACK],
                                0x92 => vec![ACK, ACK],
                                0x73 => {
                                    if opts.nak_write_unprotect {
                                        vec![ACK, NAK]
                                    } else {
                                        vec![ACK, ACK]
                                    }
                                }
                                0x44 | 0x43 | 0x31 => vec![ACK],
                                _ => vec![NAK],
                            };
                            if !send(reply).await {
                                return;
                            }
                            match cmd {
                                0x44 => BootState::EraseCount(Vec::new()),
                                0x43 => BootState::PlainErase { need: 2 },
                                0x31 => BootState::WriteAddr(Vec::new()),
                                _ => BootState::Idle,
                            }
                        }
                    }
                    BootState::EraseCount(mut got) => {
                        got.push(b);
                        if got.len() == 2 {
                            let pages =
                                u16::from_be_bytes([got[0], got[1]]).wrapping_add(1) as usize;
                            BootState::ErasePages {
                                need: 2 * pages + 1,
                            }
                        } else {
                            BootState::EraseCount(got)
                        }
                    }
                    BootState::ErasePages { need } => {
                        if need == 1 {
                            if !send(vec![ACK]).await {
                                return;
                            }
                            BootState::Idle
                        } else {
                            BootState::ErasePages { need: need - 1 }
                        }
                    }
                    BootState::PlainErase { need } => {
                        if need == 1 {
                            if !send(vec![ACK]).await {
                                return;
                            }
                            BootState::Idle
                        } else {
                            BootState::PlainErase { need: need - 1 }
                        }
                    }
                    BootState::WriteAddr(mut got) => {
                        got.push(b);
                        if got.len() == 5 {
                            let addr = u32::from_be_bytes([got[0], got[1], got[2], got[3]]);
                            if !send(vec![ACK]).await {
                                return;
                            }
                            BootState::WriteData {
                                addr,
                                len: None,
                                got: Vec::new(),
                            }
                        } else {
                            BootState::WriteAddr(got)
                        }
                    }
                    BootState::WriteData { addr, len, mut got } => match len {
                        None => BootState::WriteData {
                            addr,
                            len: Some(b as usize + 1),
                            got,
                        },
                        Some(n) => {
                            got.push(b);
                            if got.len() == n + 1 {
                                // data plus trailing checksum
                                flash.lock().push((addr, got[..n].to_vec()));
                                if !send(vec![ACK]).await {
                                    return;
                                }
                                BootState::Idle
                            } else {
                                BootState::WriteData {
                                    addr,
                                    len: Some(n),
                                    got,
                                }
                            }
                        }
                    },
                };
            }
        }
    });

    flash_out
}
