// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! The switchboard: the central point where every input and output method
//! meets. Bytes received from the microcontroller fan out to all attached
//! consoles; console lines either run a `!`-command or go to the link;
//! typed network inputs dispatch on their tag.
//!
//! The loop is deliberately single-minded: while a privileged operation
//! (upload, source include) is in flight it does not service the other
//! event sources, which is what guarantees that operation exclusive use of
//! the link and its received-bytes channel.

use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use microlink_transports::{MicroLink, PooledBuf};

use crate::firmware;
use crate::include::IncludeEngine;

/// A typed request delivered by a network client.
#[derive(Debug)]
pub enum NetInput {
    /// Raw bytes for the link, as typed in a remote shell session.
    RawBytes(PooledBuf),
    /// Reset the microcontroller (BOOT0 low).
    Reset,
    /// A block of Forth source to send with echo matching.
    SourceBlock(Vec<u8>),
    /// A firmware image to flash.
    Flash(Vec<u8>),
}

/// The set of writers that receive everything the microcontroller says.
/// Writers are added when a console attaches and silently dropped on their
/// first write error.
pub struct ConsoleRegistry {
    writers: Mutex<Vec<Box<dyn Write + Send>>>,
}

impl ConsoleRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            writers: Mutex::new(Vec::new()),
        })
    }

    pub fn add(&self, writer: Box<dyn Write + Send>) {
        self.writers.lock().push(writer);
    }

    pub fn len(&self) -> usize {
        self.writers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.writers.lock().is_empty()
    }

    /// Write `buf` to every registered console, in registration order.
    /// A writer that errors is removed before the broadcast completes.
    pub fn broadcast(&self, buf: &[u8]) {
        let mut writers = self.writers.lock();
        writers.retain_mut(|w| match w.write_all(buf).and_then(|_| w.flush()) {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "dropping console writer");
                false
            }
        });
    }
}

/// The built-in firmware bundle, as a pair of callbacks so the asset
/// source can be swapped out (tests inject fakes).
pub struct AssetBundle {
    pub names: Box<dyn Fn() -> Vec<String> + Send>,
    pub get: Box<dyn Fn(&str) -> Option<Vec<u8>> + Send>,
}

impl Default for AssetBundle {
    fn default() -> Self {
        Self {
            names: Box::new(firmware::names),
            get: Box::new(firmware::get),
        }
    }
}

/// The central event loop. See the module docs for the routing rules.
pub struct Switchboard {
    pub(crate) link: Arc<dyn MicroLink>,
    pub(crate) link_rx: mpsc::Receiver<PooledBuf>,
    pub(crate) console_rx: mpsc::Receiver<Vec<u8>>,
    pub(crate) net_rx: mpsc::Receiver<NetInput>,
    pub(crate) consoles: Arc<ConsoleRegistry>,
    pub(crate) assets: AssetBundle,
    /// Where interactive command output goes (the local console).
    pub(crate) out: Box<dyn Write + Send>,
}

impl Switchboard {
    pub fn new(
        link: Arc<dyn MicroLink>,
        link_rx: mpsc::Receiver<PooledBuf>,
        console_rx: mpsc::Receiver<Vec<u8>>,
        net_rx: mpsc::Receiver<NetInput>,
        consoles: Arc<ConsoleRegistry>,
        assets: AssetBundle,
        out: Box<dyn Write + Send>,
    ) -> Self {
        Self {
            link,
            link_rx,
            console_rx,
            net_rx,
            consoles,
            assets,
            out,
        }
    }

    /// Run until the console input channel or the link reader goes away.
    pub async fn run(mut self) {
        let mut net_open = true;
        loop {
            tokio::select! {
                buf = self.link_rx.recv() => match buf {
                    Some(buf) => {
                        debug!(data = %printable(&buf), "recv");
                        self.consoles.broadcast(&buf);
                        // buf drops here, returning to the pool
                    }
                    None => break,
                },
                line = self.console_rx.recv() => match line {
                    Some(line) => self.console_line(line).await,
                    None => break,
                },
                input = self.net_rx.recv(), if net_open => match input {
                    Some(input) => self.net_input(input).await,
                    None => net_open = false,
                },
            }
        }
    }

    /// Input from the interactive console; `!`-lines are commands,
    /// everything else goes to the microcontroller untouched.
    async fn console_line(&mut self, line: Vec<u8>) {
        if line.first() == Some(&b'!') {
            let text = String::from_utf8_lossy(&line);
            let text = text.trim_end_matches('\n').to_string();
            self.special_command(&text).await;
            return;
        }
        debug!(data = %printable(&line), "send");
        if let Err(e) = self.link.write(&line) {
            warn!(error = %e, "link write failed");
        }
    }

    /// Input from a network client; no `!`-commands here, the modes are
    /// baked into the request tag.
    async fn net_input(&mut self, input: NetInput) {
        match input {
            NetInput::RawBytes(buf) => {
                debug!(data = %printable(&buf), "send");
                if let Err(e) = self.link.write(&buf) {
                    warn!(error = %e, "link write failed");
                }
            }
            NetInput::Reset => {
                self.link.reset(false);
            }
            NetInput::SourceBlock(data) => {
                let mut engine = IncludeEngine::new(
                    self.link.as_ref(),
                    &mut self.link_rx,
                    None,
                    &mut self.out,
                );
                if let Err(e) = engine.send_block(&data).await {
                    let _ = writeln!(self.out, "[remote source block stopped: {e}]");
                }
            }
            NetInput::Flash(image) => {
                let report = crate::uploader::Uploader::new(
                    self.link.as_ref(),
                    &mut self.link_rx,
                    &mut self.out,
                )
                .upload(&image)
                .await;
                if !report.ok() {
                    let _ = writeln!(
                        self.out,
                        "[upload had {} failed exchanges]",
                        report.failures.len()
                    );
                }
                self.link.reset(false);
            }
        }
    }
}

/// Render a byte buffer for the debug trace, escaping everything that is
/// not printable ASCII.
pub(crate) fn printable(data: &[u8]) -> String {
    let mut s = String::with_capacity(data.len());
    for &b in data {
        match b {
            b'\\' => s.push_str("\\\\"),
            b'\n' => s.push_str("\\n"),
            b'\r' => s.push_str("\\r"),
            b'\t' => s.push_str("\\t"),
            0x20..=0x7E => s.push(b as char),
            _ => s.push_str(&format!("\\x{b:02x}")),
        }
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl SharedSink {
        fn new() -> Self {
            Self(Arc::new(Mutex::new(Vec::new())))
        }
        fn contents(&self) -> Vec<u8> {
            self.0.lock().clone()
        }
    }

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct FailingWriter;

    impl Write for FailingWriter {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone"))
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn broadcast_keeps_order_and_drops_failures() {
        let registry = ConsoleRegistry::new();
        let good = SharedSink::new();
        registry.add(Box::new(good.clone()));
        registry.add(Box::new(FailingWriter));
        assert_eq!(registry.len(), 2);

        registry.broadcast(b"one ");
        assert_eq!(registry.len(), 1);
        registry.broadcast(b"two ");
        registry.broadcast(b"three");
        assert_eq!(good.contents(), b"one two three");
    }

    #[test]
    fn printable_escapes() {
        assert_eq!(printable(b"ok.\r\n"), "ok.\\r\\n");
        assert_eq!(printable(&[0x00, 0xFF]), "\\x00\\xff");
        assert_eq!(printable(b"a\\b"), "a\\\\b");
    }
}
