// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Connection supervisor.
//!
//! Owns the read side of a link: the first open happens synchronously so
//! startup errors surface to the caller, after that a dedicated reader
//! thread pumps pooled buffers into the received-bytes channel and reopens
//! the connection whenever it breaks.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::Result;
use crate::link::{LinkState, MicroLink};
use crate::pool::{BufferPool, PooledBuf};

/// Ceiling for the reopen backoff.
const BACKOFF_MAX: Duration = Duration::from_millis(500);
/// First reopen delay; doubles until the ceiling.
const BACKOFF_START: Duration = Duration::from_millis(125);

/// Supervises a link's connection lifecycle and feeds received bytes into
/// a bounded channel. The capacity-1 channel is the backpressure: a busy
/// consumer stalls the reader thread, which throttles the device.
pub struct Supervisor {
    link: Arc<dyn MicroLink>,
    pool: Arc<BufferPool>,
    state: Arc<Mutex<LinkState>>,
}

impl Supervisor {
    pub fn new(link: Arc<dyn MicroLink>, pool: Arc<BufferPool>) -> Self {
        Self {
            link,
            pool,
            state: Arc::new(Mutex::new(LinkState::Closed)),
        }
    }

    pub fn state(&self) -> LinkState {
        *self.state.lock()
    }

    /// Open the link synchronously, then spawn the reader thread.
    ///
    /// `status` receives the user-facing recovery chatter: one
    /// `[disconnected: …]` line per break, a dot per repeated failed
    /// attempt, a fresh message when the error text changes, and
    /// `[reconnected]` exactly once per successful recovery.
    pub fn start(
        &self,
        tx: mpsc::Sender<PooledBuf>,
        status: impl Write + Send + 'static,
    ) -> Result<()> {
        *self.state.lock() = LinkState::Opening;
        match self.link.open() {
            Ok(()) => *self.state.lock() = LinkState::Open,
            Err(e) => {
                *self.state.lock() = LinkState::Closed;
                return Err(e);
            }
        }

        let link = Arc::clone(&self.link);
        let pool = Arc::clone(&self.pool);
        let state = Arc::clone(&self.state);
        std::thread::Builder::new()
            .name("link-reader".into())
            .spawn(move || pump(link, pool, state, tx, status))
            .expect("spawning the link reader thread");
        Ok(())
    }
}

fn pump(
    link: Arc<dyn MicroLink>,
    pool: Arc<BufferPool>,
    state: Arc<Mutex<LinkState>>,
    tx: mpsc::Sender<PooledBuf>,
    mut status: impl Write + Send,
) {
    loop {
        // Read until the connection breaks or the consumer goes away.
        let fail = loop {
            let mut buf = pool.get();
            match link.read(buf.storage_mut()) {
                Ok(0) => continue,
                Ok(n) => {
                    buf.set_filled(n);
                    if tx.blocking_send(buf).is_err() {
                        *state.lock() = LinkState::Closed;
                        let _ = link.close();
                        return;
                    }
                }
                Err(e) => break e,
            }
        };

        *state.lock() = LinkState::Broken;
        let _ = write!(status, "\n[disconnected: {fail}]\nreconnecting...");
        let _ = status.flush();
        let _ = link.close();

        // Reopen with backoff. Only a changed error text earns a new
        // message; repeats print a single dot.
        let mut prev = fail.to_string();
        let mut delay = BACKOFF_START;
        loop {
            if tx.is_closed() {
                *state.lock() = LinkState::Closed;
                return;
            }
            std::thread::sleep(delay);
            delay = (delay * 2).min(BACKOFF_MAX);
            *state.lock() = LinkState::Opening;
            match link.open() {
                Ok(()) => {
                    *state.lock() = LinkState::Open;
                    let _ = writeln!(status, "\n[reconnected]");
                    let _ = status.flush();
                    debug!(target = %link.describe(), "link reopened");
                    break;
                }
                Err(e) => {
                    *state.lock() = LinkState::Broken;
                    let text = e.to_string();
                    if text != prev {
                        let _ = write!(status, "\nerror: {text}\nreconnecting...");
                        prev = text;
                    } else {
                        let _ = write!(status, ".");
                    }
                    let _ = status.flush();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LinkError;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted link: each entry is one `read` outcome; `open` outcomes
    /// are scripted the same way and default to success.
    struct ScriptedLink {
        reads: Mutex<VecDeque<std::result::Result<Vec<u8>, LinkError>>>,
        open_script: Mutex<VecDeque<std::result::Result<(), LinkError>>>,
        opens: AtomicUsize,
    }

    impl MicroLink for ScriptedLink {
        fn open(&self) -> Result<()> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            self.open_script.lock().pop_front().unwrap_or(Ok(()))
        }
        fn close(&self) -> Result<()> {
            Ok(())
        }
        fn read(&self, buf: &mut [u8]) -> Result<usize> {
            match self.reads.lock().pop_front() {
                Some(Ok(data)) => {
                    buf[..data.len()].copy_from_slice(&data);
                    Ok(data.len())
                }
                Some(Err(e)) => Err(e),
                None => {
                    std::thread::sleep(Duration::from_millis(10));
                    Ok(0)
                }
            }
        }
        fn write(&self, buf: &[u8]) -> Result<usize> {
            Ok(buf.len())
        }
        fn reset(&self, _enter_bootloader: bool) -> bool {
            true
        }
        fn describe(&self) -> String {
            "scripted".into()
        }
    }

    #[derive(Clone)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn broken_read_reconnects_once() {
        let link = Arc::new(ScriptedLink {
            reads: Mutex::new(VecDeque::from([
                Ok(b"before".to_vec()),
                Err(LinkError::Broken),
                Ok(b"after".to_vec()),
            ])),
            open_script: Mutex::new(VecDeque::from([Ok(()), Err(LinkError::Broken)])),
            opens: AtomicUsize::new(0),
        });
        let pool = BufferPool::new();
        let sup = Supervisor::new(link.clone(), pool);
        let (tx, mut rx) = mpsc::channel(1);
        let sink = SharedSink(Arc::new(Mutex::new(Vec::new())));
        sup.start(tx, sink.clone()).unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(&*first, b"before");
        let second = rx.recv().await.unwrap();
        assert_eq!(&*second, b"after");

        let text = String::from_utf8(sink.0.lock().clone()).unwrap();
        assert_eq!(text.matches("[reconnected]").count(), 1);
        assert!(text.contains("[disconnected:"));
        // first sync open + failed reopen + successful reopen
        assert_eq!(link.opens.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn startup_open_error_is_synchronous() {
        let link = Arc::new(ScriptedLink {
            reads: Mutex::new(VecDeque::new()),
            open_script: Mutex::new(VecDeque::from([Err(LinkError::Broken)])),
            opens: AtomicUsize::new(0),
        });
        let pool = BufferPool::new();
        let sup = Supervisor::new(link, pool);
        let (tx, _rx) = mpsc::channel(1);
        let sink = SharedSink(Arc::new(Mutex::new(Vec::new())));
        assert!(sup.start(tx, sink).is_err());
        assert_eq!(sup.state(), LinkState::Closed);
    }
}
