// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! SSH tunnel link.
//!
//! Connects to a remote microlink instance and takes the place of a local
//! serial port: an interactive shell session carries the byte stream, and
//! the remote side's exec commands cover the out-of-band operations
//! (`reset`, `flash`). The async SSH machinery lives on its own thread
//! with a dedicated runtime; the `MicroLink` surface stays synchronous
//! like every other variant.

use std::path::PathBuf;
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use russh::ChannelMsg;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use microlink_transports::{LinkError, MicroLink};

/// How long a single read call waits before reporting an empty poll.
const READ_POLL: Duration = Duration::from_millis(500);

enum TunnelCmd {
    Write(Vec<u8>),
    Exec(&'static str),
    Flash(Vec<u8>, std_mpsc::Sender<Result<(), String>>),
    Close,
}

struct Connected {
    cmd_tx: mpsc::UnboundedSender<TunnelCmd>,
    data_rx: std_mpsc::Receiver<Vec<u8>>,
}

/// A remote microlink reached over SSH, driving the far end's serial
/// port as if it were local.
pub struct TunnelLink {
    addr: String,
    user: String,
    key_path: PathBuf,
    conn: Mutex<Option<Connected>>,
    /// Bytes received but not yet handed to a read call.
    carry: Mutex<Vec<u8>>,
}

impl TunnelLink {
    pub fn new(addr: impl Into<String>) -> Self {
        let home = std::env::var("HOME").unwrap_or_default();
        Self {
            addr: addr.into(),
            user: std::env::var("USER").unwrap_or_else(|_| "microlink".to_string()),
            key_path: PathBuf::from(home).join(".ssh").join("id_ed25519"),
            conn: Mutex::new(None),
            carry: Mutex::new(Vec::new()),
        }
    }
}

impl MicroLink for TunnelLink {
    fn open(&self) -> Result<(), LinkError> {
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (data_tx, data_rx) = std_mpsc::channel();

        let setup = TunnelSetup {
            addr: self.addr.clone(),
            user: self.user.clone(),
            key_path: self.key_path.clone(),
        };
        std::thread::Builder::new()
            .name("ssh-tunnel".into())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                rt.block_on(tunnel_main(setup, cmd_rx, data_tx, ready_tx));
            })
            .map_err(LinkError::Io)?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.carry.lock().clear();
                *self.conn.lock() = Some(Connected { cmd_tx, data_rx });
                Ok(())
            }
            Ok(Err(msg)) => Err(LinkError::Open {
                path: self.addr.clone(),
                source: std::io::Error::new(std::io::ErrorKind::Other, msg),
            }),
            Err(_) => Err(LinkError::Broken),
        }
    }

    fn close(&self) -> Result<(), LinkError> {
        if let Some(conn) = self.conn.lock().take() {
            let _ = conn.cmd_tx.send(TunnelCmd::Close);
        }
        Ok(())
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize, LinkError> {
        let mut carry = self.carry.lock();
        if carry.is_empty() {
            let guard = self.conn.lock();
            let conn = guard.as_ref().ok_or(LinkError::Closed)?;
            match conn.data_rx.recv_timeout(READ_POLL) {
                Ok(data) => carry.extend_from_slice(&data),
                Err(std_mpsc::RecvTimeoutError::Timeout) => return Ok(0),
                Err(std_mpsc::RecvTimeoutError::Disconnected) => return Err(LinkError::Broken),
            }
        }
        let n = carry.len().min(buf.len());
        buf[..n].copy_from_slice(&carry[..n]);
        carry.drain(..n);
        Ok(n)
    }

    fn write(&self, buf: &[u8]) -> Result<usize, LinkError> {
        let guard = self.conn.lock();
        let conn = guard.as_ref().ok_or(LinkError::Closed)?;
        conn.cmd_tx
            .send(TunnelCmd::Write(buf.to_vec()))
            .map_err(|_| LinkError::Broken)?;
        Ok(buf.len())
    }

    fn reset(&self, enter_bootloader: bool) -> bool {
        if enter_bootloader {
            // Entering the boot loader is the remote uploader's job,
            // reached through `flash`.
            return false;
        }
        let guard = self.conn.lock();
        match guard.as_ref() {
            Some(conn) => conn.cmd_tx.send(TunnelCmd::Exec("reset")).is_ok(),
            None => false,
        }
    }

    fn reply_timeout(&self) -> Duration {
        // Round trips ride on a network; be patient.
        Duration::from_secs(3)
    }

    fn supports_remote_flash(&self) -> bool {
        true
    }

    fn flash(&self, image: &[u8]) -> Result<(), LinkError> {
        let (done_tx, done_rx) = std_mpsc::channel();
        {
            let guard = self.conn.lock();
            let conn = guard.as_ref().ok_or(LinkError::Closed)?;
            conn.cmd_tx
                .send(TunnelCmd::Flash(image.to_vec(), done_tx))
                .map_err(|_| LinkError::Broken)?;
        }
        match done_rx.recv() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(msg)) => Err(LinkError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                msg,
            ))),
            Err(_) => Err(LinkError::Broken),
        }
    }

    fn describe(&self) -> String {
        format!("ssh://{}@{}", self.user, self.addr)
    }
}

struct TunnelSetup {
    addr: String,
    user: String,
    key_path: PathBuf,
}

struct ClientHandler {
    host: String,
    port: u16,
}

#[async_trait::async_trait]
impl russh::client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        let known = russh_keys::check_known_hosts(&self.host, self.port, key).unwrap_or(false);
        if !known {
            warn!(host = %self.host, "server key not in known_hosts");
        }
        Ok(known)
    }
}

async fn tunnel_main(
    setup: TunnelSetup,
    mut cmd_rx: mpsc::UnboundedReceiver<TunnelCmd>,
    data_tx: std_mpsc::Sender<Vec<u8>>,
    ready_tx: std_mpsc::Sender<Result<(), String>>,
) {
    let (host, port) = match setup.addr.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.parse::<u16>().unwrap_or(22)),
        None => (setup.addr.clone(), 22),
    };

    let connect = async {
        let config = Arc::new(russh::client::Config::default());
        let handler = ClientHandler {
            host: host.clone(),
            port,
        };
        let mut session = russh::client::connect(config, (host.as_str(), port), handler)
            .await
            .map_err(|e| e.to_string())?;

        let key = russh_keys::load_secret_key(&setup.key_path, None)
            .map_err(|e| format!("cannot load SSH key {}: {e}", setup.key_path.display()))?;
        let authenticated = session
            .authenticate_publickey(&setup.user, Arc::new(key))
            .await
            .map_err(|e| e.to_string())?;
        if !authenticated {
            return Err(format!("{}: public key rejected", setup.addr));
        }

        let channel = session
            .channel_open_session()
            .await
            .map_err(|e| e.to_string())?;
        channel
            .request_shell(true)
            .await
            .map_err(|e| e.to_string())?;
        Ok((session, channel))
    };

    let (session, mut shell) = match connect.await {
        Ok(pair) => pair,
        Err(msg) => {
            let _ = ready_tx.send(Err(msg));
            return;
        }
    };
    let _ = ready_tx.send(Ok(()));

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(TunnelCmd::Write(data)) => {
                    if shell.data(&data[..]).await.is_err() {
                        debug!("shell channel write failed");
                        return;
                    }
                }
                Some(TunnelCmd::Exec(name)) => {
                    if let Err(e) = run_exec(&session, name, &[], &data_tx).await {
                        warn!(error = %e, command = name, "remote exec failed");
                    }
                }
                Some(TunnelCmd::Flash(image, done)) => {
                    let result = run_exec(&session, "flash", &image, &data_tx).await;
                    let _ = done.send(result);
                }
                Some(TunnelCmd::Close) | None => return,
            },
            msg = shell.wait() => match msg {
                Some(ChannelMsg::Data { data }) => {
                    if data_tx.send(data.to_vec()).is_err() {
                        return;
                    }
                }
                Some(_) => {}
                None => {
                    // Shell channel gone: the supervisor will reopen us.
                    return;
                }
            },
        }
    }
}

/// Run one exec-style session: send the whole body, then forward the
/// remote output into the ordinary received-bytes stream until the
/// channel closes.
async fn run_exec(
    session: &russh::client::Handle<ClientHandler>,
    command: &str,
    body: &[u8],
    data_tx: &std_mpsc::Sender<Vec<u8>>,
) -> Result<(), String> {
    let mut channel = session
        .channel_open_session()
        .await
        .map_err(|e| e.to_string())?;
    channel
        .exec(true, command)
        .await
        .map_err(|e| e.to_string())?;
    if !body.is_empty() {
        channel.data(body).await.map_err(|_| "send failed".to_string())?;
    }
    channel.eof().await.map_err(|e| e.to_string())?;

    let mut status = None;
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { data } => {
                let _ = data_tx.send(data.to_vec());
            }
            ChannelMsg::ExitStatus { exit_status } => status = Some(exit_status),
            _ => {}
        }
    }
    match status {
        Some(0) | None => Ok(()),
        Some(code) => Err(format!("remote {command} exited with status {code}")),
    }
}
