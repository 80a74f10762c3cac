// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! SSH listener.
//!
//! Remote clients authenticate with a public key (or not at all when the
//! operator passed `insecure`) and open session channels. The channel's
//! shell or exec request selects a session mode, which this handler maps
//! onto the switchboard's typed network inputs. Every session channel is
//! also registered as a console writer so the client sees whatever the
//! microcontroller broadcasts.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context as _;
use russh::server::{Auth, Handler, Msg, Server, Session};
use russh::{Channel, ChannelId, CryptoVec};
use russh_keys::key::PublicKey;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use microlink_core::{net, NetInput, SessionMode};
use microlink_core::ConsoleRegistry;
use microlink_transports::BufferPool;

/// Client keys allowed in. `None` means authentication is disabled.
#[derive(Debug)]
pub struct AuthorizedKeys(Option<Vec<PublicKey>>);

impl AuthorizedKeys {
    /// Load an OpenSSH authorized_keys file, or disable auth entirely for
    /// the literal argument `insecure` (useful on localhost).
    pub fn load(arg: &str) -> anyhow::Result<Self> {
        if arg == "insecure" {
            return Ok(Self(None));
        }
        let text = std::fs::read_to_string(arg)
            .with_context(|| format!("failed to load authorized keys from {arg}"))?;
        let mut keys = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let b64 = line
                .split_whitespace()
                .nth(1)
                .with_context(|| format!("malformed authorized key line: {line}"))?;
            let key = russh_keys::parse_public_key_base64(b64)
                .with_context(|| format!("error parsing authorized key: {line}"))?;
            keys.push(key);
        }
        Ok(Self(Some(keys)))
    }

    fn allows(&self, offered: &PublicKey) -> bool {
        match &self.0 {
            None => true,
            Some(keys) => keys
                .iter()
                .any(|k| k.fingerprint() == offered.fingerprint()),
        }
    }
}

/// The listening SSH server. Binding and key loading happen in `bind` so
/// startup failures surface before the switchboard runs.
pub struct SshServer {
    listener: tokio::net::TcpListener,
    config: Arc<russh::server::Config>,
    factory: ListenerFactory,
}

impl SshServer {
    pub async fn bind(
        addr: &str,
        host_key: &Path,
        auth_arg: &str,
        net_tx: mpsc::Sender<NetInput>,
        consoles: Arc<ConsoleRegistry>,
        pool: Arc<BufferPool>,
    ) -> anyhow::Result<Self> {
        let authorized = Arc::new(AuthorizedKeys::load(auth_arg)?);
        let key = russh_keys::load_secret_key(host_key, None)
            .with_context(|| format!("failed to load host key from {}", host_key.display()))?;
        let config = Arc::new(russh::server::Config {
            keys: vec![key],
            ..Default::default()
        });
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to listen on {addr}"))?;
        info!(addr, "SSH listener ready");
        Ok(Self {
            listener,
            config,
            factory: ListenerFactory {
                authorized,
                net_tx,
                consoles,
                pool,
            },
        })
    }

    /// Run the accept loop in the background.
    pub fn spawn(self) {
        let SshServer {
            listener,
            config,
            mut factory,
        } = self;
        tokio::spawn(async move {
            if let Err(e) = factory.run_on_socket(config, &listener).await {
                warn!(error = %e, "SSH listener terminated");
            }
        });
    }
}

#[derive(Clone)]
struct ListenerFactory {
    authorized: Arc<AuthorizedKeys>,
    net_tx: mpsc::Sender<NetInput>,
    consoles: Arc<ConsoleRegistry>,
    pool: Arc<BufferPool>,
}

impl Server for ListenerFactory {
    type Handler = SessionHandler;

    fn new_client(&mut self, peer: Option<SocketAddr>) -> SessionHandler {
        debug!(?peer, "incoming SSH connection");
        SessionHandler {
            authorized: Arc::clone(&self.authorized),
            net_tx: self.net_tx.clone(),
            consoles: Arc::clone(&self.consoles),
            pool: Arc::clone(&self.pool),
            channels: HashMap::new(),
        }
    }
}

struct ChannelState {
    mode: SessionMode,
    body: Vec<u8>,
    dispatched: bool,
}

pub struct SessionHandler {
    authorized: Arc<AuthorizedKeys>,
    net_tx: mpsc::Sender<NetInput>,
    consoles: Arc<ConsoleRegistry>,
    pool: Arc<BufferPool>,
    channels: HashMap<ChannelId, ChannelState>,
}

impl SessionHandler {
    /// Make link broadcasts visible on this channel. The forwarder task
    /// ends when the channel goes away, after which the registry drops the
    /// writer on its next broadcast.
    fn register_console(&self, id: ChannelId, session: &Session) {
        let handle = session.handle();
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        tokio::spawn(async move {
            while let Some(data) = rx.recv().await {
                if handle.data(id, CryptoVec::from(data)).await.is_err() {
                    return;
                }
            }
        });
        self.consoles.add(Box::new(ChannelWriter { tx }));
    }

    async fn dispatch_body(&mut self, id: ChannelId) {
        if let Some(state) = self.channels.get_mut(&id) {
            if state.dispatched || !state.mode.wants_body() {
                return;
            }
            state.dispatched = true;
            let body = std::mem::take(&mut state.body);
            if let Some(input) = net::exec_input(state.mode, body) {
                let _ = self.net_tx.send(input).await;
            }
        }
    }
}

#[async_trait::async_trait]
impl Handler for SessionHandler {
    type Error = russh::Error;

    async fn auth_publickey(
        &mut self,
        user: &str,
        key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        if self.authorized.allows(key) {
            Ok(Auth::Accept)
        } else {
            debug!(user, "rejected public key");
            Ok(Auth::Reject {
                proceed_with_methods: None,
            })
        }
    }

    async fn auth_none(&mut self, _user: &str) -> Result<Auth, Self::Error> {
        if self.authorized.0.is_none() {
            Ok(Auth::Accept)
        } else {
            Ok(Auth::Reject {
                proceed_with_methods: Some(russh::MethodSet::PUBLICKEY),
            })
        }
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.channels.insert(
            channel,
            ChannelState {
                mode: SessionMode::Shell,
                body: Vec::new(),
                dispatched: false,
            },
        );
        self.register_console(channel, session);
        session.channel_success(channel);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let cmd = String::from_utf8_lossy(data).trim().to_string();
        let mode = match SessionMode::parse(Some(&cmd)) {
            Some(mode) => mode,
            None => {
                warn!(cmd, "rejecting unknown exec request");
                session.channel_failure(channel);
                return Ok(());
            }
        };
        self.channels.insert(
            channel,
            ChannelState {
                mode,
                body: Vec::new(),
                dispatched: false,
            },
        );
        self.register_console(channel, session);
        session.channel_success(channel);

        if mode == SessionMode::Reset {
            let _ = self.net_tx.send(NetInput::Reset).await;
            session.exit_status_request(channel, 0);
            session.close(channel);
        }
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        match self.channels.get_mut(&channel) {
            Some(state) if state.mode == SessionMode::Shell => {
                for input in net::raw_inputs(&self.pool, data) {
                    let _ = self.net_tx.send(input).await;
                }
            }
            Some(state) if state.mode.wants_body() => {
                state.body.extend_from_slice(data);
            }
            _ => {}
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        // EOF is how exec-style clients say "that was everything".
        self.dispatch_body(channel).await;
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.dispatch_body(channel).await;
        self.channels.remove(&channel);
        Ok(())
    }
}

/// Bridges the sync console-writer interface onto an async SSH channel.
/// Send failures mean the channel is gone, which the registry treats as
/// the signal to drop this writer.
struct ChannelWriter {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl std::io::Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.tx
            .send(buf.to_vec())
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "channel closed"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insecure_disables_auth() {
        let keys = AuthorizedKeys::load("insecure").unwrap();
        assert!(keys.0.is_none());
    }

    #[test]
    fn missing_file_is_an_error() {
        // The configured path is the one opened; no fallback names.
        let err = AuthorizedKeys::load("/nonexistent/authorized_keys").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/authorized_keys"));
    }
}
