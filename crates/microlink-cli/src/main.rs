// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! microlink: interactive console and firmware uploader for Forth-based
//! microcontrollers, over a local serial port, a telnet serial gateway,
//! or an SSH tunnel to another microlink instance.

mod chooser;
mod console;
mod remote;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use microlink_core::{AssetBundle, ConsoleRegistry, NetInput, Switchboard};
use microlink_transports::{BufferPool, MicroLink, SerialLink, Supervisor, TelnetLink};

use console::CrlfWriter;

/// Talk to a Forth-based microcontroller over serial, a telnet serial
/// gateway, or a remote microlink reached over SSH.
#[derive(Parser, Debug)]
#[command(name = "microlink", version, long_about = None)]
struct Args {
    /// Verbose output for debugging
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Address and port to listen on for SSH connections, e.g. 0.0.0.0:2022
    #[arg(short = 'l', long = "listen", conflicts_with = "ssh")]
    listen: Option<String>,

    /// SSH host key for the listener
    #[arg(long, default_value = "/etc/ssh/ssh_host_ed25519_key")]
    key: PathBuf,

    /// SSH authorized client keys; the value "insecure" disables
    /// authentication, which can be useful when listening on localhost
    #[arg(long, default_value = ".authorized_keys")]
    auth: String,

    /// Serial device (COM*, /dev/cu.*, /dev/tty*) or host:port of a
    /// telnet serial gateway
    #[arg(short = 'p', long = "port", conflicts_with = "ssh")]
    port: Option<String>,

    /// Serial baud rate
    #[arg(short = 'b', long = "baud", default_value_t = 115200)]
    baud: u32,

    /// Raw TCP instead of telnet serial escapes
    #[arg(short = 'r', long = "raw")]
    raw: bool,

    /// Act as a remote client of the microlink instance at this address
    #[arg(long)]
    ssh: Option<String>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let default_filter = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(|| CrlfWriter::new(std::io::stderr()))
        .init();

    eprintln!("[microlink {}]", env!("CARGO_PKG_VERSION"));

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(1);
        }
    };
    runtime.block_on(run(args))
}

async fn run(args: Args) -> ExitCode {
    let pool = BufferPool::new();
    let (link_tx, link_rx) = mpsc::channel(1);
    let (console_tx, console_rx) = mpsc::channel(1);
    let (net_tx, net_rx) = mpsc::channel::<NetInput>(1);
    let consoles = ConsoleRegistry::new();

    // Pick the transport variant for the microcontroller.
    let link: Arc<dyn MicroLink> = if let Some(addr) = &args.ssh {
        Arc::new(remote::client::TunnelLink::new(addr.clone()))
    } else {
        let port = match args.port.clone().or_else(chooser::select_port) {
            Some(port) => port,
            None => {
                eprintln!("No port selected");
                return ExitCode::SUCCESS;
            }
        };
        if std::path::Path::new(&port).exists() {
            Arc::new(SerialLink::new(port, args.baud))
        } else {
            Arc::new(TelnetLink::new(port, args.raw))
        }
    };

    // SSH listener, if requested. Key and bind failures are fatal before
    // anything touches the device.
    if let Some(listen) = &args.listen {
        let server = remote::server::SshServer::bind(
            listen,
            &args.key,
            &args.auth,
            net_tx.clone(),
            Arc::clone(&consoles),
            Arc::clone(&pool),
        )
        .await;
        match server {
            Ok(server) => server.spawn(),
            Err(e) => {
                eprintln!("SSH server: {e:#}");
                return ExitCode::from(2);
            }
        }
    }

    // First open happens here, synchronously, so a bad device path is an
    // immediate exit instead of an endless reconnect loop.
    let supervisor = Supervisor::new(Arc::clone(&link), Arc::clone(&pool));
    if let Err(e) = supervisor.start(link_tx, CrlfWriter::new(std::io::stderr())) {
        eprintln!("{e}");
        return ExitCode::from(3);
    }

    // The local terminal is just another console writer.
    consoles.add(Box::new(CrlfWriter::new(std::io::stdout())));

    if let Err(e) = console::spawn_reader(console_tx) {
        eprintln!("error initializing readline: {e}");
        return ExitCode::from(1);
    }
    eprintln!("[ready]");

    Switchboard::new(
        link,
        link_rx,
        console_rx,
        net_rx,
        consoles,
        AssetBundle::default(),
        Box::new(CrlfWriter::new(std::io::stdout())),
    )
    .run()
    .await;

    // Let the wrapped stdout/stderr writers drain before the process goes.
    tokio::time::sleep(Duration::from_millis(100)).await;
    ExitCode::SUCCESS
}
