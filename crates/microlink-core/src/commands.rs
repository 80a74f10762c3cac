// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! `!`-command handling for the interactive console.
//!
//! These handlers print straight to the switchboard's command output
//! writer: they only ever run for interactive console input, never for
//! network clients (whose commands arrive as typed requests instead).

use std::io::Write;

use crate::error::{CoreError, Result};
use crate::firmware::crc16;
use crate::include::IncludeEngine;
use crate::switchboard::Switchboard;
use crate::uploader::Uploader;

const HELP: &str = "\
Special commands, these can also be abbreviated as \"!r\", etc:
  !reset          reset the board, same as ctrl-c
  !send <file>    send text file to the serial port, expand \"include\" lines
  !upload         show the list of built-in firmware images
  !upload <n>     upload built-in image <n> using STM32 boot protocol
  !upload <file>  upload specified firmware image (bin or hex format)
  !upload <url>   fetch firmware image from given URL, then upload it
Utility commands:
  !cd <dir>       change directory (or list current one if not specified)
  !ls <dir>       list contents of the specified (or current) directory
  !help           this message
To quit, hit ctrl-d. For command history, use up-/down-arrow.
";

impl Switchboard {
    /// Recognise and run a `!`-command. Unrecognised `!`-lines print a
    /// hint; they are never forwarded to the microcontroller.
    pub(crate) async fn special_command(&mut self, line: &str) {
        let (cmd, rest) = match line.split_once(' ') {
            Some((cmd, rest)) if !rest.trim().is_empty() => (cmd, Some(rest.trim())),
            Some((cmd, _)) => (cmd, None),
            None => (line, None),
        };

        match cmd {
            "!" => {
                let _ = writeln!(self.out, "[enter '!h' for help]");
            }
            "!h" | "!help" => {
                let _ = writeln!(self.out, "{line}");
                let _ = write!(self.out, "{HELP}");
            }
            "!c" | "!cd" => {
                let _ = writeln!(self.out, "{line}");
                self.change_dir(rest);
            }
            "!l" | "!ls" => {
                let _ = writeln!(self.out, "{line}");
                self.list_dir(rest);
            }
            "!r" | "!reset" => {
                let _ = writeln!(self.out, "{line}");
                if !self.link.reset(false) {
                    // Couldn't issue the reset, probably a broken link.
                    let _ = writeln!(self.out, "[use CTRL-D to exit]");
                }
            }
            "!s" | "!send" => {
                let _ = writeln!(self.out, "{line}");
                self.send_file(cmd, rest).await;
            }
            "!u" | "!upload" => {
                let _ = writeln!(self.out, "{line}");
                self.upload(rest).await;
            }
            _ => {
                let _ = writeln!(self.out, "[unknown command, enter '!h' for help]");
            }
        }
        let _ = self.out.flush();
    }

    fn change_dir(&mut self, dir: Option<&str>) {
        if let Some(dir) = dir {
            if let Err(e) = std::env::set_current_dir(dir) {
                let _ = writeln!(self.out, "{dir}: {e}");
                return;
            }
        }
        match std::env::current_dir() {
            Ok(cwd) => {
                let _ = writeln!(self.out, "{}", cwd.display());
            }
            Err(e) => {
                let _ = writeln!(self.out, "{e}");
            }
        }
    }

    fn list_dir(&mut self, dir: Option<&str>) {
        let dir = dir.unwrap_or(".");
        let mut names = Vec::new();
        if let Ok(entries) = std::fs::read_dir(dir) {
            for entry in entries.flatten() {
                let mut name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with('.') {
                    continue;
                }
                if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    name.push('/');
                }
                names.push(name);
            }
        }
        names.sort();
        let _ = writeln!(self.out, "{}", names.join(" "));
    }

    async fn send_file(&mut self, cmd: &str, file: Option<&str>) {
        let file = match file {
            Some(f) => f.to_string(),
            None => {
                let _ = writeln!(self.out, "Usage: {cmd} <filename>");
                return;
            }
        };
        let mut engine = IncludeEngine::new(
            self.link.as_ref(),
            &mut self.link_rx,
            Some(&mut self.console_rx),
            &mut self.out,
        );
        if engine.include_file(&file, 0).await.is_err() {
            let _ = writeln!(self.out, "Send failed.");
        }
    }

    async fn upload(&mut self, arg: Option<&str>) {
        let names = (self.assets.names)();

        let arg = match arg {
            Some(arg) => arg,
            None => {
                if names.is_empty() {
                    let _ = writeln!(self.out, "No built-in firmware images in this build.");
                    return;
                }
                let _ = writeln!(self.out, "These firmware images are built-in:");
                for (i, name) in names.iter().enumerate() {
                    let data = (self.assets.get)(name).unwrap_or_default();
                    let _ = writeln!(
                        self.out,
                        "{:3}: {:<16} {:5}b  crc:{:04X}",
                        i + 1,
                        name,
                        data.len(),
                        crc16(&data)
                    );
                }
                let _ = writeln!(self.out, "Use '!u <n>' to upload a specific one.");
                return;
            }
        };

        let data = match self.resolve_image(arg, &names).await {
            Ok(data) => data,
            Err(e) => {
                let _ = writeln!(self.out, "{e}");
                return;
            }
        };

        if self.link.supports_remote_flash() {
            if let Err(e) = self.link.flash(&data) {
                let _ = writeln!(self.out, "remote flash failed: {e}");
            }
        } else {
            let report = Uploader::new(self.link.as_ref(), &mut self.link_rx, &mut self.out)
                .upload(&data)
                .await;
            if !report.ok() {
                let _ = writeln!(
                    self.out,
                    "[upload had {} failed exchanges]",
                    report.failures.len()
                );
            }
        }
        // Back to normal operation with BOOT0 low.
        self.link.reset(false);
    }

    /// Turn an upload argument into image bytes: a built-in image index,
    /// a URL to fetch, or a local file path.
    async fn resolve_image(&mut self, arg: &str, names: &[String]) -> Result<Vec<u8>> {
        if let Ok(n) = arg.parse::<usize>() {
            return names
                .get(n.wrapping_sub(1))
                .and_then(|name| (self.assets.get)(name))
                .ok_or_else(|| CoreError::NoSuchImage(arg.to_string()));
        }
        if arg.contains("://") {
            let _ = write!(self.out, "Fetching... ");
            let _ = self.out.flush();
            let data = fetch(arg).await?;
            let _ = writeln!(self.out, "got it, crc:{:04X}", crc16(&data));
            return Ok(data);
        }
        std::fs::read(arg).map_err(|e| CoreError::File {
            path: arg.to_string(),
            source: e,
        })
    }
}

/// GET a firmware image. Non-2xx responses become an error carrying the
/// status line and whatever diagnostic body the server sent.
async fn fetch(url: &str) -> Result<Vec<u8>> {
    let resp = reqwest::get(url).await?;
    let status = resp.status();
    let body = resp.bytes().await?;
    if !status.is_success() {
        return Err(CoreError::FetchStatus {
            status: status.to_string(),
            body: String::from_utf8_lossy(&body).into_owned(),
        });
    }
    Ok(body.to_vec())
}
