// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Forth source sender.
//!
//! Sends a text file to the target one line at a time, waiting for each
//! line's echo before the next so the interpreter is never outrun. Lines
//! consisting of whitespace or `\`-comments are skipped locally, and
//! `include <path> …` directives expand depth-first into nested files.
//!
//! The target echoes every submitted line and appends `  ok.` on success;
//! anything else is shown to the user, and a known-fatal reply aborts the
//! whole file.

use std::future::Future;
use std::io::Write;
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use microlink_transports::{LinkError, MicroLink, PooledBuf};

/// Hard ceiling on `include` nesting. Include cycles exist in the wild;
/// running into the ceiling fails the send instead of recursing forever.
pub const MAX_INCLUDE_DEPTH: usize = 16;

/// How long to wait for the echo of a submitted line.
const ECHO_TIMEOUT: Duration = Duration::from_secs(3);

/// Replies that make continuing with the rest of the file pointless.
const FATAL_SUFFIXES: &[&str] = &[
    " not found.",
    " is compile-only.",
    " Stack not balanced.",
    " Stack underflow",
    " Stack overflow",
    " Flash full",
    " Ram full",
    " Structures don't match",
    " Jump too far",
];

#[derive(Debug, thiserror::Error)]
pub enum IncludeError {
    #[error("{path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("include nesting deeper than {} levels", MAX_INCLUDE_DEPTH)]
    TooDeep,

    #[error("fatal reply from the target")]
    Fatal,

    #[error("timed out waiting for the line echo")]
    Timeout,

    #[error("aborted by console input")]
    Aborted,

    #[error("link reader terminated")]
    LinkGone,

    #[error(transparent)]
    Link(#[from] LinkError),
}

/// Sends files or source blocks over the link with echo matching. Borrows
/// the link's received-bytes channel for its whole lifetime, which keeps
/// the switchboard from competing for device output mid-send.
pub struct IncludeEngine<'a> {
    link: &'a dyn MicroLink,
    rx: &'a mut mpsc::Receiver<PooledBuf>,
    /// Console input; anything arriving here aborts the send.
    abort: Option<&'a mut mpsc::Receiver<Vec<u8>>>,
    out: &'a mut (dyn Write + Send),
    file: String,
    line_no: usize,
    /// Display counter: one `>` per include call since depth zero.
    calls: usize,
    status_len: usize,
}

impl<'a> IncludeEngine<'a> {
    pub fn new(
        link: &'a dyn MicroLink,
        rx: &'a mut mpsc::Receiver<PooledBuf>,
        abort: Option<&'a mut mpsc::Receiver<Vec<u8>>>,
        out: &'a mut (dyn Write + Send),
    ) -> Self {
        Self {
            link,
            rx,
            abort,
            out,
            file: String::new(),
            line_no: 0,
            calls: 0,
            status_len: 0,
        }
    }

    /// Send one file, expanding embedded includes as needed. `level` is
    /// the nesting depth; zero for a user-initiated send.
    pub fn include_file<'s>(
        &'s mut self,
        name: &str,
        level: usize,
    ) -> Pin<Box<dyn Future<Output = Result<(), IncludeError>> + Send + 's>> {
        let name = name.to_owned();
        Box::pin(async move {
            if level >= MAX_INCLUDE_DEPTH {
                let _ = writeln!(self.out, "{name}: include nesting too deep");
                return Err(IncludeError::TooDeep);
            }
            let text = match std::fs::read_to_string(&name) {
                Ok(text) => text,
                Err(e) => {
                    let _ = writeln!(self.out, "{name}: {e}");
                    return Err(IncludeError::Open {
                        path: name,
                        source: e,
                    });
                }
            };

            let prev_file = std::mem::replace(&mut self.file, basename(&name));
            let prev_line = std::mem::replace(&mut self.line_no, 0);
            if level == 0 {
                self.calls = 0;
            }
            self.calls += 1;

            let result = self.send_lines(&text, level).await;

            self.status("");
            self.file = prev_file;
            self.line_no = prev_line;
            result
        })
    }

    /// Send a block of source received from a network client. Lines go
    /// through the same skip rules and echo matching as a local include,
    /// but `include` directives are not expanded: remote input gets no
    /// access to local files.
    pub async fn send_block(&mut self, data: &[u8]) -> Result<(), IncludeError> {
        let text = String::from_utf8_lossy(data).into_owned();
        let prev_file = std::mem::replace(&mut self.file, "(remote)".to_string());
        let prev_line = std::mem::replace(&mut self.line_no, 0);
        self.calls = 1;

        let mut result = Ok(());
        for raw in text.lines() {
            self.line_no += 1;
            self.show_position();
            let line = raw.trim_end_matches('\r');
            if is_skippable(line) {
                continue;
            }
            if let Err(e) = self.send_line(line).await {
                result = Err(e);
                break;
            }
        }

        self.status("");
        self.file = prev_file;
        self.line_no = prev_line;
        result
    }

    async fn send_lines(&mut self, text: &str, level: usize) -> Result<(), IncludeError> {
        for raw in text.lines() {
            self.line_no += 1;
            self.show_position();

            let line = raw.trim_end_matches('\r');
            if is_skippable(line) {
                continue;
            }

            if let Some(rest) = line.strip_prefix("include ") {
                for token in rest.split_whitespace() {
                    self.status("");
                    self.include_file(token, level + 1).await?;
                }
            } else {
                self.send_line(line).await?;
            }
        }
        Ok(())
    }

    /// Write one line with its carriage return and wait for the echo.
    async fn send_line(&mut self, line: &str) -> Result<(), IncludeError> {
        let mut msg = Vec::with_capacity(line.len() + 1);
        msg.extend_from_slice(line.as_bytes());
        msg.push(b'\r');
        self.link.write(&msg)?;
        self.match_echo(line).await
    }

    /// Wait for the echo of `expect` and classify the target's reply.
    async fn match_echo(&mut self, expect: &str) -> Result<(), IncludeError> {
        let deadline = Instant::now() + ECHO_TIMEOUT;
        let started = format!("{expect} ");
        let accepted = format!("{expect}  ok.");
        let mut pending: Vec<u8> = Vec::new();

        loop {
            let data = tokio::select! {
                _ = recv_abort(self.abort.as_mut().map(|r| &mut **r)) => {
                    return Err(IncludeError::Aborted);
                }
                data = self.rx.recv() => match data {
                    Some(data) => data,
                    None => return Err(IncludeError::LinkGone),
                },
                _ = tokio::time::sleep_until(deadline) => {
                    if pending.is_empty() {
                        return Ok(());
                    }
                    let shown = String::from_utf8_lossy(&pending).into_owned();
                    self.print_reply(&format!("{shown} (timeout)"));
                    // An echo that started but never finished means the
                    // target is still chewing; anything else failed.
                    if pending == started.as_bytes() {
                        return Ok(());
                    }
                    return Err(IncludeError::Timeout);
                }
            };
            pending.extend_from_slice(&data);

            if !pending.contains(&b'\n') {
                continue;
            }

            let mut parts: Vec<Vec<u8>> = pending
                .split(|&b| b == b'\n')
                .map(|s| s.to_vec())
                .collect();
            let tail = parts.pop().unwrap_or_default();
            let last = parts.pop().unwrap_or_default();
            // Everything before the line being matched is unexpected
            // intermediate output; show it as-is.
            for part in &parts {
                self.print_reply(&String::from_utf8_lossy(part));
            }

            if tail.is_empty() && last.starts_with(started.as_bytes()) {
                if last == accepted.as_bytes() {
                    return Ok(());
                }
                let reply = String::from_utf8_lossy(&last[started.len()..]).into_owned();
                self.print_reply(&reply);
                let full = String::from_utf8_lossy(&last);
                if FATAL_SUFFIXES.iter().any(|s| full.ends_with(s)) {
                    return Err(IncludeError::Fatal);
                }
                return Ok(());
            }

            self.print_reply(&String::from_utf8_lossy(&last));
            pending = tail;
        }
    }

    fn show_position(&mut self) {
        let msg = format!(
            "{} {} {}: ",
            ">".repeat(self.calls),
            self.file,
            self.line_no
        );
        self.status(&msg);
    }

    fn print_reply(&mut self, msg: &str) {
        let _ = writeln!(self.out, "{}, line {}: {}", self.file, self.line_no, msg);
        let _ = self.out.flush();
    }

    /// Replace the transient status line, backspacing over the previous
    /// one so the display stays on a single line.
    fn status(&mut self, msg: &str) {
        let mut s = String::with_capacity(3 * self.status_len + msg.len());
        for _ in 0..self.status_len {
            s.push_str("\u{8} \u{8}");
        }
        s.push_str(msg);
        let _ = self.out.write_all(s.as_bytes());
        let _ = self.out.flush();
        self.status_len = msg.len();
    }
}

async fn recv_abort(abort: Option<&mut mpsc::Receiver<Vec<u8>>>) -> Option<Vec<u8>> {
    match abort {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Blank lines and Forth line comments never reach the target.
fn is_skippable(line: &str) -> bool {
    let s = line.trim_start_matches(' ');
    s.is_empty() || s == "\\" || s.starts_with("\\ ")
}

fn basename(path: &str) -> String {
    std::path::Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_rules() {
        assert!(is_skippable(""));
        assert!(is_skippable("   "));
        assert!(is_skippable("\\"));
        assert!(is_skippable("\\ a comment"));
        assert!(is_skippable("   \\ indented comment"));
        assert!(!is_skippable("\\t escapes are words here"));
        assert!(!is_skippable(": definition ;"));
        assert!(!is_skippable("include lib.fs"));
    }

    #[test]
    fn basenames() {
        assert_eq!(basename("dir/sub/file.fs"), "file.fs");
        assert_eq!(basename("file.fs"), "file.fs");
    }
}
