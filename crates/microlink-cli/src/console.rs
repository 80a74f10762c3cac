// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Interactive console: the line editor loop and the writer that keeps
//! terminal output sane while the editor has the terminal in raw mode.

use std::io::Write;

use rustyline::completion::{Completer, Pair};
use rustyline::highlight::Highlighter;
use rustyline::hint::Hinter;
use rustyline::history::DefaultHistory;
use rustyline::validate::Validator;
use rustyline::{Config, Editor, Helper};
use tokio::sync::mpsc;
use tracing::debug;

/// Inserts a carriage return before every line feed. Raw terminal mode
/// drops the usual newline translation, so everything the program prints
/// while the line editor is active goes through one of these.
pub struct CrlfWriter<W> {
    inner: W,
}

impl<W: Write> CrlfWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W: Write> Write for CrlfWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        for chunk in buf.split_inclusive(|&b| b == b'\n') {
            match chunk.split_last() {
                Some((b'\n', head)) => {
                    self.inner.write_all(head)?;
                    self.inner.write_all(b"\r\n")?;
                }
                _ => self.inner.write_all(chunk)?,
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Filename completion for `!`-command arguments: `!send ste<tab>` offers
/// the files in the named (or current) directory.
pub struct ConsoleHelper;

impl Completer for ConsoleHelper {
    type Candidate = Pair;

    fn complete(
        &self,
        line: &str,
        pos: usize,
        _ctx: &rustyline::Context<'_>,
    ) -> rustyline::Result<(usize, Vec<Pair>)> {
        let typed = &line[..pos];
        let space = match typed.find(' ') {
            Some(i) if typed.starts_with('!') && i > 0 => i,
            _ => return Ok((pos, Vec::new())),
        };

        let slash = typed.rfind('/').filter(|&i| i > space);
        let (dir, word_start) = match slash {
            Some(i) => (&typed[space + 1..=i], i + 1),
            None => ("./", space + 1),
        };
        let prefix = &typed[word_start..];

        let mut candidates = Vec::new();
        if let Ok(entries) = std::fs::read_dir(dir) {
            for entry in entries.flatten() {
                let mut name = entry.file_name().to_string_lossy().into_owned();
                if !name.starts_with(prefix) {
                    continue;
                }
                if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    name.push('/');
                }
                candidates.push(Pair {
                    display: name.clone(),
                    replacement: name,
                });
            }
        }
        candidates.sort_by(|a, b| a.display.cmp(&b.display));
        Ok((word_start, candidates))
    }
}

impl Hinter for ConsoleHelper {
    type Hint = String;
}

impl Highlighter for ConsoleHelper {}

impl Validator for ConsoleHelper {}
impl Helper for ConsoleHelper {}

/// Start the console reader thread. Each line goes into `tx` with a
/// trailing line feed; ctrl-C becomes `!reset`; ctrl-D ends the loop and
/// drops the sender, which is the switchboard's cue to shut down.
pub fn spawn_reader(tx: mpsc::Sender<Vec<u8>>) -> anyhow::Result<()> {
    let config = Config::builder().auto_add_history(true).build();
    let mut editor: Editor<ConsoleHelper, DefaultHistory> = Editor::with_config(config)?;
    editor.set_helper(Some(ConsoleHelper));

    std::thread::Builder::new()
        .name("console".into())
        .spawn(move || loop {
            let line = match editor.readline("") {
                Ok(line) => line,
                Err(rustyline::error::ReadlineError::Interrupted) => "!reset".to_string(),
                Err(e) => {
                    debug!(error = %e, "console reader done");
                    return;
                }
            };
            let mut buf = line.into_bytes();
            buf.push(b'\n');
            if tx.blocking_send(buf).is_err() {
                return;
            }
        })?;
    Ok(())
}
