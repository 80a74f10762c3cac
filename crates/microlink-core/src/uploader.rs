// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! STM32 USART boot-protocol uploader.
//!
//! Implements the ROM boot loader's serial protocol: reset the chip with
//! BOOT0 high, autobaud with 0x7F, then unprotect, erase and write the
//! image in 256-byte chunks. Every command byte is followed by its
//! complement and answered with an ACK; variable-length arguments carry a
//! running XOR checksum.
//!
//! A failed exchange prints `Failed: XX` and is recorded in the run
//! report, but the sequence keeps going: stopping halfway leaves the chip
//! no better off, and the report tells the caller what happened.

use std::collections::VecDeque;
use std::io::Write;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::trace;

use microlink_transports::{MicroLink, PooledBuf};

use crate::hexfile;

pub const ACK: u8 = 0x79;
pub const NAK: u8 = 0x1F;

/// Autobaud pattern that wakes the boot loader up.
const DISCOVER: u8 = 0x7F;

/// Start of flash on every STM32.
const FLASH_BASE: usize = 0x0800_0000;

/// Bytes per write command.
const CHUNK: usize = 256;

/// Flash page size for the extended-erase page list. This assumes the
/// 0x417 (L0xx) device family; the GETID reply is reported to the user but
/// does not change this.
const PAGE_SIZE: usize = 128;

/// Drain window for stray in-flight bytes before each fresh command.
const DRAIN: Duration = Duration::from_millis(50);

/// STM32 USART boot-loader command set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Fetch the boot-loader version and allowed commands.
    Get = 0x00,
    /// Get the chip ID.
    GetId = 0x02,
    /// Jump to user application code.
    Go = 0x21,
    /// Write up to 256 bytes of RAM or flash.
    WriteMemory = 0x31,
    /// Erase flash memory pages.
    Erase = 0x43,
    /// Erase flash pages with two-byte addressing (v3.0+ boot loaders).
    ExtendedErase = 0x44,
    /// Disable write protection for all flash sectors.
    WriteUnprotect = 0x73,
    /// Disable the read protection.
    ReadoutUnprotect = 0x92,
}

/// One exchange that did not come back with an ACK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFailure {
    pub stage: &'static str,
    /// The reply byte; 0 when nothing arrived at all.
    pub reply: u8,
}

/// What an upload run did, inspectable by the caller even though the
/// protocol sequence never aborts on individual failures.
#[derive(Debug, Default)]
pub struct UploadReport {
    pub image_len: usize,
    pub boot_version: u8,
    pub chip_id: u16,
    pub extended_erase: bool,
    pub pages_erased: Option<usize>,
    pub failures: Vec<UploadFailure>,
}

impl UploadReport {
    pub fn ok(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Drives one upload. Holds the link's received-bytes channel by `&mut`
/// for its whole run, so nothing else can consume boot-loader replies.
pub struct Uploader<'a> {
    link: &'a dyn MicroLink,
    rx: &'a mut mpsc::Receiver<PooledBuf>,
    out: &'a mut (dyn Write + Send),
    /// Running XOR of every byte sent since the last ACK.
    checksum: u8,
    /// Bytes received but not yet consumed as protocol replies.
    pending: VecDeque<u8>,
    extended: bool,
    stage: &'static str,
    report: UploadReport,
}

impl<'a> Uploader<'a> {
    pub fn new(
        link: &'a dyn MicroLink,
        rx: &'a mut mpsc::Receiver<PooledBuf>,
        out: &'a mut (dyn Write + Send),
    ) -> Self {
        Self {
            link,
            rx,
            out,
            checksum: 0,
            pending: VecDeque::new(),
            extended: false,
            stage: "attach",
            report: UploadReport::default(),
        }
    }

    /// Flash `image` (Intel-hex or raw binary, autodetected) and report
    /// what happened.
    pub async fn upload(mut self, image: &[u8]) -> UploadReport {
        let data = if hexfile::looks_like_hex(image) {
            match hexfile::decode(image) {
                Ok(bin) => bin,
                Err(e) => {
                    let _ = writeln!(self.out, "{e}");
                    image.to_vec()
                }
            }
        } else {
            image.to_vec()
        };
        self.report.image_len = data.len();
        let _ = write!(self.out, "  {}b ", data.len());
        let _ = self.out.flush();

        self.attach().await;

        let version = self.boot_version().await;
        self.report.boot_version = version;
        let _ = write!(self.out, "V{version:02X} ");

        let id = self.chip_id().await;
        self.report.chip_id = id;
        let _ = write!(self.out, "#{id:04X} ");

        self.stage = "read-unprotect";
        self.command(Command::ReadoutUnprotect).await;
        // Clearing read protection mass-erases the chip; give it time.
        self.expect_ack(20).await;
        let _ = write!(self.out, "R ");
        self.attach().await;

        self.stage = "write-unprotect";
        self.command(Command::WriteUnprotect).await;
        self.expect_ack(0).await;
        let _ = write!(self.out, "W ");
        self.attach().await;

        self.stage = "erase";
        self.report.extended_erase = self.extended;
        if self.extended {
            let pages = (data.len() + PAGE_SIZE - 1) / PAGE_SIZE;
            self.erase_pages(pages).await;
            self.report.pages_erased = Some(pages);
            let _ = write!(self.out, "E{pages}* ");
        } else {
            self.erase_all().await;
            let _ = write!(self.out, "E ");
        }

        self.stage = "write";
        self.write_flash(&data).await;
        let _ = writeln!(self.out, "done.");
        let _ = self.out.flush();
        self.report
    }

    /// Reset into the boot loader and autobaud until it answers.
    async fn attach(&mut self) {
        self.stage = "attach";
        loop {
            self.link.reset(true);
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.send_byte(DISCOVER);
            let r = self.reply().await;
            if r == ACK || r == NAK {
                if r == ACK {
                    let _ = write!(self.out, "+");
                }
                break;
            }
            let _ = write!(self.out, ".");
            let _ = self.out.flush();
        }
        let _ = self.out.flush();
    }

    async fn boot_version(&mut self) -> u8 {
        self.stage = "get";
        self.command(Command::Get).await;
        let n = self.reply().await;
        let version = self.reply().await;
        self.extended = false;
        for _ in 0..n {
            if self.reply().await == Command::ExtendedErase as u8 {
                self.extended = true;
            }
        }
        self.expect_ack(0).await;
        version
    }

    async fn chip_id(&mut self) -> u16 {
        self.stage = "get-id";
        self.command(Command::GetId).await;
        let _len = self.reply().await; // should be 1
        let hi = self.reply().await;
        let lo = self.reply().await;
        self.expect_ack(0).await;
        ((hi as u16) << 8) | lo as u16
    }

    async fn erase_pages(&mut self, pages: usize) {
        self.command(Command::ExtendedErase).await;
        // A full mass erase (0xFFFF) gets a NAK from some boot loaders, so
        // erase an explicit list covering just the pages to be programmed.
        self.send_u16((pages as u16).wrapping_sub(1));
        for i in 0..pages {
            self.send_u16(i as u16);
        }
        let cks = self.checksum;
        self.send_byte(cks);
        self.expect_ack(10).await;
    }

    async fn erase_all(&mut self) {
        self.command(Command::Erase).await;
        self.send_byte(0xFF);
        self.send_byte(0x00);
        self.expect_ack(10).await;
    }

    async fn write_flash(&mut self, data: &[u8]) {
        let _ = write!(self.out, "writing: ");
        let _ = self.out.flush();
        let total = (data.len() + CHUNK - 1) / CHUNK;
        let mut erase = 0;
        for (index, offset) in (0..data.len()).step_by(CHUNK).enumerate() {
            let counter = format!("{}/{} ", index + 1, total);
            let mut progress = "\u{8}".repeat(erase);
            progress.push_str(&counter);
            erase = counter.len();
            let _ = self.out.write_all(progress.as_bytes());
            let _ = self.out.flush();

            self.command(Command::WriteMemory).await;
            self.send_u32((FLASH_BASE + offset) as u32);
            let cks = self.checksum;
            self.send_byte(cks);
            self.expect_ack(0).await;

            self.send_byte((CHUNK - 1) as u8);
            for i in 0..CHUNK {
                self.send_byte(data.get(offset + i).copied().unwrap_or(0xFF));
            }
            let cks = self.checksum;
            self.send_byte(cks);
            self.expect_ack(0).await;
        }
    }

    /// Send a command byte plus its complement, after draining whatever
    /// was still in flight, and consume the command ACK.
    async fn command(&mut self, cmd: Command) {
        let _ = self.read_chunk(DRAIN).await;
        self.pending.clear();

        self.send_byte(cmd as u8);
        self.send_byte(!(cmd as u8));
        self.pending.clear();
        self.expect_ack(0).await;
    }

    /// Wait for an ACK, allowing `retries` empty reads for operations with
    /// long completion times. Anything else is recorded and printed, and
    /// the run continues.
    async fn expect_ack(&mut self, retries: usize) {
        let mut r = self.reply().await;
        let mut retries = retries;
        while retries > 0 && r == 0 {
            r = self.reply().await;
            retries -= 1;
        }
        if r != ACK {
            let _ = write!(self.out, "\nFailed: {r:02X}\n");
            let _ = self.out.flush();
            self.report.failures.push(UploadFailure {
                stage: self.stage,
                reply: r,
            });
        }
        self.checksum = 0;
    }

    /// Next reply byte, or 0 when the transport stays silent past its
    /// reply timeout.
    async fn reply(&mut self) -> u8 {
        if self.pending.is_empty() {
            if let Some(buf) = self.read_chunk(self.link.reply_timeout()).await {
                self.pending.extend(buf.iter().copied());
            }
        }
        match self.pending.pop_front() {
            Some(b) => {
                trace!("reply {b:02X} ({} still pending)", self.pending.len());
                b
            }
            None => 0,
        }
    }

    async fn read_chunk(&mut self, window: Duration) -> Option<PooledBuf> {
        tokio::time::timeout(window, self.rx.recv()).await.ok().flatten()
    }

    fn send_byte(&mut self, b: u8) {
        trace!("send {b:02X}");
        let _ = self.link.write(&[b]);
        self.checksum ^= b;
    }

    fn send_u16(&mut self, v: u16) {
        self.send_byte((v >> 8) as u8);
        self.send_byte(v as u8);
    }

    fn send_u32(&mut self, v: u32) {
        self.send_u16((v >> 16) as u16);
        self.send_u16(v as u16);
    }
}
