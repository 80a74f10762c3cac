// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Include engine behaviour against a scripted echoing target.

mod common;

use common::{ok_echo, spawn_echo, MockLink, SharedSink};
use microlink_core::include::{IncludeEngine, IncludeError};
use microlink_transports::BufferPool;
use tokio::sync::mpsc;

#[tokio::test]
async fn comment_lines_never_reach_the_link() {
    let (link, writes) = MockLink::new();
    let pool = BufferPool::new();
    let (tx, mut rx) = mpsc::channel(1);
    spawn_echo(writes, tx, pool, ok_echo);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("main.fs");
    std::fs::write(
        &path,
        "\n\\ a comment\n\\\n   \n: foo 1 + ;\n   \\ indented comment\n2 foo .\n",
    )
    .unwrap();

    let mut sink = SharedSink::new();
    let mut engine = IncludeEngine::new(link.as_ref(), &mut rx, None, &mut sink);
    engine
        .include_file(path.to_str().unwrap(), 0)
        .await
        .unwrap();

    // Stripping comments beforehand would produce exactly this traffic.
    assert_eq!(link.written(), b": foo 1 + ;\r2 foo .\r");
}

#[tokio::test]
async fn accepted_lines_are_silent() {
    let (link, writes) = MockLink::new();
    let pool = BufferPool::new();
    let (tx, mut rx) = mpsc::channel(1);
    spawn_echo(writes, tx, pool, ok_echo);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("one.fs");
    std::fs::write(&path, ": foo 1 + ;\n").unwrap();

    let sink = SharedSink::new();
    let mut out = sink.clone();
    let mut engine = IncludeEngine::new(link.as_ref(), &mut rx, None, &mut out);
    engine
        .include_file(path.to_str().unwrap(), 0)
        .await
        .unwrap();

    assert_eq!(link.written(), b": foo 1 + ;\r");
    // `<line>  ok.` replies print nothing; only the status line moved.
    assert!(
        !sink.text().contains(", line 1:"),
        "output: {:?}",
        sink.text()
    );
}

#[tokio::test]
async fn fatal_reply_aborts_the_file() {
    let (link, writes) = MockLink::new();
    let pool = BufferPool::new();
    let (tx, mut rx) = mpsc::channel(1);
    spawn_echo(writes, tx, pool, |line| {
        let mut out = line.to_vec();
        out.extend_from_slice(b" ? not found.\n");
        out
    });

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.fs");
    std::fs::write(&path, "bogus\nnever-sent\n").unwrap();

    let sink = SharedSink::new();
    let mut out = sink.clone();
    let mut engine = IncludeEngine::new(link.as_ref(), &mut rx, None, &mut out);
    let err = engine
        .include_file(path.to_str().unwrap(), 0)
        .await
        .unwrap_err();

    assert!(matches!(err, IncludeError::Fatal));
    assert!(
        sink.text().contains("bad.fs, line 1: ? not found."),
        "output: {:?}",
        sink.text()
    );
    // The second line was never attempted.
    assert_eq!(link.written(), b"bogus\r");
}

#[tokio::test]
async fn nested_includes_expand_depth_first() {
    let (link, writes) = MockLink::new();
    let pool = BufferPool::new();
    let (tx, mut rx) = mpsc::channel(1);
    spawn_echo(writes, tx, pool, ok_echo);

    let dir = tempfile::tempdir().unwrap();
    let lib = dir.path().join("lib.fs");
    std::fs::write(&lib, ": helper ;\n").unwrap();
    let main = dir.path().join("main.fs");
    std::fs::write(
        &main,
        format!("include {}\n: top helper ;\n", lib.display()),
    )
    .unwrap();

    let sink = SharedSink::new();
    let mut out = sink.clone();
    let mut engine = IncludeEngine::new(link.as_ref(), &mut rx, None, &mut out);
    engine
        .include_file(main.to_str().unwrap(), 0)
        .await
        .unwrap();

    assert_eq!(link.written(), b": helper ;\r: top helper ;\r");
    // The nested file showed a two-deep display prefix at some point.
    assert!(sink.text().contains(">> lib.fs"), "output: {:?}", sink.text());
}

#[tokio::test]
async fn include_cycles_hit_the_depth_ceiling() {
    let (link, _writes) = MockLink::new();
    let (_tx, mut rx) = mpsc::channel(1);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("self.fs");
    std::fs::write(&path, format!("include {}\n", path.display())).unwrap();

    let mut sink = SharedSink::new();
    let mut engine = IncludeEngine::new(link.as_ref(), &mut rx, None, &mut sink);
    let err = engine
        .include_file(path.to_str().unwrap(), 0)
        .await
        .unwrap_err();
    assert!(matches!(err, IncludeError::TooDeep));
}

#[tokio::test]
async fn console_input_aborts_a_running_send() {
    let (link, _writes) = MockLink::new();
    let (_tx, mut rx) = mpsc::channel(1);
    let (abort_tx, mut abort_rx) = mpsc::channel::<Vec<u8>>(1);
    abort_tx.send(b"!r\n".to_vec()).await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("slow.fs");
    std::fs::write(&path, "word\n").unwrap();

    let mut sink = SharedSink::new();
    let mut engine = IncludeEngine::new(link.as_ref(), &mut rx, Some(&mut abort_rx), &mut sink);
    let err = engine
        .include_file(path.to_str().unwrap(), 0)
        .await
        .unwrap_err();
    assert!(matches!(err, IncludeError::Aborted));
}

#[tokio::test(start_paused = true)]
async fn partial_echo_times_out() {
    let (link, writes) = MockLink::new();
    let pool = BufferPool::new();
    let (tx, mut rx) = mpsc::channel(1);
    // Echo arrives but the reply never completes with a line feed.
    spawn_echo(writes, tx, pool, |_line| b"wo".to_vec());

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stuck.fs");
    std::fs::write(&path, "word\n").unwrap();

    let sink = SharedSink::new();
    let mut out = sink.clone();
    let mut engine = IncludeEngine::new(link.as_ref(), &mut rx, None, &mut out);
    let err = engine
        .include_file(path.to_str().unwrap(), 0)
        .await
        .unwrap_err();
    assert!(matches!(err, IncludeError::Timeout));
    assert!(sink.text().contains("(timeout)"), "output: {:?}", sink.text());
}

#[tokio::test(start_paused = true)]
async fn echo_started_but_no_reply_is_not_a_failure() {
    let (link, writes) = MockLink::new();
    let pool = BufferPool::new();
    let (tx, mut rx) = mpsc::channel(1);
    // The echo of the submitted line plus the trailing space, then silence:
    // the target is still working on it.
    spawn_echo(writes, tx, pool, |line| {
        let mut out = line.to_vec();
        out.push(b' ');
        out
    });

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("busy.fs");
    std::fs::write(&path, "word\n").unwrap();

    let mut sink = SharedSink::new();
    let mut engine = IncludeEngine::new(link.as_ref(), &mut rx, None, &mut sink);
    engine
        .include_file(path.to_str().unwrap(), 0)
        .await
        .unwrap();
}

#[tokio::test]
async fn remote_source_blocks_use_the_same_rules() {
    let (link, writes) = MockLink::new();
    let pool = BufferPool::new();
    let (tx, mut rx) = mpsc::channel(1);
    spawn_echo(writes, tx, pool, ok_echo);

    let mut sink = SharedSink::new();
    let mut engine = IncludeEngine::new(link.as_ref(), &mut rx, None, &mut sink);
    engine
        .send_block(b": a 1 ;\n\\ comment\n: b 2 ;\n")
        .await
        .unwrap();
    assert_eq!(link.written(), b": a 1 ;\r: b 2 ;\r");
}
