// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The helper-read byte-recovery path: bytes coming back from a helper
//! container over a multiplexed log socket must survive demultiplexing
//! exactly, even when the file content itself looks like frame headers.

use quantflow_docker::{demux_all, stdout_bytes, Demuxer, StdStream};

fn mux_frame(stream_id: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![stream_id, 0, 0, 0];
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Simulate `cat .last_result.json` through a helper container whose
/// stderr also emits a diagnostic line mid-stream.
#[test]
fn result_pointer_survives_interleaved_stderr() {
    let pointer = br#"{"latest_backtest": "results-20240301.zip"}"#;

    let mut wire = Vec::new();
    wire.extend(mux_frame(1, &pointer[..10]));
    wire.extend(mux_frame(2, b"cat: some transient warning\n"));
    wire.extend(mux_frame(1, &pointer[10..]));

    let recovered = stdout_bytes(&wire);
    assert_eq!(recovered, pointer);

    let parsed: serde_json::Value = serde_json::from_slice(&recovered).unwrap();
    assert_eq!(parsed["latest_backtest"], "results-20240301.zip");
}

/// A file whose bytes collide with a valid-looking frame header must pass
/// through untouched: the parser is length-driven, never sniffing.
#[test]
fn header_collision_bytes_pass_through() {
    // Starts with what looks like a stdout frame header announcing a
    // 4 GiB payload.
    let mut evil_file = vec![1u8, 0, 0, 0, 0xFF, 0xFF, 0xFF, 0xFF];
    evil_file.extend_from_slice(b"{\"k\":1}");

    let mut wire = Vec::new();
    wire.extend(mux_frame(1, &evil_file));
    wire.extend(mux_frame(1, b"tail"));

    let frames = demux_all(&wire);
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].stream, StdStream::Stdout);
    assert_eq!(frames[0].payload.as_ref(), evil_file.as_slice());
    assert_eq!(frames[1].payload.as_ref(), b"tail");
}

/// Chunk boundaries from the network never align with frame boundaries;
/// recovery must be identical regardless of how the bytes arrive.
#[test]
fn recovery_is_chunking_invariant() {
    let member = vec![0xA5u8; 3000]; // binary archive member
    let mut wire = Vec::new();
    for chunk in member.chunks(512) {
        wire.extend(mux_frame(1, chunk));
    }

    for chunk_size in [1, 7, 64, 4096] {
        let mut demuxer = Demuxer::new();
        let mut recovered = Vec::new();
        for chunk in wire.chunks(chunk_size) {
            demuxer.push(chunk);
            while let Some(frame) = demuxer.next_frame() {
                if frame.stream == StdStream::Stdout {
                    recovered.extend_from_slice(&frame.payload);
                }
            }
        }
        assert_eq!(recovered, member, "chunk size {chunk_size}");
        assert_eq!(demuxer.pending(), 0);
    }
}
