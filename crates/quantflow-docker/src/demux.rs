// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Multiplexed log-stream demultiplexer
//!
//! Containers started without a TTY write stdout and stderr down one
//! socket, framed with an 8-byte header: `{stream id, 0, 0, 0, length}`
//! with the length big-endian. Any raw bytes read off such a socket must
//! be demultiplexed before use — result extraction through helper
//! containers would otherwise hand back corrupted JSON.
//!
//! Parsing is strictly length-driven from the start of the stream. Payload
//! bytes that happen to look like a frame header are never re-interpreted,
//! because the parser only reads headers at frame boundaries.

use bytes::{Buf, Bytes, BytesMut};

/// Frame header length: stream id, three reserved bytes, u32 length.
const HEADER_LEN: usize = 8;

/// Output stream a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdStream {
    Stdin,
    Stdout,
    Stderr,
}

impl StdStream {
    fn from_id(id: u8) -> Self {
        match id {
            0 => StdStream::Stdin,
            2 => StdStream::Stderr,
            // The daemon only emits 0, 1 and 2; treat anything else as
            // stdout rather than dropping bytes.
            _ => StdStream::Stdout,
        }
    }
}

/// One demultiplexed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream: StdStream,
    pub payload: Bytes,
}

/// Incremental demultiplexer over arbitrarily-chunked input.
#[derive(Debug, Default)]
pub struct Demuxer {
    buf: BytesMut,
}

impl Demuxer {
    /// Fresh demultiplexer at a frame boundary.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes from the socket.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pop the next complete frame, if one is buffered.
    pub fn next_frame(&mut self) -> Option<Frame> {
        if self.buf.len() < HEADER_LEN {
            return None;
        }
        let len = u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]]) as usize;
        if self.buf.len() < HEADER_LEN + len {
            return None;
        }
        let stream = StdStream::from_id(self.buf[0]);
        self.buf.advance(HEADER_LEN);
        let payload = self.buf.split_to(len).freeze();
        Some(Frame { stream, payload })
    }

    /// Bytes buffered but not yet framed (mid-frame tail).
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Demultiplex a complete in-memory stream into frames.
#[must_use]
pub fn demux_all(bytes: &[u8]) -> Vec<Frame> {
    let mut demuxer = Demuxer::new();
    demuxer.push(bytes);
    let mut frames = Vec::new();
    while let Some(frame) = demuxer.next_frame() {
        frames.push(frame);
    }
    frames
}

/// Concatenated stdout payload of a complete in-memory stream.
#[must_use]
pub fn stdout_bytes(bytes: &[u8]) -> Vec<u8> {
    demux_all(bytes)
        .into_iter()
        .filter(|f| f.stream == StdStream::Stdout)
        .flat_map(|f| f.payload)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(stream_id: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![stream_id, 0, 0, 0];
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn splits_interleaved_streams() {
        let mut bytes = frame(1, b"out-1");
        bytes.extend(frame(2, b"err-1"));
        bytes.extend(frame(1, b"out-2"));

        let frames = demux_all(&bytes);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].stream, StdStream::Stdout);
        assert_eq!(frames[1].stream, StdStream::Stderr);
        assert_eq!(&stdout_bytes(&bytes), b"out-1out-2");
    }

    #[test]
    fn survives_arbitrary_chunking() {
        let mut bytes = frame(1, b"hello ");
        bytes.extend(frame(1, b"world"));

        // Feed one byte at a time across frame boundaries.
        let mut demuxer = Demuxer::new();
        let mut collected = Vec::new();
        for byte in &bytes {
            demuxer.push(std::slice::from_ref(byte));
            while let Some(frame) = demuxer.next_frame() {
                collected.extend_from_slice(&frame.payload);
            }
        }
        assert_eq!(&collected, b"hello world");
        assert_eq!(demuxer.pending(), 0);
    }

    #[test]
    fn payload_colliding_with_a_header_is_not_reinterpreted() {
        // A payload whose bytes form a valid-looking frame header claiming
        // a huge length. A sniffing parser would stall or corrupt; a
        // length-driven parser must pass it through untouched.
        let evil_payload: &[u8] = &[1, 0, 0, 0, 0xFF, 0xFF, 0xFF, 0xFF, b'x'];
        let mut bytes = frame(1, evil_payload);
        bytes.extend(frame(2, b"after"));

        let frames = demux_all(&bytes);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].payload.as_ref(), evil_payload);
        assert_eq!(frames[1].payload.as_ref(), b"after");
    }

    #[test]
    fn empty_frames_and_empty_input() {
        assert!(demux_all(&[]).is_empty());
        let bytes = frame(1, b"");
        let frames = demux_all(&bytes);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].payload.is_empty());
    }

    #[test]
    fn truncated_tail_stays_pending() {
        let mut bytes = frame(1, b"complete");
        bytes.extend_from_slice(&[1, 0, 0, 0, 0, 0, 0, 9, b'p']); // 9 promised, 1 present

        let mut demuxer = Demuxer::new();
        demuxer.push(&bytes);
        assert!(demuxer.next_frame().is_some());
        assert!(demuxer.next_frame().is_none());
        assert_eq!(demuxer.pending(), HEADER_LEN + 1);
    }
}
