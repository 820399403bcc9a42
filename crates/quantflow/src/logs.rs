// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Log-stream abstraction
//!
//! A [`LogStream`] owns a dedicated substrate connection: raw bytes, an
//! optional parsed-entry channel, and an explicit close that tears the
//! producer down. Concurrent readers on the same workload each get their
//! own stream.

use std::pin::Pin;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Which output streams of the workload to read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Stdout,
    Stderr,
    #[default]
    Both,
}

impl LogSource {
    /// Whether stdout frames are included.
    #[must_use]
    pub fn stdout(&self) -> bool {
        matches!(self, LogSource::Stdout | LogSource::Both)
    }

    /// Whether stderr frames are included.
    #[must_use]
    pub fn stderr(&self) -> bool {
        matches!(self, LogSource::Stderr | LogSource::Both)
    }
}

/// Options for a log read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogOptions {
    /// Keep the stream open and follow new output.
    #[serde(default)]
    pub follow: bool,
    /// Only the last `n` lines.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tail: Option<u64>,
    /// Prefix each line with its timestamp.
    #[serde(default)]
    pub timestamps: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub source: LogSource,
}

impl LogOptions {
    /// Options for collecting everything a finished workload wrote.
    #[must_use]
    pub fn capture_all() -> Self {
        Self { follow: false, ..Self::default() }
    }
}

/// One demultiplexed log line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Which output stream the line came from.
    pub source: LogSource,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// An open log read against one workload.
///
/// Dropping the stream, or calling [`LogStream::close`], cancels the
/// producer and releases the substrate connection.
pub struct LogStream {
    bytes: ByteStream,
    entries: Option<mpsc::Receiver<LogEntry>>,
    cancel: CancellationToken,
}

impl LogStream {
    /// Wrap a raw byte stream. The token is cancelled on close.
    #[must_use]
    pub fn new(bytes: ByteStream, cancel: CancellationToken) -> Self {
        Self { bytes, entries: None, cancel }
    }

    /// Attach a parsed-entry channel fed by the producer.
    #[must_use]
    pub fn with_entries(mut self, entries: mpsc::Receiver<LogEntry>) -> Self {
        self.entries = Some(entries);
        self
    }

    /// Next chunk of raw bytes, `None` at end of stream.
    pub async fn next_chunk(&mut self) -> Option<Result<Bytes>> {
        self.bytes.next().await
    }

    /// Take the parsed-entry receiver, if the driver provides one.
    pub fn take_entries(&mut self) -> Option<mpsc::Receiver<LogEntry>> {
        self.entries.take()
    }

    /// Drain the stream into a lossy UTF-8 string.
    pub async fn collect_string(mut self) -> Result<String> {
        let mut buf = Vec::new();
        while let Some(chunk) = self.bytes.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Tear down the producer and release the substrate connection.
    pub fn close(&mut self) {
        self.cancel.cancel();
    }
}

impl Drop for LogStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for LogStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogStream")
            .field("entries", &self.entries.is_some())
            .field("closed", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn byte_stream(chunks: Vec<&'static [u8]>) -> ByteStream {
        Box::pin(stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from_static(c)))))
    }

    #[tokio::test]
    async fn collect_string_concatenates_chunks() {
        let stream = LogStream::new(
            byte_stream(vec![b"hello ", b"world\n"]),
            CancellationToken::new(),
        );
        assert_eq!(stream.collect_string().await.unwrap(), "hello world\n");
    }

    #[tokio::test]
    async fn close_cancels_the_producer() {
        let cancel = CancellationToken::new();
        let mut stream = LogStream::new(byte_stream(vec![]), cancel.clone());
        assert!(!cancel.is_cancelled());
        stream.close();
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn drop_also_cancels() {
        let cancel = CancellationToken::new();
        {
            let _stream = LogStream::new(byte_stream(vec![]), cancel.clone());
        }
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn source_selector() {
        assert!(LogSource::Both.stdout() && LogSource::Both.stderr());
        assert!(LogSource::Stdout.stdout() && !LogSource::Stdout.stderr());
        assert!(!LogSource::Stderr.stdout() && LogSource::Stderr.stderr());
    }
}
