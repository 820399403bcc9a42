// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Log-stream production shared by the workload, job and download
//! controllers
//!
//! Each open stream owns a dedicated daemon connection driven by a
//! background task; closing the [`LogStream`] (or dropping it) cancels the
//! task. Raw bytes and parsed line entries are both offered, matching the
//! log contract of the capability traits.

use bollard::container::{LogOutput, LogsOptions};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use quantflow::logs::{LogEntry, LogOptions as CoreLogOptions, LogSource, LogStream};

use crate::client::{docker_err, DockerClient};

/// Translate the capability-level options into daemon options.
#[must_use]
pub(crate) fn to_daemon_options(options: &CoreLogOptions) -> LogsOptions<String> {
    LogsOptions {
        follow: options.follow,
        stdout: options.source.stdout(),
        stderr: options.source.stderr(),
        since: options.since.map_or(0, |t| t.timestamp()),
        until: options.until.map_or(0, |t| t.timestamp()),
        timestamps: options.timestamps,
        tail: options.tail.map_or_else(|| "all".to_string(), |n| n.to_string()),
    }
}

/// Open a log stream for `container` and drive it from a background task.
pub(crate) fn open(client: &DockerClient, container: &str, options: &CoreLogOptions) -> LogStream {
    let cancel = CancellationToken::new();
    let (byte_tx, byte_rx) = mpsc::channel::<quantflow::Result<Bytes>>(64);
    let (entry_tx, entry_rx) = mpsc::channel::<LogEntry>(256);

    let docker = client.docker().clone();
    let container = container.to_string();
    let daemon_options = to_daemon_options(options);
    let timestamps = options.timestamps;
    let task_cancel = cancel.clone();

    tokio::spawn(async move {
        let mut frames = docker.logs(&container, Some(daemon_options));
        let mut lines = LineAssembler::new(timestamps);
        loop {
            tokio::select! {
                () = task_cancel.cancelled() => break,
                frame = frames.next() => match frame {
                    Some(Ok(output)) => {
                        let (source, payload) = split_output(output);
                        for entry in lines.push(source, &payload) {
                            if entry_tx.send(entry).await.is_err() {
                                // Entry consumer gone; keep bytes flowing.
                            }
                        }
                        if byte_tx.send(Ok(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        let _ = byte_tx.send(Err(docker_err("get-logs", e))).await;
                        break;
                    }
                    None => break,
                },
            }
        }
        for entry in lines.flush() {
            let _ = entry_tx.send(entry).await;
        }
        debug!(container = %container, "log stream closed");
    });

    LogStream::new(Box::pin(ReceiverStream::new(byte_rx)), cancel).with_entries(entry_rx)
}

/// Collect a container's logs into a lossy UTF-8 string without keeping a
/// stream open. Used for result extraction and progress parsing.
pub(crate) async fn collect(
    client: &DockerClient,
    ctx: &quantflow::OpCtx,
    container: &str,
    options: &CoreLogOptions,
) -> quantflow::Result<String> {
    let mut frames = client.docker().logs(container, Some(to_daemon_options(options)));
    let mut buf = Vec::new();
    while let Some(frame) = ctx.guard("get-logs", frames.next()).await? {
        let (_, payload) = split_output(frame.map_err(|e| docker_err("get-logs", e))?);
        buf.extend_from_slice(&payload);
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn split_output(output: LogOutput) -> (LogSource, Bytes) {
    match output {
        LogOutput::StdOut { message } | LogOutput::Console { message } => {
            (LogSource::Stdout, message)
        }
        LogOutput::StdErr { message } => (LogSource::Stderr, message),
        LogOutput::StdIn { message } => (LogSource::Stdout, message),
    }
}

/// Reassembles frames into whole lines, one buffer per source stream.
struct LineAssembler {
    timestamps: bool,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl LineAssembler {
    fn new(timestamps: bool) -> Self {
        Self { timestamps, stdout: Vec::new(), stderr: Vec::new() }
    }

    fn push(&mut self, source: LogSource, payload: &[u8]) -> Vec<LogEntry> {
        let buf = match source {
            LogSource::Stderr => &mut self.stderr,
            _ => &mut self.stdout,
        };
        buf.extend_from_slice(payload);

        let mut lines = Vec::new();
        while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buf.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line[..line.len() - 1]).into_owned());
        }

        lines.into_iter().map(|text| self.entry(source, text)).collect()
    }

    fn flush(&mut self) -> Vec<LogEntry> {
        let mut entries = Vec::new();
        for (source, buf) in [
            (LogSource::Stdout, std::mem::take(&mut self.stdout)),
            (LogSource::Stderr, std::mem::take(&mut self.stderr)),
        ] {
            if !buf.is_empty() {
                let text = String::from_utf8_lossy(&buf).into_owned();
                entries.push(self.entry(source, text));
            }
        }
        entries
    }

    fn entry(&self, source: LogSource, text: String) -> LogEntry {
        let (timestamp, message) = if self.timestamps {
            parse_timestamp_prefix(&text)
        } else {
            (None, text)
        };
        LogEntry { source, message, timestamp }
    }
}

/// Split a daemon `timestamps=true` line into its timestamp and message.
fn parse_timestamp_prefix(line: &str) -> (Option<DateTime<Utc>>, String) {
    if let Some((prefix, rest)) = line.split_once(' ') {
        if let Ok(parsed) = DateTime::parse_from_rfc3339(prefix) {
            return (Some(parsed.with_timezone(&Utc)), rest.to_string());
        }
    }
    (None, line.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembler_reunites_split_lines() {
        let mut lines = LineAssembler::new(false);
        assert!(lines.push(LogSource::Stdout, b"par").is_empty());
        let entries = lines.push(LogSource::Stdout, b"tial line\nsecond\nthird");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, "partial line");
        assert_eq!(entries[1].message, "second");

        let tail = lines.flush();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].message, "third");
    }

    #[test]
    fn assembler_keeps_streams_separate() {
        let mut lines = LineAssembler::new(false);
        lines.push(LogSource::Stdout, b"out partial ");
        let err_entries = lines.push(LogSource::Stderr, b"err line\n");
        assert_eq!(err_entries.len(), 1);
        assert_eq!(err_entries[0].source, LogSource::Stderr);

        let out_entries = lines.push(LogSource::Stdout, b"done\n");
        assert_eq!(out_entries[0].message, "out partial done");
    }

    #[test]
    fn timestamp_prefix_is_parsed_when_enabled() {
        let (ts, message) =
            parse_timestamp_prefix("2024-03-01T10:00:00.000000000Z starting trade loop");
        assert!(ts.is_some());
        assert_eq!(message, "starting trade loop");

        let (ts, message) = parse_timestamp_prefix("no timestamp here");
        assert!(ts.is_none());
        assert_eq!(message, "no timestamp here");
    }

    #[test]
    fn options_translate_to_daemon_shape() {
        let options = CoreLogOptions {
            follow: true,
            tail: Some(250),
            timestamps: true,
            since: None,
            until: None,
            source: LogSource::Stderr,
        };
        let daemon = to_daemon_options(&options);
        assert!(daemon.follow && daemon.timestamps);
        assert!(!daemon.stdout && daemon.stderr);
        assert_eq!(daemon.tail, "250");
        assert_eq!(daemon.since, 0);
    }
}
