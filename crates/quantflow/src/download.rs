// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Historical-data download coordination
//!
//! The download runs on the runner's own substrate, never on the
//! orchestrator host. This module composes the shell script the workload
//! image executes and parses the script's output back out of the captured
//! logs: phase announcements drive coarse progress, and the availability
//! manifest travels between sentinel lines.
//!
//! The script assumes nothing beyond the workload image itself: archive
//! fetch and presigned-PUT upload use the image's bundled Python runtime,
//! packaging uses `tar`. Every piece of user-supplied text is
//! shell-escaped before it enters the script.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Error, ErrorKind, Result};
use crate::jobs::{DataDownloadSpec, MarketMode};
use crate::layout;
use crate::runner::{AvailableData, DownloadProgress};
use crate::sanitize::shell_escape;

/// Sentinel opening the availability manifest in the captured logs.
pub const DATA_AVAILABLE_START: &str = "===DATA_AVAILABLE_START===";
/// Sentinel closing the availability manifest.
pub const DATA_AVAILABLE_END: &str = "===DATA_AVAILABLE_END===";

/// Phase-announcement line for `phase`.
#[must_use]
pub fn phase_line(phase: &str) -> String {
    format!("===PHASE:{phase}===")
}

#[allow(clippy::unwrap_used)] // literal pattern
static PHASE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^===PHASE:([a-z-]+)(?::(\S+))?===$").unwrap());

#[allow(clippy::unwrap_used)] // literal pattern
static PAIR_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"Downloading pair ([A-Z0-9/:]+)").unwrap());

/// Python one-liner fetching a URL to a file, used for the incremental
/// bundle.
const FETCH_SNIPPET: &str =
    "import sys, urllib.request\nurllib.request.urlretrieve(sys.argv[1], sys.argv[2])\n";

/// Python snippet uploading the packaged archive via presigned PUT.
const UPLOAD_SNIPPET: &str = r#"import sys, urllib.request
path, url = sys.argv[1], sys.argv[2]
with open(path, 'rb') as fh:
    body = fh.read()
req = urllib.request.Request(url, data=body, method='PUT')
req.add_header('Content-Type', 'application/gzip')
with urllib.request.urlopen(req) as resp:
    sys.stderr.write('upload status %s\n' % resp.status)
"#;

/// Python snippet walking the data tree and printing the availability
/// manifest as a single JSON line.
///
/// Spot files are named `BASE_QUOTE-TIMEFRAME.json`, futures files
/// `BASE_QUOTE_SETTLE-TIMEFRAME-futures.json`; each holds an array of
/// `[timestamp-ms, o, h, l, c, v]` tuples, oldest first.
const MANIFEST_SNIPPET: &str = r#"import json, os, re, sys
root = sys.argv[1]
pattern = re.compile(r'^([A-Z0-9]+)_([A-Z0-9]+?)(?:_([A-Z0-9]+))?-(\d+[mhdw])(-futures)?\.json$')
manifest = {}
for exchange in sorted(os.listdir(root)):
    exdir = os.path.join(root, exchange)
    if not os.path.isdir(exdir):
        continue
    for dirpath, _dirnames, filenames in os.walk(exdir):
        for name in sorted(filenames):
            match = pattern.match(name)
            if not match:
                continue
            base, quote, settle, timeframe, _futures = match.groups()
            symbol = base + '/' + quote + (':' + settle if settle else '')
            try:
                with open(os.path.join(dirpath, name)) as fh:
                    candles = json.load(fh)
            except (OSError, ValueError):
                continue
            if not candles:
                continue
            entry = {'timeframe': timeframe,
                     'from_ms': int(candles[0][0]),
                     'to_ms': int(candles[-1][0])}
            manifest.setdefault(exchange, {}).setdefault(symbol, []).append(entry)
print(json.dumps(manifest))
"#;

/// Compose the shell script for a download task.
///
/// The script announces each phase on its own line so progress can be
/// derived from the log stream, and tolerates a missing or corrupt
/// existing bundle (treated as "no existing data").
pub fn compose_script(spec: &DataDownloadSpec) -> Result<String> {
    spec.validate()?;

    let data_dir = layout::data_dir();
    let mut script = String::new();
    script.push_str("#!/bin/sh\nset -eu\n\n");
    script.push_str(&format!("DATA_DIR={}\n", shell_escape(&data_dir)));
    script.push_str("mkdir -p \"$DATA_DIR\"\n\n");

    if let Some(existing) = &spec.existing_data_url {
        script.push_str(&format!("echo {}\n", shell_escape(&phase_line("fetch-existing"))));
        script.push_str("(\n  set -e\n");
        script.push_str(&format!(
            "  python3 -c {} {} /tmp/existing.tar.gz\n",
            shell_escape(FETCH_SNIPPET),
            shell_escape(existing),
        ));
        script.push_str("  tar -xzf /tmp/existing.tar.gz -C \"$DATA_DIR\"\n");
        script.push_str(") || echo 'no usable existing bundle, starting fresh'\n\n");
    }

    for entry in &spec.exchanges {
        script.push_str(&format!(
            "echo {}\n",
            shell_escape(&phase_line(&format!("download:{}", entry.exchange)))
        ));
        let timeframes =
            entry.timeframes.iter().map(|tf| shell_escape(tf)).collect::<Vec<_>>().join(" ");
        script.push_str(&format!(
            "freqtrade download-data --userdir {} --exchange {} --pairs {} --timeframes {} \
             --days {} --trading-mode {} --data-format-ohlcv json\n\n",
            shell_escape(layout::USER_DATA_DIR),
            shell_escape(&entry.exchange),
            shell_escape(&entry.pairs),
            timeframes,
            entry.days,
            shell_escape(entry.mode.as_str()),
        ));
    }

    script.push_str(&format!("echo {}\n", shell_escape(&phase_line("package"))));
    script.push_str("tar -C \"$DATA_DIR\" -czf /tmp/quantflow-data.tar.gz .\n\n");

    script.push_str(&format!("echo {}\n", shell_escape(&phase_line("upload"))));
    script.push_str(&format!(
        "python3 -c {} /tmp/quantflow-data.tar.gz {}\n\n",
        shell_escape(UPLOAD_SNIPPET),
        shell_escape(&spec.upload_url),
    ));

    script.push_str(&format!("echo {DATA_AVAILABLE_START}\n"));
    script.push_str(&format!(
        "python3 -c {} \"$DATA_DIR\"\n",
        shell_escape(MANIFEST_SNIPPET)
    ));
    script.push_str(&format!("echo {DATA_AVAILABLE_END}\n"));
    script.push_str(&format!("echo {}\n", shell_escape(&phase_line("done"))));

    Ok(script)
}

/// Extract the availability manifest from captured logs.
///
/// Returns `Ok(None)` when the sentinels have not appeared yet (the task
/// is still running), and a result-extraction error when the bracketed
/// payload is not valid JSON — the upstream layout changed and guessing
/// would be worse than failing loudly.
pub fn parse_available_data(logs: &str) -> Result<Option<AvailableData>> {
    let Some(start) = logs.find(DATA_AVAILABLE_START) else {
        return Ok(None);
    };
    let after_start = &logs[start + DATA_AVAILABLE_START.len()..];
    let Some(end) = after_start.find(DATA_AVAILABLE_END) else {
        return Ok(None);
    };
    let payload = after_start[..end].trim();
    if payload.is_empty() {
        return Ok(Some(AvailableData::default()));
    }
    let manifest: AvailableData = serde_json::from_str(payload).map_err(|err| {
        Error::new(
            "parse-available-data",
            ErrorKind::Other(format!("availability manifest is not valid JSON: {err}")),
        )
    })?;
    Ok(Some(manifest))
}

/// Derive coarse progress from the phase lines in the captured logs.
///
/// Percent is per-exchange granularity: downloads span 5–85, packaging
/// and upload the remainder. Symbol counts come from the workload
/// runtime's own per-pair log lines; the total stays zero when the symbol
/// pattern makes it unknowable up front.
#[must_use]
pub fn parse_progress(logs: &str, exchange_total: u32) -> DownloadProgress {
    let mut downloads_seen = 0u32;
    let mut packaging = false;
    let mut uploading = false;
    let mut done = false;

    for line in logs.lines() {
        let line = line.trim();
        if let Some(caps) = PHASE_RE.captures(line) {
            match caps.get(1).map(|m| m.as_str()) {
                Some("download") => downloads_seen += 1,
                Some("package") => packaging = true,
                Some("upload") => uploading = true,
                Some("done") => done = true,
                _ => {}
            }
        }
    }

    let mut current_symbol = None;
    let mut symbols_completed = 0u32;
    let mut last_symbol: Option<String> = None;
    for caps in PAIR_RE.captures_iter(logs) {
        let symbol = caps[1].to_string();
        if last_symbol.as_deref() != Some(symbol.as_str()) {
            if last_symbol.is_some() {
                symbols_completed += 1;
            }
            last_symbol = Some(symbol.clone());
        }
        current_symbol = Some(symbol);
    }

    let percent = if done {
        100.0
    } else if uploading {
        95.0
    } else if packaging {
        90.0
    } else if exchange_total > 0 {
        // A seen phase means that exchange is in flight, not finished.
        let finished = downloads_seen.saturating_sub(1);
        5.0 + 80.0 * f64::from(finished) / f64::from(exchange_total)
    } else {
        0.0
    };

    DownloadProgress {
        percent,
        current_symbol: if done { None } else { current_symbol },
        symbols_completed: if done { symbols_completed + u32::from(last_symbol.is_some()) } else { symbols_completed },
        symbols_total: 0,
    }
}

/// Archive entry path for one symbol and timeframe.
///
/// Spot symbols are `BASE/QUOTE`, futures symbols `BASE/QUOTE:SETTLE`.
#[must_use]
pub fn archive_entry_path(exchange: &str, symbol: &str, timeframe: &str, mode: MarketMode) -> String {
    let (pair, settle) = match symbol.split_once(':') {
        Some((pair, settle)) => (pair, Some(settle)),
        None => (symbol, None),
    };
    let flat_pair = pair.replace('/', "_");
    match (mode, settle) {
        (MarketMode::Futures, Some(settle)) => {
            format!("{exchange}/{flat_pair}_{settle}-{timeframe}-futures.json")
        }
        (MarketMode::Futures, None) => format!("{exchange}/{flat_pair}-{timeframe}-futures.json"),
        (MarketMode::Spot, _) => format!("{exchange}/{flat_pair}-{timeframe}.json"),
    }
}

/// Parsed fields of one archive entry path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub exchange: String,
    /// Display symbol, `BASE/QUOTE` or `BASE/QUOTE:SETTLE`.
    pub symbol: String,
    pub timeframe: String,
    pub mode: MarketMode,
}

#[allow(clippy::unwrap_used)] // literal pattern
static ENTRY_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^([^/]+)/([A-Z0-9]+)_([A-Z0-9]+?)(?:_([A-Z0-9]+))?-(\d+[mhdw])(-futures)?\.json$") .unwrap());

/// Parse an archive entry path back into its fields.
#[must_use]
pub fn parse_archive_entry(path: &str) -> Option<ArchiveEntry> {
    let caps = ENTRY_RE.captures(path)?;
    let base = caps.get(2)?.as_str();
    let quote = caps.get(3)?.as_str();
    let settle = caps.get(4).map(|m| m.as_str());
    let futures = caps.get(6).is_some();
    let symbol = match settle {
        Some(settle) => format!("{base}/{quote}:{settle}"),
        None => format!("{base}/{quote}"),
    };
    Some(ArchiveEntry {
        exchange: caps.get(1)?.as_str().to_string(),
        symbol,
        timeframe: caps.get(5)?.as_str().to_string(),
        mode: if futures { MarketMode::Futures } else { MarketMode::Spot },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::tests::sample_download;
    use crate::jobs::ExchangeDownload;

    #[test]
    fn script_escapes_injection_attempts() {
        let mut spec = sample_download();
        spec.exchanges.push(ExchangeDownload {
            exchange: "$(reboot)".into(),
            pairs: "'; rm -rf / #".into(),
            timeframes: vec!["1h".into()],
            days: 7,
            mode: MarketMode::Futures,
        });
        let script = compose_script(&spec).unwrap();

        // The dangerous bytes survive only inside single-quoted words.
        assert!(script.contains("--exchange '$(reboot)'"));
        assert!(script.contains("--pairs ''\\''; rm -rf / #'"));
        assert!(!script.contains("--exchange $(reboot)"));
    }

    #[test]
    fn script_phases_appear_in_order() {
        let mut spec = sample_download();
        spec.existing_data_url = Some("https://storage.example/old?sig=1".into());
        let script = compose_script(&spec).unwrap();

        let fetch = script.find("===PHASE:fetch-existing===").unwrap();
        let download = script.find("===PHASE:download:binance===").unwrap();
        let package = script.find("===PHASE:package===").unwrap();
        let upload = script.find("===PHASE:upload===").unwrap();
        let manifest = script.find(DATA_AVAILABLE_START).unwrap();
        assert!(fetch < download && download < package && package < upload && upload < manifest);

        // Incremental fetch tolerates failure; downloads do not.
        assert!(script.contains("|| echo 'no usable existing bundle"));
        assert!(script.contains("Content-Type"));
    }

    #[test]
    fn script_without_existing_bundle_skips_fetch_phase() {
        let script = compose_script(&sample_download()).unwrap();
        assert!(!script.contains("fetch-existing"));
    }

    #[test]
    fn manifest_parses_between_sentinels() {
        let logs = format!(
            "noise\n{DATA_AVAILABLE_START}\n{}\n{DATA_AVAILABLE_END}\ntail\n",
            r#"{"binance":{"BTC/USDT":[{"timeframe":"1h","from_ms":1704067200000,"to_ms":1709251200000}]}}"#
        );
        let manifest = parse_available_data(&logs).unwrap().unwrap();
        assert_eq!(manifest.symbol_count(), 1);
        assert_eq!(manifest.0["binance"]["BTC/USDT"][0].timeframe, "1h");
    }

    #[test]
    fn manifest_absent_while_running() {
        assert!(parse_available_data("===PHASE:download:binance===\n").unwrap().is_none());
        // Opening sentinel without the closing one: still in flight.
        let partial = format!("{DATA_AVAILABLE_START}\n{{\"binance\"");
        assert!(parse_available_data(&partial).unwrap().is_none());
    }

    #[test]
    fn garbled_manifest_is_an_extraction_error() {
        let logs = format!("{DATA_AVAILABLE_START}\nnot json\n{DATA_AVAILABLE_END}\n");
        assert!(parse_available_data(&logs).is_err());
    }

    #[test]
    fn progress_is_per_exchange_granularity() {
        let empty = parse_progress("", 2);
        assert_eq!(empty.percent, 0.0);

        let first = parse_progress("===PHASE:download:binance===\n", 2);
        assert!(first.percent >= 5.0 && first.percent < 50.0);

        let second = parse_progress(
            "===PHASE:download:binance===\n===PHASE:download:kraken===\n",
            2,
        );
        assert!(second.percent > first.percent && second.percent < 90.0);

        let packaged = parse_progress(
            "===PHASE:download:binance===\n===PHASE:download:kraken===\n===PHASE:package===\n",
            2,
        );
        assert_eq!(packaged.percent, 90.0);

        let done = parse_progress("===PHASE:done===\n", 2);
        assert_eq!(done.percent, 100.0);
    }

    #[test]
    fn progress_tracks_current_symbol() {
        let logs = "\
===PHASE:download:binance===
2024-03-01 10:00:00 - INFO - Downloading pair BTC/USDT, interval 1h.
2024-03-01 10:00:05 - INFO - Downloading pair BTC/USDT, interval 5m.
2024-03-01 10:00:10 - INFO - Downloading pair ETH/USDT, interval 1h.
";
        let progress = parse_progress(logs, 1);
        assert_eq!(progress.current_symbol.as_deref(), Some("ETH/USDT"));
        assert_eq!(progress.symbols_completed, 1);
    }

    #[test]
    fn archive_entry_round_trips() {
        let cases = [
            ("binance", "BTC/USDT", "1h", MarketMode::Spot),
            ("binance", "ETH/USDT:USDT", "5m", MarketMode::Futures),
            ("kraken", "SOL/EUR", "1d", MarketMode::Spot),
        ];
        for (exchange, symbol, timeframe, mode) in cases {
            let path = archive_entry_path(exchange, symbol, timeframe, mode);
            let parsed = parse_archive_entry(&path).unwrap();
            assert_eq!(parsed.exchange, exchange);
            assert_eq!(parsed.symbol, symbol);
            assert_eq!(parsed.timeframe, timeframe);
            assert_eq!(parsed.mode, mode);
        }
    }

    #[test]
    fn archive_entry_examples_match_contract() {
        assert_eq!(
            archive_entry_path("binance", "BTC/USDT", "1h", MarketMode::Spot),
            "binance/BTC_USDT-1h.json"
        );
        assert_eq!(
            archive_entry_path("binance", "BTC/USDT:USDT", "5m", MarketMode::Futures),
            "binance/BTC_USDT_USDT-5m-futures.json"
        );
    }
}
