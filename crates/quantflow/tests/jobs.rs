// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! One-shot job and data-download behavior against the mock substrate.

use quantflow::download::{DATA_AVAILABLE_END, DATA_AVAILABLE_START};
use quantflow::error::ErrorKind;
use quantflow::results::EXTRACTION_ERROR_KEY;
use quantflow::runner::DownloadState;
use quantflow::{DataDownloadController, JobController, JobState, OpCtx};
use quantflow_testing::{
    sample_backtest_spec, sample_download_spec, sample_raw_backtest_result, MockSubstrate,
};

#[tokio::test]
async fn backtest_result_extraction_happy_path() {
    let substrate = MockSubstrate::new();
    let ctx = OpCtx::new();
    let spec = sample_backtest_spec();

    substrate.start_backtest(&ctx, &spec).await.unwrap();
    let status = JobController::status(&substrate, &ctx, &spec.id).await.unwrap();
    assert_eq!(status.state, JobState::Running);

    // The run finishes and leaves .last_result.json -> archive -> JSON.
    substrate.finish_job(
        &spec.id,
        0,
        "2024-03-01 10:00:00 - backtesting done\n",
        Some(sample_raw_backtest_result()),
    );

    let result = substrate.backtest_result(&ctx, &spec.id).await.unwrap();
    assert_eq!(result.state, JobState::Completed);
    assert_eq!(result.metrics.trades_total, Some(42));
    assert_eq!(result.metrics.sharpe, Some(1.42));
    assert!(result.raw.get("strategy").is_some());
    assert!(!result.logs.is_empty());
    assert!(result.duration_secs.is_some());
    assert!(result.error.is_none());
}

#[tokio::test]
async fn result_before_terminal_state_is_rejected() {
    let substrate = MockSubstrate::new();
    let ctx = OpCtx::new();
    let spec = sample_backtest_spec();

    substrate.start_backtest(&ctx, &spec).await.unwrap();
    let err = substrate.backtest_result(&ctx, &spec.id).await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Validation(_)));
}

#[tokio::test]
async fn extraction_failure_surfaces_logs_not_an_error() {
    let substrate = MockSubstrate::new();
    let ctx = OpCtx::new();
    let spec = sample_backtest_spec();

    substrate.start_backtest(&ctx, &spec).await.unwrap();
    // Finishes without any result document on the volume.
    substrate.finish_job(&spec.id, 0, "ran but wrote nothing\n", None);

    let result = substrate.backtest_result(&ctx, &spec.id).await.unwrap();
    assert_eq!(result.logs, "ran but wrote nothing\n");
    assert!(result.raw.get(EXTRACTION_ERROR_KEY).is_some());
    assert!(result.error.is_some());
}

#[tokio::test]
async fn failed_jobs_still_serve_results_with_logs() {
    let substrate = MockSubstrate::new();
    let ctx = OpCtx::new();
    let spec = sample_backtest_spec();

    substrate.start_backtest(&ctx, &spec).await.unwrap();
    substrate.finish_job(&spec.id, 1, "Traceback: strategy import failed\n", None);

    let status = JobController::status(&substrate, &ctx, &spec.id).await.unwrap();
    assert_eq!(status.state, JobState::Failed);

    let result = substrate.backtest_result(&ctx, &spec.id).await.unwrap();
    assert_eq!(result.state, JobState::Failed);
    assert!(result.logs.contains("Traceback"));
}

#[tokio::test]
async fn job_delete_is_idempotent() {
    let substrate = MockSubstrate::new();
    let ctx = OpCtx::new();
    let spec = sample_backtest_spec();

    substrate.start_backtest(&ctx, &spec).await.unwrap();
    JobController::delete(&substrate, &ctx, &spec.id).await.unwrap();
    JobController::delete(&substrate, &ctx, &spec.id).await.unwrap();
}

#[tokio::test]
async fn download_progress_and_manifest_flow() {
    let substrate = MockSubstrate::new();
    let ctx = OpCtx::new();
    let spec = sample_download_spec();

    let task = substrate.start_download(&ctx, &spec).await.unwrap();
    let status = DataDownloadController::status(&substrate, &ctx, &task).await.unwrap();
    assert_eq!(status.state, DownloadState::Downloading);

    substrate.advance_download(
        &spec.id,
        "===PHASE:download:binance===\n\
         2024-03-01 10:00:00 - INFO - Downloading pair BTC/USDT, interval 1h.\n",
        DownloadState::Downloading,
    );
    let status = DataDownloadController::status(&substrate, &ctx, &task).await.unwrap();
    assert_eq!(status.progress.current_symbol.as_deref(), Some("BTC/USDT"));

    substrate.advance_download(
        &spec.id,
        format!(
            "===PHASE:package===\n===PHASE:upload===\n{DATA_AVAILABLE_START}\n\
             {{\"binance\":{{\"BTC/USDT\":[{{\"timeframe\":\"1h\",\"from_ms\":1704067200000,\"to_ms\":1709251200000}}]}}}}\n\
             {DATA_AVAILABLE_END}\n===PHASE:done===\n"
        ),
        DownloadState::Completed,
    );

    let status = DataDownloadController::status(&substrate, &ctx, &task).await.unwrap();
    assert_eq!(status.state, DownloadState::Completed);
    assert_eq!(status.progress.percent, 100.0);
    let available = status.available.unwrap();
    assert_eq!(available.symbol_count(), 1);
    assert_eq!(available.0["binance"]["BTC/USDT"][0].timeframe, "1h");

    DataDownloadController::cleanup(&substrate, &ctx, &task).await.unwrap();
    let status = DataDownloadController::status(&substrate, &ctx, &task).await.unwrap();
    assert_eq!(status.state, DownloadState::Idle);
}

#[tokio::test]
async fn cancel_marks_download_failed() {
    let substrate = MockSubstrate::new();
    let ctx = OpCtx::new();
    let spec = sample_download_spec();

    let task = substrate.start_download(&ctx, &spec).await.unwrap();
    DataDownloadController::cancel(&substrate, &ctx, &task).await.unwrap();
    let status = DataDownloadController::status(&substrate, &ctx, &task).await.unwrap();
    assert_eq!(status.state, DownloadState::Failed);
}
