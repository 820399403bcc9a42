// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Runner persistence boundary with soft-delete interception
//!
//! The core reads runner entities and writes status snapshots back through
//! [`RunnerRepository`]. Delete is intercepted: without an explicit bypass
//! marker on the calling context it is rewritten to "set deleted-at = now",
//! and ordinary queries hide tombstoned rows. Secret-bearing config fields
//! are opaque strings here — the persistence layer decrypts on read and
//! re-encrypts on write, driven by [`crate::secrets::SECRET_PATHS`].

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use tracing::debug;

use crate::error::{Error, ErrorKind, Result};
use crate::results::BacktestResult;
use crate::runner::{Runner, RunnerDataState};
use crate::status::WorkloadStatus;
use crate::workload::{RunnerId, WorkloadId};

/// Context markers scoped to one repository call.
#[derive(Debug, Clone, Copy, Default)]
pub struct RepoCtx {
    /// Permit true deletion instead of tombstoning. Cleanup paths only.
    pub bypass_soft_delete: bool,
    /// Let queries see tombstoned rows.
    pub include_deleted: bool,
}

impl RepoCtx {
    /// Ordinary caller context: soft delete, tombstones hidden.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Context with the true-deletion bypass marker set.
    #[must_use]
    pub fn bypassing_soft_delete(mut self) -> Self {
        self.bypass_soft_delete = true;
        self
    }

    /// Context with the include-deleted marker set.
    #[must_use]
    pub fn including_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }
}

/// Persistence boundary for runner entities.
#[async_trait]
pub trait RunnerRepository: Send + Sync {
    /// Fetch one runner. Tombstoned rows are invisible unless the context
    /// carries the include-deleted marker.
    async fn get(&self, ctx: RepoCtx, id: &RunnerId) -> Result<Option<Runner>>;

    /// List runners, newest first.
    async fn list(&self, ctx: RepoCtx) -> Result<Vec<Runner>>;

    async fn insert(&self, ctx: RepoCtx, runner: Runner) -> Result<()>;

    /// Delete a runner. Rewritten to a tombstone unless the context
    /// carries the bypass marker. Idempotent either way.
    async fn delete(&self, ctx: RepoCtx, id: &RunnerId) -> Result<()>;

    /// Persist a data-state snapshot for a runner.
    async fn put_data_state(&self, ctx: RepoCtx, id: &RunnerId, state: RunnerDataState)
        -> Result<()>;

    async fn data_state(&self, ctx: RepoCtx, id: &RunnerId) -> Result<Option<RunnerDataState>>;

    /// Persist an observed workload status snapshot.
    async fn put_workload_status(&self, ctx: RepoCtx, status: WorkloadStatus) -> Result<()>;

    async fn workload_status(&self, ctx: RepoCtx, id: &WorkloadId)
        -> Result<Option<WorkloadStatus>>;

    /// Persist a terminal backtest result snapshot.
    async fn put_backtest_result(&self, ctx: RepoCtx, result: BacktestResult) -> Result<()>;

    async fn backtest_result(&self, ctx: RepoCtx, id: &WorkloadId)
        -> Result<Option<BacktestResult>>;
}

/// In-memory repository used by tests and single-process deployments.
#[derive(Default)]
pub struct MemoryRunnerRepository {
    rows: RwLock<HashMap<RunnerId, Runner>>,
    data: RwLock<HashMap<RunnerId, RunnerDataState>>,
    statuses: RwLock<HashMap<WorkloadId, WorkloadStatus>>,
    results: RwLock<HashMap<WorkloadId, BacktestResult>>,
}

impl MemoryRunnerRepository {
    /// Fresh, empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunnerRepository for MemoryRunnerRepository {
    async fn get(&self, ctx: RepoCtx, id: &RunnerId) -> Result<Option<Runner>> {
        let rows = self.rows.read();
        Ok(rows.get(id).filter(|r| ctx.include_deleted || !r.is_deleted()).cloned())
    }

    async fn list(&self, ctx: RepoCtx) -> Result<Vec<Runner>> {
        let rows = self.rows.read();
        let mut out: Vec<Runner> = rows
            .values()
            .filter(|r| ctx.include_deleted || !r.is_deleted())
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    async fn insert(&self, _ctx: RepoCtx, runner: Runner) -> Result<()> {
        let mut rows = self.rows.write();
        if rows.contains_key(&runner.id) {
            return Err(Error::new(
                "insert-runner",
                ErrorKind::AlreadyExists(runner.id.to_string()),
            ));
        }
        rows.insert(runner.id, runner);
        Ok(())
    }

    async fn delete(&self, ctx: RepoCtx, id: &RunnerId) -> Result<()> {
        let mut rows = self.rows.write();
        if ctx.bypass_soft_delete {
            debug!(runner = %id, "hard-deleting runner row");
            rows.remove(id);
            self.data.write().remove(id);
            return Ok(());
        }
        if let Some(runner) = rows.get_mut(id) {
            if runner.deleted_at.is_none() {
                runner.deleted_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn put_data_state(
        &self,
        _ctx: RepoCtx,
        id: &RunnerId,
        state: RunnerDataState,
    ) -> Result<()> {
        self.data.write().insert(*id, state);
        Ok(())
    }

    async fn data_state(&self, _ctx: RepoCtx, id: &RunnerId) -> Result<Option<RunnerDataState>> {
        Ok(self.data.read().get(id).cloned())
    }

    async fn put_workload_status(&self, _ctx: RepoCtx, status: WorkloadStatus) -> Result<()> {
        self.statuses.write().insert(status.id, status);
        Ok(())
    }

    async fn workload_status(
        &self,
        _ctx: RepoCtx,
        id: &WorkloadId,
    ) -> Result<Option<WorkloadStatus>> {
        Ok(self.statuses.read().get(id).cloned())
    }

    async fn put_backtest_result(&self, _ctx: RepoCtx, result: BacktestResult) -> Result<()> {
        self.results.write().insert(result.id, result);
        Ok(())
    }

    async fn backtest_result(
        &self,
        _ctx: RepoCtx,
        id: &WorkloadId,
    ) -> Result<Option<BacktestResult>> {
        Ok(self.results.read().get(id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::tests::sample_runner;

    #[tokio::test]
    async fn delete_without_bypass_tombstones() {
        let repo = MemoryRunnerRepository::new();
        let runner = sample_runner();
        let id = runner.id;
        repo.insert(RepoCtx::new(), runner).await.unwrap();

        repo.delete(RepoCtx::new(), &id).await.unwrap();

        // Hidden from ordinary queries...
        assert!(repo.get(RepoCtx::new(), &id).await.unwrap().is_none());
        assert!(repo.list(RepoCtx::new()).await.unwrap().is_empty());

        // ...but the row survives with a deletion timestamp.
        let row = repo.get(RepoCtx::new().including_deleted(), &id).await.unwrap().unwrap();
        assert!(row.is_deleted());
        assert_eq!(repo.list(RepoCtx::new().including_deleted()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_with_bypass_removes_the_row() {
        let repo = MemoryRunnerRepository::new();
        let runner = sample_runner();
        let id = runner.id;
        repo.insert(RepoCtx::new(), runner).await.unwrap();

        repo.delete(RepoCtx::new().bypassing_soft_delete(), &id).await.unwrap();

        assert!(repo.get(RepoCtx::new(), &id).await.unwrap().is_none());
        assert!(repo.get(RepoCtx::new().including_deleted(), &id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let repo = MemoryRunnerRepository::new();
        let runner = sample_runner();
        let id = runner.id;
        repo.insert(RepoCtx::new(), runner).await.unwrap();

        repo.delete(RepoCtx::new(), &id).await.unwrap();
        repo.delete(RepoCtx::new(), &id).await.unwrap();
        // The first tombstone timestamp is preserved by the second call.
        let first = repo.get(RepoCtx::new().including_deleted(), &id).await.unwrap().unwrap();
        repo.delete(RepoCtx::new(), &id).await.unwrap();
        let second = repo.get(RepoCtx::new().including_deleted(), &id).await.unwrap().unwrap();
        assert_eq!(first.deleted_at, second.deleted_at);

        // Deleting a row that never existed is fine too.
        repo.delete(RepoCtx::new(), &RunnerId::random()).await.unwrap();
    }

    #[tokio::test]
    async fn status_and_result_snapshots_round_trip() {
        let repo = MemoryRunnerRepository::new();
        let id = crate::workload::WorkloadId::random();

        let status = crate::status::WorkloadStatus::absent(id);
        repo.put_workload_status(RepoCtx::new(), status.clone()).await.unwrap();
        assert_eq!(repo.workload_status(RepoCtx::new(), &id).await.unwrap(), Some(status));

        let result = crate::results::BacktestResult::extraction_failed(
            id,
            crate::status::JobState::Completed,
            Some(0),
            "no pointer",
            "logs".into(),
            None,
            None,
        );
        repo.put_backtest_result(RepoCtx::new(), result.clone()).await.unwrap();
        assert_eq!(repo.backtest_result(RepoCtx::new(), &id).await.unwrap(), Some(result));
    }

    #[tokio::test]
    async fn data_state_snapshots_round_trip() {
        let repo = MemoryRunnerRepository::new();
        let runner = sample_runner();
        let id = runner.id;
        repo.insert(RepoCtx::new(), runner).await.unwrap();

        assert!(repo.data_state(RepoCtx::new(), &id).await.unwrap().is_none());

        let state = RunnerDataState { ready: true, ..RunnerDataState::default() };
        repo.put_data_state(RepoCtx::new(), &id, state.clone()).await.unwrap();
        assert_eq!(repo.data_state(RepoCtx::new(), &id).await.unwrap(), Some(state));
    }
}
