// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Lifecycle engine
//!
//! The engine owns the workload state machine; the substrate owns the
//! truth. Commands are gated by the legal transition table, observations
//! from the substrate are reconciled in and always win (with a warning
//! when they arrive out of order). Driver errors are annotated with the
//! public operation name and workload id. The engine never retries — the
//! retryable flag on the error is the caller's policy input.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::controller::{OpCtx, WorkloadController};
use crate::error::{Error, ErrorKind, Result};
use crate::status::{WorkloadState, WorkloadStatus};
use crate::workload::{BotSpec, SubstrateHandle, WorkloadId, WorkloadUpdate};

/// Observer invoked on every advisory state change.
///
/// `from` is `None` when the workload enters the machine. Hooks run on the
/// calling task; a panicking hook is recovered at the engine boundary and
/// reported as a non-retryable error with the panic value recorded.
pub type StateHook =
    Box<dyn Fn(&WorkloadId, Option<WorkloadState>, WorkloadState) + Send + Sync>;

#[derive(Debug, Clone)]
struct Advisory {
    state: WorkloadState,
    error: Option<String>,
}

/// Enforces the workload state machine over one driver.
pub struct LifecycleEngine {
    controller: Arc<dyn WorkloadController>,
    advisory: RwLock<HashMap<WorkloadId, Advisory>>,
    hooks: Vec<StateHook>,
}

impl LifecycleEngine {
    /// Wrap a driver.
    #[must_use]
    pub fn new(controller: Arc<dyn WorkloadController>) -> Self {
        Self { controller, advisory: RwLock::new(HashMap::new()), hooks: Vec::new() }
    }

    /// Attach a state-change hook. Build-time only.
    #[must_use]
    pub fn with_hook(mut self, hook: StateHook) -> Self {
        self.hooks.push(hook);
        self
    }

    /// The engine's advisory view of a workload, if it is tracked.
    #[must_use]
    pub fn advisory_state(&self, id: &WorkloadId) -> Option<WorkloadState> {
        self.advisory.read().get(id).map(|a| a.state)
    }

    /// Last recorded error message of a workload, if any.
    #[must_use]
    pub fn advisory_error(&self, id: &WorkloadId) -> Option<String> {
        self.advisory.read().get(id).and_then(|a| a.error.clone())
    }

    /// Create and start a workload.
    ///
    /// On failure the workload never enters the state machine.
    pub async fn create(&self, ctx: &OpCtx, spec: &BotSpec) -> Result<SubstrateHandle> {
        spec.validate()?;
        let handle = self
            .controller
            .create(ctx, spec)
            .await
            .map_err(|e| e.with_operation("create").with_workload(spec.id))?;
        self.transition(&spec.id, WorkloadState::Creating, None)?;
        Ok(handle)
    }

    /// Start a stopped workload.
    ///
    /// On failure the workload is left `stopped` with the error recorded.
    pub async fn start(&self, ctx: &OpCtx, id: &WorkloadId) -> Result<()> {
        self.gate(id, WorkloadState::Creating, "start")?;
        match self.controller.start(ctx, id).await {
            Ok(()) => self.transition(id, WorkloadState::Creating, None),
            Err(e) => {
                let e = e.with_operation("start").with_workload(*id);
                self.transition(id, WorkloadState::Stopped, Some(e.to_string()))?;
                Err(e)
            }
        }
    }

    /// Stop a running workload with the driver's grace timeout.
    pub async fn stop(&self, ctx: &OpCtx, id: &WorkloadId) -> Result<()> {
        self.gate(id, WorkloadState::Stopped, "stop")?;
        self.controller
            .stop(ctx, id)
            .await
            .map_err(|e| e.with_operation("stop").with_workload(*id))?;
        self.transition(id, WorkloadState::Stopped, None)
    }

    /// Restart a workload in place.
    pub async fn restart(&self, ctx: &OpCtx, id: &WorkloadId) -> Result<()> {
        self.controller
            .restart(ctx, id)
            .await
            .map_err(|e| e.with_operation("restart").with_workload(*id))?;
        self.transition(id, WorkloadState::Creating, None)
    }

    /// Delete a workload. Idempotent; any state may be deleted.
    pub async fn delete(&self, ctx: &OpCtx, id: &WorkloadId) -> Result<()> {
        self.controller
            .delete(ctx, id)
            .await
            .map_err(|e| e.with_operation("delete").with_workload(*id))?;
        let previous = self.advisory.write().remove(id).map(|a| a.state);
        self.fire_hooks(id, previous, WorkloadState::Deleted)?;
        Ok(())
    }

    /// Apply online changes to a workload.
    pub async fn update(&self, ctx: &OpCtx, id: &WorkloadId, update: &WorkloadUpdate) -> Result<()> {
        self.controller
            .update(ctx, id, update)
            .await
            .map_err(|e| e.with_operation("update").with_workload(*id))
    }

    /// Fetch the substrate's view and reconcile it into the advisory map.
    ///
    /// A substrate-unreachable failure propagates as retryable and leaves
    /// the advisory state unchanged.
    pub async fn reconcile(&self, ctx: &OpCtx, id: &WorkloadId) -> Result<WorkloadStatus> {
        let status = self
            .controller
            .status(ctx, id)
            .await
            .map_err(|e| e.with_operation("get-status").with_workload(*id))?;

        let previous = self.advisory_state(id);
        if let Some(previous) = previous {
            if !previous.can_transition_to(status.state) {
                warn!(
                    workload = %id,
                    from = %previous,
                    to = %status.state,
                    "substrate observation skipped a state; accepting it anyway"
                );
            }
        }
        self.transition(id, status.state, status.error.clone())?;
        Ok(status)
    }

    /// Gate a command on the legal transition table.
    ///
    /// Unknown workloads pass: the substrate is authoritative and the
    /// advisory map is best-effort (it starts empty after an orchestrator
    /// restart).
    fn gate(&self, id: &WorkloadId, target: WorkloadState, operation: &str) -> Result<()> {
        if let Some(current) = self.advisory_state(id) {
            if !current.can_transition_to(target) {
                return Err(Error::validation(
                    operation,
                    format!("illegal transition {current} -> {target}"),
                )
                .with_workload(*id));
            }
        }
        Ok(())
    }

    fn transition(
        &self,
        id: &WorkloadId,
        state: WorkloadState,
        error: Option<String>,
    ) -> Result<()> {
        let previous = {
            let mut advisory = self.advisory.write();
            let previous = advisory.get(id).map(|a| a.state);
            advisory.insert(*id, Advisory { state, error });
            previous
        };
        if previous != Some(state) {
            debug!(workload = %id, from = ?previous, to = %state, "workload state change");
            self.fire_hooks(id, previous, state)?;
        }
        Ok(())
    }

    fn fire_hooks(
        &self,
        id: &WorkloadId,
        from: Option<WorkloadState>,
        to: WorkloadState,
    ) -> Result<()> {
        for hook in &self.hooks {
            let outcome = catch_unwind(AssertUnwindSafe(|| hook(id, from, to)));
            if let Err(payload) = outcome {
                let message = panic_message(payload.as_ref());
                return Err(Error::new("state-hook", ErrorKind::HookPanicked(message))
                    .with_workload(*id));
            }
        }
        Ok(())
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads_are_stringified() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");

        let boxed: Box<dyn std::any::Any + Send> = Box::new(String::from("kaput"));
        assert_eq!(panic_message(boxed.as_ref()), "kaput");

        let boxed: Box<dyn std::any::Any + Send> = Box::new(17_u8);
        assert_eq!(panic_message(boxed.as_ref()), "non-string panic payload");
    }
}
