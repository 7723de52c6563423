//! Thread-safe handle to a live operation.
//!
//! All mutation funnels through this type, which enforces the step state
//! machine (pending → running → completed/failed/cancelled, or pending →
//! skipped) and emits broadcast deltas. The broadcaster is invoked only
//! after the write lock is released.

use crate::broadcast::{Broadcaster, OperationEvent};
use crate::operation::state::{OperationState, OperationStatus, StepState, StepStatus};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Shared, lock-guarded operation state plus the run's cancel signal.
#[derive(Clone)]
pub struct SharedOperation {
    id: Arc<str>,
    inner: Arc<RwLock<OperationState>>,
    cancel: CancellationToken,
    broadcaster: Arc<dyn Broadcaster>,
}

impl SharedOperation {
    pub fn new(
        state: OperationState,
        cancel: CancellationToken,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> Self {
        Self {
            id: Arc::from(state.id.as_str()),
            inner: Arc::new(RwLock::new(state)),
            cancel,
            broadcaster,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Immutable deep copy of the current state.
    pub async fn snapshot(&self) -> OperationState {
        self.inner.read().await.clone()
    }

    pub async fn get_step(&self, id: &str) -> Option<StepState> {
        self.inner.read().await.step(id).cloned()
    }

    /// Write a context value. Per-key last-writer-wins.
    pub async fn set_context(&self, key: impl Into<String>, value: serde_json::Value) {
        let mut state = self.inner.write().await;
        state.context.insert(key.into(), value);
    }

    pub async fn get_context(&self, key: &str) -> Option<serde_json::Value> {
        self.inner.read().await.context.get(key).cloned()
    }

    /// Report step progress. Values are clamped to [0, 100] and never
    /// move backwards within a running span. Updates that do not change
    /// the floored percentage or the message are coalesced away.
    pub async fn update_step_progress(&self, step_id: &str, progress: f64, message: &str) {
        let event = {
            let mut state = self.inner.write().await;
            let Some(step) = state.step_mut(step_id) else {
                return;
            };
            if step.status != StepStatus::Running {
                return;
            }
            let next = progress.clamp(0.0, 100.0).max(step.progress);
            let changed = (next.floor() as u8) != (step.progress.floor() as u8)
                || message != step.message;
            step.progress = next;
            step.message = message.to_string();
            changed.then(|| {
                OperationEvent::step_progress(
                    &self.id,
                    step_id,
                    step.status.as_str(),
                    serde_json::json!({
                        "progress": next.floor() as u8,
                        "message": message,
                    }),
                )
            })
        };
        if let Some(event) = event {
            self.broadcaster.broadcast(event);
        }
    }

    /// Transition the operation to running and stamp its start time.
    pub(crate) async fn begin(&self) {
        {
            let mut state = self.inner.write().await;
            state.status = OperationStatus::Running;
            state.started_at = Some(Utc::now());
        }
        self.broadcaster
            .broadcast(OperationEvent::operation_status(&self.id, "running"));
    }

    /// Stamp the terminal status and finish time. Emitting the completion
    /// event is the orchestrator's job, after this returns.
    pub(crate) async fn finish(&self, status: OperationStatus) -> OperationState {
        let mut state = self.inner.write().await;
        state.status = status;
        state.finished_at = Some(Utc::now());
        state.clone()
    }

    pub(crate) async fn mark_step_running(&self, step_id: &str) {
        let event = {
            let mut state = self.inner.write().await;
            let Some(step) = state.step_mut(step_id) else {
                return;
            };
            if step.status != StepStatus::Pending {
                return;
            }
            step.status = StepStatus::Running;
            step.started_at = Some(Utc::now());
            step.progress = 0.0;
            OperationEvent::step_progress(
                &self.id,
                step_id,
                "running",
                serde_json::json!({"progress": 0}),
            )
        };
        self.broadcaster.broadcast(event);
    }

    /// Reset progress for a retry attempt. The step stays running; the
    /// attempt counter is what distinguishes the spans.
    pub(crate) async fn begin_attempt(&self, step_id: &str, attempt: u32) {
        let event = {
            let mut state = self.inner.write().await;
            let Some(step) = state.step_mut(step_id) else {
                return;
            };
            if step.status != StepStatus::Running {
                return;
            }
            step.attempts = attempt;
            step.progress = 0.0;
            OperationEvent::step_progress(
                &self.id,
                step_id,
                "running",
                serde_json::json!({"progress": 0, "attempt": attempt}),
            )
        };
        self.broadcaster.broadcast(event);
    }

    pub(crate) async fn mark_step_completed(&self, step_id: &str) {
        let event = {
            let mut state = self.inner.write().await;
            let Some(step) = state.step_mut(step_id) else {
                return;
            };
            if step.status != StepStatus::Running {
                return;
            }
            step.status = StepStatus::Completed;
            step.progress = 100.0;
            step.finished_at = Some(Utc::now());
            OperationEvent::step_progress(
                &self.id,
                step_id,
                "completed",
                serde_json::json!({"progress": 100, "attempts": step.attempts}),
            )
        };
        self.broadcaster.broadcast(event);
    }

    pub(crate) async fn mark_step_failed(&self, step_id: &str, kind: &str, message: &str) {
        let event = {
            let mut state = self.inner.write().await;
            let Some(step) = state.step_mut(step_id) else {
                return;
            };
            if !matches!(step.status, StepStatus::Running | StepStatus::Pending) {
                return;
            }
            step.status = StepStatus::Failed;
            step.finished_at = Some(Utc::now());
            step.error = Some(message.to_string());
            step.message = message.to_string();
            OperationEvent::step_progress(
                &self.id,
                step_id,
                "failed",
                serde_json::json!({"kind": kind, "error": message}),
            )
        };
        self.broadcaster.broadcast(event);
    }

    pub(crate) async fn mark_step_skipped(&self, step_id: &str, reason: &str) {
        let event = {
            let mut state = self.inner.write().await;
            let Some(step) = state.step_mut(step_id) else {
                return;
            };
            if step.status != StepStatus::Pending {
                return;
            }
            step.status = StepStatus::Skipped;
            step.finished_at = Some(Utc::now());
            step.message = reason.to_string();
            OperationEvent::step_progress(
                &self.id,
                step_id,
                "skipped",
                serde_json::json!({"reason": reason}),
            )
        };
        self.broadcaster.broadcast(event);
    }

    pub(crate) async fn mark_step_cancelled(&self, step_id: &str) {
        let event = {
            let mut state = self.inner.write().await;
            let Some(step) = state.step_mut(step_id) else {
                return;
            };
            if step.status != StepStatus::Running {
                return;
            }
            step.status = StepStatus::Cancelled;
            step.finished_at = Some(Utc::now());
            OperationEvent::step_progress(&self.id, step_id, "cancelled", serde_json::Value::Null)
        };
        self.broadcaster.broadcast(event);
    }
}

impl std::fmt::Debug for SharedOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedOperation")
            .field("id", &self.id)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::MemoryBroadcaster;
    use crate::operation::state::{OperationMode, OperationRequest, StepState};
    use chrono::NaiveDate;

    fn shared(broadcaster: Arc<MemoryBroadcaster>) -> SharedOperation {
        let request = OperationRequest::new(
            OperationMode::Initial,
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 5).unwrap(),
        );
        let state = OperationState::new(
            "op-1",
            request,
            vec![StepState::pending("scrape", "Scrape reports")],
        );
        SharedOperation::new(state, CancellationToken::new(), broadcaster)
    }

    #[tokio::test]
    async fn progress_is_monotonic_within_running_span() {
        let broadcaster = MemoryBroadcaster::new();
        let op = shared(broadcaster.clone());

        op.mark_step_running("scrape").await;
        op.update_step_progress("scrape", 40.0, "downloading").await;
        op.update_step_progress("scrape", 20.0, "downloading").await;

        let snap = op.snapshot().await;
        assert_eq!(snap.step("scrape").unwrap().progress, 40.0);
    }

    #[tokio::test]
    async fn progress_coalesces_same_floor_and_message() {
        let broadcaster = MemoryBroadcaster::new();
        let op = shared(broadcaster.clone());

        op.mark_step_running("scrape").await;
        op.update_step_progress("scrape", 10.2, "working").await;
        op.update_step_progress("scrape", 10.8, "working").await;
        op.update_step_progress("scrape", 11.0, "working").await;

        // running + 10% + 11%; the 10.8 update was coalesced
        assert_eq!(broadcaster.events_for("op-1").len(), 3);
    }

    #[tokio::test]
    async fn progress_ignored_unless_running() {
        let broadcaster = MemoryBroadcaster::new();
        let op = shared(broadcaster.clone());

        op.update_step_progress("scrape", 50.0, "early").await;
        let snap = op.snapshot().await;
        assert_eq!(snap.step("scrape").unwrap().progress, 0.0);
        assert!(broadcaster.events_for("op-1").is_empty());
    }

    #[tokio::test]
    async fn illegal_transitions_are_no_ops() {
        let broadcaster = MemoryBroadcaster::new();
        let op = shared(broadcaster.clone());

        // completed before running: rejected
        op.mark_step_completed("scrape").await;
        assert_eq!(
            op.snapshot().await.step("scrape").unwrap().status,
            StepStatus::Pending
        );

        op.mark_step_running("scrape").await;
        op.mark_step_completed("scrape").await;
        // skip after terminal: rejected
        op.mark_step_skipped("scrape", "late").await;
        let snap = op.snapshot().await;
        assert_eq!(snap.step("scrape").unwrap().status, StepStatus::Completed);
        assert_eq!(snap.step("scrape").unwrap().progress, 100.0);
    }

    #[tokio::test]
    async fn context_round_trip() {
        let broadcaster = MemoryBroadcaster::new();
        let op = shared(broadcaster);
        op.set_context("combined_rows", serde_json::json!(1234)).await;
        assert_eq!(
            op.get_context("combined_rows").await,
            Some(serde_json::json!(1234))
        );
        assert_eq!(op.get_context("missing").await, None);
    }
}
