//! The operation orchestrator: accepts requests, gates them by license,
//! executes steps under the configured policy, and reports state.
//!
//! One orchestrator serves many concurrent operations. Within an
//! operation, steps run one at a time (sequential mode) or concurrently
//! as the dependency graph allows (parallel mode). Live state is held in
//! [`SharedOperation`] handles; finished runs move to a bounded history.

pub mod config;
mod retry;

pub use config::{ExecutionMode, OrchestratorConfig, RetryPolicy};

use crate::broadcast::{Broadcaster, OperationEvent};
use crate::errors::{OrchestratorError, StepError, redact_message};
use crate::license::LicenseManager;
use crate::operation::{
    OperationHistory, OperationRequest, OperationState, OperationStatus, OperationSummary,
    SharedOperation, StepState,
};
use crate::registry::StepRegistry;
use crate::step::{DataManifest, RunContext, Step};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Caller-facing result of a finished operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationResponse {
    pub id: String,
    pub status: OperationStatus,
    pub summary: OperationSummary,
    pub steps: Vec<StepState>,
}

impl From<OperationState> for OperationResponse {
    fn from(state: OperationState) -> Self {
        Self {
            id: state.id.clone(),
            status: state.status,
            summary: state.summary(),
            steps: state.steps,
        }
    }
}

struct RunOutcome {
    cancelled: bool,
}

/// Schedules and executes operations. Cheap to share behind an `Arc`.
pub struct Orchestrator {
    registry: std::sync::RwLock<StepRegistry>,
    registry_frozen: AtomicBool,
    config: std::sync::RwLock<OrchestratorConfig>,
    broadcaster: Arc<dyn Broadcaster>,
    license: Arc<LicenseManager>,
    live: Mutex<HashMap<String, SharedOperation>>,
    history: Mutex<OperationHistory>,
}

impl Orchestrator {
    pub fn new(
        license: Arc<LicenseManager>,
        broadcaster: Arc<dyn Broadcaster>,
        config: OrchestratorConfig,
    ) -> Self {
        let history_limit = config.history_limit;
        Self {
            registry: std::sync::RwLock::new(StepRegistry::new()),
            registry_frozen: AtomicBool::new(false),
            config: std::sync::RwLock::new(config),
            broadcaster,
            license,
            live: Mutex::new(HashMap::new()),
            history: Mutex::new(OperationHistory::new(history_limit)),
        }
    }

    /// Register a step definition. The registry freezes at the first
    /// `execute`, after which registration is rejected.
    pub fn register_step(&self, step: Arc<dyn Step>) -> Result<(), OrchestratorError> {
        if self.registry_frozen.load(Ordering::Acquire) {
            return Err(OrchestratorError::RegistryFrozen);
        }
        let mut registry = self
            .registry
            .write()
            .map_err(|_| anyhow::anyhow!("step registry lock poisoned"))?;
        registry.register(step)
    }

    pub fn set_config(&self, config: OrchestratorConfig) -> Result<(), OrchestratorError> {
        let mut guard = self
            .config
            .write()
            .map_err(|_| anyhow::anyhow!("config lock poisoned"))?;
        *guard = config;
        Ok(())
    }

    pub fn get_config(&self) -> Result<OrchestratorConfig, OrchestratorError> {
        let guard = self
            .config
            .read()
            .map_err(|_| anyhow::anyhow!("config lock poisoned"))?;
        Ok(guard.clone())
    }

    /// Run an operation to a terminal state. Synchronous from the
    /// caller's perspective; callers wanting fire-and-forget spawn this.
    pub async fn execute(
        &self,
        mut request: OperationRequest,
    ) -> Result<OperationResponse, OrchestratorError> {
        let config = self.get_config()?;
        self.registry_frozen.store(true, Ordering::Release);
        let ordered = {
            let registry = self
                .registry
                .read()
                .map_err(|_| anyhow::anyhow!("step registry lock poisoned"))?;
            registry.dependency_order()?
        };

        if request.id.trim().is_empty() {
            request.id = uuid::Uuid::new_v4().to_string();
        }
        let id = request.id.clone();

        let step_states: Vec<StepState> = ordered
            .iter()
            .map(|s| StepState::pending(s.id(), s.name()))
            .collect();
        let state = OperationState::new(&id, request, step_states);
        let op = SharedOperation::new(state, CancellationToken::new(), self.broadcaster.clone());

        {
            let mut live = self.live.lock().await;
            let history = self.history.lock().await;
            if live.contains_key(&id) || history.contains(&id) {
                return Err(OrchestratorError::DuplicateOperation(id));
            }
            live.insert(id.clone(), op.clone());
        }

        info!(operation = %id, steps = ordered.len(), "operation accepted");
        self.broadcaster.broadcast(OperationEvent::reset(&id));

        // License gate: checked exactly once, before any step transition.
        let validation = self.license.validate().await;
        if !validation.valid {
            let reason = validation
                .reason
                .unwrap_or_else(|| "license not activated".to_string());
            warn!(operation = %id, reason = %reason, "operation rejected by license gate");
            let final_state = op.finish(OperationStatus::Failed).await;
            self.broadcaster.broadcast(OperationEvent::complete(
                &id,
                "failed",
                serde_json::json!({
                    "kind": "license_required",
                    "message": redact_message(&reason),
                }),
            ));
            self.retire(&id, final_state).await;
            return Err(OrchestratorError::LicenseRequired(reason));
        }

        op.begin().await;

        let trace_id = uuid::Uuid::new_v4().to_string();
        let base_ctx = RunContext::new(
            op.id(),
            trace_id,
            op.cancel_token().clone(),
            self.broadcaster.clone(),
        );

        let outcome = match config.execution_mode {
            ExecutionMode::Sequential => {
                self.run_sequential(&ordered, &op, &base_ctx, &config).await
            }
            ExecutionMode::ParallelByDependency => {
                self.run_parallel(&ordered, &op, &base_ctx, &config).await
            }
        };

        let status = if outcome.cancelled {
            OperationStatus::Cancelled
        } else {
            op.snapshot().await.derive_final_status()
        };
        let final_state = op.finish(status).await;
        let summary = final_state.summary();
        info!(
            operation = %id,
            status = status.as_str(),
            completed = summary.completed,
            failed = summary.failed,
            skipped = summary.skipped,
            "operation finished"
        );
        self.broadcaster.broadcast(OperationEvent::complete(
            &id,
            status.as_str(),
            serde_json::to_value(&summary).unwrap_or(serde_json::Value::Null),
        ));
        self.retire(&id, final_state.clone()).await;

        Ok(OperationResponse::from(final_state))
    }

    /// Snapshot of a live or recently finished operation.
    pub async fn get_operation(&self, id: &str) -> Result<OperationState, OrchestratorError> {
        if let Some(op) = self.live.lock().await.get(id).cloned() {
            return Ok(op.snapshot().await);
        }
        if let Some(state) = self.history.lock().await.get(id).cloned() {
            return Ok(state);
        }
        Err(OrchestratorError::NotFound(id.to_string()))
    }

    /// Snapshots of all live operations plus the retained history,
    /// live first.
    pub async fn list_operations(&self) -> Vec<OperationState> {
        let live: Vec<SharedOperation> = self.live.lock().await.values().cloned().collect();
        let mut out = Vec::with_capacity(live.len());
        for op in live {
            out.push(op.snapshot().await);
        }
        out.extend(self.history.lock().await.list());
        out
    }

    /// Request cancellation. Terminal operations are a no-op `Ok`.
    pub async fn cancel(&self, id: &str) -> Result<(), OrchestratorError> {
        if let Some(op) = self.live.lock().await.get(id) {
            info!(operation = %id, "cancellation requested");
            op.cancel();
            return Ok(());
        }
        if self.history.lock().await.contains(id) {
            return Ok(());
        }
        Err(OrchestratorError::NotFound(id.to_string()))
    }

    async fn retire(&self, id: &str, state: OperationState) {
        let mut live = self.live.lock().await;
        live.remove(id);
        self.history.lock().await.insert(state);
    }

    async fn run_sequential(
        &self,
        ordered: &[Arc<dyn Step>],
        op: &SharedOperation,
        base_ctx: &RunContext,
        config: &OrchestratorConfig,
    ) -> RunOutcome {
        let mut manifest = DataManifest::new();
        let mut completed: HashSet<String> = HashSet::new();
        let mut abort = false;

        for (i, step) in ordered.iter().enumerate() {
            if op.is_cancelled() {
                for rest in &ordered[i..] {
                    op.mark_step_skipped(rest.id(), "operation cancelled").await;
                }
                return RunOutcome { cancelled: true };
            }
            if abort {
                op.mark_step_skipped(step.id(), "earlier step failed").await;
                continue;
            }
            if let Some(dep) = step
                .dependencies()
                .iter()
                .find(|d| !completed.contains(*d))
            {
                op.mark_step_skipped(step.id(), &format!("dependency '{dep}' did not complete"))
                    .await;
                continue;
            }
            if !step.can_run(&manifest) {
                op.mark_step_skipped(step.id(), "required inputs unavailable")
                    .await;
                continue;
            }

            let snapshot = op.snapshot().await;
            if let Err(err) = step.validate(&snapshot) {
                op.mark_step_failed(step.id(), err.kind(), &redact_message(&err.to_string()))
                    .await;
                if !config.continue_on_error {
                    abort = true;
                }
                continue;
            }

            op.mark_step_running(step.id()).await;
            let ctx = base_ctx
                .clone()
                .with_step_config(config.step_config(step.id()).cloned());
            let result = retry::run_with_policy(
                step,
                &ctx,
                op,
                &config.retry,
                config.timeout_for(step.id()),
            )
            .await;

            match result {
                Ok(()) => {
                    op.mark_step_completed(step.id()).await;
                    completed.insert(step.id().to_string());
                    for output in step.produced_outputs() {
                        manifest.add(&output);
                    }
                }
                Err(StepError::Cancelled) => {
                    op.mark_step_cancelled(step.id()).await;
                    for rest in &ordered[i + 1..] {
                        op.mark_step_skipped(rest.id(), "operation cancelled").await;
                    }
                    return RunOutcome { cancelled: true };
                }
                Err(err) => {
                    op.mark_step_failed(step.id(), err.kind(), &redact_message(&err.to_string()))
                        .await;
                    if !config.continue_on_error {
                        abort = true;
                    }
                }
            }
        }

        RunOutcome { cancelled: false }
    }

    async fn run_parallel(
        &self,
        ordered: &[Arc<dyn Step>],
        op: &SharedOperation,
        base_ctx: &RunContext,
        config: &OrchestratorConfig,
    ) -> RunOutcome {
        #[derive(PartialEq)]
        enum Local {
            Pending,
            Running,
            Terminal,
        }

        let mut local: HashMap<String, Local> = ordered
            .iter()
            .map(|s| (s.id().to_string(), Local::Pending))
            .collect();
        let by_id: HashMap<String, Arc<dyn Step>> = ordered
            .iter()
            .map(|s| (s.id().to_string(), Arc::clone(s)))
            .collect();
        let mut manifest = DataManifest::new();
        let mut completed: HashSet<String> = HashSet::new();
        let mut cancelled = false;
        let mut abort = false;

        let (tx, mut rx) = mpsc::channel::<(String, Result<(), StepError>)>(ordered.len().max(1));

        loop {
            if op.is_cancelled()
                && !cancelled
                && local.values().any(|s| *s != Local::Terminal)
            {
                cancelled = true;
            }

            if cancelled || abort {
                let reason = if cancelled {
                    "operation cancelled"
                } else {
                    "earlier step failed"
                };
                for step in ordered {
                    if local[step.id()] == Local::Pending {
                        op.mark_step_skipped(step.id(), reason).await;
                        local.insert(step.id().to_string(), Local::Terminal);
                    }
                }
            } else {
                // Steps whose dependencies can no longer complete.
                loop {
                    let mut doomed: Option<(String, String)> = None;
                    for step in ordered {
                        if local[step.id()] != Local::Pending {
                            continue;
                        }
                        if let Some(dep) = step.dependencies().iter().find(|d| {
                            local.get(*d).is_some_and(|s| *s == Local::Terminal)
                                && !completed.contains(*d)
                        }) {
                            doomed = Some((step.id().to_string(), dep.clone()));
                            break;
                        }
                    }
                    let Some((sid, dep)) = doomed else { break };
                    op.mark_step_skipped(&sid, &format!("dependency '{dep}' did not complete"))
                        .await;
                    local.insert(sid, Local::Terminal);
                }

                // Dispatch ready steps up to the concurrency bound.
                let running_count = local.values().filter(|s| **s == Local::Running).count();
                let mut slots = config.max_parallel.saturating_sub(running_count);
                for step in ordered {
                    if slots == 0 {
                        break;
                    }
                    if local[step.id()] != Local::Pending {
                        continue;
                    }
                    if !step
                        .dependencies()
                        .iter()
                        .all(|d| completed.contains(d))
                    {
                        continue;
                    }
                    if !step.can_run(&manifest) {
                        op.mark_step_skipped(step.id(), "required inputs unavailable")
                            .await;
                        local.insert(step.id().to_string(), Local::Terminal);
                        continue;
                    }
                    let snapshot = op.snapshot().await;
                    if let Err(err) = step.validate(&snapshot) {
                        op.mark_step_failed(
                            step.id(),
                            err.kind(),
                            &redact_message(&err.to_string()),
                        )
                        .await;
                        local.insert(step.id().to_string(), Local::Terminal);
                        if !config.continue_on_error {
                            abort = true;
                        }
                        break;
                    }

                    op.mark_step_running(step.id()).await;
                    local.insert(step.id().to_string(), Local::Running);
                    slots -= 1;

                    let task_step = Arc::clone(step);
                    let task_ctx = base_ctx
                        .clone()
                        .with_step_config(config.step_config(step.id()).cloned());
                    let task_op = op.clone();
                    let task_policy = config.retry.clone();
                    let task_timeout = config.timeout_for(step.id());
                    let task_tx = tx.clone();
                    tokio::spawn(async move {
                        let result = retry::run_with_policy(
                            &task_step,
                            &task_ctx,
                            &task_op,
                            &task_policy,
                            task_timeout,
                        )
                        .await;
                        let _ = task_tx.send((task_step.id().to_string(), result)).await;
                    });
                }
            }

            let running_count = local.values().filter(|s| **s == Local::Running).count();
            if running_count == 0 {
                if local.values().all(|s| *s == Local::Terminal) || cancelled || abort {
                    let reason = if cancelled {
                        "operation cancelled"
                    } else {
                        "earlier step failed"
                    };
                    for step in ordered {
                        if local[step.id()] == Local::Pending {
                            op.mark_step_skipped(step.id(), reason).await;
                            local.insert(step.id().to_string(), Local::Terminal);
                        }
                    }
                    break;
                }
                // Nothing running and nothing dispatchable: remaining
                // steps are unreachable (should not happen on a valid DAG).
                let mut progressed = false;
                for step in ordered {
                    if local[step.id()] == Local::Pending {
                        op.mark_step_skipped(step.id(), "dependencies unreachable").await;
                        local.insert(step.id().to_string(), Local::Terminal);
                        progressed = true;
                    }
                }
                if !progressed {
                    break;
                }
                continue;
            }

            let Some((sid, result)) = rx.recv().await else {
                break;
            };
            local.insert(sid.clone(), Local::Terminal);
            match result {
                Ok(()) => {
                    op.mark_step_completed(&sid).await;
                    completed.insert(sid.clone());
                    if let Some(step) = by_id.get(&sid) {
                        for output in step.produced_outputs() {
                            manifest.add(&output);
                        }
                    }
                }
                Err(StepError::Cancelled) => {
                    op.mark_step_cancelled(&sid).await;
                    cancelled = true;
                }
                Err(err) => {
                    op.mark_step_failed(&sid, err.kind(), &redact_message(&err.to_string()))
                        .await;
                    if !config.continue_on_error {
                        abort = true;
                    }
                }
            }
        }

        RunOutcome { cancelled }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator").finish_non_exhaustive()
    }
}
