//! The step contract consumed by the orchestrator.
//!
//! A step is a named unit of work with declared dependencies and data
//! tags. Definitions are immutable and shared read-only across runs; all
//! mutable per-run state lives in [`SharedOperation`]. Steps receive an
//! explicit [`RunContext`] instead of reaching for process globals.

use crate::broadcast::Broadcaster;
use crate::errors::StepError;
use crate::operation::{OperationState, SharedOperation};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A data tag a step needs present in the manifest before it can run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataRequirement {
    pub tag: String,
}

impl DataRequirement {
    pub fn new(tag: impl Into<String>) -> Self {
        Self { tag: tag.into() }
    }
}

/// A data tag a step adds to the manifest when it completes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataOutput {
    pub tag: String,
}

impl DataOutput {
    pub fn new(tag: impl Into<String>) -> Self {
        Self { tag: tag.into() }
    }
}

/// The set of data tags available to a run. Grows as steps complete.
#[derive(Debug, Clone, Default)]
pub struct DataManifest {
    available: HashSet<String>,
}

impl DataManifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tags<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            available: tags.into_iter().map(Into::into).collect(),
        }
    }

    pub fn add(&mut self, output: &DataOutput) {
        self.available.insert(output.tag.clone());
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.available.contains(tag)
    }

    pub fn satisfies(&self, requirements: &[DataRequirement]) -> bool {
        requirements.iter().all(|r| self.available.contains(&r.tag))
    }
}

/// Per-run context handed to every step invocation.
///
/// Carries the trace id, the cancellation signal, the broadcaster handle,
/// and the step's own slice of the run configuration.
#[derive(Clone)]
pub struct RunContext {
    operation_id: String,
    trace_id: String,
    cancel: CancellationToken,
    broadcaster: Arc<dyn Broadcaster>,
    step_config: Option<serde_json::Value>,
}

impl RunContext {
    pub fn new(
        operation_id: impl Into<String>,
        trace_id: impl Into<String>,
        cancel: CancellationToken,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> Self {
        Self {
            operation_id: operation_id.into(),
            trace_id: trace_id.into(),
            cancel,
            broadcaster,
            step_config: None,
        }
    }

    /// Attach the per-step configuration slice for the next invocation.
    pub fn with_step_config(mut self, config: Option<serde_json::Value>) -> Self {
        self.step_config = config;
        self
    }

    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn broadcaster(&self) -> &Arc<dyn Broadcaster> {
        &self.broadcaster
    }

    pub fn step_config(&self) -> Option<&serde_json::Value> {
        self.step_config.as_ref()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the operation is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Cooperative cancellation check. Steps call this at suspension
    /// points; blocking work must be broken up so the check is reached.
    pub fn checkpoint(&self) -> Result<(), StepError> {
        if self.cancel.is_cancelled() {
            Err(StepError::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("operation_id", &self.operation_id)
            .field("trace_id", &self.trace_id)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// An immutable step definition.
///
/// `execute` must observe the context's cancellation signal; any blocking
/// primitive used inside a step must be cancellation-aware.
#[async_trait]
pub trait Step: Send + Sync {
    /// Unique, stable identifier.
    fn id(&self) -> &str;

    /// Human-readable name.
    fn name(&self) -> &str;

    /// Ids of steps that must complete before this one may start.
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    fn required_inputs(&self) -> Vec<DataRequirement> {
        Vec::new()
    }

    fn produced_outputs(&self) -> Vec<DataOutput> {
        Vec::new()
    }

    /// Manifest gate. The default checks declared inputs against the
    /// manifest; steps with dynamic requirements override this.
    fn can_run(&self, manifest: &DataManifest) -> bool {
        manifest.satisfies(&self.required_inputs())
    }

    /// Pre-execution check against a state snapshot. A failure here marks
    /// the step `Failed` without retries and without running `execute`.
    fn validate(&self, _state: &OperationState) -> Result<(), StepError> {
        Ok(())
    }

    /// Run the step. Progress and context writes go through `op`.
    async fn execute(&self, ctx: &RunContext, op: &SharedOperation) -> Result<(), StepError>;
}

impl std::fmt::Debug for dyn Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step").field("id", &self.id()).finish()
    }
}
