//! Per-run state tree: the operation, its steps, and the shared context.
//!
//! `OperationState` is plain data. It is owned by the orchestrator behind
//! a lock for the duration of a run (see [`super::SharedOperation`]) and
//! then surrendered read-only to the bounded history. Snapshots are deep
//! copies and serialize directly onto the wire.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Status of a single step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Skipped | Self::Cancelled
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Status of the operation as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Pipeline mode requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OperationMode {
    /// Rebuild everything in the date range.
    #[default]
    Initial,
    /// Only fill in what is missing.
    Accumulative,
}

/// A request to run an operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRequest {
    /// Caller-supplied id; the orchestrator assigns one when empty.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub mode: OperationMode,
    pub from_date: NaiveDate,
    pub to_date: NaiveDate,
    /// Free-form options, seeded into the operation context at start.
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
}

impl OperationRequest {
    pub fn new(mode: OperationMode, from_date: NaiveDate, to_date: NaiveDate) -> Self {
        Self {
            id: String::new(),
            mode,
            from_date,
            to_date,
            parameters: HashMap::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }
}

/// Mutable per-step state, one per step per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepState {
    pub id: String,
    pub name: String,
    pub status: StepStatus,
    /// Percent complete, 0.0 ..= 100.0. Non-decreasing within a single
    /// running span; resets to 0 at the start of each retry attempt.
    pub progress: f64,
    pub message: String,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepState {
    pub fn pending(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            status: StepStatus::Pending,
            progress: 0.0,
            message: String::new(),
            attempts: 0,
            started_at: None,
            finished_at: None,
            error: None,
        }
    }
}

/// Mutable per-run state: the operation, its steps in execution order,
/// and the context map shared between steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationState {
    pub id: String,
    pub status: OperationStatus,
    /// Step order equals execution order.
    pub steps: Vec<StepState>,
    pub request: OperationRequest,
    /// Key/value data shared between steps; monotonically grown.
    pub context: HashMap<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl OperationState {
    /// Build a fresh state with every step pending and the request
    /// parameters seeded into the context.
    pub fn new(id: impl Into<String>, request: OperationRequest, steps: Vec<StepState>) -> Self {
        let context = request.parameters.clone();
        Self {
            id: id.into(),
            status: OperationStatus::Pending,
            steps,
            request,
            context,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn step(&self, id: &str) -> Option<&StepState> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn step_mut(&mut self, id: &str) -> Option<&mut StepState> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    pub fn summary(&self) -> OperationSummary {
        let mut summary = OperationSummary {
            total: self.steps.len(),
            ..Default::default()
        };
        for step in &self.steps {
            match step.status {
                StepStatus::Completed => summary.completed += 1,
                StepStatus::Failed => summary.failed += 1,
                StepStatus::Skipped => summary.skipped += 1,
                StepStatus::Cancelled => summary.cancelled += 1,
                StepStatus::Pending | StepStatus::Running => {}
            }
        }
        if let (Some(start), Some(end)) = (self.started_at, self.finished_at) {
            summary.duration_ms = (end - start).num_milliseconds().max(0) as u64;
        }
        summary
    }

    /// The final operation status implied by the step states, given that
    /// no cancellation was observed.
    pub fn derive_final_status(&self) -> OperationStatus {
        if self.steps.iter().any(|s| s.status == StepStatus::Failed) {
            return OperationStatus::Failed;
        }
        if self
            .steps
            .iter()
            .any(|s| s.status == StepStatus::Cancelled)
        {
            return OperationStatus::Cancelled;
        }
        let all_settled = self
            .steps
            .iter()
            .all(|s| matches!(s.status, StepStatus::Completed | StepStatus::Skipped));
        let any_completed = self.steps.iter().any(|s| s.status.is_success());
        if self.steps.is_empty() || (all_settled && any_completed) {
            OperationStatus::Completed
        } else {
            OperationStatus::Failed
        }
    }
}

/// Aggregate counts for completion broadcasts and API responses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperationSummary {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
    pub duration_ms: u64,
}
