//! Per-run operation state: the state tree, the thread-safe handle the
//! orchestrator and steps share, and the bounded history of finished runs.

mod history;
mod shared;
mod state;

pub use history::OperationHistory;
pub use shared::SharedOperation;
pub use state::{
    OperationMode, OperationRequest, OperationState, OperationStatus, OperationSummary, StepState,
    StepStatus,
};
