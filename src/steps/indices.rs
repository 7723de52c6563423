//! Indices step: extract the ISX60 and ISX15 index series from the
//! combined table.

use crate::errors::StepError;
use crate::operation::SharedOperation;
use crate::step::{DataOutput, DataRequirement, RunContext, Step};
use crate::steps::{COMBINED_FILENAME, CombinedRow, INDEXES_FILENAME, dir_from_context};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;

const INDEX_SYMBOLS: [&str; 2] = ["ISX60", "ISX15"];

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexPoint {
    date: NaiveDate,
    index: String,
    value: f64,
}

pub struct IndicesStep {
    reports_dir: PathBuf,
}

impl IndicesStep {
    pub const ID: &'static str = "indices";

    pub fn new(reports_dir: PathBuf) -> Self {
        Self { reports_dir }
    }
}

#[async_trait]
impl Step for IndicesStep {
    fn id(&self) -> &str {
        Self::ID
    }

    fn name(&self) -> &str {
        "Extract market indices"
    }

    fn dependencies(&self) -> Vec<String> {
        vec!["process".to_string()]
    }

    fn required_inputs(&self) -> Vec<DataRequirement> {
        vec![DataRequirement::new("combined_data")]
    }

    fn produced_outputs(&self) -> Vec<DataOutput> {
        vec![DataOutput::new("index_data")]
    }

    async fn execute(&self, ctx: &RunContext, op: &SharedOperation) -> Result<(), StepError> {
        let reports_dir = dir_from_context(op, "reports_dir", &self.reports_dir).await;
        let combined_path = match op.get_context("combined_path").await {
            Some(value) => value
                .as_str()
                .map(PathBuf::from)
                .unwrap_or_else(|| reports_dir.join(COMBINED_FILENAME)),
            None => reports_dir.join(COMBINED_FILENAME),
        };

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_path(&combined_path)
            .map_err(|e| StepError::execution(format!("cannot open combined table: {e}")))?;

        let mut points = Vec::new();
        for result in reader.deserialize::<CombinedRow>() {
            ctx.checkpoint()?;
            let row =
                result.map_err(|e| StepError::fatal(format!("malformed combined row: {e}")))?;
            if INDEX_SYMBOLS.contains(&row.symbol.as_str()) {
                points.push(IndexPoint {
                    date: row.date,
                    index: row.symbol,
                    value: row.close,
                });
            }
        }
        points.sort_by(|a, b| (a.date, a.index.as_str()).cmp(&(b.date, b.index.as_str())));
        op.update_step_progress(Self::ID, 50.0, "index rows collected")
            .await;

        let out_path = reports_dir.join(INDEXES_FILENAME);
        let mut writer = csv::Writer::from_path(&out_path)
            .map_err(|e| StepError::execution(format!("cannot write index file: {e}")))?;
        for point in &points {
            writer
                .serialize(point)
                .map_err(|e| StepError::execution(format!("index file write: {e}")))?;
        }
        writer
            .flush()
            .map_err(|e| StepError::execution(format!("index file flush: {e}")))?;

        info!(points = points.len(), "index series extracted");
        op.set_context("index_points", serde_json::json!(points.len()))
            .await;
        op.set_context("indexes_path", serde_json::json!(out_path.to_string_lossy()))
            .await;
        op.update_step_progress(Self::ID, 100.0, "index file written")
            .await;
        Ok(())
    }
}
