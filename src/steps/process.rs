//! Process step: parse daily report files into the combined table.

use crate::errors::StepError;
use crate::operation::{OperationState, SharedOperation};
use crate::step::{DataOutput, DataRequirement, RunContext, Step};
use crate::steps::{
    COMBINED_FILENAME, CombinedRow, DailyQuote, date_from_report_filename, dir_from_context,
};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::info;
use walkdir::WalkDir;

pub struct ProcessStep {
    downloads_dir: PathBuf,
    reports_dir: PathBuf,
}

impl ProcessStep {
    pub const ID: &'static str = "process";

    pub fn new(downloads_dir: PathBuf, reports_dir: PathBuf) -> Self {
        Self {
            downloads_dir,
            reports_dir,
        }
    }

    /// Report files from context when the scrape step ran, otherwise a
    /// walk of the downloads directory.
    async fn report_files(&self, op: &SharedOperation) -> Vec<PathBuf> {
        if let Some(value) = op.get_context("report_files").await
            && let Some(entries) = value.as_array()
        {
            return entries
                .iter()
                .filter_map(|v| v.as_str().map(PathBuf::from))
                .collect();
        }
        let downloads_dir = dir_from_context(op, "downloads_dir", &self.downloads_dir).await;
        let mut files: Vec<PathBuf> = WalkDir::new(&downloads_dir)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| {
                e.file_name()
                    .to_str()
                    .is_some_and(|n| n.ends_with("ISX Daily Report.csv"))
            })
            .map(|e| e.into_path())
            .collect();
        files.sort();
        files
    }

    fn parse_report(path: &Path) -> Result<Vec<CombinedRow>, StepError> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        let date = date_from_report_filename(name).ok_or_else(|| {
            StepError::fatal(format!("report filename '{name}' has no parseable date"))
        })?;

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_path(path)
            .map_err(|e| StepError::execution(format!("cannot open report: {e}")))?;

        let mut rows = Vec::new();
        for result in reader.deserialize::<DailyQuote>() {
            let quote =
                result.map_err(|e| StepError::fatal(format!("malformed report row: {e}")))?;
            rows.push(CombinedRow::from_quote(date, quote));
        }
        Ok(rows)
    }
}

#[async_trait]
impl Step for ProcessStep {
    fn id(&self) -> &str {
        Self::ID
    }

    fn name(&self) -> &str {
        "Process daily reports"
    }

    fn dependencies(&self) -> Vec<String> {
        vec!["scrape".to_string()]
    }

    fn required_inputs(&self) -> Vec<DataRequirement> {
        vec![DataRequirement::new("daily_reports")]
    }

    fn produced_outputs(&self) -> Vec<DataOutput> {
        vec![DataOutput::new("combined_data")]
    }

    fn validate(&self, _state: &OperationState) -> Result<(), StepError> {
        Ok(())
    }

    async fn execute(&self, ctx: &RunContext, op: &SharedOperation) -> Result<(), StepError> {
        let reports_dir = dir_from_context(op, "reports_dir", &self.reports_dir).await;
        tokio::fs::create_dir_all(&reports_dir)
            .await
            .map_err(|e| StepError::fatal(format!("cannot create reports dir: {e}")))?;

        let files = self.report_files(op).await;
        if files.is_empty() {
            return Err(StepError::fatal("no daily report files to process"));
        }

        let combined_path = reports_dir.join(COMBINED_FILENAME);
        let mut writer = csv::Writer::from_path(&combined_path)
            .map_err(|e| StepError::execution(format!("cannot write combined table: {e}")))?;

        let total = files.len();
        let mut combined_rows = 0usize;
        for (i, file) in files.iter().enumerate() {
            ctx.checkpoint()?;
            let rows = Self::parse_report(file)?;
            for row in &rows {
                writer
                    .serialize(row)
                    .map_err(|e| StepError::execution(format!("combined table write: {e}")))?;
            }
            combined_rows += rows.len();
            let pct = ((i + 1) as f64 / total as f64) * 100.0;
            op.update_step_progress(
                Self::ID,
                pct,
                &format!("processed {} of {} reports", i + 1, total),
            )
            .await;
        }
        writer
            .flush()
            .map_err(|e| StepError::execution(format!("combined table flush: {e}")))?;

        info!(rows = combined_rows, reports = total, "combined table written");
        op.set_context(
            "combined_path",
            serde_json::json!(combined_path.to_string_lossy()),
        )
        .await;
        op.set_context("combined_rows", serde_json::json!(combined_rows))
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::NullBroadcaster;
    use crate::operation::{OperationMode, OperationRequest, StepState};
    use crate::steps::daily_report_filename;
    use chrono::NaiveDate;
    use std::sync::Arc;
    use tempfile::tempdir;
    use tokio_util::sync::CancellationToken;

    const HEADER: &str = "symbol,open,high,low,close,volume,value,trades";

    fn write_report(dir: &Path, date: NaiveDate, rows: &[&str]) -> PathBuf {
        let path = dir.join(daily_report_filename(date));
        let mut content = String::from(HEADER);
        for row in rows {
            content.push('\n');
            content.push_str(row);
        }
        content.push('\n');
        std::fs::write(&path, content).unwrap();
        path
    }

    fn harness(downloads: &Path, reports: &Path) -> (RunContext, SharedOperation) {
        let broadcaster = Arc::new(NullBroadcaster);
        let request = OperationRequest::new(
            OperationMode::Initial,
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 5).unwrap(),
        );
        let mut state = OperationState::new(
            "op-process",
            request,
            vec![StepState::pending(ProcessStep::ID, "Process daily reports")],
        );
        state.context.insert(
            "downloads_dir".to_string(),
            serde_json::json!(downloads.to_string_lossy()),
        );
        state.context.insert(
            "reports_dir".to_string(),
            serde_json::json!(reports.to_string_lossy()),
        );
        let cancel = CancellationToken::new();
        let op = SharedOperation::new(state, cancel.clone(), broadcaster.clone());
        let ctx = RunContext::new("op-process", "trace", cancel, broadcaster);
        (ctx, op)
    }

    #[tokio::test]
    async fn combines_reports_with_dates() {
        let downloads = tempdir().unwrap();
        let reports = tempdir().unwrap();
        write_report(
            downloads.path(),
            NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
            &["BBOB,1.10,1.20,1.05,1.15,1000000,1150000.0,54"],
        );
        write_report(
            downloads.path(),
            NaiveDate::from_ymd_opt(2024, 1, 3).unwrap(),
            &[
                "BBOB,1.15,1.22,1.10,1.20,900000,1080000.0,41",
                "ISX60,0,0,0,612.5,0,0.0,0",
            ],
        );

        let (ctx, op) = harness(downloads.path(), reports.path());
        op.mark_step_running(ProcessStep::ID).await;
        let step = ProcessStep::new(
            downloads.path().to_path_buf(),
            reports.path().to_path_buf(),
        );
        step.execute(&ctx, &op).await.unwrap();

        assert_eq!(
            op.get_context("combined_rows").await,
            Some(serde_json::json!(3))
        );

        let combined = std::fs::read_to_string(reports.path().join(COMBINED_FILENAME)).unwrap();
        assert!(combined.starts_with("date,symbol,"));
        assert!(combined.contains("2024-01-02,BBOB"));
        assert!(combined.contains("2024-01-03,ISX60"));
    }

    #[tokio::test]
    async fn missing_reports_are_fatal() {
        let downloads = tempdir().unwrap();
        let reports = tempdir().unwrap();
        let (ctx, op) = harness(downloads.path(), reports.path());
        op.mark_step_running(ProcessStep::ID).await;
        let step = ProcessStep::new(
            downloads.path().to_path_buf(),
            reports.path().to_path_buf(),
        );

        let err = step.execute(&ctx, &op).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn malformed_rows_are_fatal() {
        let downloads = tempdir().unwrap();
        let reports = tempdir().unwrap();
        write_report(
            downloads.path(),
            NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
            &["BBOB,not-a-number,1.20,1.05,1.15,1000000,1150000.0,54"],
        );

        let (ctx, op) = harness(downloads.path(), reports.path());
        op.mark_step_running(ProcessStep::ID).await;
        let step = ProcessStep::new(
            downloads.path().to_path_buf(),
            reports.path().to_path_buf(),
        );
        let err = step.execute(&ctx, &op).await.unwrap_err();
        assert!(matches!(err, StepError::Execution { retryable: false, .. }));
    }
}
