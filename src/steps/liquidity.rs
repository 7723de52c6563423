//! Liquidity step: score every instrument over the processed window and
//! write the dated liquidity report.

use crate::errors::StepError;
use crate::operation::SharedOperation;
use crate::step::{DataOutput, DataRequirement, RunContext, Step};
use crate::steps::{COMBINED_FILENAME, CombinedRow, dir_from_context, liquidity_report_filename};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::info;

/// Scoring weights: traded value and volume dominate, continuity breaks
/// ties between thinly and regularly traded instruments.
const VALUE_WEIGHT: f64 = 0.4;
const VOLUME_WEIGHT: f64 = 0.4;
const CONTINUITY_WEIGHT: f64 = 0.2;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LiquidityRow {
    symbol: String,
    days_traded: usize,
    avg_volume: f64,
    avg_value: f64,
    continuity: f64,
    score: f64,
}

#[derive(Default)]
struct SymbolAccumulator {
    days: usize,
    volume: u64,
    value: f64,
}

pub struct LiquidityStep {
    reports_dir: PathBuf,
}

impl LiquidityStep {
    pub const ID: &'static str = "liquidity";

    pub fn new(reports_dir: PathBuf) -> Self {
        Self { reports_dir }
    }
}

#[async_trait]
impl Step for LiquidityStep {
    fn id(&self) -> &str {
        Self::ID
    }

    fn name(&self) -> &str {
        "Score liquidity"
    }

    fn dependencies(&self) -> Vec<String> {
        vec!["indices".to_string()]
    }

    fn required_inputs(&self) -> Vec<DataRequirement> {
        vec![DataRequirement::new("combined_data")]
    }

    fn produced_outputs(&self) -> Vec<DataOutput> {
        vec![DataOutput::new("liquidity_report")]
    }

    async fn execute(&self, ctx: &RunContext, op: &SharedOperation) -> Result<(), StepError> {
        let snapshot = op.snapshot().await;
        let reports_dir = dir_from_context(op, "reports_dir", &self.reports_dir).await;
        let combined_path = reports_dir.join(COMBINED_FILENAME);

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_path(&combined_path)
            .map_err(|e| StepError::execution(format!("cannot open combined table: {e}")))?;

        let mut by_symbol: BTreeMap<String, SymbolAccumulator> = BTreeMap::new();
        let mut trading_dates = std::collections::BTreeSet::new();
        for result in reader.deserialize::<CombinedRow>() {
            ctx.checkpoint()?;
            let row =
                result.map_err(|e| StepError::fatal(format!("malformed combined row: {e}")))?;
            trading_dates.insert(row.date);
            if row.symbol.starts_with("ISX") && row.volume == 0 {
                // index rows carry no tradable liquidity
                continue;
            }
            let acc = by_symbol.entry(row.symbol).or_default();
            acc.days += 1;
            acc.volume += row.volume;
            acc.value += row.value;
        }
        op.update_step_progress(Self::ID, 40.0, "window aggregated").await;

        let window_days = trading_dates.len().max(1);
        let max_avg_volume = by_symbol
            .values()
            .map(|a| a.volume as f64 / a.days.max(1) as f64)
            .fold(0.0_f64, f64::max)
            .max(1.0);
        let max_avg_value = by_symbol
            .values()
            .map(|a| a.value / a.days.max(1) as f64)
            .fold(0.0_f64, f64::max)
            .max(1.0);

        let mut rows: Vec<LiquidityRow> = by_symbol
            .into_iter()
            .map(|(symbol, acc)| {
                let avg_volume = acc.volume as f64 / acc.days.max(1) as f64;
                let avg_value = acc.value / acc.days.max(1) as f64;
                let continuity = acc.days as f64 / window_days as f64;
                let score = VALUE_WEIGHT * (avg_value / max_avg_value)
                    + VOLUME_WEIGHT * (avg_volume / max_avg_volume)
                    + CONTINUITY_WEIGHT * continuity;
                LiquidityRow {
                    symbol,
                    days_traded: acc.days,
                    avg_volume,
                    avg_value,
                    continuity,
                    score,
                }
            })
            .collect();
        rows.sort_by(|a, b| b.score.total_cmp(&a.score));
        op.update_step_progress(Self::ID, 70.0, "instruments scored").await;

        let out_path = reports_dir.join(liquidity_report_filename(snapshot.request.to_date));
        let mut writer = csv::Writer::from_path(&out_path)
            .map_err(|e| StepError::execution(format!("cannot write liquidity report: {e}")))?;
        for row in &rows {
            writer
                .serialize(row)
                .map_err(|e| StepError::execution(format!("liquidity report write: {e}")))?;
        }
        writer
            .flush()
            .map_err(|e| StepError::execution(format!("liquidity report flush: {e}")))?;

        info!(instruments = rows.len(), "liquidity report written");
        op.set_context(
            "liquidity_report",
            serde_json::json!(out_path.to_string_lossy()),
        )
        .await;
        op.update_step_progress(Self::ID, 100.0, "liquidity report written")
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::NullBroadcaster;
    use crate::operation::{OperationMode, OperationRequest, OperationState, StepState};
    use chrono::NaiveDate;
    use std::sync::Arc;
    use tempfile::tempdir;
    use tokio_util::sync::CancellationToken;

    fn harness(reports: &std::path::Path) -> (RunContext, SharedOperation) {
        let broadcaster = Arc::new(NullBroadcaster);
        let request = OperationRequest::new(
            OperationMode::Initial,
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 3).unwrap(),
        );
        let mut state = OperationState::new(
            "op-liquidity",
            request,
            vec![StepState::pending(LiquidityStep::ID, "Score liquidity")],
        );
        state.context.insert(
            "reports_dir".to_string(),
            serde_json::json!(reports.to_string_lossy()),
        );
        let cancel = CancellationToken::new();
        let op = SharedOperation::new(state, cancel.clone(), broadcaster.clone());
        let ctx = RunContext::new("op-liquidity", "trace", cancel, broadcaster);
        (ctx, op)
    }

    fn write_combined(dir: &std::path::Path, rows: &[&str]) {
        let mut content =
            String::from("date,symbol,open,high,low,close,volume,value,trades");
        for row in rows {
            content.push('\n');
            content.push_str(row);
        }
        content.push('\n');
        std::fs::write(dir.join(COMBINED_FILENAME), content).unwrap();
    }

    #[tokio::test]
    async fn scores_and_ranks_instruments() {
        let reports = tempdir().unwrap();
        write_combined(
            reports.path(),
            &[
                "2024-01-02,BBOB,1.1,1.2,1.0,1.15,1000000,1150000.0,50",
                "2024-01-03,BBOB,1.1,1.2,1.0,1.18,900000,1060000.0,45",
                "2024-01-02,TASC,4.0,4.1,3.9,4.05,10000,40500.0,5",
                "2024-01-02,ISX60,0,0,0,612.5,0,0.0,0",
            ],
        );

        let (ctx, op) = harness(reports.path());
        op.mark_step_running(LiquidityStep::ID).await;
        let step = LiquidityStep::new(reports.path().to_path_buf());
        step.execute(&ctx, &op).await.unwrap();

        let report_path = reports
            .path()
            .join(liquidity_report_filename(NaiveDate::from_ymd_opt(2024, 1, 3).unwrap()));
        let content = std::fs::read_to_string(&report_path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        // header + two instruments, index row excluded
        assert_eq!(lines.len(), 3);
        // BBOB trades every day with far larger volume, so it ranks first
        assert!(lines[1].starts_with("BBOB,2,"));
        assert!(lines[2].starts_with("TASC,1,"));
    }

    #[tokio::test]
    async fn report_filename_uses_to_date() {
        let reports = tempdir().unwrap();
        write_combined(
            reports.path(),
            &["2024-01-02,BBOB,1.1,1.2,1.0,1.15,1000,1150.0,5"],
        );
        let (ctx, op) = harness(reports.path());
        op.mark_step_running(LiquidityStep::ID).await;
        let step = LiquidityStep::new(reports.path().to_path_buf());
        step.execute(&ctx, &op).await.unwrap();

        assert!(reports.path().join("liquidity_report_20240103.csv").exists());
        assert_eq!(
            op.get_context("liquidity_report").await.unwrap(),
            serde_json::json!(
                reports
                    .path()
                    .join("liquidity_report_20240103.csv")
                    .to_string_lossy()
            )
        );
    }
}
