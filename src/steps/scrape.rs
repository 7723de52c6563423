//! Scrape step: fetch the daily report file for every trading day in the
//! requested range.
//!
//! The engine knows nothing about where reports come from; this step owns
//! that side effect. With a `base_url` in its step config it downloads
//! missing files over HTTP; without one it runs offline and indexes the
//! files already present in the downloads directory.

use crate::errors::StepError;
use crate::operation::{OperationMode, OperationState, SharedOperation};
use crate::step::{DataOutput, RunContext, Step};
use crate::steps::{daily_report_filename, dir_from_context, trading_days};
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::{debug, info};

pub struct ScrapeStep {
    downloads_dir: PathBuf,
}

impl ScrapeStep {
    pub const ID: &'static str = "scrape";

    pub fn new(downloads_dir: PathBuf) -> Self {
        Self { downloads_dir }
    }

    fn base_url(ctx: &RunContext) -> Option<String> {
        ctx.step_config()
            .and_then(|c| c.get("base_url"))
            .and_then(|v| v.as_str())
            .map(|s| s.trim_end_matches('/').to_string())
    }

    async fn download(
        client: &reqwest::Client,
        base_url: &str,
        date: chrono::NaiveDate,
        target: &PathBuf,
    ) -> Result<bool, StepError> {
        let url = format!("{base_url}/reports/{}.csv", date.format("%Y%m%d"));
        let response = client
            .get(&url)
            .send()
            .await
            .map_err(|e| StepError::execution(format!("report download failed: {e}")))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            // no trading that day
            debug!(%url, "no report published for date");
            return Ok(false);
        }
        if !response.status().is_success() {
            return Err(StepError::execution(format!(
                "report server returned {}",
                response.status()
            )));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| StepError::execution(format!("report download failed: {e}")))?;
        tokio::fs::write(target, &body)
            .await
            .map_err(|e| StepError::execution(format!("failed to store report: {e}")))?;
        Ok(true)
    }
}

#[async_trait]
impl Step for ScrapeStep {
    fn id(&self) -> &str {
        Self::ID
    }

    fn name(&self) -> &str {
        "Scrape daily reports"
    }

    fn produced_outputs(&self) -> Vec<DataOutput> {
        vec![DataOutput::new("daily_reports")]
    }

    fn validate(&self, state: &OperationState) -> Result<(), StepError> {
        if state.request.from_date > state.request.to_date {
            return Err(StepError::Validation(
                "from_date must not be after to_date".to_string(),
            ));
        }
        Ok(())
    }

    async fn execute(&self, ctx: &RunContext, op: &SharedOperation) -> Result<(), StepError> {
        let snapshot = op.snapshot().await;
        let downloads_dir = dir_from_context(op, "downloads_dir", &self.downloads_dir).await;
        tokio::fs::create_dir_all(&downloads_dir)
            .await
            .map_err(|e| StepError::fatal(format!("cannot create downloads dir: {e}")))?;

        let days = trading_days(snapshot.request.from_date, snapshot.request.to_date);
        let total = days.len().max(1);
        let base_url = Self::base_url(ctx);
        let client = reqwest::Client::new();

        let mut report_files: Vec<String> = Vec::new();
        let mut report_dates: Vec<String> = Vec::new();

        for (i, date) in days.iter().enumerate() {
            ctx.checkpoint()?;

            let filename = daily_report_filename(*date);
            let target = downloads_dir.join(&filename);
            let already_present = target.exists();

            let available = if already_present
                && snapshot.request.mode == OperationMode::Accumulative
            {
                true
            } else if let Some(base) = &base_url {
                Self::download(&client, base, *date, &target).await?
            } else {
                already_present
            };

            if available {
                report_files.push(target.to_string_lossy().into_owned());
                report_dates.push(date.format("%Y-%m-%d").to_string());
            }

            let pct = ((i + 1) as f64 / total as f64) * 100.0;
            op.update_step_progress(
                Self::ID,
                pct,
                &format!("fetched {} of {} trading days", i + 1, total),
            )
            .await;
        }

        if report_files.is_empty() {
            return Err(StepError::fatal(
                "no daily reports available in the requested range",
            ));
        }

        info!(count = report_files.len(), "daily reports collected");
        op.set_context("report_files", serde_json::json!(report_files))
            .await;
        op.set_context("report_dates", serde_json::json!(report_dates))
            .await;
        Ok(())
    }
}
