//! Reference step catalog: scrape → process → indices → liquidity.
//!
//! These are consumers of the engine, not part of it. Each step reads
//! its inputs from the operation context (seeded from the request
//! parameters) with a configured directory as fallback, reports progress
//! through the shared operation handle, and observes cancellation at its
//! suspension points.

mod indices;
mod liquidity;
mod process;
mod scrape;

pub use indices::IndicesStep;
pub use liquidity::LiquidityStep;
pub use process::ProcessStep;
pub use scrape::ScrapeStep;

use crate::errors::OrchestratorError;
use crate::orchestrator::Orchestrator;
use chrono::{Datelike, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// One instrument's daily quote as parsed from a daily report file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyQuote {
    pub symbol: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
    pub value: f64,
    pub trades: u32,
}

/// A quote row in the combined table, stamped with its trading date.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CombinedRow {
    pub date: NaiveDate,
    pub symbol: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
    pub value: f64,
    pub trades: u32,
}

impl CombinedRow {
    pub fn from_quote(date: NaiveDate, quote: DailyQuote) -> Self {
        Self {
            date,
            symbol: quote.symbol,
            open: quote.open,
            high: quote.high,
            low: quote.low,
            close: quote.close,
            volume: quote.volume,
            value: quote.value,
            trades: quote.trades,
        }
    }
}

/// Name of the combined table file.
pub const COMBINED_FILENAME: &str = "isx_combined_data.csv";
/// Name of the index extraction file.
pub const INDEXES_FILENAME: &str = "indexes.csv";

/// `YYYY MM DD ISX Daily Report.csv`
pub fn daily_report_filename(date: NaiveDate) -> String {
    format!("{} ISX Daily Report.csv", date.format("%Y %m %d"))
}

/// `liquidity_report_YYYYMMDD.csv`
pub fn liquidity_report_filename(date: NaiveDate) -> String {
    format!("liquidity_report_{}.csv", date.format("%Y%m%d"))
}

/// Recover the trading date from a daily report filename.
pub fn date_from_report_filename(name: &str) -> Option<NaiveDate> {
    let prefix = name.get(..10)?;
    NaiveDate::parse_from_str(prefix, "%Y %m %d").ok()
}

/// Trading days in the inclusive range. The ISX trades Sunday through
/// Thursday.
pub fn trading_days(from: NaiveDate, to: NaiveDate) -> Vec<NaiveDate> {
    let mut days = Vec::new();
    let mut current = from;
    while current <= to {
        if !matches!(current.weekday(), Weekday::Fri | Weekday::Sat) {
            days.push(current);
        }
        current = match current.succ_opt() {
            Some(next) => next,
            None => break,
        };
    }
    days
}

/// Resolve a directory from the operation context, falling back to the
/// step's configured default.
pub(crate) async fn dir_from_context(
    op: &crate::operation::SharedOperation,
    key: &str,
    default: &PathBuf,
) -> PathBuf {
    match op.get_context(key).await {
        Some(value) => value
            .as_str()
            .map(PathBuf::from)
            .unwrap_or_else(|| default.clone()),
        None => default.clone(),
    }
}

/// Register the full catalog in pipeline order.
pub fn register_catalog(
    orchestrator: &Orchestrator,
    downloads_dir: PathBuf,
    reports_dir: PathBuf,
) -> Result<(), OrchestratorError> {
    orchestrator.register_step(Arc::new(ScrapeStep::new(downloads_dir.clone())))?;
    orchestrator.register_step(Arc::new(ProcessStep::new(
        downloads_dir,
        reports_dir.clone(),
    )))?;
    orchestrator.register_step(Arc::new(IndicesStep::new(reports_dir.clone())))?;
    orchestrator.register_step(Arc::new(LiquidityStep::new(reports_dir)))?;
    Ok(())
}
