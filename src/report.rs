//! Renders the final report after running a load test.
//!
//! The text report is the [`Display`](std::fmt::Display) implementation of
//! [`AggregateStats`]: an overview, then tables of requests, latencies, percentiles, status
//! codes, errors and cumulative latency buckets. The JSON report serializes the same stats.

use regex::RegexSet;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::metrics::AggregateStats;
use crate::FlockError;

/// Supported final report formats.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum ReportFormat {
    #[default]
    Text,
    Json,
}
impl FromStr for ReportFormat {
    type Err = FlockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let report_format = RegexSet::new([r"(?i)^te?xt$", r"(?i)^json$"])
            .expect("failed to compile report_format RegexSet");
        let matches = report_format.matches(s);
        if matches.matched(0) {
            Ok(ReportFormat::Text)
        } else if matches.matched(1) {
            Ok(ReportFormat::Json)
        } else {
            Err(FlockError::InvalidOption {
                option: "--report-format".to_string(),
                value: s.to_string(),
                detail: "Invalid report format, expected: text or json.".to_string(),
            })
        }
    }
}

/// Render the stats in the requested format.
///
/// Rendering never modifies the stats, so a failed render can be retried in another format.
pub fn render(stats: &AggregateStats, format: ReportFormat) -> Result<String, FlockError> {
    match format {
        ReportFormat::Text => Ok(format!("{}", stats)),
        ReportFormat::Json => Ok(serde_json::to_string_pretty(stats)?),
    }
}
