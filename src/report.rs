//! The end-of-run summary.
//!
//! When [`Stampede::execute()`](../struct.Stampede.html#method.execute) completes it
//! returns a [`SummaryReport`]. When viewed with [`std::fmt::Display`] the report is
//! rendered as tables:
//!
//! ```text
//!  === STAMPEDE SUMMARY ===
//!  ------------------------------------------------------------------------------
//!  Scenario: payments_summary | Duration: 10.01s | Max users: 10
//!  ------------------------------------------------------------------------------
//!  Name                     |        # reqs |        # fails |    req/s |  fail/s
//!  ------------------------------------------------------------------------------
//!  payments_summary         |            62 |         0 (0%) |     6.19 |    0.00
//!  ------------------------------------------------------------------------------
//!  Name                     |    Avg (ms) |        Min |        Max
//!  ------------------------------------------------------------------------------
//!  payments_summary         |        5.01 |       5.00 |       5.03
//!  ------------------------------------------------------------------------------
//!  Name                     |        p50 |        p90 |        p99
//!  ------------------------------------------------------------------------------
//!  payments_summary         |       5.00 |       5.01 |       5.03
//! ```
//!
//! The same report can be written as JSON with `--report-file`.

use chrono::prelude::*;
use itertools::Itertools;
use num_format::{Locale, ToFormattedString};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

use crate::metrics::AggregateStats;
use crate::test_plan::StageHistory;
use crate::util;
use crate::StampedeError;

/// One requested percentile.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PercentileLatency {
    /// From 0 to 100.
    pub percentile: f64,
    pub latency_ms: f64,
}

/// Read-only summary of a run.
#[derive(Clone, Debug, Serialize)]
pub struct SummaryReport {
    pub scenario: String,
    pub started: DateTime<Utc>,
    pub duration_secs: f64,
    /// Total requests recorded.
    pub count: u64,
    pub failure_count: u64,
    /// Failures divided by count, from 0 to 1.
    pub failure_rate: f64,
    pub requests_per_second: f64,
    pub min_ms: f64,
    pub mean_ms: f64,
    pub max_ms: f64,
    /// Always reported, whether or not 99 is among the requested percentiles.
    pub p99_ms: f64,
    pub percentiles: Vec<PercentileLatency>,
    /// Highest number of active virtual users seen.
    pub max_users: usize,
    pub clamped_samples: u64,
    pub dropped_samples: u64,
    pub total_bytes: u64,
    /// Virtual users retired because their scenario failed fatally or panicked.
    pub worker_faults: usize,
    /// The run was aborted before the schedule completed.
    pub canceled: bool,
    pub failure_rate_threshold: Option<f32>,
    pub threshold_breached: bool,
    pub history: Vec<StageHistory>,
}
impl SummaryReport {
    /// Summarize `stats`, computing each of `percentiles` from the merged digest.
    pub fn new(
        scenario: &str,
        started: DateTime<Utc>,
        duration: Duration,
        stats: &AggregateStats,
        percentiles: &[f64],
    ) -> Self {
        let duration_secs = duration.as_secs_f64();
        let requests_per_second = if duration_secs > 0.0 {
            stats.count as f64 / duration_secs
        } else {
            0.0
        };
        SummaryReport {
            scenario: scenario.to_string(),
            started,
            duration_secs,
            count: stats.count,
            failure_count: stats.failure_count,
            failure_rate: stats.failure_rate(),
            requests_per_second,
            min_ms: util::as_millis_f64(stats.digest.min()),
            mean_ms: util::as_millis_f64(stats.digest.mean()),
            max_ms: util::as_millis_f64(stats.digest.max()),
            p99_ms: util::as_millis_f64(stats.percentile(99.0)),
            percentiles: percentiles
                .iter()
                .map(|p| PercentileLatency {
                    percentile: *p,
                    latency_ms: util::as_millis_f64(stats.percentile(*p)),
                })
                .collect(),
            max_users: 0,
            clamped_samples: stats.clamped_count,
            dropped_samples: stats.dropped_count,
            total_bytes: stats.total_bytes,
            worker_faults: 0,
            canceled: false,
            failure_rate_threshold: None,
            threshold_breached: false,
            history: Vec::new(),
        }
    }

    /// Mark the run failed if the failure rate is above `threshold`.
    pub fn evaluate_threshold(&mut self, threshold: Option<f32>) {
        self.failure_rate_threshold = threshold;
        self.threshold_breached = match threshold {
            Some(threshold) => self.failure_rate > threshold as f64,
            None => false,
        };
        if self.threshold_breached {
            warn!(
                "failure rate {:.2}% is above threshold {:.2}%",
                self.failure_rate * 100.0,
                self.failure_rate_threshold.unwrap_or_default() * 100.0
            );
        }
    }

    /// Latency at a requested percentile, if it was requested.
    pub fn percentile_ms(&self, percentile: f64) -> Option<f64> {
        self.percentiles
            .iter()
            .find(|p| (p.percentile - percentile).abs() < f64::EPSILON)
            .map(|p| p.latency_ms)
    }

    /// Write the report as pretty-printed JSON.
    pub async fn write_json(&self, path: &str) -> Result<(), StampedeError> {
        let json = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, json).await?;
        info!("wrote report to: {}", path);
        Ok(())
    }

    fn fmt_requests(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        writeln!(
            fmt,
            " {:<24} | {:>13} | {:>14} | {:>8} | {:>7}",
            "Name", "# reqs", "# fails", "req/s", "fail/s"
        )?;
        writeln!(fmt, " {}", "-".repeat(78))?;
        let fail_percent = self.failure_rate * 100.0;
        // Compress 100.0 and 0.0 to 100 and 0 respectively to save width.
        let fails = if fail_percent as usize == 100 || fail_percent == 0.0 {
            format!(
                "{} ({}%)",
                self.failure_count.to_formatted_string(&Locale::en),
                fail_percent as usize
            )
        } else {
            format!(
                "{} ({:.1}%)",
                self.failure_count.to_formatted_string(&Locale::en),
                fail_percent
            )
        };
        let fails_per_second = if self.duration_secs > 0.0 {
            self.failure_count as f64 / self.duration_secs
        } else {
            0.0
        };
        writeln!(
            fmt,
            " {:<24} | {:>13} | {:>14} | {:>8.reqs_p$} | {:>7.fails_p$}",
            util::truncate_string(&self.scenario, 24),
            self.count.to_formatted_string(&Locale::en),
            fails,
            self.requests_per_second,
            fails_per_second,
            reqs_p = determine_precision(self.requests_per_second),
            fails_p = determine_precision(fails_per_second),
        )
    }

    fn fmt_latencies(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        writeln!(
            fmt,
            " {:<24} | {:>11} | {:>10} | {:>10}",
            "Name", "Avg (ms)", "Min", "Max"
        )?;
        writeln!(fmt, " {}", "-".repeat(78))?;
        writeln!(
            fmt,
            " {:<24} | {:>11.2} | {:>10.2} | {:>10.2}",
            util::truncate_string(&self.scenario, 24),
            self.mean_ms,
            self.min_ms,
            self.max_ms,
        )
    }

    fn fmt_percentiles(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        if self.percentiles.is_empty() {
            return Ok(());
        }
        writeln!(fmt, " {}", "-".repeat(78))?;
        writeln!(
            fmt,
            " {:<24} | {}",
            "Name",
            self.percentiles
                .iter()
                .map(|p| format!("{:>10}", percentile_label(p.percentile)))
                .join(" | ")
        )?;
        writeln!(fmt, " {}", "-".repeat(78))?;
        writeln!(
            fmt,
            " {:<24} | {}",
            util::truncate_string(&self.scenario, 24),
            self.percentiles
                .iter()
                .map(|p| format!("{:>10.2}", p.latency_ms))
                .join(" | ")
        )
    }

    fn fmt_history(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        if self.history.is_empty() {
            return Ok(());
        }
        writeln!(fmt, " {}", "-".repeat(78))?;
        writeln!(fmt, " {:<24} | {:>24} | {:>13}", "Stage", "Started", "Target")?;
        writeln!(fmt, " {}", "-".repeat(78))?;
        for step in &self.history {
            writeln!(
                fmt,
                " {:<24} | {:>24} | {:>13}",
                step.state.to_string(),
                step.timestamp.format("%y-%m-%d %H:%M:%S%.3f").to_string(),
                step.target.to_formatted_string(&Locale::en),
            )?;
        }
        Ok(())
    }
}

/// Implement format trait to allow displaying the summary.
impl fmt::Display for SummaryReport {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        writeln!(fmt, "\n === STAMPEDE SUMMARY ===")?;
        writeln!(fmt, " {}", "-".repeat(78))?;
        writeln!(
            fmt,
            " Scenario: {} | Duration: {:.2}s | Max users: {}{}",
            self.scenario,
            self.duration_secs,
            self.max_users.to_formatted_string(&Locale::en),
            if self.canceled { " | canceled" } else { "" },
        )?;
        writeln!(fmt, " {}", "-".repeat(78))?;
        self.fmt_requests(fmt)?;
        writeln!(fmt, " {}", "-".repeat(78))?;
        self.fmt_latencies(fmt)?;
        self.fmt_percentiles(fmt)?;
        self.fmt_history(fmt)?;

        if self.worker_faults > 0 || self.clamped_samples > 0 || self.dropped_samples > 0 {
            writeln!(fmt, " {}", "-".repeat(78))?;
            writeln!(
                fmt,
                " Worker faults: {} | Clamped samples: {} | Dropped samples: {}",
                self.worker_faults.to_formatted_string(&Locale::en),
                self.clamped_samples.to_formatted_string(&Locale::en),
                self.dropped_samples.to_formatted_string(&Locale::en),
            )?;
        }
        if let Some(threshold) = self.failure_rate_threshold {
            writeln!(fmt, " {}", "-".repeat(78))?;
            writeln!(
                fmt,
                " Failure rate threshold {:.2}%: {}",
                threshold * 100.0,
                if self.threshold_breached {
                    "FAILED"
                } else {
                    "passed"
                }
            )?;
        }
        Ok(())
    }
}

fn determine_precision(value: f64) -> usize {
    if value < 1000.0 {
        2
    } else {
        0
    }
}

/// "p99" for whole percentiles, "p99.9" otherwise.
fn percentile_label(percentile: f64) -> String {
    if percentile.fract() == 0.0 {
        format!("p{}", percentile as usize)
    } else {
        format!("p{}", percentile)
    }
}
