//! Presentation-ready statistics derived from a validated [`ReportDocument`].
//!
//! Everything here is pure: the same report always yields the same analysis.

use chrono::{DateTime, FixedOffset};
use serde::Serialize;
use std::fmt;

use crate::config::{DEFAULT_HISTOGRAM_BINS, KB_PER_MB, MBPS_DISPLAY_THRESHOLD, SLOW_REQUEST_LIMIT};
use crate::report::{ErrorCounts, Percentiles, ReportDocument, TimeSeriesSample};

// --- Histogram ---

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistogramBin {
    pub start: f64,
    pub end: f64,
    pub count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Histogram {
    pub min: f64,
    pub max: f64,
    pub bin_width: f64,
    pub bins: Vec<HistogramBin>,
}

impl Histogram {
    pub fn total(&self) -> usize {
        self.bins.iter().map(|b| b.count).sum()
    }
}

/// Equal-width latency histogram. Bins are `[start, end)` except the last,
/// which also holds the maximum.
pub fn histogram(latencies: &[f64], bin_count: usize) -> Histogram {
    if latencies.is_empty() || bin_count == 0 {
        return Histogram::default();
    }

    let min = latencies.iter().copied().fold(f64::INFINITY, f64::min);
    let max = latencies.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let bin_width = (max - min) / bin_count as f64;

    let mut bins: Vec<HistogramBin> = (0..bin_count)
        .map(|i| HistogramBin {
            start: min + i as f64 * bin_width,
            end: if i + 1 == bin_count {
                max
            } else {
                min + (i + 1) as f64 * bin_width
            },
            count: 0,
        })
        .collect();

    let last = bin_count - 1;
    for &latency in latencies {
        let index = if bin_width > 0.0 {
            (((latency - min) / bin_width).floor() as usize).min(last)
        } else {
            last
        };
        bins[index].count += 1;
    }

    Histogram {
        min,
        max,
        bin_width,
        bins,
    }
}

// --- Rankings and percentiles ---

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlowRequest {
    /// 1 = slowest.
    pub rank: usize,
    /// Position of the request in the report's latency sequence.
    pub request_index: usize,
    pub latency_ms: f64,
}

pub fn slowest_requests(latencies: &[f64], limit: usize) -> Vec<SlowRequest> {
    let mut indexed: Vec<(usize, f64)> = latencies.iter().copied().enumerate().collect();
    // Stable sort keeps earlier requests first among equal latencies.
    indexed.sort_by(|a, b| b.1.total_cmp(&a.1));
    indexed
        .into_iter()
        .take(limit)
        .enumerate()
        .map(|(i, (request_index, latency_ms))| SlowRequest {
            rank: i + 1,
            request_index,
            latency_ms,
        })
        .collect()
}

/// Linear-interpolated percentile over sorted data, `p` in `0.0..=1.0`.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    let position = p * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let fraction = position - lower as f64;
    sorted[lower] * (1.0 - fraction) + sorted[upper] * fraction
}

pub fn percentiles(latencies: &[f64]) -> Option<Percentiles> {
    if latencies.is_empty() {
        return None;
    }
    let mut sorted = latencies.to_vec();
    sorted.sort_by(f64::total_cmp);
    Some(Percentiles {
        p25: percentile(&sorted, 0.25),
        p50: percentile(&sorted, 0.50),
        p75: percentile(&sorted, 0.75),
        p90: percentile(&sorted, 0.90),
        p95: percentile(&sorted, 0.95),
        p99: percentile(&sorted, 0.99),
    })
}

// --- Throughput presentation ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ThroughputUnit {
    #[serde(rename = "KB/s")]
    KBps,
    #[serde(rename = "MB/s")]
    MBps,
}

impl fmt::Display for ThroughputUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThroughputUnit::KBps => f.write_str("KB/s"),
            ThroughputUnit::MBps => f.write_str("MB/s"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Throughput {
    pub value: f64,
    pub unit: ThroughputUnit,
}

impl fmt::Display for Throughput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2} {}", self.value, self.unit)
    }
}

/// Present `mbps` in KB/s below 1 MB/s, otherwise in MB/s.
pub fn format_throughput(mbps: f64) -> Throughput {
    if mbps < MBPS_DISPLAY_THRESHOLD {
        Throughput {
            value: mbps * KB_PER_MB,
            unit: ThroughputUnit::KBps,
        }
    } else {
        Throughput {
            value: mbps,
            unit: ThroughputUnit::MBps,
        }
    }
}

// --- Time series ---

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeSeriesPoint {
    pub elapsed_secs: f64,
    pub requests: u64,
    pub errors: u64,
    pub data_transferred_kb: f64,
    pub throughput: Throughput,
}

/// Samples re-based to seconds since the first one.
pub fn normalize_time_series(samples: &[TimeSeriesSample]) -> Vec<TimeSeriesPoint> {
    let Some(first) = samples.first() else {
        return Vec::new();
    };
    samples
        .iter()
        .map(|sample| TimeSeriesPoint {
            elapsed_secs: (sample.timestamp - first.timestamp)
                .num_milliseconds() as f64
                / 1000.0,
            requests: sample.requests,
            errors: sample.errors,
            data_transferred_kb: sample.data_transferred_kb,
            throughput: format_throughput(sample.throughput_mbps),
        })
        .collect()
}

// --- Errors ---

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorShare {
    pub kind: String,
    pub count: u64,
    pub percent: f64,
}

/// Error kinds by count (descending, then name) with their share of all errors.
pub fn error_breakdown(errors: &ErrorCounts) -> Vec<ErrorShare> {
    let total = errors.total();
    let mut shares: Vec<ErrorShare> = errors
        .0
        .iter()
        .map(|(kind, &count)| ErrorShare {
            kind: kind.clone(),
            count,
            percent: if total == 0 {
                0.0
            } else {
                count as f64 * 100.0 / total as f64
            },
        })
        .collect();
    shares.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.kind.cmp(&b.kind)));
    shares
}

// --- Full analysis ---

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryView {
    pub test_id: Option<String>,
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub timestamp: DateTime<FixedOffset>,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Percentage of requests that succeeded.
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
    pub avg_throughput: Throughput,
    pub peak_throughput: Throughput,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportAnalysis {
    pub summary: SummaryView,
    pub histogram: Histogram,
    pub slowest_requests: Vec<SlowRequest>,
    pub percentiles: Percentiles,
    pub time_series: Vec<TimeSeriesPoint>,
    pub errors: Vec<ErrorShare>,
}

pub fn analyze(report: &ReportDocument) -> ReportAnalysis {
    analyze_with_bins(report, DEFAULT_HISTOGRAM_BINS)
}

pub fn analyze_with_bins(report: &ReportDocument, bin_count: usize) -> ReportAnalysis {
    let summary = &report.summary;
    let success_rate = if summary.total_requests == 0 {
        0.0
    } else {
        summary.successful_requests as f64 * 100.0 / summary.total_requests as f64
    };

    ReportAnalysis {
        summary: SummaryView {
            test_id: report.config.test_id.clone(),
            protocol: report.config.protocol.clone(),
            host: report.config.host.clone(),
            port: report.config.port,
            timestamp: report.timestamp,
            total_requests: summary.total_requests,
            successful_requests: summary.successful_requests,
            failed_requests: summary.failed_requests,
            success_rate,
            avg_latency_ms: summary.avg_latency_ms,
            min_latency_ms: summary.min_latency_ms,
            max_latency_ms: summary.max_latency_ms,
            avg_throughput: format_throughput(summary.avg_throughput_mbps),
            peak_throughput: format_throughput(summary.peak_throughput_mbps),
        },
        histogram: histogram(&report.latencies, bin_count),
        slowest_requests: slowest_requests(&report.latencies, SLOW_REQUEST_LIMIT),
        percentiles: percentiles(&report.latencies)
            .unwrap_or_else(|| summary.percentiles.clone()),
        time_series: normalize_time_series(&report.time_series),
        errors: error_breakdown(&report.errors),
    }
}
