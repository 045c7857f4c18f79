//! Optional metrics collected and aggregated during load tests.
//!
//! Every request issued by a [`VirtualUser`](../user/struct.VirtualUser.html) produces exactly
//! one [`RequestOutcome`], which is recorded into the shared [`Aggregator`]. The aggregator is
//! split into one mutex-protected shard per virtual user, so recording never waits on other
//! users. At the end of a run [`Aggregator::snapshot`] merges all shards into an
//! [`AggregateStats`], which can be displayed directly or rendered by the
//! [`report`](../report/index.html) module.
//!
//! Latencies are stored in milliseconds in a rounded map to bound memory use:
//!  - latencies below 100ms are stored without any rounding;
//!  - latencies between 100 and 500ms are rounded to the nearest 10ms;
//!  - latencies between 500 and 1000ms are rounded to the nearest 100ms;
//!  - larger latencies are rounded to the nearest 1000ms.
//!
//! Cumulative latency buckets are counted separately with microsecond precision, both for
//! all requests and for each status code. Requests that never received a response are
//! bucketed under status code 0.

use chrono::{DateTime, Local};
use itertools::Itertools;
use num_format::{Locale, ToFormattedString};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::plan::HttpMethod;
use crate::util;

/// Upper bounds (in milliseconds) of the default cumulative latency buckets.
pub const DEFAULT_HISTOGRAM_BUCKETS: [f64; 21] = [
    0.5, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0, 12.0, 15.0, 20.0, 30.0, 40.0, 50.0,
    70.0, 100.0, 500.0, 1000.0,
];

/// Percentiles displayed in the final report, with their labels.
pub const REPORT_PERCENTILES: [(f32, &str); 7] = [
    (0.5, "50"),
    (0.75, "75"),
    (0.9, "90"),
    (0.95, "95"),
    (0.98, "98"),
    (0.99, "99"),
    (0.999, "99.9"),
];

/// Why a request produced no HTTP response.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub enum RequestErrorKind {
    /// The request did not complete within the configured timeout.
    Timeout,
    /// The server actively refused the connection.
    ConnectionRefused,
    /// The host name could not be resolved.
    Dns,
    /// The TLS handshake failed.
    Tls,
    /// Any other failure to connect.
    Connect,
    /// Any other transport failure.
    Other,
}
impl fmt::Display for RequestErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let description = match self {
            RequestErrorKind::Timeout => "timeout",
            RequestErrorKind::ConnectionRefused => "connection refused",
            RequestErrorKind::Dns => "dns error",
            RequestErrorKind::Tls => "tls error",
            RequestErrorKind::Connect => "connect error",
            RequestErrorKind::Other => "other error",
        };
        write!(f, "{}", description)
    }
}

/// Result of a single request: either the HTTP status returned by the server, or the
/// reason no response was received.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum RequestStatus {
    Response(u16),
    Error(RequestErrorKind),
}
impl RequestStatus {
    /// The HTTP status code, or 0 if no response was received.
    pub fn status_code(&self) -> u16 {
        match self {
            RequestStatus::Response(status_code) => *status_code,
            RequestStatus::Error(_) => 0,
        }
    }
}

/// The per-request record fed to the [`Aggregator`], and optionally to the request log.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct RequestOutcome {
    /// How many milliseconds the load test had been running when the request started.
    pub elapsed: u64,
    /// Which virtual user made the request.
    pub vu_id: usize,
    /// The virtual user's iteration that made the request.
    pub iteration: usize,
    /// The method used.
    pub method: HttpMethod,
    /// The name of the request plan, used to group metrics.
    pub name: String,
    /// The fully rendered url that was requested.
    pub url: String,
    /// How long the request took, in microseconds.
    pub duration_micros: u64,
    /// The status returned, or the error that prevented a response.
    pub status: RequestStatus,
    /// How many bytes of body were received.
    pub bytes_received: u64,
}
impl RequestOutcome {
    /// Latency in whole milliseconds.
    pub fn latency_ms(&self) -> u64 {
        self.duration_micros / 1_000
    }

    /// Whether a 2xx response was received.
    pub fn success(&self) -> bool {
        matches!(self.status, RequestStatus::Response(code) if (200..300).contains(&code))
    }

    /// Header line matching [`RequestOutcome::csv_row`].
    pub fn csv_header() -> &'static str {
        "elapsed,vu_id,iteration,method,name,url,duration_micros,status_code,error,bytes_received"
    }

    /// Format this outcome as one line of csv.
    pub fn csv_row(&self) -> String {
        let error = match self.status {
            RequestStatus::Response(_) => "".to_string(),
            RequestStatus::Error(kind) => format!("{:?}", kind),
        };
        format!(
            "{},{},{},{},{},{},{},{},{},{}",
            self.elapsed,
            self.vu_id,
            self.iteration,
            self.method,
            csv_escape(&self.name),
            csv_escape(&self.url),
            self.duration_micros,
            self.status.status_code(),
            error,
            self.bytes_received,
        )
    }
}

// Quote a csv field if it contains a delimiter, a quote or a line break.
fn csv_escape(field: &str) -> String {
    if field.contains(|c| c == ',' || c == '"' || c == '\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Metrics collected about all requests sharing a name.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct RequestAggregate {
    /// Rounded latency in milliseconds, and how many times it was seen.
    pub latencies: BTreeMap<usize, usize>,
    /// The fastest latency seen, in milliseconds. Not rounded.
    pub min_latency: usize,
    /// The slowest latency seen, in milliseconds. Not rounded.
    pub max_latency: usize,
    /// Total of all latencies seen, in microseconds.
    pub total_latency_micros: u64,
    /// How many latencies have been recorded.
    pub latency_counter: usize,
    /// Responses with a 2xx status code.
    pub success_count: usize,
    /// Responses with any other status code.
    pub fail_count: usize,
    /// Requests that never received a response.
    pub error_count: usize,
    /// Per-status-code counters.
    pub status_code_counts: BTreeMap<u16, usize>,
    /// Per-error-kind counters.
    pub error_counts: BTreeMap<RequestErrorKind, usize>,
    /// Total bytes of body received.
    pub bytes_received: u64,
    /// Non-cumulative counts per latency bucket, the last entry is the +Inf bucket.
    pub bucket_counts: Vec<usize>,
    /// Non-cumulative latency bucket counts for each status code, 0 for errors.
    #[serde(default)]
    pub status_bucket_counts: BTreeMap<u16, Vec<usize>>,
}
impl RequestAggregate {
    /// Create a new empty aggregate with room for `buckets` upper bounds plus +Inf.
    pub(crate) fn new(buckets: usize) -> Self {
        RequestAggregate {
            bucket_counts: vec![0; buckets + 1],
            ..Default::default()
        }
    }

    /// Total number of requests recorded.
    pub fn count(&self) -> usize {
        self.success_count
            .saturating_add(self.fail_count)
            .saturating_add(self.error_count)
    }

    /// Record a single outcome. Returns the number of counters that overflowed.
    pub(crate) fn record(&mut self, outcome: &RequestOutcome, bucket_bounds: &[f64]) -> usize {
        let mut overflows = 0;
        let latency = outcome.latency_ms() as usize;

        // Update minimum if this one is fastest yet, or the first one.
        self.min_latency = update_min_time(self.min_latency, self.latency_counter == 0, latency);
        // Update maximum if this one is slowest yet.
        self.max_latency = update_max_time(self.max_latency, latency);

        match self.total_latency_micros.checked_add(outcome.duration_micros) {
            Some(total) => self.total_latency_micros = total,
            None => {
                warn!("total latency counter overflowed, saturating");
                self.total_latency_micros = u64::MAX;
                overflows += 1;
            }
        }
        overflows += increment(&mut self.latency_counter, "latency counter");

        let rounded_latency = round_latency(latency);
        overflows += increment(
            self.latencies.entry(rounded_latency).or_insert(0),
            "latency map",
        );

        // Buckets hold the first bound the latency fits within, made cumulative on read.
        let latency_ms = outcome.duration_micros as f64 / 1_000.0;
        let bucket = bucket_bounds
            .iter()
            .position(|bound| latency_ms <= *bound)
            .unwrap_or(bucket_bounds.len());
        if self.bucket_counts.len() <= bucket {
            self.bucket_counts.resize(bucket_bounds.len() + 1, 0);
        }
        overflows += increment(&mut self.bucket_counts[bucket], "latency bucket");
        let status_buckets = self
            .status_bucket_counts
            .entry(outcome.status.status_code())
            .or_insert_with(|| vec![0; bucket_bounds.len() + 1]);
        if status_buckets.len() <= bucket {
            status_buckets.resize(bucket_bounds.len() + 1, 0);
        }
        overflows += increment(&mut status_buckets[bucket], "status latency bucket");

        match outcome.status {
            RequestStatus::Response(status_code) => {
                if outcome.success() {
                    overflows += increment(&mut self.success_count, "success counter");
                } else {
                    overflows += increment(&mut self.fail_count, "fail counter");
                }
                overflows += increment(
                    self.status_code_counts.entry(status_code).or_insert(0),
                    "status code counter",
                );
            }
            RequestStatus::Error(kind) => {
                overflows += increment(&mut self.error_count, "error counter");
                overflows += increment(
                    self.error_counts.entry(kind).or_insert(0),
                    "error kind counter",
                );
            }
        }

        match self.bytes_received.checked_add(outcome.bytes_received) {
            Some(total) => self.bytes_received = total,
            None => {
                warn!("bytes received counter overflowed, saturating");
                self.bytes_received = u64::MAX;
                overflows += 1;
            }
        }

        overflows
    }

    /// Merge another aggregate into this one. Returns the number of counters that overflowed.
    pub(crate) fn merge(&mut self, other: &RequestAggregate) -> usize {
        let mut overflows = 0;
        self.latencies = merge_times(std::mem::take(&mut self.latencies), &other.latencies);
        // An empty aggregate has no min or max latency to merge.
        if other.latency_counter > 0 {
            self.min_latency =
                update_min_time(self.min_latency, self.latency_counter == 0, other.min_latency);
            self.max_latency = update_max_time(self.max_latency, other.max_latency);
        }
        self.total_latency_micros = self
            .total_latency_micros
            .checked_add(other.total_latency_micros)
            .unwrap_or_else(|| {
                overflows += 1;
                u64::MAX
            });
        overflows += add(&mut self.latency_counter, other.latency_counter);
        overflows += add(&mut self.success_count, other.success_count);
        overflows += add(&mut self.fail_count, other.fail_count);
        overflows += add(&mut self.error_count, other.error_count);
        for (status_code, count) in &other.status_code_counts {
            overflows += add(self.status_code_counts.entry(*status_code).or_insert(0), *count);
        }
        for (kind, count) in &other.error_counts {
            overflows += add(self.error_counts.entry(*kind).or_insert(0), *count);
        }
        self.bytes_received = self
            .bytes_received
            .checked_add(other.bytes_received)
            .unwrap_or_else(|| {
                overflows += 1;
                u64::MAX
            });
        overflows += merge_buckets(&mut self.bucket_counts, &other.bucket_counts);
        for (status_code, counts) in &other.status_bucket_counts {
            overflows += merge_buckets(
                self.status_bucket_counts.entry(*status_code).or_default(),
                counts,
            );
        }
        if overflows > 0 {
            warn!("{} counters overflowed while merging metrics", overflows);
        }
        overflows
    }

    /// Average latency in milliseconds.
    pub fn mean_latency(&self) -> f32 {
        if self.latency_counter == 0 {
            0.0
        } else {
            (self.total_latency_micros as f64 / self.latency_counter as f64 / 1_000.0) as f32
        }
    }

    /// Median latency in milliseconds.
    pub fn median_latency(&self) -> usize {
        util::median(
            &self.latencies,
            self.latency_counter,
            self.min_latency,
            self.max_latency,
        )
    }

    /// Latency in milliseconds that `percent` of the requests finished within.
    pub fn percentile(&self, percent: f32) -> usize {
        calculate_latency_percentile(
            &self.latencies,
            self.latency_counter,
            self.min_latency,
            self.max_latency,
            percent,
        )
    }
}

// Increment a counter by one, saturating on overflow. Returns 1 if the counter overflowed.
fn increment(counter: &mut usize, what: &str) -> usize {
    match counter.checked_add(1) {
        Some(value) => {
            *counter = value;
            0
        }
        None => {
            warn!("{} overflowed, saturating", what);
            *counter = usize::MAX;
            1
        }
    }
}

// Add to a counter, saturating on overflow. Returns 1 if the counter overflowed.
fn merge_buckets(buckets: &mut Vec<usize>, other: &[usize]) -> usize {
    if buckets.len() < other.len() {
        buckets.resize(other.len(), 0);
    }
    other
        .iter()
        .zip(buckets.iter_mut())
        .map(|(count, bucket)| add(bucket, *count))
        .sum()
}

fn add(counter: &mut usize, value: usize) -> usize {
    match counter.checked_add(value) {
        Some(total) => {
            *counter = total;
            0
        }
        None => {
            *counter = usize::MAX;
            1
        }
    }
}

/// Round a latency so similar values share a counter.
pub(crate) fn round_latency(latency: usize) -> usize {
    // No rounding for 1-100ms latencies.
    if latency < 100 {
        latency
    }
    // Round to nearest 10 for 100-500ms latencies.
    else if latency < 500 {
        ((latency as f64 / 10.0).round() * 10.0) as usize
    }
    // Round to nearest 100 for 500-1000ms latencies.
    else if latency < 1000 {
        ((latency as f64 / 100.0).round() * 100.0) as usize
    }
    // Round to nearest 1000 for all larger latencies.
    else {
        ((latency as f64 / 1000.0).round() * 1000.0) as usize
    }
}

/// A consistent, merged view of all metrics recorded during a load test.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AggregateStats {
    /// Metrics for each request name.
    pub requests: BTreeMap<String, RequestAggregate>,
    /// All request names merged together.
    pub total: RequestAggregate,
    /// Upper bounds of the cumulative latency buckets, in milliseconds.
    pub bucket_bounds: Vec<f64>,
    /// How many counters saturated instead of overflowing.
    pub aggregation_errors: usize,
    /// How many request log lines were dropped because the logger fell behind.
    pub dropped_log_lines: usize,
    /// How many virtual users ran.
    pub vus: usize,
    /// How long the load test ran.
    pub duration: Duration,
    /// When the load test started.
    pub started: Option<DateTime<Local>>,
    /// When the load test stopped.
    pub stopped: Option<DateTime<Local>>,
}
impl AggregateStats {
    /// Total number of requests recorded.
    pub fn count(&self) -> usize {
        self.total.count()
    }

    /// Requests that never received a response.
    pub fn error_count(&self) -> usize {
        self.total.error_count
    }

    /// Responses with a non-2xx status code.
    pub fn fail_count(&self) -> usize {
        self.total.fail_count
    }

    /// Fraction of requests that never received a response.
    pub fn error_rate(&self) -> f64 {
        if self.count() == 0 {
            0.0
        } else {
            self.error_count() as f64 / self.count() as f64
        }
    }

    /// Fastest latency in milliseconds.
    pub fn min_latency(&self) -> usize {
        self.total.min_latency
    }

    /// Slowest latency in milliseconds.
    pub fn max_latency(&self) -> usize {
        self.total.max_latency
    }

    /// Requests and fails per second over the run.
    pub fn per_second(&self) -> (f32, f32) {
        per_second_calculations(
            self.duration,
            self.count(),
            self.total.fail_count + self.total.error_count,
        )
    }

    /// Cumulative counts for each bucket bound, ending with the +Inf bucket (`None`).
    pub fn cumulative_buckets(&self) -> Vec<(Option<f64>, usize)> {
        self.cumulate(&self.total.bucket_counts)
    }

    /// Cumulative bucket counts for each status code, status code 0 holding requests
    /// that never received a response.
    pub fn status_buckets(&self) -> BTreeMap<u16, Vec<(Option<f64>, usize)>> {
        self.total
            .status_bucket_counts
            .iter()
            .map(|(status_code, counts)| (*status_code, self.cumulate(counts)))
            .collect()
    }

    /// Sum of all latencies in milliseconds, matching the +Inf bucket count.
    pub fn latency_sum_ms(&self) -> f64 {
        self.total.total_latency_micros as f64 / 1_000.0
    }

    fn cumulate(&self, counts: &[usize]) -> Vec<(Option<f64>, usize)> {
        let mut cumulative = 0usize;
        let mut buckets = Vec::with_capacity(self.bucket_bounds.len() + 1);
        for (index, bound) in self
            .bucket_bounds
            .iter()
            .map(|bound| Some(*bound))
            .chain(std::iter::once(None))
            .enumerate()
        {
            cumulative = cumulative.saturating_add(counts.get(index).copied().unwrap_or(0));
            buckets.push((bound, cumulative));
        }
        buckets
    }

    /// Optionally prepares a table of requests and fails.
    pub(crate) fn fmt_requests(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        // If there's nothing to display, exit immediately.
        if self.requests.is_empty() {
            return Ok(());
        }

        writeln!(
            fmt,
            "\n === PER REQUEST METRICS ===\n ------------------------------------------------------------------------------"
        )?;
        writeln!(
            fmt,
            " {:<24} | {:>13} | {:>14} | {:>8} | {:>7}",
            "Name", "# reqs", "# fails", "req/s", "fail/s"
        )?;
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        for (name, request) in self.requests.iter() {
            self.fmt_request_row(fmt, name, request)?;
        }
        if self.requests.len() > 1 {
            writeln!(
                fmt,
                " -------------------------+---------------+----------------+----------+--------"
            )?;
            self.fmt_request_row(fmt, "Aggregated", &self.total)?;
        }
        Ok(())
    }

    fn fmt_request_row(
        &self,
        fmt: &mut fmt::Formatter<'_>,
        name: &str,
        request: &RequestAggregate,
    ) -> fmt::Result {
        let total_count = request.count();
        let fail_count = request.fail_count + request.error_count;
        let fail_percent = if fail_count > 0 {
            fail_count as f32 / total_count as f32 * 100.0
        } else {
            0.0
        };
        let (reqs, fails) = per_second_calculations(self.duration, total_count, fail_count);
        let reqs_precision = determine_precision(reqs);
        let fails_precision = determine_precision(fails);
        // Compress 100.0 and 0.0 to 100 and 0 respectively to save width.
        let fails_column = if fail_percent as usize == 100 || fail_percent as usize == 0 {
            format!("{} ({}%)", format_number(fail_count), fail_percent as usize)
        } else {
            format!("{} ({:.1}%)", format_number(fail_count), fail_percent)
        };
        writeln!(
            fmt,
            " {:<24} | {:>13} | {:>14} | {:>8.reqs_p$} | {:>7.fails_p$}",
            util::truncate_string(name, 24),
            format_number(total_count),
            fails_column,
            reqs,
            fails,
            reqs_p = reqs_precision,
            fails_p = fails_precision,
        )
    }

    /// Optionally prepares a table of latencies.
    pub(crate) fn fmt_latencies(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.requests.is_empty() {
            return Ok(());
        }

        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        writeln!(
            fmt,
            " {:<24} | {:>11} | {:>10} | {:>11} | {:>10}",
            "Name", "Avg (ms)", "Min", "Max", "Median"
        )?;
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        let mut rows: Vec<(&str, &RequestAggregate)> = self
            .requests
            .iter()
            .map(|(name, request)| (name.as_str(), request))
            .collect();
        if self.requests.len() > 1 {
            rows.push(("Aggregated", &self.total));
        }
        for (index, (name, request)) in rows.iter().enumerate() {
            if self.requests.len() > 1 && index == self.requests.len() {
                writeln!(
                    fmt,
                    " -------------------------+-------------+------------+-------------+-----------"
                )?;
            }
            let average = request.mean_latency();
            writeln!(
                fmt,
                " {:<24} | {:>11.avg_p$} | {:>10} | {:>11} | {:>10}",
                util::truncate_string(name, 24),
                average,
                format_number(request.min_latency),
                format_number(request.max_latency),
                format_number(request.median_latency()),
                avg_p = determine_precision(average),
            )?;
        }
        Ok(())
    }

    /// Optionally prepares a table of slowest latencies within several percentiles.
    pub(crate) fn fmt_percentiles(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.requests.is_empty() {
            return Ok(());
        }

        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        writeln!(
            fmt,
            " Slowest page load within specified percentile of requests (in ms):"
        )?;
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        write!(fmt, " {:<24}", "Name")?;
        for (_, label) in REPORT_PERCENTILES.iter() {
            write!(fmt, " | {:>5}", format!("{}%", label))?;
        }
        writeln!(fmt)?;
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        for (name, request) in self.requests.iter() {
            fmt_percentile_row(fmt, name, request)?;
        }
        if self.requests.len() > 1 {
            writeln!(
                fmt,
                " -------------------------+-------+-------+-------+-------+-------+-------+------"
            )?;
            fmt_percentile_row(fmt, "Aggregated", &self.total)?;
        }
        Ok(())
    }

    /// Optionally prepares a table of status codes.
    pub(crate) fn fmt_status_codes(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.total.status_code_counts.is_empty() {
            return Ok(());
        }
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        writeln!(fmt, " {:<24} | {:>51} ", "Name", "Status codes")?;
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        for (name, request) in self.requests.iter() {
            if request.status_code_counts.is_empty() {
                continue;
            }
            writeln!(
                fmt,
                " {:<24} | {:>51}",
                util::truncate_string(name, 24),
                prepare_status_codes(&request.status_code_counts),
            )?;
        }
        if self.requests.len() > 1 {
            writeln!(
                fmt,
                " -------------------------+----------------------------------------------------"
            )?;
            writeln!(
                fmt,
                " {:<24} | {:>51} ",
                "Aggregated",
                prepare_status_codes(&self.total.status_code_counts)
            )?;
        }
        Ok(())
    }

    /// Optionally prepares a table of errors.
    pub(crate) fn fmt_errors(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.total.error_counts.is_empty() {
            return Ok(());
        }
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        writeln!(fmt, " {:<24} | {:>13} | Error", "Name", "#")?;
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        for (name, request) in self.requests.iter() {
            for (kind, count) in request.error_counts.iter() {
                writeln!(
                    fmt,
                    " {:<24} | {:>13} | {}",
                    util::truncate_string(name, 24),
                    format_number(*count),
                    kind
                )?;
            }
        }
        Ok(())
    }

    /// Optionally prepares a table of cumulative latency buckets.
    pub(crate) fn fmt_buckets(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.count() == 0 {
            return Ok(());
        }
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        let status_buckets = self.status_buckets();
        write!(fmt, " {:<24} | {:>13} | {:>8}", "Latency <= (ms)", "# reqs", "%")?;
        for status_code in status_buckets.keys() {
            write!(fmt, " | {:>7}", status_label(*status_code))?;
        }
        writeln!(fmt)?;
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        let count = self.count();
        for (index, (bound, cumulative)) in self.cumulative_buckets().into_iter().enumerate() {
            let label = match bound {
                Some(bound) => format!("{}", bound),
                None => "+Inf".to_string(),
            };
            write!(
                fmt,
                " {:<24} | {:>13} | {:>8.2}",
                label,
                format_number(cumulative),
                cumulative as f32 / count as f32 * 100.0,
            )?;
            for buckets in status_buckets.values() {
                let cumulative = buckets.get(index).map_or(0, |(_, count)| *count);
                write!(fmt, " | {:>7}", format_number(cumulative))?;
            }
            writeln!(fmt)?;
        }
        writeln!(
            fmt,
            " Latency sum: {:.3} ms, count: {}",
            self.latency_sum_ms(),
            format_number(self.total.latency_counter)
        )?;
        Ok(())
    }

    /// Prepares an overview of the run.
    pub(crate) fn fmt_overview(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            fmt,
            "\n === OVERVIEW ===\n ------------------------------------------------------------------------------"
        )?;
        writeln!(fmt, " Virtual users: {}", format_number(self.vus))?;
        writeln!(
            fmt,
            " Duration: {:.3} seconds",
            self.duration.as_secs_f64()
        )?;
        if let (Some(started), Some(stopped)) = (self.started, self.stopped) {
            writeln!(
                fmt,
                " Started: {}, stopped: {}",
                started.format("%y-%m-%d %H:%M:%S"),
                stopped.format("%y-%m-%d %H:%M:%S")
            )?;
        }
        let (reqs, fails) = self.per_second();
        writeln!(
            fmt,
            " Requests: {} ({:.2}/s), fails: {}, errors: {} ({:.2}/s)",
            format_number(self.count()),
            reqs,
            format_number(self.fail_count()),
            format_number(self.error_count()),
            fails,
        )?;
        writeln!(
            fmt,
            " Bytes received: {}",
            format_number(self.total.bytes_received as usize)
        )?;
        if self.aggregation_errors > 0 || self.dropped_log_lines > 0 {
            writeln!(
                fmt,
                " Aggregation errors: {}, dropped request log lines: {}",
                format_number(self.aggregation_errors),
                format_number(self.dropped_log_lines),
            )?;
        }
        Ok(())
    }
}

// Requests without a response are bucketed under status code 0.
fn status_label(status_code: u16) -> String {
    match status_code {
        0 => "error".to_string(),
        _ => status_code.to_string(),
    }
}

fn fmt_percentile_row(
    fmt: &mut fmt::Formatter<'_>,
    name: &str,
    request: &RequestAggregate,
) -> fmt::Result {
    write!(fmt, " {:<24}", util::truncate_string(name, 24))?;
    for (percent, _) in REPORT_PERCENTILES.iter() {
        write!(fmt, " | {:>5}", format_number(request.percentile(*percent)))?;
    }
    writeln!(fmt)
}

/// Implement format trait to allow displaying metrics.
impl fmt::Display for AggregateStats {
    // Implement display of metrics with `{}` marker.
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        self.fmt_overview(fmt)?;
        self.fmt_requests(fmt)?;
        self.fmt_latencies(fmt)?;
        self.fmt_percentiles(fmt)?;
        self.fmt_status_codes(fmt)?;
        self.fmt_errors(fmt)?;
        self.fmt_buckets(fmt)?;

        Ok(())
    }
}

impl Serialize for AggregateStats {
    // Serialize the timestamps as strings and the duration as seconds.
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut s = serializer.serialize_struct("AggregateStats", 15)?;
        s.serialize_field("vus", &self.vus)?;
        s.serialize_field("duration", &self.duration.as_secs_f64())?;
        s.serialize_field("started", &self.started.map(|t| t.to_rfc3339()))?;
        s.serialize_field("stopped", &self.stopped.map(|t| t.to_rfc3339()))?;
        s.serialize_field("count", &self.count())?;
        s.serialize_field("error_count", &self.error_count())?;
        s.serialize_field("fail_count", &self.fail_count())?;
        s.serialize_field("error_rate", &self.error_rate())?;
        let percentiles: BTreeMap<String, usize> = REPORT_PERCENTILES
            .iter()
            .map(|(percent, label)| (format!("p{}", label), self.total.percentile(*percent)))
            .collect();
        s.serialize_field("percentiles", &percentiles)?;
        s.serialize_field("buckets", &bucket_labels(self.cumulative_buckets()))?;
        let status_buckets: BTreeMap<u16, Vec<(String, usize)>> = self
            .status_buckets()
            .into_iter()
            .map(|(status_code, buckets)| (status_code, bucket_labels(buckets)))
            .collect();
        s.serialize_field("status_buckets", &status_buckets)?;
        s.serialize_field("latency_sum_ms", &self.latency_sum_ms())?;
        s.serialize_field("latency_count", &self.total.latency_counter)?;
        s.serialize_field("total", &self.total)?;
        s.serialize_field("requests", &self.requests)?;
        s.serialize_field("aggregation_errors", &self.aggregation_errors)?;
        s.serialize_field("dropped_log_lines", &self.dropped_log_lines)?;
        s.end()
    }
}

// Label each bucket with its bound, or +Inf.
fn bucket_labels(buckets: Vec<(Option<f64>, usize)>) -> Vec<(String, usize)> {
    buckets
        .into_iter()
        .map(|(bound, count)| {
            (
                bound.map_or_else(|| "+Inf".to_string(), |b| b.to_string()),
                count,
            )
        })
        .collect()
}

#[derive(Default)]
struct Shard {
    requests: BTreeMap<String, RequestAggregate>,
    aggregation_errors: usize,
}

/// Collects [`RequestOutcome`]s from all virtual users.
///
/// One shard exists per virtual user, each behind its own mutex, so a virtual user only
/// ever contends with [`Aggregator::snapshot`].
pub struct Aggregator {
    shards: Vec<Mutex<Shard>>,
    bucket_bounds: Vec<f64>,
}
impl Aggregator {
    /// Create an aggregator with `shards` shards (at least one) and the given bucket bounds
    /// in milliseconds.
    pub fn new(shards: usize, mut bucket_bounds: Vec<f64>) -> Self {
        bucket_bounds.retain(|bound| bound.is_finite());
        bucket_bounds.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        bucket_bounds.dedup();
        Aggregator {
            shards: (0..shards.max(1))
                .map(|_| Mutex::new(Shard::default()))
                .collect(),
            bucket_bounds,
        }
    }

    /// The configured bucket bounds, sorted.
    pub fn bucket_bounds(&self) -> &[f64] {
        &self.bucket_bounds
    }

    fn lock(&self, index: usize) -> MutexGuard<'_, Shard> {
        match self.shards[index].lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("metrics shard {} was poisoned, recovering", index);
                poisoned.into_inner()
            }
        }
    }

    /// Record one outcome into the shard owned by its virtual user.
    pub fn record(&self, outcome: RequestOutcome) {
        let index = outcome.vu_id % self.shards.len();
        let bucket_bounds = &self.bucket_bounds;
        let mut shard = self.lock(index);
        let buckets = bucket_bounds.len();
        let overflows = shard
            .requests
            .entry(outcome.name.clone())
            .or_insert_with(|| RequestAggregate::new(buckets))
            .record(&outcome, bucket_bounds);
        if overflows > 0 {
            shard.aggregation_errors = shard.aggregation_errors.saturating_add(overflows);
        }
    }

    /// Merge all shards into a consistent view.
    ///
    /// All shards are locked in index order before merging, so the result reflects a single
    /// point in time.
    pub fn snapshot(&self) -> AggregateStats {
        let guards: Vec<MutexGuard<'_, Shard>> =
            (0..self.shards.len()).map(|index| self.lock(index)).collect();

        let buckets = self.bucket_bounds.len();
        let mut stats = AggregateStats {
            total: RequestAggregate::new(buckets),
            bucket_bounds: self.bucket_bounds.clone(),
            ..Default::default()
        };
        let mut overflows = 0;
        for shard in guards.iter() {
            stats.aggregation_errors = stats
                .aggregation_errors
                .saturating_add(shard.aggregation_errors);
            for (name, request) in shard.requests.iter() {
                overflows += stats
                    .requests
                    .entry(name.clone())
                    .or_insert_with(|| RequestAggregate::new(buckets))
                    .merge(request);
            }
        }
        drop(guards);

        for request in stats.requests.values() {
            overflows += stats.total.merge(request);
        }
        stats.aggregation_errors = stats.aggregation_errors.saturating_add(overflows);
        stats
    }
}

/// Helper to calculate requests and fails per seconds.
pub(crate) fn per_second_calculations(duration: Duration, total: usize, fail: usize) -> (f32, f32) {
    let seconds = duration.as_secs_f32();
    if seconds <= 0.0 {
        (0.0, 0.0)
    } else {
        (total as f32 / seconds, fail as f32 / seconds)
    }
}

fn determine_precision(value: f32) -> usize {
    if value < 1000.0 {
        2
    } else {
        0
    }
}

/// Format large number in locale appropriate style.
pub(crate) fn format_number(number: usize) -> String {
    (number).to_formatted_string(&Locale::en)
}

/// A helper function that merges together rounded latencies.
pub(crate) fn merge_times(
    mut global_latencies: BTreeMap<usize, usize>,
    local_latencies: &BTreeMap<usize, usize>,
) -> BTreeMap<usize, usize> {
    for (latency, count) in local_latencies {
        let counter = global_latencies.entry(*latency).or_insert(0);
        *counter = counter.saturating_add(*count);
    }
    global_latencies
}

/// A helper function to update the global minimum time based on local time.
///
/// Latencies under 1ms are recorded as 0, so `global_empty` says whether `global_min` is set.
pub(crate) fn update_min_time(global_min: usize, global_empty: bool, min: usize) -> usize {
    if global_empty || min < global_min {
        min
    } else {
        global_min
    }
}

/// A helper function to update the global maximum time based on local time.
pub(crate) fn update_max_time(mut global_max: usize, max: usize) -> usize {
    if global_max < max {
        global_max = max;
    }
    global_max
}

/// Get the latency that a certain number of percent of the requests finished within.
pub(crate) fn calculate_latency_percentile(
    latencies: &BTreeMap<usize, usize>,
    total_requests: usize,
    min: usize,
    max: usize,
    percent: f32,
) -> usize {
    let percentile_request = (total_requests as f32 * percent).round() as usize;
    trace!(
        "percentile: {}, request {} of total {}",
        percent,
        percentile_request,
        total_requests
    );

    let mut total_count: usize = 0;

    for (value, counter) in latencies {
        total_count += counter;
        if total_count >= percentile_request {
            if *value < min {
                return min;
            } else if *value > max {
                return max;
            } else {
                return *value;
            }
        }
    }
    0
}

/// Helper to format seen status codes.
pub(crate) fn prepare_status_codes(status_code_counts: &BTreeMap<u16, usize>) -> String {
    status_code_counts
        .iter()
        .map(|(status_code, count)| format!("{} [{}]", format_number(*count), status_code))
        .join(", ")
}

#[cfg(test)]
mod test {
    use super::*;

    fn outcome(vu_id: usize, name: &str, millis: u64, status: RequestStatus) -> RequestOutcome {
        RequestOutcome {
            elapsed: 0,
            vu_id,
            iteration: 0,
            method: HttpMethod::Get,
            name: name.to_string(),
            url: "http://localhost:8080/?rnd=1".to_string(),
            duration_micros: millis * 1_000,
            status,
            bytes_received: 10,
        }
    }

    #[test]
    fn max_latency() {
        let mut max_latency = 99;
        // Update max latency to a higher value.
        max_latency = update_max_time(max_latency, 101);
        assert_eq!(max_latency, 101);
        // Max latency doesn't update when updating with a lower value.
        max_latency = update_max_time(max_latency, 1);
        assert_eq!(max_latency, 101);
    }

    #[test]
    fn min_latency() {
        // The first latency is always the minimum, even 0.
        let mut min_latency = update_min_time(0, true, 11);
        assert_eq!(min_latency, 11);
        // Update min latency to a lower value.
        min_latency = update_min_time(min_latency, false, 9);
        assert_eq!(min_latency, 9);
        // Min latency doesn't update when updating with a higher value.
        min_latency = update_min_time(min_latency, false, 22);
        assert_eq!(min_latency, 9);
        // Sub-millisecond latencies are recorded as 0.
        min_latency = update_min_time(min_latency, false, 0);
        assert_eq!(min_latency, 0);
        assert_eq!(update_min_time(0, false, 5), 0);
    }

    #[test]
    fn sub_millisecond_latencies() {
        let aggregator = Aggregator::new(2, DEFAULT_HISTOGRAM_BUCKETS.to_vec());
        // The slow request lands in its own shard first.
        aggregator.record(outcome(1, "index", 5, RequestStatus::Response(200)));
        for _ in 0..9 {
            let mut fast = outcome(0, "index", 0, RequestStatus::Response(200));
            fast.duration_micros = 400;
            aggregator.record(fast);
        }

        let stats = aggregator.snapshot();
        assert_eq!(stats.count(), 10);
        assert_eq!(stats.min_latency(), 0);
        assert_eq!(stats.max_latency(), 5);
        assert_eq!(stats.total.median_latency(), 0);
        assert_eq!(stats.total.percentile(0.5), 0);
        assert_eq!(stats.total.percentile(0.9), 0);
        assert_eq!(stats.total.percentile(0.999), 5);
        assert_eq!(stats.requests["index"].min_latency, 0);
        // The average still counts every microsecond.
        assert!((stats.total.mean_latency() - 0.86).abs() < 0.001);
    }

    #[test]
    fn merge_skips_empty_aggregates() {
        let mut total = RequestAggregate::new(0);
        total.merge(&RequestAggregate::new(0));
        let mut slow = RequestAggregate::new(0);
        slow.record(&outcome(0, "index", 8, RequestStatus::Response(200)), &[]);
        total.merge(&slow);
        total.merge(&RequestAggregate::new(0));
        assert_eq!(total.min_latency, 8);
        assert_eq!(total.max_latency, 8);
    }

    #[test]
    fn rounding() {
        assert_eq!(round_latency(1), 1);
        assert_eq!(round_latency(99), 99);
        assert_eq!(round_latency(101), 100);
        assert_eq!(round_latency(105), 110);
        assert_eq!(round_latency(499), 500);
        assert_eq!(round_latency(549), 500);
        assert_eq!(round_latency(550), 600);
        assert_eq!(round_latency(1_400), 1_000);
        assert_eq!(round_latency(1_500), 2_000);
        assert_eq!(round_latency(12_345), 12_000);
    }

    #[test]
    fn latency_percentiles() {
        let mut latencies = BTreeMap::new();
        latencies.insert(1, 80);
        latencies.insert(5, 15);
        latencies.insert(200, 4);
        latencies.insert(1_000, 1);
        assert_eq!(calculate_latency_percentile(&latencies, 100, 1, 1_200, 0.5), 1);
        assert_eq!(calculate_latency_percentile(&latencies, 100, 1, 1_200, 0.9), 5);
        assert_eq!(calculate_latency_percentile(&latencies, 100, 1, 1_200, 0.98), 200);
        assert_eq!(
            calculate_latency_percentile(&latencies, 100, 1, 1_200, 0.999),
            1_000
        );
        // Rounded values are clamped to the real min and max.
        assert_eq!(calculate_latency_percentile(&latencies, 100, 2, 150, 0.5), 2);
        assert_eq!(calculate_latency_percentile(&latencies, 100, 2, 150, 0.99), 150);
        // Nothing recorded.
        assert_eq!(calculate_latency_percentile(&BTreeMap::new(), 0, 0, 0, 0.5), 0);
    }

    #[test]
    fn record_and_snapshot() {
        let aggregator = Aggregator::new(2, DEFAULT_HISTOGRAM_BUCKETS.to_vec());
        aggregator.record(outcome(0, "index", 3, RequestStatus::Response(200)));
        aggregator.record(outcome(1, "index", 7, RequestStatus::Response(200)));
        aggregator.record(outcome(2, "index", 250, RequestStatus::Response(500)));
        aggregator.record(outcome(
            3,
            "about",
            1,
            RequestStatus::Error(RequestErrorKind::ConnectionRefused),
        ));

        let stats = aggregator.snapshot();
        assert_eq!(stats.count(), 4);
        assert_eq!(stats.error_count(), 1);
        assert_eq!(stats.fail_count(), 1);
        assert_eq!(stats.total.success_count, 2);
        assert_eq!(stats.min_latency(), 1);
        assert_eq!(stats.max_latency(), 250);
        assert_eq!(stats.total.bytes_received, 40);
        assert_eq!(stats.requests.len(), 2);
        assert_eq!(stats.requests["index"].count(), 3);
        assert_eq!(stats.requests["about"].error_count, 1);
        assert_eq!(
            stats.total.error_counts[&RequestErrorKind::ConnectionRefused],
            1
        );
        assert_eq!(stats.total.status_code_counts[&200], 2);
        assert_eq!(stats.total.status_code_counts[&500], 1);
        assert_eq!(stats.aggregation_errors, 0);
        assert!((stats.error_rate() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn snapshot_is_idempotent() {
        let aggregator = Aggregator::new(3, DEFAULT_HISTOGRAM_BUCKETS.to_vec());
        for vu_id in 0..30 {
            aggregator.record(outcome(
                vu_id,
                "index",
                vu_id as u64,
                RequestStatus::Response(200),
            ));
        }
        let first = aggregator.snapshot();
        let second = aggregator.snapshot();
        assert_eq!(first, second);
        assert_eq!(first.count(), 30);
    }

    #[test]
    fn cumulative_buckets() {
        let aggregator = Aggregator::new(1, vec![10.0, 1.0, 100.0]);
        assert_eq!(aggregator.bucket_bounds(), &[1.0, 10.0, 100.0]);
        aggregator.record(outcome(0, "index", 0, RequestStatus::Response(200)));
        aggregator.record(outcome(0, "index", 1, RequestStatus::Response(200)));
        aggregator.record(outcome(0, "index", 5, RequestStatus::Response(200)));
        aggregator.record(outcome(0, "index", 50, RequestStatus::Response(200)));
        aggregator.record(outcome(0, "index", 5_000, RequestStatus::Response(200)));

        let buckets = aggregator.snapshot().cumulative_buckets();
        assert_eq!(
            buckets,
            vec![
                (Some(1.0), 2),
                (Some(10.0), 3),
                (Some(100.0), 4),
                (None, 5)
            ]
        );
    }

    #[test]
    fn status_buckets() {
        let aggregator = Aggregator::new(2, vec![1.0, 10.0]);
        aggregator.record(outcome(0, "index", 0, RequestStatus::Response(200)));
        aggregator.record(outcome(1, "index", 5, RequestStatus::Response(200)));
        aggregator.record(outcome(0, "missing", 5, RequestStatus::Response(404)));
        aggregator.record(outcome(1, "slow", 50, RequestStatus::Response(404)));
        aggregator.record(outcome(
            1,
            "slow",
            20,
            RequestStatus::Error(RequestErrorKind::Timeout),
        ));

        let stats = aggregator.snapshot();
        let status_buckets = stats.status_buckets();
        assert_eq!(status_buckets.keys().copied().collect::<Vec<_>>(), vec![0, 200, 404]);
        assert_eq!(
            status_buckets[&200],
            vec![(Some(1.0), 1), (Some(10.0), 2), (None, 2)]
        );
        assert_eq!(
            status_buckets[&404],
            vec![(Some(1.0), 0), (Some(10.0), 1), (None, 2)]
        );
        assert_eq!(
            status_buckets[&0],
            vec![(Some(1.0), 0), (Some(10.0), 0), (None, 1)]
        );

        // The +Inf buckets of all status codes add up to the count.
        let inf: usize = status_buckets.values().map(|b| b[2].1).sum();
        assert_eq!(inf, stats.total.latency_counter);
        assert_eq!(stats.latency_sum_ms(), 80.0);

        // Per-request aggregates only hold their own status codes.
        assert_eq!(
            stats.requests["slow"].status_bucket_counts.keys().copied().collect::<Vec<_>>(),
            vec![0, 404]
        );

        let text = format!("{}", stats);
        assert!(text.contains("error"));
        assert!(text.contains("Latency sum: 80.000 ms, count: 5"));

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["latency_count"], 5);
        assert_eq!(json["status_buckets"]["404"][1][1], 1);
    }

    #[test]
    fn counters_saturate() {
        let mut aggregate = RequestAggregate::new(0);
        aggregate.success_count = usize::MAX;
        let overflows = aggregate.record(&outcome(0, "index", 1, RequestStatus::Response(200)), &[]);
        assert_eq!(overflows, 1);
        assert_eq!(aggregate.success_count, usize::MAX);
    }

    #[test]
    fn status_codes() {
        let mut codes = BTreeMap::new();
        codes.insert(200, 1_500);
        codes.insert(404, 3);
        assert_eq!(prepare_status_codes(&codes), "1,500 [200], 3 [404]");
    }

    #[test]
    fn csv_rows() {
        let mut row = outcome(1, "with, comma", 2, RequestStatus::Response(200));
        row.iteration = 4;
        assert_eq!(
            row.csv_row(),
            "0,1,4,GET,\"with, comma\",http://localhost:8080/?rnd=1,2000,200,,10"
        );
        let row = outcome(0, "index", 2, RequestStatus::Error(RequestErrorKind::Timeout));
        assert!(row.csv_row().ends_with(",0,Timeout,10"));
    }

    #[test]
    fn display() {
        let aggregator = Aggregator::new(1, DEFAULT_HISTOGRAM_BUCKETS.to_vec());
        aggregator.record(outcome(0, "index", 3, RequestStatus::Response(200)));
        let mut stats = aggregator.snapshot();
        stats.vus = 2;
        stats.duration = Duration::from_secs(1);
        let text = format!("{}", stats);
        assert!(text.contains("=== OVERVIEW ==="));
        assert!(text.contains("=== PER REQUEST METRICS ==="));
        assert!(text.contains("Slowest page load within specified percentile"));
        assert!(text.contains("1 [200]"));
        assert!(text.contains("+Inf"));
    }
}
