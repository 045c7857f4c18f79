//! Functions and structures related to configuring a Flock load test.
//!
//! Flock can be configured programmatically with [`LoadTest::set_default`], from a JSON run
//! script loaded with `--script`, and at run time with command line options. Options set on
//! the command line take precedence over the run script, which takes precedence over
//! programmatic defaults, which take precedence over Flock's built-in defaults.
//!
//! A run script looks like:
//! ```json
//! {
//!   "vus": 2,
//!   "duration": "10s",
//!   "requests": [
//!     {"method": "GET", "url": "http://localhost:8080/?rnd={rnd}", "name": "index"}
//!   ]
//! }
//! ```
//!
//! [`LoadTest::set_default`]: ../struct.LoadTest.html#method.set_default

use gumdrop::Options;
use serde::{Deserialize, Serialize};
use simplelog::*;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::logger::LogFormat;
use crate::metrics::DEFAULT_HISTOGRAM_BUCKETS;
use crate::plan::PlanSpec;
use crate::report::ReportFormat;
use crate::util;
use crate::{FlockError, LoadTest};

/// Requests that take longer than this are recorded as timeouts, unless configured.
const DEFAULT_TIMEOUT: &str = "30s";
/// How long virtual users may keep running after the load test stops, unless configured.
const DEFAULT_GRACE_PERIOD: &str = "5s";

/// Runtime options available when launching a Flock load test.
///
/// Custom defaults can be programmatically set for most of these options using the
/// [`FlockDefaultType::set_default`] trait.
///
/// Flock leverages [`gumdrop`](https://docs.rs/gumdrop/) to derive the following parser:
/// ```text
/// Usage: flock [OPTIONS]
///
/// Flock is a minimal concurrent HTTP load testing engine.
///
/// Optional arguments:
///   -h, --help                  Displays this help
///   -V, --version               Prints version information
///   -l, --list                  Lists all request plans and exits
///
///   -u, --vus VUS               Sets concurrent virtual users (default: 1)
///   -t, --duration TIME         Stops load test after (250ms, 30s, 20m, 3h, 1h30m, etc)
///   -i, --iterations ITERATIONS Stops load test after this many iterations in total
///   --url URL                   Adds a GET request plan ({rnd}, {vu} and {iteration} are rendered)
///   -f, --script FILE           Loads vus, stop condition and request plans from a JSON file
///   --header "KEY: VALUE"       Adds a header to request plans defined with --url
///   --timeout TIME              Sets per-request timeout (default: 30s)
///   --grace-period TIME         Sets how long in-flight requests may finish (default: 5s)
///   --error-rate RATE           Asks the server to fail this fraction of requests with err=1
///
/// Reports:
///   --report-format FORMAT      Sets final report format (text, json)
///   --running-metrics TIME      How often to optionally print running metrics, in seconds
///   --histogram-buckets LIST    Sets latency bucket bounds in ms (0.5,1,2,...)
///
/// Logging:
///   -R, --request-log NAME      Sets request log file name
///   --request-format FORMAT     Sets request log format (json, csv, raw)
///   -G, --log-file NAME         Enables Flock log file and sets name
///   -g, --log-level             Increases Flock log level (-g, -gg, etc)
///   -q, --quiet                 Decreases Flock verbosity (-q, -qq, etc)
///   -v, --verbose               Increases Flock verbosity (-v, -vv, etc)
/// ```
#[derive(Options, Debug, Clone, Default, Serialize, Deserialize)]
#[options(
    help = r#"Flock is a minimal concurrent HTTP load testing engine.

The following runtime options are available when launching a Flock load test:"#
)]
pub struct FlockConfiguration {
    /// Displays this help
    #[options(short = "h")]
    pub help: bool,
    /// Prints version information
    #[options(short = "V")]
    pub version: bool,
    /// Lists all request plans and exits
    // Add a blank line after this option
    #[options(short = "l", help = "Lists all request plans and exits\n")]
    pub list: bool,

    /// Sets concurrent virtual users (default: 1)
    #[options(short = "u")]
    pub vus: Option<usize>,
    /// Stops load test after (250ms, 30s, 20m, 3h, 1h30m, etc)
    #[options(short = "t", meta = "TIME")]
    pub duration: String,
    /// Stops load test after this many iterations in total
    #[options(short = "i")]
    pub iterations: Option<usize>,
    /// Adds a GET request plan ({rnd}, {vu} and {iteration} are rendered)
    #[options(no_short, meta = "URL")]
    pub url: Vec<String>,
    /// Loads vus, stop condition and request plans from a JSON file
    #[options(short = "f", meta = "FILE")]
    pub script: String,
    /// Adds a header to request plans defined with --url
    #[options(no_short, meta = "\"KEY: VALUE\"")]
    pub header: Vec<String>,
    /// Sets per-request timeout (default: 30s)
    #[options(no_short, meta = "TIME")]
    pub timeout: String,
    /// Sets how long in-flight requests may finish (default: 5s)
    #[options(no_short, meta = "TIME")]
    pub grace_period: String,
    /// Asks the server to fail this fraction of requests with err=1
    #[options(
        no_short,
        meta = "RATE",
        // Add a blank line and then a 'Reports:' header after this option
        help = "Asks the server to fail this fraction of requests with err=1\n\nReports:"
    )]
    pub error_rate: Option<f32>,

    /// Sets final report format (text, json)
    #[options(no_short, meta = "FORMAT")]
    pub report_format: Option<ReportFormat>,
    /// How often to optionally print running metrics, in seconds
    #[options(no_short, meta = "TIME")]
    pub running_metrics: Option<usize>,
    /// Sets latency bucket bounds in ms (0.5,1,2,...)
    #[options(
        no_short,
        meta = "LIST",
        // Add a blank line and then a 'Logging:' header after this option
        help = "Sets latency bucket bounds in ms (0.5,1,2,...)\n\nLogging:"
    )]
    pub histogram_buckets: String,

    /// Sets request log file name
    #[options(short = "R", meta = "NAME")]
    pub request_log: String,
    /// Sets request log format (json, csv, raw)
    #[options(no_short, meta = "FORMAT")]
    pub request_format: Option<LogFormat>,
    /// Enables Flock log file and sets name
    #[options(short = "G", meta = "NAME")]
    pub log_file: String,
    /// Increases Flock log level (-g, -gg, etc)
    #[options(short = "g", count)]
    pub log_level: u8,
    /// Decreases Flock verbosity (-q, -qq, etc)
    #[options(count, short = "q", help = "Decreases Flock verbosity (-q, -qq, etc)")]
    pub quiet: u8,
    /// Increases Flock verbosity (-v, -vv, etc)
    #[options(count, short = "v", help = "Increases Flock verbosity (-v, -vv, etc)")]
    pub verbose: u8,
}

/// A load test loaded from a JSON run script with `--script`.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RunScript {
    pub vus: Option<usize>,
    pub duration: Option<String>,
    pub iterations: Option<usize>,
    pub timeout: Option<String>,
    pub grace_period: Option<String>,
    #[serde(default)]
    pub requests: Vec<PlanSpec>,
}
impl RunScript {
    /// Load and parse a run script.
    pub fn load(path: &str) -> Result<Self, FlockError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            error!("failed to read run script ({}): {}", path, e);
            FlockError::Io(e)
        })?;
        RunScript::from_json(&contents)
    }

    pub fn from_json(contents: &str) -> Result<Self, FlockError> {
        Ok(serde_json::from_str(contents)?)
    }
}

/// Optional default values for Flock run-time options.
///
/// These custom defaults can be configured using [`FlockDefaultType::set_default()`].
#[derive(Clone, Debug, Default)]
pub(crate) struct FlockDefaults {
    /// An optional default number of virtual users.
    pub vus: Option<usize>,
    /// An optional default run duration.
    pub duration: Option<String>,
    /// An optional default total number of iterations.
    pub iterations: Option<usize>,
    /// An optional default per-request timeout.
    pub timeout: Option<String>,
    /// An optional default grace period.
    pub grace_period: Option<String>,
    /// An optional default fault injection rate.
    pub error_rate: Option<f32>,
    /// An optional default report format.
    pub report_format: Option<ReportFormat>,
    /// An optional default for how often to print running metrics.
    pub running_metrics: Option<usize>,
    /// An optional default list of histogram bucket bounds.
    pub histogram_buckets: Option<String>,
    /// An optional default for the request log file name.
    pub request_log: Option<String>,
    /// An optional default for the request log format.
    pub request_format: Option<LogFormat>,
    /// An optional default for the Flock log file name.
    pub log_file: Option<String>,
    /// An optional default log level.
    pub log_level: Option<u8>,
    /// An optional default value for quiet level.
    pub quiet: Option<u8>,
    /// An optional default value for verbosity level.
    pub verbose: Option<u8>,
}

/// Defines all [`FlockConfiguration`] options that can be programmatically configured with
/// a custom default.
///
/// These custom defaults can be configured using [`FlockDefaultType::set_default()`].
#[derive(Debug)]
pub enum FlockDefault {
    /// An optional default number of virtual users.
    Vus,
    /// An optional default run duration (250ms, 30s, 20m, 3h, 1h30m, etc).
    Duration,
    /// An optional default total number of iterations.
    Iterations,
    /// An optional default per-request timeout.
    Timeout,
    /// An optional default grace period.
    GracePeriod,
    /// An optional default fault injection rate.
    ErrorRate,
    /// An optional default report format.
    ReportFormat,
    /// An optional default for how often to print running metrics, in seconds.
    RunningMetrics,
    /// An optional default list of histogram bucket bounds.
    HistogramBuckets,
    /// An optional default for the request log file name.
    RequestLog,
    /// An optional default for the request log format.
    RequestFormat,
    /// An optional default for the Flock log file name.
    LogFile,
    /// An optional default log level.
    LogLevel,
    /// An optional default value for quiet level.
    Quiet,
    /// An optional default value for verbosity level.
    Verbose,
}
impl FlockDefault {
    // The type of value each default expects, used in errors.
    fn expects(&self) -> &'static str {
        match self {
            FlockDefault::Vus
            | FlockDefault::Iterations
            | FlockDefault::RunningMetrics
            | FlockDefault::LogLevel
            | FlockDefault::Quiet
            | FlockDefault::Verbose => "usize",
            FlockDefault::Duration
            | FlockDefault::Timeout
            | FlockDefault::GracePeriod
            | FlockDefault::HistogramBuckets
            | FlockDefault::RequestLog
            | FlockDefault::LogFile => "&str",
            FlockDefault::ErrorRate => "f32",
            FlockDefault::ReportFormat => "ReportFormat",
            FlockDefault::RequestFormat => "LogFormat",
        }
    }

    fn wrong_type(&self, value: impl fmt::Debug, received: &str) -> FlockError {
        FlockError::InvalidOption {
            option: format!("FlockDefault::{:?}", self),
            value: format!("{:?}", value),
            detail: format!(
                "set_default(FlockDefault::{:?}, {:?}) expected {} value, received {}",
                self,
                value,
                self.expects(),
                received
            ),
        }
    }
}

pub trait FlockDefaultType<T> {
    /// Sets a [`FlockDefault`] to the provided value. The required type of each option
    /// is documented in [`FlockDefault`].
    ///
    /// # Example
    /// ```rust
    /// use flock::prelude::*;
    ///
    /// fn main() -> Result<(), FlockError> {
    ///     LoadTest::initialize_with_config(FlockConfiguration::default())?
    ///         // Simulate two virtual users.
    ///         .set_default(FlockDefault::Vus, 2)?
    ///         // Run for ten seconds.
    ///         .set_default(FlockDefault::Duration, "10s")?
    ///         // Log all requests made during the test to `flock-request.log`.
    ///         .set_default(FlockDefault::RequestLog, "flock-request.log")?;
    ///
    ///     Ok(())
    /// }
    /// ```
    fn set_default(self, key: FlockDefault, value: T) -> Result<Box<Self>, FlockError>;
}
impl FlockDefaultType<&str> for LoadTest {
    /// Sets [`FlockDefault`] to a [`&str`] value.
    fn set_default(mut self, key: FlockDefault, value: &str) -> Result<Box<Self>, FlockError> {
        match key {
            FlockDefault::Duration => self.defaults.duration = Some(value.to_string()),
            FlockDefault::Timeout => self.defaults.timeout = Some(value.to_string()),
            FlockDefault::GracePeriod => self.defaults.grace_period = Some(value.to_string()),
            FlockDefault::HistogramBuckets => {
                self.defaults.histogram_buckets = Some(value.to_string())
            }
            FlockDefault::RequestLog => self.defaults.request_log = Some(value.to_string()),
            FlockDefault::LogFile => self.defaults.log_file = Some(value.to_string()),
            // Otherwise display a helpful and explicit error.
            _ => return Err(key.wrong_type(value, "&str")),
        }
        Ok(Box::new(self))
    }
}
impl FlockDefaultType<usize> for LoadTest {
    /// Sets [`FlockDefault`] to a [`usize`] value.
    fn set_default(mut self, key: FlockDefault, value: usize) -> Result<Box<Self>, FlockError> {
        match key {
            FlockDefault::Vus => self.defaults.vus = Some(value),
            FlockDefault::Iterations => self.defaults.iterations = Some(value),
            FlockDefault::RunningMetrics => self.defaults.running_metrics = Some(value),
            FlockDefault::LogLevel => self.defaults.log_level = Some(value as u8),
            FlockDefault::Quiet => self.defaults.quiet = Some(value as u8),
            FlockDefault::Verbose => self.defaults.verbose = Some(value as u8),
            // Otherwise display a helpful and explicit error.
            _ => return Err(key.wrong_type(value, "usize")),
        }
        Ok(Box::new(self))
    }
}
impl FlockDefaultType<f32> for LoadTest {
    /// Sets [`FlockDefault`] to a [`f32`] value.
    fn set_default(mut self, key: FlockDefault, value: f32) -> Result<Box<Self>, FlockError> {
        match key {
            FlockDefault::ErrorRate => self.defaults.error_rate = Some(value),
            _ => return Err(key.wrong_type(value, "f32")),
        }
        Ok(Box::new(self))
    }
}
impl FlockDefaultType<ReportFormat> for LoadTest {
    /// Sets [`FlockDefault`] to a [`ReportFormat`] value.
    fn set_default(
        mut self,
        key: FlockDefault,
        value: ReportFormat,
    ) -> Result<Box<Self>, FlockError> {
        match key {
            FlockDefault::ReportFormat => self.defaults.report_format = Some(value),
            _ => return Err(key.wrong_type(value, "ReportFormat")),
        }
        Ok(Box::new(self))
    }
}
impl FlockDefaultType<LogFormat> for LoadTest {
    /// Sets [`FlockDefault`] to a [`LogFormat`] value.
    fn set_default(mut self, key: FlockDefault, value: LogFormat) -> Result<Box<Self>, FlockError> {
        match key {
            FlockDefault::RequestFormat => self.defaults.request_format = Some(value),
            _ => return Err(key.wrong_type(value, "LogFormat")),
        }
        Ok(Box::new(self))
    }
}

/// One source of a configuration value, in order of precedence.
pub(crate) struct FlockValue<'a, T> {
    /// The optional value to set.
    pub(crate) value: Option<T>,
    /// Filter using this value if true.
    pub(crate) filter: bool,
    /// An optional INFO level log message.
    pub(crate) message: &'a str,
}

/// Return the first unfiltered value that is set.
pub(crate) fn get_value<T: fmt::Debug>(values: Vec<FlockValue<T>>) -> Option<T> {
    for value in values {
        if let Some(v) = value.value {
            if value.filter {
                continue;
            } else {
                if !value.message.is_empty() {
                    info!("{} = {:?}", value.message, v)
                }
                return Some(v);
            }
        }
    }
    None
}

/// How a load test decides to stop.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum StopCondition {
    /// Stop after running for this long.
    Duration(Duration),
    /// Stop after this many iterations in total, across all virtual users.
    Iterations(usize),
}

/// The validated, immutable configuration a load test runs with.
#[derive(Clone, Debug, PartialEq)]
pub struct RunConfig {
    pub vus: usize,
    pub stop: StopCondition,
    pub request_timeout: Duration,
    pub grace_period: Duration,
    pub error_rate: f64,
    pub histogram_buckets: Vec<f64>,
    pub report_format: ReportFormat,
    /// How often to print running metrics while the load test runs, if at all.
    pub running_metrics: Option<Duration>,
    pub request_log: Option<String>,
    pub request_format: LogFormat,
}

/// Parse a time span option, or explain why it's invalid.
fn parse_time(option: &str, value: &str) -> Result<Duration, FlockError> {
    util::parse_timespan(value).ok_or_else(|| FlockError::InvalidOption {
        option: option.to_string(),
        value: value.to_string(),
        detail: format!(
            "{} must be a time span like 250ms, 30s, 20m, 3h or 1h30m.",
            option
        ),
    })
}

/// Parse a comma separated list of bucket bounds in milliseconds.
pub(crate) fn parse_histogram_buckets(value: &str) -> Result<Vec<f64>, FlockError> {
    let mut buckets = Vec::new();
    for bound in value.split(',').map(str::trim).filter(|b| !b.is_empty()) {
        match bound.parse::<f64>() {
            Ok(bound) if bound.is_finite() && bound > 0.0 => buckets.push(bound),
            _ => {
                return Err(FlockError::InvalidOption {
                    option: "--histogram-buckets".to_string(),
                    value: value.to_string(),
                    detail: format!("{} is not a positive number of milliseconds.", bound),
                })
            }
        }
    }
    if buckets.is_empty() {
        return Err(FlockError::InvalidOption {
            option: "--histogram-buckets".to_string(),
            value: value.to_string(),
            detail: "At least one bucket bound is required.".to_string(),
        });
    }
    Ok(buckets)
}

/// Parse a `KEY: VALUE` header option.
fn parse_header(header: &str) -> Result<(String, String), FlockError> {
    match header.split_once(':') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(FlockError::InvalidOption {
            option: "--header".to_string(),
            value: header.to_string(),
            detail: "Headers must be formatted as \"KEY: VALUE\".".to_string(),
        }),
    }
}

impl FlockConfiguration {
    /// Load the run script, if one is configured.
    pub(crate) fn load_script(&self) -> Result<Option<RunScript>, FlockError> {
        if self.script.is_empty() {
            Ok(None)
        } else {
            info!("loading run script: {}", self.script);
            RunScript::load(&self.script).map(Some)
        }
    }

    /// Fill in options not set on the command line from the run script, then from
    /// programmatic defaults.
    pub(crate) fn configure(&mut self, script: Option<&RunScript>, defaults: &FlockDefaults) {
        // Configure `quiet`.
        self.quiet = get_value(vec![
            // Use --quiet if set.
            FlockValue {
                value: Some(self.quiet),
                filter: self.quiet == 0,
                message: "",
            },
            // Otherwise use FlockDefault if set.
            FlockValue {
                value: defaults.quiet,
                filter: defaults.quiet.is_none(),
                message: "",
            },
        ])
        .unwrap_or(0);

        // Configure `verbose`.
        self.verbose = get_value(vec![
            FlockValue {
                value: Some(self.verbose),
                filter: self.verbose == 0,
                message: "",
            },
            FlockValue {
                value: defaults.verbose,
                filter: defaults.verbose.is_none(),
                message: "",
            },
        ])
        .unwrap_or(0);

        // Configure `log_level`.
        self.log_level = get_value(vec![
            FlockValue {
                value: Some(self.log_level),
                filter: self.log_level == 0,
                message: "",
            },
            FlockValue {
                value: defaults.log_level,
                filter: defaults.log_level.is_none(),
                message: "",
            },
        ])
        .unwrap_or(0);

        // Configure `log_file`.
        self.log_file = get_value(vec![
            FlockValue {
                value: Some(self.log_file.to_string()),
                filter: self.log_file.is_empty(),
                message: "",
            },
            FlockValue {
                value: defaults.log_file.clone(),
                filter: defaults.log_file.is_none(),
                message: "",
            },
        ])
        .unwrap_or_default();

        // Configure `vus`.
        self.vus = get_value(vec![
            // Use --vus if set.
            FlockValue {
                value: self.vus,
                filter: false,
                message: "vus",
            },
            // Otherwise use the run script if set.
            FlockValue {
                value: script.and_then(|s| s.vus),
                filter: false,
                message: "vus",
            },
            // Otherwise use FlockDefault if set.
            FlockValue {
                value: defaults.vus,
                filter: false,
                message: "vus",
            },
        ]);

        // The stop condition is taken as a whole from the first source that defines one, so
        // `--iterations` overrides a duration set in the run script.
        let cli_stop = !self.duration.is_empty() || self.iterations.is_some();
        let script_stop = script
            .map(|s| s.duration.is_some() || s.iterations.is_some())
            .unwrap_or(false);
        if !cli_stop {
            if let Some(script) = script.filter(|_| script_stop) {
                self.duration = script.duration.clone().unwrap_or_default();
                self.iterations = script.iterations;
                info!(
                    "run script stop condition = {:?} {:?}",
                    script.duration, script.iterations
                );
            } else {
                self.duration = defaults.duration.clone().unwrap_or_default();
                self.iterations = defaults.iterations;
            }
        }

        // Configure `timeout`.
        self.timeout = get_value(vec![
            FlockValue {
                value: Some(self.timeout.to_string()),
                filter: self.timeout.is_empty(),
                message: "timeout",
            },
            FlockValue {
                value: script.and_then(|s| s.timeout.clone()),
                filter: false,
                message: "timeout",
            },
            FlockValue {
                value: defaults.timeout.clone(),
                filter: false,
                message: "timeout",
            },
        ])
        .unwrap_or_else(|| DEFAULT_TIMEOUT.to_string());

        // Configure `grace_period`.
        self.grace_period = get_value(vec![
            FlockValue {
                value: Some(self.grace_period.to_string()),
                filter: self.grace_period.is_empty(),
                message: "grace_period",
            },
            FlockValue {
                value: script.and_then(|s| s.grace_period.clone()),
                filter: false,
                message: "grace_period",
            },
            FlockValue {
                value: defaults.grace_period.clone(),
                filter: false,
                message: "grace_period",
            },
        ])
        .unwrap_or_else(|| DEFAULT_GRACE_PERIOD.to_string());

        // Configure `error_rate`.
        self.error_rate = get_value(vec![
            FlockValue {
                value: self.error_rate,
                filter: false,
                message: "error_rate",
            },
            FlockValue {
                value: defaults.error_rate,
                filter: false,
                message: "error_rate",
            },
        ]);

        // Configure `report_format`.
        self.report_format = get_value(vec![
            FlockValue {
                value: self.report_format.clone(),
                filter: false,
                message: "",
            },
            FlockValue {
                value: defaults.report_format.clone(),
                filter: false,
                message: "report_format",
            },
        ]);

        // Configure `running_metrics`.
        self.running_metrics = get_value(vec![
            FlockValue {
                value: self.running_metrics,
                filter: false,
                message: "",
            },
            FlockValue {
                value: defaults.running_metrics,
                filter: false,
                message: "running_metrics",
            },
        ]);

        // Configure `histogram_buckets`.
        self.histogram_buckets = get_value(vec![
            FlockValue {
                value: Some(self.histogram_buckets.to_string()),
                filter: self.histogram_buckets.is_empty(),
                message: "",
            },
            FlockValue {
                value: defaults.histogram_buckets.clone(),
                filter: false,
                message: "histogram_buckets",
            },
        ])
        .unwrap_or_default();

        // Configure `request_log`.
        self.request_log = get_value(vec![
            FlockValue {
                value: Some(self.request_log.to_string()),
                filter: self.request_log.is_empty(),
                message: "request_log",
            },
            FlockValue {
                value: defaults.request_log.clone(),
                filter: false,
                message: "request_log",
            },
        ])
        .unwrap_or_default();

        // Configure `request_format`.
        self.request_format = get_value(vec![
            FlockValue {
                value: self.request_format.clone(),
                filter: false,
                message: "",
            },
            FlockValue {
                value: defaults.request_format.clone(),
                filter: false,
                message: "request_format",
            },
        ]);
    }

    /// Validate that the configuration is valid, and displays an error if not.
    pub(crate) fn validate(&self) -> Result<(), FlockError> {
        // Can't set both --verbose and --quiet.
        if self.verbose > 0 && self.quiet > 0 {
            return Err(FlockError::InvalidOption {
                option: "`configuration.verbose`".to_string(),
                value: self.verbose.to_string(),
                detail: "`configuration.verbose` can not be set with `configuration.quiet`."
                    .to_string(),
            });
        }

        // Validate `vus`.
        if let Some(vus) = self.vus.as_ref() {
            if vus == &0 {
                return Err(FlockError::InvalidOption {
                    option: "`configuration.vus`".to_string(),
                    value: vus.to_string(),
                    detail: "`configuration.vus` must be set to at least 1.".to_string(),
                });
            }
        }

        // Exactly one stop condition is required.
        match (self.duration.is_empty(), self.iterations) {
            (false, Some(iterations)) => {
                return Err(FlockError::InvalidOption {
                    option: "`configuration.iterations`".to_string(),
                    value: iterations.to_string(),
                    detail: "`configuration.iterations` can not be set with `configuration.duration`."
                        .to_string(),
                });
            }
            (true, None) => {
                return Err(FlockError::InvalidOption {
                    option: "`configuration.duration`".to_string(),
                    value: "".to_string(),
                    detail: "Either `configuration.duration` or `configuration.iterations` must be set."
                        .to_string(),
                });
            }
            (true, Some(0)) => {
                return Err(FlockError::InvalidOption {
                    option: "`configuration.iterations`".to_string(),
                    value: "0".to_string(),
                    detail: "`configuration.iterations` must be set to at least 1.".to_string(),
                });
            }
            (true, Some(_)) => (),
            (false, None) => {
                if parse_time("`configuration.duration`", &self.duration)?.is_zero() {
                    return Err(FlockError::InvalidOption {
                        option: "`configuration.duration`".to_string(),
                        value: self.duration.to_string(),
                        detail: "`configuration.duration` must be greater than 0.".to_string(),
                    });
                }
            }
        }

        // The timeout must be greater than zero.
        if parse_time("`configuration.timeout`", &self.timeout)?.is_zero() {
            return Err(FlockError::InvalidOption {
                option: "`configuration.timeout`".to_string(),
                value: self.timeout.to_string(),
                detail: "`configuration.timeout` must be greater than 0.".to_string(),
            });
        }
        parse_time("`configuration.grace_period`", &self.grace_period)?;

        // The error rate is a probability.
        if let Some(error_rate) = self.error_rate {
            if !(0.0..=1.0).contains(&error_rate) {
                return Err(FlockError::InvalidOption {
                    option: "`configuration.error_rate`".to_string(),
                    value: error_rate.to_string(),
                    detail: "`configuration.error_rate` must be between 0 and 1.".to_string(),
                });
            }
        }

        if !self.histogram_buckets.is_empty() {
            parse_histogram_buckets(&self.histogram_buckets)?;
        }

        // Request headers must be well formed.
        for header in &self.header {
            parse_header(header)?;
        }

        Ok(())
    }

    /// Build the immutable [`RunConfig`] from a configured and validated configuration.
    pub fn run_config(&self) -> Result<RunConfig, FlockError> {
        let stop = match self.iterations {
            Some(iterations) => StopCondition::Iterations(iterations),
            None => StopCondition::Duration(parse_time("`configuration.duration`", &self.duration)?),
        };
        let histogram_buckets = if self.histogram_buckets.is_empty() {
            DEFAULT_HISTOGRAM_BUCKETS.to_vec()
        } else {
            parse_histogram_buckets(&self.histogram_buckets)?
        };
        Ok(RunConfig {
            vus: self.vus.unwrap_or(1),
            stop,
            request_timeout: parse_time("`configuration.timeout`", &self.timeout)?,
            grace_period: parse_time("`configuration.grace_period`", &self.grace_period)?,
            error_rate: self.error_rate.unwrap_or(0.0) as f64,
            histogram_buckets,
            report_format: self.report_format.clone().unwrap_or_default(),
            running_metrics: self
                .running_metrics
                .filter(|seconds| *seconds > 0)
                .map(|seconds| Duration::from_secs(seconds as u64)),
            request_log: if self.request_log.is_empty() {
                None
            } else {
                Some(self.request_log.to_string())
            },
            request_format: self.request_format.clone().unwrap_or_default(),
        })
    }

    /// Request plans defined on the command line, otherwise in the run script.
    pub(crate) fn plan_specs(&self, script: Option<&RunScript>) -> Result<Vec<PlanSpec>, FlockError> {
        if !self.url.is_empty() {
            let mut headers = BTreeMap::new();
            for header in &self.header {
                let (key, value) = parse_header(header)?;
                headers.insert(key, value);
            }
            Ok(self
                .url
                .iter()
                .map(|url| {
                    let mut spec = PlanSpec::get(url);
                    spec.headers = headers.clone();
                    spec
                })
                .collect())
        } else {
            Ok(script.map(|s| s.requests.clone()).unwrap_or_default())
        }
    }

    /// Optionally initialize the Flock logger which writes to standard out and/or to
    /// a configurable log file.
    pub(crate) fn initialize_logger(&self) {
        // Configure debug output level.
        let debug_level = match self.verbose {
            0 => match self.quiet {
                0 => LevelFilter::Info,
                _ => LevelFilter::Warn,
            },
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Configure Flock log level.
        let log_level = match self.log_level {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Open the log file if configured.
        let log_file: Option<PathBuf> = if !self.log_file.is_empty() {
            Some(PathBuf::from(&self.log_file))
        // Otherwise disable the log.
        } else {
            None
        };

        let mut loggers: Vec<Box<dyn SharedLogger>> =
            vec![SimpleLogger::new(debug_level, Config::default())];
        if let Some(log_to_file) = log_file.as_ref() {
            match std::fs::File::create(log_to_file) {
                Ok(file) => loggers.push(WriteLogger::new(log_level, Config::default(), file)),
                Err(e) => eprintln!(
                    "failed to create log file ({}): {}",
                    log_to_file.display(),
                    e
                ),
            }
        }
        match CombinedLogger::init(loggers) {
            Ok(_) => (),
            Err(e) => {
                info!("failed to initialize CombinedLogger: {}", e);
            }
        }
        if let Some(log_to_file) = log_file {
            info!("Writing to log file: {}", log_to_file.display());
        }

        info!("Output verbosity level: {}", debug_level);
        info!("Logfile verbosity level: {}", log_level);
    }
}
