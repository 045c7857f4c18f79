//! # Flock
//!
//! Flock is a minimal concurrent HTTP load testing engine. A fixed pool of virtual users
//! repeatedly issues GET requests described by request plans, for a fixed duration or a
//! total number of iterations, while every outcome is aggregated into latency, status code
//! and error statistics that are reported when the load test ends.
//!
//! ## Creating a load test
//!
//! The simplest load test needs nothing but a url, for example from the command line:
//!
//! ```text
//! flock --vus 2 --duration 10s --url "http://localhost:8080/?rnd={rnd}"
//! ```
//!
//! The same load test can be defined in code:
//!
//! ```rust,no_run
//! use flock::prelude::*;
//!
//! fn main() -> Result<(), FlockError> {
//!     let stats = LoadTest::initialize()?
//!         .register_plan(RequestPlan::get("http://localhost:8080/?rnd={rnd}")?)
//!         .set_default(FlockDefault::Vus, 2)?
//!         .set_default(FlockDefault::Duration, "10s")?
//!         .execute()?;
//!
//!     println!("{} requests, {} errors", stats.count(), stats.error_count());
//!     Ok(())
//! }
//! ```
//!
//! Request plans may contain `{rnd}`, `{vu}` and `{iteration}` placeholders, which are
//! rendered fresh for every request. Several plans can be registered with weights, or a
//! custom [`IterationBody`](./plan/trait.IterationBody.html) can decide what to request.
//!
//! ## Stopping
//!
//! A load test stops when its duration has elapsed, when its iteration budget is spent,
//! when [`RunHandle::stop`] is called, or on ctrl-c. Virtual users then have a grace period
//! to finish their in-flight request, after which any still running are aborted and their
//! requests are not recorded.
//!
//! ## License
//!
//! Copyright 2020-2024 Jeremy Andrews
//!
//! Licensed under the Apache License, Version 2.0 (the "License");
//! you may not use this file except in compliance with the License.
//! You may obtain a copy of the License at
//!
//! <http://www.apache.org/licenses/LICENSE-2.0>
//!
//! Unless required by applicable law or agreed to in writing, software
//! distributed under the License is distributed on an "AS IS" BASIS,
//! WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//! See the License for the specific language governing permissions and
//! limitations under the License.

#[macro_use]
extern crate log;

pub mod client;
pub mod config;
pub mod logger;
pub mod metrics;
pub mod plan;
pub mod prelude;
pub mod report;
pub mod user;
pub mod util;

use chrono::{DateTime, Local};
use gumdrop::Options;
use lazy_static::lazy_static;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use std::{fmt, io};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::client::{HttpClient, ReqwestClient};
use crate::config::{FlockConfiguration, FlockDefaults, RunConfig, RunScript, StopCondition};
use crate::metrics::{AggregateStats, Aggregator, RequestOutcome};
use crate::plan::{HttpMethod, IterationBody, PlanScheduler, RequestPlan, WeightedPlans};
use crate::user::{
    ActiveUser, IterationBudget, OutcomeSink, StopSignal, UserSettings, VirtualUser,
};

/// How often the load test checks whether it's time to stop.
const MONITOR_INTERVAL: Duration = Duration::from_millis(100);

lazy_static! {
    /// Set when ctrl-c is caught, the load test then shuts down gracefully.
    static ref CANCELED: RwLock<bool> = RwLock::new(false);
}

/// An enumeration of all errors a [`LoadTest`](./struct.LoadTest.html) can return.
#[derive(Debug)]
pub enum FlockError {
    /// Wraps a [`std::io::Error`](https://doc.rust-lang.org/std/io/struct.Error.html).
    Io(io::Error),
    /// Wraps a [`reqwest::Error`](https://docs.rs/reqwest/*/reqwest/struct.Error.html).
    Reqwest(reqwest::Error),
    /// Wraps a ['tokio::task::JoinError'](https://tokio-rs.github.io/tokio/doc/tokio/task/struct.JoinError.html).
    TokioJoin(tokio::task::JoinError),
    /// Wraps a [`serde_json::Error`](https://docs.rs/serde_json/*/serde_json/struct.Error.html).
    Serde(serde_json::Error),
    /// Invalid option or value specified, may only be invalid in context.
    InvalidOption {
        /// The invalid option that caused this error, may be only invalid in context.
        option: String,
        /// The invalid value that caused this error, may be only invalid in context.
        value: String,
        /// An optional explanation of the error.
        detail: String,
    },
    /// Failed to parse a url.
    InvalidUrl {
        /// The invalid url that caused this error.
        url: String,
        /// An optional explanation of the error.
        detail: String,
        /// Wraps a [`url::ParseError`](https://docs.rs/url/*/url/enum.ParseError.html).
        parse_error: url::ParseError,
    },
    /// [`LoadTest`](./struct.LoadTest.html) has no request plans defined.
    NoRequestPlans {
        /// An optional explanation of the error.
        detail: String,
    },
}
/// Implement a helper to provide a text description of all possible types of errors.
impl FlockError {
    fn describe(&self) -> &str {
        match *self {
            FlockError::Io(_) => "io::Error",
            FlockError::Reqwest(_) => "reqwest::Error",
            FlockError::TokioJoin(_) => "tokio::task::JoinError",
            FlockError::Serde(_) => "serde_json::Error",
            FlockError::InvalidOption { .. } => "invalid option or value specified",
            FlockError::InvalidUrl { .. } => "failed to parse url",
            FlockError::NoRequestPlans { .. } => "no request plans defined",
        }
    }

    /// Whether the error was caused by an invalid configuration.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            FlockError::InvalidOption { .. }
                | FlockError::InvalidUrl { .. }
                | FlockError::NoRequestPlans { .. }
                | FlockError::Serde(_)
        )
    }
}

/// Implement format trait to allow displaying errors.
impl fmt::Display for FlockError {
    // Implement display of error with `{}` marker.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            FlockError::Io(ref source) => write!(f, "FlockError: {} ({})", self.describe(), source),
            FlockError::Reqwest(ref source) => {
                write!(f, "FlockError: {} ({})", self.describe(), source)
            }
            FlockError::TokioJoin(ref source) => {
                write!(f, "FlockError: {} ({})", self.describe(), source)
            }
            FlockError::Serde(ref source) => {
                write!(f, "FlockError: {} ({})", self.describe(), source)
            }
            FlockError::InvalidOption {
                ref option,
                ref value,
                ref detail,
            } => write!(
                f,
                "FlockError: {} ({} = {:?}): {}",
                self.describe(),
                option,
                value,
                detail
            ),
            FlockError::InvalidUrl {
                ref url,
                ref detail,
                ref parse_error,
            } => write!(
                f,
                "FlockError: {} ({}: {}): {}",
                self.describe(),
                url,
                parse_error,
                detail
            ),
            FlockError::NoRequestPlans { ref detail } => {
                write!(f, "FlockError: {}: {}", self.describe(), detail)
            }
        }
    }
}

// Define the lower level source of this error, if any.
impl std::error::Error for FlockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            FlockError::Io(ref source) => Some(source),
            FlockError::Reqwest(ref source) => Some(source),
            FlockError::TokioJoin(ref source) => Some(source),
            FlockError::Serde(ref source) => Some(source),
            FlockError::InvalidUrl {
                ref parse_error, ..
            } => Some(parse_error),
            _ => None,
        }
    }
}

/// Auto-convert Reqwest errors.
impl From<reqwest::Error> for FlockError {
    fn from(err: reqwest::Error) -> FlockError {
        FlockError::Reqwest(err)
    }
}

/// Auto-convert IO errors.
impl From<io::Error> for FlockError {
    fn from(err: io::Error) -> FlockError {
        FlockError::Io(err)
    }
}

/// Auto-convert TokioJoin errors.
impl From<tokio::task::JoinError> for FlockError {
    fn from(err: tokio::task::JoinError) -> FlockError {
        FlockError::TokioJoin(err)
    }
}

/// Auto-convert serde_json errors.
impl From<serde_json::Error> for FlockError {
    fn from(err: serde_json::Error) -> FlockError {
        FlockError::Serde(err)
    }
}

/// Global internal state for the load test.
pub struct LoadTest {
    /// Request plans registered in code, with their weights.
    plans: Vec<(RequestPlan, usize)>,
    /// An optional custom iteration body, used instead of registered plans.
    body: Option<Arc<dyn IterationBody>>,
    /// An optional client shared by all virtual users, instead of one reqwest client each.
    client: Option<Arc<dyn HttpClient>>,
    /// The order weighted plans are requested in.
    scheduler: PlanScheduler,
    /// Optional default values for run-time options.
    defaults: FlockDefaults,
    /// Configuration object holding options set when launching the load test.
    configuration: FlockConfiguration,
}
/// Flock's internal global state.
impl LoadTest {
    /// Load configuration and initialize a [`LoadTest`](./struct.LoadTest.html).
    ///
    /// # Example
    /// ```rust,no_run
    /// use flock::prelude::*;
    ///
    /// let mut load_test = LoadTest::initialize();
    /// ```
    pub fn initialize() -> Result<LoadTest, FlockError> {
        LoadTest::initialize_with_config(FlockConfiguration::parse_args_default_or_exit())
    }

    /// Initialize a [`LoadTest`](./struct.LoadTest.html) with an already loaded
    /// configuration.
    ///
    /// This is generally used by tests.
    ///
    /// # Example
    /// ```rust
    /// use flock::prelude::*;
    ///
    /// let load_test = LoadTest::initialize_with_config(FlockConfiguration::default());
    /// ```
    pub fn initialize_with_config(
        configuration: FlockConfiguration,
    ) -> Result<LoadTest, FlockError> {
        Ok(LoadTest {
            plans: Vec::new(),
            body: None,
            client: None,
            scheduler: PlanScheduler::RoundRobin,
            defaults: FlockDefaults::default(),
            configuration,
        })
    }

    /// Register a request plan with a weight of 1.
    pub fn register_plan(self, plan: RequestPlan) -> Self {
        self.register_weighted_plan(plan, 1)
    }

    /// Register a request plan with a weight. A plan with a weight of 2 is requested twice
    /// as often as a plan with a weight of 1.
    pub fn register_weighted_plan(mut self, plan: RequestPlan, weight: usize) -> Self {
        self.plans.push((plan, weight));
        self
    }

    /// Register a custom [`IterationBody`](./plan/trait.IterationBody.html) deciding what
    /// every iteration requests. Request plans defined on the command line or in a run
    /// script still take precedence.
    pub fn register_body(mut self, body: Arc<dyn IterationBody>) -> Self {
        self.body = Some(body);
        self
    }

    /// Send all requests through a custom [`HttpClient`](./client/trait.HttpClient.html)
    /// instead of a [`ReqwestClient`](./client/struct.ReqwestClient.html) per virtual user.
    pub fn set_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Define the order weighted plans are requested in.
    ///
    /// By default plans are requested round robin. For example, if plan A has a weight of 2
    /// and plan B a weight of 1, each virtual user requests A, B, A, A, B, A...
    pub fn set_scheduler(mut self, scheduler: PlanScheduler) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Build the iteration body every virtual user runs: plans from the command line,
    /// otherwise from the run script, otherwise the registered body or plans.
    fn prepare_body(&self, script: Option<&RunScript>) -> Result<Arc<dyn IterationBody>, FlockError> {
        let specs = self.configuration.plan_specs(script)?;
        let body: Arc<dyn IterationBody> = if !specs.is_empty() {
            let mut plans = Vec::with_capacity(specs.len());
            for spec in specs {
                let weight = spec.weight;
                plans.push((RequestPlan::build(spec)?, weight));
            }
            self.weigh_plans(plans)?
        } else if let Some(body) = self.body.as_ref() {
            Arc::clone(body)
        } else {
            self.weigh_plans(self.plans.clone())?
        };

        // Only GET requests are supported.
        for plan in body.plans() {
            if plan.method() != HttpMethod::Get {
                return Err(FlockError::InvalidOption {
                    option: "method".to_string(),
                    value: plan.method().to_string(),
                    detail: format!(
                        "Plan {} uses {}, only GET requests are supported.",
                        plan.name(),
                        plan.method()
                    ),
                });
            }
        }
        Ok(body)
    }

    fn weigh_plans(
        &self,
        mut plans: Vec<(RequestPlan, usize)>,
    ) -> Result<Arc<dyn IterationBody>, FlockError> {
        if plans.is_empty() {
            return Err(FlockError::NoRequestPlans {
                detail: "No request plans are defined, use --url or --script.".to_string(),
            });
        }
        if plans.len() == 1 && plans[0].1 > 0 {
            let (plan, _) = plans.remove(0);
            Ok(Arc::new(plan))
        } else {
            Ok(Arc::new(WeightedPlans::new(plans, self.scheduler.clone())?))
        }
    }

    /// Execute the [`LoadTest`](./struct.LoadTest.html) load test, blocking until it ends
    /// and displaying the final report.
    ///
    /// # Example
    /// ```rust,no_run
    /// use flock::prelude::*;
    ///
    /// fn main() -> Result<(), FlockError> {
    ///     let _stats = LoadTest::initialize()?
    ///         .register_plan(RequestPlan::get("http://localhost:8080/?rnd={rnd}")?)
    ///         .execute()?;
    ///
    ///     Ok(())
    /// }
    /// ```
    pub fn execute(self) -> Result<AggregateStats, FlockError> {
        // If version flag is set, display package name and version and exit.
        if self.configuration.version {
            println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
            std::process::exit(0);
        }

        // Display request plans, then exit.
        if self.configuration.list {
            let script = self.configuration.load_script()?;
            let body = self.prepare_body(script.as_ref())?;
            println!("Available request plans:");
            for plan in body.plans() {
                println!(
                    " - {} ({} {})",
                    plan.name(),
                    plan.method(),
                    plan.url_template()
                );
            }
            std::process::exit(0);
        }

        let rt = tokio::runtime::Runtime::new()?;
        let (stats, report_format) = rt.block_on(async {
            let run = self.start().await?;
            let report_format = run.run_config().report_format.clone();
            let stats = run.wait().await?;
            Ok::<_, FlockError>((stats, report_format))
        })?;

        println!("{}", report::render(&stats, report_format)?);
        Ok(stats)
    }

    /// Validate the configuration and launch all virtual users, returning a handle to the
    /// running load test.
    ///
    /// Nothing is requested if the configuration is invalid.
    pub async fn start(mut self) -> Result<RunHandle, FlockError> {
        let script = self.configuration.load_script()?;
        self.configuration.configure(script.as_ref(), &self.defaults);
        self.configuration.initialize_logger();
        self.configuration.validate()?;
        let run_config = self.configuration.run_config()?;
        let body = self.prepare_body(script.as_ref())?;

        // Build every client before launching anyone, so a failure launches nothing.
        let mut clients: Vec<Arc<dyn HttpClient>> = Vec::with_capacity(run_config.vus);
        for _ in 0..run_config.vus {
            match self.client.as_ref() {
                Some(client) => clients.push(Arc::clone(client)),
                None => clients.push(Arc::new(ReqwestClient::new(run_config.request_timeout)?)),
            }
        }

        let aggregator = Arc::new(Aggregator::new(
            run_config.vus,
            run_config.histogram_buckets.clone(),
        ));
        let request_logger = match run_config.request_log.as_ref() {
            Some(path) => {
                Some(logger::setup_request_logger(path, run_config.request_format.clone()).await?)
            }
            None => None,
        };
        let sink = OutcomeSink::new(
            Arc::clone(&aggregator),
            request_logger.as_ref().map(|(sender, _)| sender.clone()),
        );

        util::setup_ctrlc_handler();

        let stop = StopSignal::new();
        let budget = match run_config.stop {
            StopCondition::Iterations(iterations) => Some(IterationBudget::new(iterations)),
            StopCondition::Duration(_) => None,
        };
        let started = Instant::now();
        let started_at = Local::now();
        let settings = Arc::new(UserSettings {
            started,
            request_timeout: run_config.request_timeout,
            error_rate: run_config.error_rate,
        });
        let active_users = Arc::new(AtomicUsize::new(0));

        info!(
            "launching {} virtual users, stopping after {:?}...",
            run_config.vus, run_config.stop
        );
        let users = clients
            .into_iter()
            .enumerate()
            .map(|(id, client)| {
                tokio::spawn(user::user_main(
                    VirtualUser::new(id, Arc::clone(&body)),
                    client,
                    stop.clone(),
                    budget.clone(),
                    sink.clone(),
                    Arc::clone(&settings),
                    ActiveUser::new(&active_users),
                ))
            })
            .collect();

        Ok(RunHandle {
            users,
            stop,
            aggregator,
            active_users,
            sink,
            request_logger,
            run_config,
            started,
            started_at,
        })
    }
}

/// A running load test.
pub struct RunHandle {
    users: Vec<JoinHandle<VirtualUser>>,
    stop: StopSignal,
    aggregator: Arc<Aggregator>,
    active_users: Arc<AtomicUsize>,
    sink: OutcomeSink,
    request_logger: Option<(
        flume::Sender<Option<RequestOutcome>>,
        JoinHandle<Result<(), FlockError>>,
    )>,
    run_config: RunConfig,
    started: Instant,
    started_at: DateTime<Local>,
}
impl RunHandle {
    /// How many virtual users are currently running.
    pub fn active_users(&self) -> usize {
        self.active_users.load(Ordering::SeqCst)
    }

    /// Stop the load test early. Virtual users finish their current request, within the
    /// grace period.
    pub fn stop(&self) {
        info!("stopping load test...");
        self.stop.stop();
    }

    /// The aggregator outcomes are recorded into, for snapshots while the load test runs.
    pub fn aggregator(&self) -> Arc<Aggregator> {
        Arc::clone(&self.aggregator)
    }

    /// The configuration the load test is running with.
    pub fn run_config(&self) -> &RunConfig {
        &self.run_config
    }

    /// Metrics recorded so far. The load test keeps running.
    pub fn snapshot(&self) -> AggregateStats {
        let mut stats = self.aggregator.snapshot();
        stats.vus = self.run_config.vus;
        stats.duration = self.started.elapsed();
        stats.started = Some(self.started_at);
        stats.dropped_log_lines = self.sink.dropped_log_lines();
        stats
    }

    // Display running metrics in the configured report format.
    fn print_running(&self) {
        let stats = self.snapshot();
        info!(
            "printing running metrics after {} seconds...",
            stats.duration.as_secs()
        );
        match report::render(&stats, self.run_config.report_format.clone()) {
            // Include a blank line after printing running metrics.
            Ok(report) => println!("{}\n", report),
            Err(e) => warn!("failed to render running metrics: {}", e),
        }
    }

    /// Wait for the load test to stop, give in-flight requests the grace period to
    /// complete, then return the final stats.
    pub async fn wait(mut self) -> Result<AggregateStats, FlockError> {
        let deadline = match self.run_config.stop {
            StopCondition::Duration(duration) => Some(self.started + duration),
            StopCondition::Iterations(_) => None,
        };

        let mut running_metrics_timer = self.started;
        let mut drift = Instant::now();
        loop {
            if self.stop.is_stopped() {
                break;
            }
            if util::ctrlc_caught() {
                info!("load test canceled...");
                break;
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    info!("load test duration elapsed, stopping...");
                    break;
                }
            }
            if self.users.iter().all(|user| user.is_finished()) {
                info!("all virtual users finished...");
                break;
            }

            if let Some(running_metrics) = self.run_config.running_metrics {
                if util::timer_expired(running_metrics_timer, running_metrics) {
                    running_metrics_timer = Instant::now();
                    self.print_running();
                }
            }

            let interval = match deadline {
                Some(deadline) => MONITOR_INTERVAL.min(deadline.saturating_duration_since(drift)),
                None => MONITOR_INTERVAL,
            };
            drift = util::sleep_minus_drift(interval, drift).await;
        }
        let stopped = Instant::now();
        let stopped_at = Local::now();
        self.stop.stop();

        self.stop_running_users().await;
        self.stop_request_logger().await?;

        let mut stats = self.snapshot();
        stats.duration = stopped.duration_since(self.started);
        stats.stopped = Some(stopped_at);
        info!(
            "load test finished after {:?}: {} requests",
            stats.duration,
            stats.count()
        );
        Ok(stats)
    }

    // Wait up to the grace period for virtual users to exit, then abort the rest. Requests
    // still in flight when a user is aborted are not recorded.
    async fn stop_running_users(&mut self) {
        let grace_deadline = Instant::now() + self.run_config.grace_period;
        let mut aborted = Vec::new();
        for (id, mut user) in self.users.drain(..).enumerate() {
            match tokio::time::timeout_at(grace_deadline, &mut user).await {
                Ok(Ok(user)) => debug!("user {} exited", user.id),
                Ok(Err(e)) => error!("user {} failed: {}", id, e),
                Err(_) => {
                    user.abort();
                    aborted.push(user);
                }
            }
        }
        if !aborted.is_empty() {
            warn!(
                "aborted {} virtual users still running after the {:?} grace period",
                aborted.len(),
                self.run_config.grace_period
            );
            // Aborted tasks drop their in-flight request and their active user guard.
            for result in futures::future::join_all(aborted).await {
                if let Err(e) = result {
                    if !e.is_cancelled() {
                        error!("user failed: {}", e);
                    }
                }
            }
        }
    }

    // Tell the request logger to flush and exit, and wait for it.
    async fn stop_request_logger(&mut self) -> Result<(), FlockError> {
        if let Some((sender, logger)) = self.request_logger.take() {
            if let Err(e) = sender.send_async(None).await {
                warn!("failed to stop request logger: {}", e);
            }
            logger.await??;
        }
        Ok(())
    }
}

// Dropping the handle stops the load test.
impl Drop for RunHandle {
    fn drop(&mut self) {
        self.stop.stop();
    }
}
