//! # Stampede
//!
//! Stampede is a staged HTTP load generator. It drives a ramping number of
//! concurrent virtual users against an HTTP endpoint, following a test plan of
//! stages, and reports latency percentiles and failure rates when the run ends.
//!
//! User behavior is defined with standard Rust code: a scenario is an async
//! function that performs one iteration of work (typically one HTTP request) and
//! returns the samples it produced. Stampede uses [`reqwest`](https://docs.rs/reqwest/)
//! to send requests by default.
//!
//! ## Creating a Stampede load test
//!
//! Add the following boilerplate `use` declaration at the top of your `src/main.rs`:
//!
//! ```rust
//! use stampede::prelude::*;
//! ```
//!
//! Then define a scenario, register it, and execute the run:
//!
//! ```rust,no_run
//! use stampede::prelude::*;
//! use std::time::Duration;
//!
//! async fn payments_summary(ctx: ScenarioContext) -> ScenarioResult {
//!     Ok(vec![ctx.get("/payments-summary").await?])
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), StampedeError> {
//!     let report = Stampede::initialize()?
//!         .register_scenario(
//!             scenario!(payments_summary).set_think_time(Duration::from_secs(1)),
//!         )
//!         .set_default(StampedeDefault::Host, "http://localhost:9999")?
//!         .set_default(StampedeDefault::TestPlan, "500,10s")?
//!         .execute()
//!         .await?;
//!
//!     println!("p99 latency: {:.2} ms", report.p99_ms);
//!     Ok(())
//! }
//! ```
//!
//! ## Test plans
//!
//! A test plan is a list of stages, each a target number of users and a duration.
//! Within each stage the number of users moves linearly from the previous stage's
//! target (or `--start-users`, for the first stage) to the stage's own target. For
//! example, `--test-plan "10,30s;10,1m;0,10s"` ramps from 1 to 10 users over 30
//! seconds, holds 10 users for a minute, then ramps back down to 0 over 10 seconds.
//!
//! When the last stage ends, every user is told to stop after its current
//! iteration. In-flight iterations get up to `--graceful-ramp-down` to finish, then
//! they are canceled.
//!
//! ## Stopping a run
//!
//! Pressing ctrl-c, or canceling [`Stampede::cancellation_token`], cancels the run:
//! in-flight requests are dropped, and the report covers what was recorded so far.
//! A second ctrl-c exits immediately.

#[macro_use]
extern crate log;

pub mod client;
pub mod config;
pub mod logger;
pub mod metrics;
pub mod pool;
pub mod prelude;
pub mod report;
pub mod scenario;
pub mod scenarios;
pub mod test_plan;
mod user;
pub mod util;

use chrono::Utc;
use gumdrop::Options;
use std::sync::Arc;
use std::time::Duration;
use std::{fmt, io};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::client::{HttpTransport, ReqwestTransport};
use crate::config::StampedeDefaults;
use crate::metrics::Aggregator;
use crate::pool::VirtualUserPool;
use crate::report::SummaryReport;
use crate::scenario::Scenario;
use crate::test_plan::{RunSchedule, SchedulerState, StageScheduler};

pub use crate::config::StampedeConfiguration;
pub use crate::user::VirtualUserState;

/// How often the run controller re-evaluates the schedule.
const TICK: Duration = Duration::from_millis(100);

/// How long users get to exit after the run finishes before they are aborted.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// An enumeration of all errors a [`Stampede`] run can return.
#[derive(Debug)]
pub enum StampedeError {
    /// Wraps a [`std::io::Error`](https://doc.rust-lang.org/std/io/struct.Error.html).
    Io(io::Error),
    /// Wraps a [`reqwest::Error`](https://docs.rs/reqwest/*/reqwest/struct.Error.html).
    Reqwest(reqwest::Error),
    /// Wraps a ['tokio::task::JoinError'](https://tokio-rs.github.io/tokio/doc/tokio/task/struct.JoinError.html).
    TokioJoin(tokio::task::JoinError),
    /// Wraps a [`serde_json::Error`](https://docs.rs/serde_json/*/serde_json/struct.Error.html).
    Serde(serde_json::Error),
    /// Failed to parse a hostname.
    InvalidHost {
        /// The invalid hostname that caused this error.
        host: String,
        /// An optional explanation of the error.
        detail: String,
        /// Wraps a [`url::ParseError`](https://docs.rs/url/*/url/enum.ParseError.html).
        parse_error: url::ParseError,
    },
    /// Invalid option or value specified, may only be invalid in context.
    InvalidOption {
        /// The invalid option that caused this error, may be only invalid in context.
        option: String,
        /// The invalid value that caused this error, may be only invalid in context.
        value: String,
        /// An optional explanation of the error.
        detail: String,
    },
    /// [`Stampede`] has no [`Scenario`] registered.
    NoScenarios {
        /// An optional explanation of the error.
        detail: String,
    },
}
/// Implement a helper to provide a text description of all possible types of errors.
impl StampedeError {
    fn describe(&self) -> &str {
        match *self {
            StampedeError::Io(_) => "io::Error",
            StampedeError::Reqwest(_) => "reqwest::Error",
            StampedeError::TokioJoin(_) => "tokio::task::JoinError",
            StampedeError::Serde(_) => "serde_json::Error",
            StampedeError::InvalidHost { .. } => "failed to parse hostname",
            StampedeError::InvalidOption { .. } => "invalid option or value specified",
            StampedeError::NoScenarios { .. } => "no scenarios defined",
        }
    }
}

/// Implement format trait to allow displaying errors.
impl fmt::Display for StampedeError {
    // Implement display of error with `{}` marker.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            StampedeError::Io(ref source) => {
                write!(f, "StampedeError: {} ({})", self.describe(), source)
            }
            StampedeError::Reqwest(ref source) => {
                write!(f, "StampedeError: {} ({})", self.describe(), source)
            }
            StampedeError::TokioJoin(ref source) => {
                write!(f, "StampedeError: {} ({})", self.describe(), source)
            }
            StampedeError::Serde(ref source) => {
                write!(f, "StampedeError: {} ({})", self.describe(), source)
            }
            StampedeError::InvalidHost {
                ref parse_error, ..
            } => write!(f, "StampedeError: {} ({})", self.describe(), parse_error),
            StampedeError::InvalidOption { ref detail, .. }
            | StampedeError::NoScenarios { ref detail } => {
                write!(f, "StampedeError: {} ({})", self.describe(), detail)
            }
        }
    }
}

// Define the lower level source of this error, if any.
impl std::error::Error for StampedeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            StampedeError::Io(ref source) => Some(source),
            StampedeError::Reqwest(ref source) => Some(source),
            StampedeError::TokioJoin(ref source) => Some(source),
            StampedeError::Serde(ref source) => Some(source),
            StampedeError::InvalidHost {
                ref parse_error, ..
            } => Some(parse_error),
            _ => None,
        }
    }
}

/// Auto-convert Reqwest errors.
impl From<reqwest::Error> for StampedeError {
    fn from(err: reqwest::Error) -> StampedeError {
        StampedeError::Reqwest(err)
    }
}

/// Auto-convert IO errors.
impl From<io::Error> for StampedeError {
    fn from(err: io::Error) -> StampedeError {
        StampedeError::Io(err)
    }
}

/// Auto-convert TokioJoin errors.
impl From<tokio::task::JoinError> for StampedeError {
    fn from(err: tokio::task::JoinError) -> StampedeError {
        StampedeError::TokioJoin(err)
    }
}

/// Auto-convert serde_json errors.
impl From<serde_json::Error> for StampedeError {
    fn from(err: serde_json::Error) -> StampedeError {
        StampedeError::Serde(err)
    }
}

/// The run controller: owns the configuration, the registered scenarios and the
/// transport, and drives one run to completion.
#[derive(Clone)]
pub struct Stampede {
    /// Scenarios that can be selected with `--scenario`.
    scenarios: Vec<Scenario>,
    /// Defaults set with [`StampedeDefaultType::set_default`](config::StampedeDefaultType::set_default).
    pub(crate) defaults: StampedeDefaults,
    /// Configuration parsed from the command line.
    configuration: StampedeConfiguration,
    /// An optional custom transport, replacing the default reqwest client.
    transport: Option<Arc<dyn HttpTransport>>,
    /// Canceled to abort the run.
    abort: CancellationToken,
}
/// Stampede's internal global state.
impl Stampede {
    /// Load configuration from the command line and initialize a [`Stampede`].
    ///
    /// # Example
    /// ```rust,no_run
    /// use stampede::prelude::*;
    ///
    /// let mut stampede = Stampede::initialize();
    /// ```
    pub fn initialize() -> Result<Stampede, StampedeError> {
        Ok(Stampede::initialize_with_config(
            StampedeConfiguration::parse_args_default_or_exit(),
        ))
    }

    /// Initialize a [`Stampede`] with an already loaded configuration.
    ///
    /// This is generally used by tests and by binaries that parse the command
    /// line themselves.
    ///
    /// # Example
    /// ```rust
    /// use stampede::prelude::*;
    ///
    /// let configuration = StampedeConfiguration::default();
    /// let stampede = Stampede::initialize_with_config(configuration);
    /// ```
    pub fn initialize_with_config(configuration: StampedeConfiguration) -> Stampede {
        Stampede {
            scenarios: Vec::new(),
            defaults: StampedeDefaults::default(),
            configuration,
            transport: None,
            abort: CancellationToken::new(),
        }
    }

    /// Register a scenario. When more than one scenario is registered, `--scenario`
    /// selects the one to run.
    pub fn register_scenario(mut self, scenario: Scenario) -> Self {
        self.scenarios.push(scenario);
        self
    }

    /// Replace the default reqwest transport.
    pub fn set_transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// The token that aborts this run when canceled, with the same effect as ctrl-c.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.abort.clone()
    }

    /// The registered scenarios.
    pub fn scenarios(&self) -> &[Scenario] {
        &self.scenarios
    }

    // Pick the scenario to run.
    fn select_scenario(&self) -> Result<Scenario, StampedeError> {
        if self.configuration.scenario.is_empty() {
            if self.scenarios.len() == 1 {
                return Ok(self.scenarios[0].clone());
            }
            return Err(StampedeError::InvalidOption {
                option: "`configuration.scenario`".to_string(),
                value: "".to_string(),
                detail: format!(
                    "{} scenarios are registered, select one with `configuration.scenario`.",
                    self.scenarios.len()
                ),
            });
        }

        self.scenarios
            .iter()
            .find(|s| s.name == self.configuration.scenario)
            .cloned()
            .ok_or_else(|| StampedeError::InvalidOption {
                option: "`configuration.scenario`".to_string(),
                value: self.configuration.scenario.clone(),
                detail: format!(
                    "`configuration.scenario` must be one of: {}.",
                    self.scenarios
                        .iter()
                        .map(|s| s.name.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            })
    }

    /// Execute the run, returning its [`SummaryReport`].
    ///
    /// Configuration errors are returned before any virtual user is spawned. Once
    /// the run has started, a report is always produced, including when the run is
    /// aborted with ctrl-c or [`Stampede::cancellation_token`].
    pub async fn execute(mut self) -> Result<SummaryReport, StampedeError> {
        // If version flag is set, display package name and version and exit.
        if self.configuration.version {
            println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
            std::process::exit(0);
        }

        // At least one scenario is required.
        if self.scenarios.is_empty() {
            return Err(StampedeError::NoScenarios {
                detail: "No scenarios are defined.".to_string(),
            });
        }

        // Display scenarios, then exit.
        if self.configuration.list {
            println!("Available scenarios:");
            for scenario in &self.scenarios {
                match scenario.host.as_ref() {
                    Some(host) => println!(" - {} ({})", scenario.name, host),
                    None => println!(" - {}", scenario.name),
                }
            }
            std::process::exit(0);
        }

        // Options set on the command line override per-scenario settings, so note
        // them before defaults are merged in.
        let cli_host = !self.configuration.host.is_empty();
        let cli_think_time = !self.configuration.think_time.is_empty();

        // Configure StampedeConfiguration.
        self.configuration.configure(&self.defaults);
        self.configuration.initialize_logger()?;

        // Validate StampedeConfiguration.
        self.configuration.validate()?;

        let scenario = self.select_scenario()?;
        let schedule = RunSchedule::build(&self.configuration)?;

        // The command line wins, then the scenario, then the default.
        let host = match scenario.host.as_ref() {
            Some(host) if !cli_host => Some(host.clone()),
            _ if !self.configuration.host.is_empty() => Some(self.configuration.host.clone()),
            _ => None,
        };
        let host: Option<Url> = match host {
            Some(host) => Some(util::is_valid_host(&host)?),
            None => None,
        };
        let think_time = match scenario.think_time {
            Some(think_time) if !cli_think_time => think_time,
            _ => self.configuration.think_time(),
        };

        let transport: Arc<dyn HttpTransport> = match self.transport.take() {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new(self.configuration.request_timeout())?),
        };

        info!(
            "running scenario {} against {} with {} stages",
            scenario.name,
            host.as_ref().map(|h| h.as_str()).unwrap_or("no host"),
            schedule.stages().len()
        );
        self.run(scenario, schedule, host, think_time, transport)
            .await
    }

    // Drive the scheduler and the pool until the run finishes, then build the report.
    async fn run(
        &self,
        scenario: Scenario,
        schedule: RunSchedule,
        host: Option<Url>,
        think_time: Duration,
        transport: Arc<dyn HttpTransport>,
    ) -> Result<SummaryReport, StampedeError> {
        let (logger_handle, logger_tx) = self.configuration.setup_request_logger().await?;
        let aggregator = Arc::new(Aggregator::new(self.configuration.shards.unwrap_or(1)));

        // Hard cancellation: a child of the abort token, so aborting the run
        // also cancels in-flight requests.
        let run_token = self.abort.child_token();
        util::setup_ctrlc_handler(&self.abort);

        let scenario_name = scenario.name.clone();
        let graceful_ramp_down = schedule.graceful_ramp_down();
        let mut pool = VirtualUserPool::new(
            scenario,
            host,
            think_time,
            transport,
            run_token.clone(),
            aggregator.clone(),
            logger_tx.clone(),
        );
        let mut scheduler = StageScheduler::new(schedule);

        let started = Utc::now();
        let timer = tokio::time::Instant::now();
        let mut tick = timer;
        let mut canceled = false;
        scheduler.start();

        loop {
            if self.abort.is_cancelled() && !canceled {
                warn!("run aborted, stopping all users");
                canceled = true;
                scheduler.finish();
            }

            let previous = scheduler.state();
            let state = scheduler.update(timer.elapsed(), pool.len());
            if state != previous {
                info!("{} -> {}", previous, state);
            }

            match state {
                SchedulerState::Staging(_) => pool.reconcile(scheduler.current_target()),
                SchedulerState::RampingDown => {
                    if previous != SchedulerState::RampingDown {
                        info!(
                            "stopping {} users, graceful ramp-down {:?}",
                            pool.len(),
                            graceful_ramp_down
                        );
                        pool.stop_all();
                        if graceful_ramp_down.is_zero() {
                            run_token.cancel();
                        }
                    }
                }
                SchedulerState::Finished => break,
                SchedulerState::NotStarted => (),
            }

            tokio::select! {
                now = util::sleep_minus_drift(TICK, tick) => tick = now,
                _ = self.abort.cancelled(), if !canceled => tick = tokio::time::Instant::now(),
            }
        }

        // Drain the pool: whatever is still in flight is canceled.
        let elapsed = timer.elapsed();
        pool.stop_all();
        run_token.cancel();
        if !pool.wait_until_empty(SHUTDOWN_TIMEOUT).await {
            let aborted = pool.abort_remaining();
            warn!("aborted {} users that did not exit in {:?}", aborted, SHUTDOWN_TIMEOUT);
        }

        // Tell the logger thread to flush and exit.
        if let Some(logger_tx) = logger_tx {
            // Ignore the error, the logger may have already exited.
            let _ = logger_tx.send(None);
        }
        // A failed request log never costs the run its report.
        if let Some(logger_handle) = logger_handle {
            info!("waiting for request logger to exit");
            match logger_handle.await {
                Ok(Ok(())) => (),
                Ok(Err(e)) => warn!(
                    "request log {} is incomplete: {}",
                    self.configuration.request_log, e
                ),
                Err(e) => warn!("request logger failed: {}", e),
            }
        }
        util::clear_ctrlc_handler();

        let stats = aggregator.snapshot();
        let percentiles = self
            .configuration
            .percentiles
            .clone()
            .unwrap_or_default();
        let mut report = SummaryReport::new(&scenario_name, started, elapsed, &stats, &percentiles.0);
        report.max_users = pool.peak_users();
        report.worker_faults = pool.faults();
        report.canceled = canceled;
        report.history = scheduler.history().to_vec();
        report.evaluate_threshold(self.configuration.failure_rate_threshold);
        info!(
            "run finished: {} requests, {} failures in {:.2}s",
            report.count, report.failure_count, report.duration_secs
        );
        if report.threshold_breached {
            warn!(
                "failure rate {:.4} is above threshold {:?}",
                report.failure_rate, report.failure_rate_threshold
            );
        }

        if !self.configuration.no_print_metrics {
            println!("{}", report);
        }

        if !self.configuration.report_file.is_empty() {
            report.write_json(&self.configuration.report_file).await?;
        }

        Ok(report)
    }
}
