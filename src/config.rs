//! Functions and structures related to configuring a Stampede load test.
//!
//! Stampede can be configured at run time by passing in the options and flags defined by
//! the [`StampedeConfiguration`] structure.
//!
//! Stampede can be configured programmatically with [`StampedeDefaultType::set_default`].
//!
//! Each option is resolved in this order, first match wins:
//!  1. the command line,
//!  2. the environment (only `MAX_REQUESTS`, for `--max-users`),
//!  3. a programmatic default set with [`StampedeDefaultType::set_default`],
//!  4. the built-in default.

use gumdrop::Options;
use serde::{Deserialize, Serialize};
use simplelog::*;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::logger::LogFormat;
use crate::test_plan::TestPlan;
use crate::util;
use crate::{Stampede, StampedeError};

/// Runtime options available when launching a Stampede load test.
///
/// Custom defaults can be programmatically set for most of these options using
/// [`StampedeDefaultType::set_default`].
///
/// Stampede leverages [`gumdrop`](https://docs.rs/gumdrop/) to derive the help output
/// from the below structure.
#[derive(Options, Debug, Clone, Default, Serialize, Deserialize)]
#[options(
    help = r#"Stampede drives a ramping number of virtual users against an HTTP endpoint
and reports latency percentiles when the run ends.

The following runtime options are available when launching a Stampede load test:"#
)]
pub struct StampedeConfiguration {
    /// Displays this help
    #[options(short = "h")]
    pub help: bool,
    /// Prints version information
    #[options(short = "V")]
    pub version: bool,
    /// Lists all scenarios and exits
    // Add a blank line after this option
    #[options(short = "l", help = "Lists all scenarios and exits\n")]
    pub list: bool,

    /// Defines host to load test (ie http://10.21.32.33)
    #[options(short = "H")]
    pub host: String,
    /// Selects the scenario to run when more than one is registered
    #[options(no_short, meta = "NAME")]
    pub scenario: String,
    /// Defines the stages to run ("10,30s;10,1m;0,10s")
    #[options(no_short, meta = "\"TESTPLAN\"")]
    pub test_plan: Option<TestPlan>,
    /// Sets concurrent users for a flat test plan
    #[options(short = "u")]
    pub users: Option<usize>,
    /// Ramps up to --users over (30s, 20m, 3h, 1h30m, etc)
    #[options(no_short, meta = "TIME")]
    pub startup_time: String,
    /// Holds --users for (30s, 20m, 3h, 1h30m, etc)
    #[options(short = "t", meta = "TIME")]
    pub run_time: String,
    /// Sets the number of users the first stage ramps from (default: 1)
    #[options(short = "s")]
    pub start_users: Option<usize>,
    /// Lets in-flight iterations finish for up to TIME after the last stage
    #[options(no_short, meta = "TIME")]
    pub graceful_ramp_down: String,
    /// Sets a fixed delay between iterations (1s, 500ms, etc)
    #[options(no_short, meta = "TIME")]
    pub think_time: String,
    /// Caps concurrent users (default: $MAX_REQUESTS)
    #[options(short = "m")]
    pub max_users: Option<usize>,
    /// Sets per-request timeout (30s, 500ms, etc)
    // Add a blank line and then a 'Metrics:' header after this option
    #[options(no_short, meta = "TIME", help = "Sets per-request timeout (30s, 500ms, etc)\n\nMetrics:")]
    pub timeout: Option<String>,

    /// Sets the latency percentiles to report (default: "50,90,95,99")
    #[options(no_short, meta = "\"LIST\"")]
    pub percentiles: Option<Percentiles>,
    /// Fails the run if more than RATE (0-1) of requests fail
    #[options(no_short, meta = "RATE")]
    pub failure_rate_threshold: Option<f32>,
    /// Sets the number of metrics shards (default: number of CPUs)
    #[options(no_short)]
    pub shards: Option<usize>,
    /// Doesn't display metrics at end of load test
    #[options(no_short)]
    pub no_print_metrics: bool,
    /// Writes a json-formatted report
    #[options(no_short, meta = "NAME")]
    pub report_file: String,
    /// Sets request log file name
    #[options(short = "R", meta = "NAME")]
    pub request_log: String,
    /// Sets request log format (csv, json, raw)
    // Add a blank line and then a 'Logging:' header after this option
    #[options(no_short, meta = "FORMAT", help = "Sets request log format (csv, json, raw)\n\nLogging:")]
    pub request_format: Option<LogFormat>,

    /// Enables log file and sets name
    #[options(short = "G", meta = "NAME")]
    pub log_file: String,
    /// Increases log file level (-g, -gg, etc)
    #[options(short = "g", count)]
    pub log_level: u8,
    /// Decreases verbosity (-q, -qq, etc)
    #[options(count, short = "q")]
    pub quiet: u8,
    /// Increases verbosity (-v, -vv, etc)
    #[options(count, short = "v")]
    pub verbose: u8,
}

/// Latency percentiles to report, each greater than 0 and at most 100.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Percentiles(pub Vec<f64>);
impl Default for Percentiles {
    fn default() -> Self {
        Percentiles(vec![50.0, 90.0, 95.0, 99.0])
    }
}
/// Implement [`FromStr`] to convert `"50,90,99.9"` into a sorted list of percentiles.
impl FromStr for Percentiles {
    type Err = StampedeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |detail: &str| StampedeError::InvalidOption {
            option: "`configuration.percentiles`".to_string(),
            value: s.to_string(),
            detail: detail.to_string(),
        };
        let mut percentiles = Vec::new();
        for value in s.split(',') {
            let percentile = f64::from_str(value.trim())
                .map_err(|_| invalid("`configuration.percentiles` must be a comma separated list of numbers."))?;
            if !(percentile > 0.0 && percentile <= 100.0) {
                return Err(invalid(
                    "`configuration.percentiles` must each be greater than 0 and at most 100.",
                ));
            }
            percentiles.push(percentile);
        }
        percentiles.sort_by(|a, b| a.total_cmp(b));
        percentiles.dedup();
        Ok(Percentiles(percentiles))
    }
}

/// Custom defaults, set programmatically with [`StampedeDefaultType::set_default`].
#[derive(Clone, Debug, Default)]
pub(crate) struct StampedeDefaults {
    pub host: Option<String>,
    pub scenario: Option<String>,
    pub test_plan: Option<TestPlan>,
    pub users: Option<usize>,
    pub startup_time: Option<String>,
    pub run_time: Option<String>,
    pub start_users: Option<usize>,
    pub graceful_ramp_down: Option<String>,
    pub think_time: Option<String>,
    pub max_users: Option<usize>,
    pub timeout: Option<String>,
    pub percentiles: Option<Percentiles>,
    pub failure_rate_threshold: Option<f32>,
    pub shards: Option<usize>,
    pub no_print_metrics: Option<bool>,
    pub report_file: Option<String>,
    pub request_log: Option<String>,
    pub request_format: Option<LogFormat>,
    pub log_file: Option<String>,
    pub log_level: Option<u8>,
    pub quiet: Option<u8>,
    pub verbose: Option<u8>,
}

/// Defines all [`StampedeConfiguration`] options that can be programmatically configured
/// with a custom default.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StampedeDefault {
    /// An optional default host to run this load test against.
    Host,
    /// An optional default scenario to run.
    Scenario,
    /// An optional default test plan.
    TestPlan,
    /// An optional default number of users for a flat test plan.
    Users,
    /// An optional default time to ramp up to `Users`.
    StartupTime,
    /// An optional default time to hold `Users`.
    RunTime,
    /// An optional default number of users the first stage ramps from.
    StartUsers,
    /// An optional default graceful ramp-down time.
    GracefulRampDown,
    /// An optional default delay between iterations.
    ThinkTime,
    /// An optional default concurrency cap.
    MaxUsers,
    /// An optional default per-request timeout.
    Timeout,
    /// An optional default list of percentiles to report.
    Percentiles,
    /// An optional default failure rate threshold.
    FailureRateThreshold,
    /// An optional default number of metrics shards.
    Shards,
    /// An optional default for not printing metrics at the end of the run.
    NoPrintMetrics,
    /// An optional default json report file name.
    ReportFile,
    /// An optional default request log file name.
    RequestLog,
    /// An optional default request log format.
    RequestFormat,
    /// An optional default log file name.
    LogFile,
    /// An optional default log file level.
    LogLevel,
    /// An optional default value for quiet level.
    Quiet,
    /// An optional default value for verbosity level.
    Verbose,
}
impl StampedeDefault {
    /// The type [`StampedeDefaultType::set_default`] expects for this option.
    fn value_type(self) -> &'static str {
        match self {
            StampedeDefault::Host
            | StampedeDefault::Scenario
            | StampedeDefault::TestPlan
            | StampedeDefault::StartupTime
            | StampedeDefault::RunTime
            | StampedeDefault::GracefulRampDown
            | StampedeDefault::ThinkTime
            | StampedeDefault::Timeout
            | StampedeDefault::Percentiles
            | StampedeDefault::ReportFile
            | StampedeDefault::RequestLog
            | StampedeDefault::LogFile => "&str",
            StampedeDefault::Users
            | StampedeDefault::StartUsers
            | StampedeDefault::MaxUsers
            | StampedeDefault::Shards
            | StampedeDefault::LogLevel
            | StampedeDefault::Quiet
            | StampedeDefault::Verbose => "usize",
            StampedeDefault::FailureRateThreshold => "f32",
            StampedeDefault::NoPrintMetrics => "bool",
            StampedeDefault::RequestFormat => "LogFormat",
        }
    }

    // Display a helpful and explicit error when a default is set with the wrong type.
    fn wrong_type<T: fmt::Display>(self, value: T, received: &str) -> StampedeError {
        StampedeError::InvalidOption {
            option: format!("StampedeDefault::{:?}", self),
            value: value.to_string(),
            detail: format!(
                "set_default(StampedeDefault::{:?}, {}) expected {} value, received {}",
                self,
                value,
                self.value_type(),
                received
            ),
        }
    }
}

/// Sets a custom default for a [`StampedeDefault`] option.
///
/// The following options are set with a [`&str`]: `Host`, `Scenario`, `TestPlan`,
/// `StartupTime`, `RunTime`, `GracefulRampDown`, `ThinkTime`, `Timeout`, `Percentiles`,
/// `ReportFile`, `RequestLog`, `LogFile`.
///
/// The following options are set with a [`usize`]: `Users`, `StartUsers`, `MaxUsers`,
/// `Shards`, `LogLevel`, `Quiet`, `Verbose`.
///
/// `FailureRateThreshold` is set with an [`f32`], `NoPrintMetrics` with a [`bool`] and
/// `RequestFormat` with a [`LogFormat`].
pub trait StampedeDefaultType<T> {
    /// Sets a [`StampedeDefault`] to the provided value.
    ///
    /// # Example
    /// ```rust
    /// use stampede::prelude::*;
    ///
    /// fn main() -> Result<(), StampedeError> {
    ///     Stampede::initialize_with_config(StampedeConfiguration::default())
    ///         // Ramp to 10 users over 10 seconds.
    ///         .set_default(StampedeDefault::TestPlan, "10,10s")?
    ///         // Don't start more than 5 users.
    ///         .set_default(StampedeDefault::MaxUsers, 5)?
    ///         // Do not print the summary tables.
    ///         .set_default(StampedeDefault::NoPrintMetrics, true)?;
    ///
    ///     Ok(())
    /// }
    /// ```
    fn set_default(self, key: StampedeDefault, value: T) -> Result<Box<Self>, StampedeError>;
}
impl StampedeDefaultType<&str> for Stampede {
    /// Sets [`StampedeDefault`] to a [`&str`] value.
    fn set_default(mut self, key: StampedeDefault, value: &str) -> Result<Box<Self>, StampedeError> {
        match key {
            StampedeDefault::Host => {
                self.defaults.host = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                }
            }
            StampedeDefault::Scenario => self.defaults.scenario = Some(value.to_string()),
            StampedeDefault::TestPlan => self.defaults.test_plan = Some(value.parse()?),
            StampedeDefault::StartupTime => self.defaults.startup_time = Some(value.to_string()),
            StampedeDefault::RunTime => self.defaults.run_time = Some(value.to_string()),
            StampedeDefault::GracefulRampDown => {
                self.defaults.graceful_ramp_down = Some(value.to_string())
            }
            StampedeDefault::ThinkTime => self.defaults.think_time = Some(value.to_string()),
            StampedeDefault::Timeout => self.defaults.timeout = Some(value.to_string()),
            StampedeDefault::Percentiles => self.defaults.percentiles = Some(value.parse()?),
            StampedeDefault::ReportFile => self.defaults.report_file = Some(value.to_string()),
            StampedeDefault::RequestLog => self.defaults.request_log = Some(value.to_string()),
            StampedeDefault::LogFile => self.defaults.log_file = Some(value.to_string()),
            _ => return Err(key.wrong_type(value, "&str")),
        }
        Ok(Box::new(self))
    }
}
impl StampedeDefaultType<usize> for Stampede {
    /// Sets [`StampedeDefault`] to a [`usize`] value.
    fn set_default(mut self, key: StampedeDefault, value: usize) -> Result<Box<Self>, StampedeError> {
        match key {
            StampedeDefault::Users => self.defaults.users = Some(value),
            StampedeDefault::StartUsers => self.defaults.start_users = Some(value),
            StampedeDefault::MaxUsers => self.defaults.max_users = Some(value),
            StampedeDefault::Shards => self.defaults.shards = Some(value),
            StampedeDefault::LogLevel => self.defaults.log_level = Some(value as u8),
            StampedeDefault::Quiet => self.defaults.quiet = Some(value as u8),
            StampedeDefault::Verbose => self.defaults.verbose = Some(value as u8),
            _ => return Err(key.wrong_type(value, "usize")),
        }
        Ok(Box::new(self))
    }
}
impl StampedeDefaultType<f32> for Stampede {
    /// Sets [`StampedeDefault`] to an [`f32`] value.
    fn set_default(mut self, key: StampedeDefault, value: f32) -> Result<Box<Self>, StampedeError> {
        match key {
            StampedeDefault::FailureRateThreshold => {
                self.defaults.failure_rate_threshold = Some(value)
            }
            _ => return Err(key.wrong_type(value, "f32")),
        }
        Ok(Box::new(self))
    }
}
impl StampedeDefaultType<bool> for Stampede {
    /// Sets [`StampedeDefault`] to a [`bool`] value.
    fn set_default(mut self, key: StampedeDefault, value: bool) -> Result<Box<Self>, StampedeError> {
        match key {
            StampedeDefault::NoPrintMetrics => self.defaults.no_print_metrics = Some(value),
            _ => return Err(key.wrong_type(value, "bool")),
        }
        Ok(Box::new(self))
    }
}
impl StampedeDefaultType<LogFormat> for Stampede {
    /// Sets [`StampedeDefault`] to a [`LogFormat`] value.
    fn set_default(
        mut self,
        key: StampedeDefault,
        value: LogFormat,
    ) -> Result<Box<Self>, StampedeError> {
        match key {
            StampedeDefault::RequestFormat => self.defaults.request_format = Some(value),
            _ => return Err(key.wrong_type(value, "LogFormat")),
        }
        Ok(Box::new(self))
    }
}

/// One candidate source for an option.
pub(crate) struct StampedeValue<'a, T> {
    /// The optional value to set.
    pub(crate) value: Option<T>,
    /// Skip this value if true.
    pub(crate) filter: bool,
    /// An optional INFO level log message.
    pub(crate) message: &'a str,
}

pub(crate) trait StampedeConfigure<T> {
    /// Return the first value that is set and not filtered.
    fn get_value(&self, values: Vec<StampedeValue<T>>) -> Option<T>;
}
impl<T: fmt::Debug> StampedeConfigure<T> for StampedeConfiguration {
    fn get_value(&self, values: Vec<StampedeValue<T>>) -> Option<T> {
        for value in values {
            if let Some(v) = value.value {
                if value.filter {
                    continue;
                }
                if !value.message.is_empty() {
                    info!("{} = {:?}", value.message, v)
                }
                return Some(v);
            }
        }
        None
    }
}

impl StampedeConfiguration {
    /// Resolve every option from the command line, the environment and `defaults`.
    pub(crate) fn configure(&mut self, defaults: &StampedeDefaults) {
        // Configure `quiet`.
        self.quiet = self
            .get_value(vec![
                // Use --quiet if set.
                StampedeValue {
                    value: Some(self.quiet),
                    filter: self.quiet == 0,
                    message: "",
                },
                // Otherwise use StampedeDefault if set.
                StampedeValue {
                    value: defaults.quiet,
                    filter: false,
                    message: "",
                },
            ])
            .unwrap_or(0);

        // Configure `verbose`.
        self.verbose = self
            .get_value(vec![
                StampedeValue {
                    value: Some(self.verbose),
                    filter: self.verbose == 0,
                    message: "",
                },
                StampedeValue {
                    value: defaults.verbose,
                    filter: false,
                    message: "",
                },
            ])
            .unwrap_or(0);

        // Configure `log_level`.
        self.log_level = self
            .get_value(vec![
                StampedeValue {
                    value: Some(self.log_level),
                    filter: self.log_level == 0,
                    message: "",
                },
                StampedeValue {
                    value: defaults.log_level,
                    filter: false,
                    message: "",
                },
            ])
            .unwrap_or(0);

        self.log_file = self.configure_string(&self.log_file, &defaults.log_file, "", "");
        self.host = self.configure_string(&self.host, &defaults.host, "host", "");
        self.scenario = self.configure_string(&self.scenario, &defaults.scenario, "scenario", "");

        // Configure `test_plan` before `users`, they are mutually exclusive.
        self.test_plan = self.get_value(vec![
            // Use --test-plan if set.
            StampedeValue {
                value: self.test_plan.clone(),
                filter: false,
                message: "test_plan",
            },
            // Otherwise use StampedeDefault if --users isn't set.
            StampedeValue {
                value: defaults.test_plan.clone(),
                filter: self.users.is_some(),
                message: "test_plan",
            },
        ]);

        // Configure `users`.
        self.users = self.get_value(vec![
            StampedeValue {
                value: self.users,
                filter: false,
                message: "users",
            },
            // Don't mix a default flat plan with a configured test plan.
            StampedeValue {
                value: defaults.users,
                filter: self.test_plan.is_some(),
                message: "users",
            },
        ]);

        self.startup_time =
            self.configure_string(&self.startup_time, &defaults.startup_time, "startup_time", "0");
        self.run_time = self.configure_string(&self.run_time, &defaults.run_time, "run_time", "0");
        self.graceful_ramp_down = self.configure_string(
            &self.graceful_ramp_down,
            &defaults.graceful_ramp_down,
            "graceful_ramp_down",
            "0",
        );
        self.think_time =
            self.configure_string(&self.think_time, &defaults.think_time, "think_time", "0");

        // Configure `start_users`.
        self.start_users = Some(
            self.get_value(vec![
                StampedeValue {
                    value: self.start_users,
                    filter: false,
                    message: "start_users",
                },
                StampedeValue {
                    value: defaults.start_users,
                    filter: false,
                    message: "start_users",
                },
            ])
            .unwrap_or(1),
        );

        // Configure `max_users`, the environment overrides programmatic defaults.
        self.max_users = self.get_value(vec![
            StampedeValue {
                value: self.max_users,
                filter: false,
                message: "max_users",
            },
            StampedeValue {
                value: util::max_users_from_env(),
                filter: false,
                message: "max_users (from MAX_REQUESTS)",
            },
            StampedeValue {
                value: defaults.max_users,
                filter: false,
                message: "max_users",
            },
        ]);

        // Configure `timeout`.
        self.timeout = self.get_value(vec![
            StampedeValue {
                value: self.timeout.clone(),
                filter: false,
                message: "timeout",
            },
            StampedeValue {
                value: defaults.timeout.clone(),
                filter: false,
                message: "timeout",
            },
        ]);

        // Configure `percentiles`.
        self.percentiles = Some(
            self.get_value(vec![
                StampedeValue {
                    value: self.percentiles.clone(),
                    filter: false,
                    message: "percentiles",
                },
                StampedeValue {
                    value: defaults.percentiles.clone(),
                    filter: false,
                    message: "percentiles",
                },
            ])
            .unwrap_or_default(),
        );

        // Configure `failure_rate_threshold`.
        self.failure_rate_threshold = self.get_value(vec![
            StampedeValue {
                value: self.failure_rate_threshold,
                filter: false,
                message: "failure_rate_threshold",
            },
            StampedeValue {
                value: defaults.failure_rate_threshold,
                filter: false,
                message: "failure_rate_threshold",
            },
        ]);

        // Configure `shards`, defaulting to one per CPU.
        self.shards = Some(
            self.get_value(vec![
                StampedeValue {
                    value: self.shards,
                    filter: false,
                    message: "shards",
                },
                StampedeValue {
                    value: defaults.shards,
                    filter: false,
                    message: "shards",
                },
            ])
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
            }),
        );

        // Configure `no_print_metrics`.
        self.no_print_metrics = self
            .get_value(vec![
                StampedeValue {
                    value: Some(self.no_print_metrics),
                    filter: !self.no_print_metrics,
                    message: "no_print_metrics",
                },
                StampedeValue {
                    value: defaults.no_print_metrics,
                    filter: false,
                    message: "no_print_metrics",
                },
            ])
            .unwrap_or(false);

        self.report_file =
            self.configure_string(&self.report_file, &defaults.report_file, "report_file", "");
        self.request_log =
            self.configure_string(&self.request_log, &defaults.request_log, "request_log", "");

        // Configure `request_format`.
        self.request_format = self.get_value(vec![
            StampedeValue {
                value: self.request_format,
                filter: false,
                message: "request_format",
            },
            StampedeValue {
                value: defaults.request_format,
                filter: false,
                message: "request_format",
            },
        ]);
    }

    // Strings are unset when empty: use the command line, then the default, then `fallback`.
    fn configure_string(
        &self,
        value: &str,
        default: &Option<String>,
        message: &str,
        fallback: &str,
    ) -> String {
        self.get_value(vec![
            StampedeValue {
                value: Some(value.to_string()),
                filter: value.is_empty(),
                message,
            },
            StampedeValue {
                value: default.clone(),
                filter: false,
                message,
            },
        ])
        .unwrap_or_else(|| fallback.to_string())
    }

    /// Validate the resolved configuration, failing before any virtual user is spawned.
    pub(crate) fn validate(&self) -> Result<(), StampedeError> {
        // Can't set both --verbose and --quiet.
        if self.verbose > 0 && self.quiet > 0 {
            return Err(StampedeError::InvalidOption {
                option: "`configuration.verbose`".to_string(),
                value: self.verbose.to_string(),
                detail: "`configuration.verbose` can not be set with `configuration.quiet`."
                    .to_string(),
            });
        }

        // Can't set both --test-plan and --users.
        if self.test_plan.is_some() && self.users.is_some() {
            return Err(StampedeError::InvalidOption {
                option: "`configuration.test_plan`".to_string(),
                value: format!("{:?}", self.test_plan),
                detail: "`configuration.test_plan` can not be set with `configuration.users`."
                    .to_string(),
            });
        }

        // Startup and run time only apply to a flat test plan.
        if self.users.is_none() {
            for (option, value) in [("startup_time", &self.startup_time), ("run_time", &self.run_time)] {
                if value.as_str() != "0" {
                    return Err(StampedeError::InvalidOption {
                        option: format!("`configuration.{}`", option),
                        value: value.to_string(),
                        detail: format!(
                            "`configuration.{}` can only be set with `configuration.users`.",
                            option
                        ),
                    });
                }
            }
        }

        // Validate `users`.
        if let Some(users) = self.users {
            if users == 0 {
                return Err(StampedeError::InvalidOption {
                    option: "`configuration.users`".to_string(),
                    value: users.to_string(),
                    detail: "`configuration.users` must be set to at least 1.".to_string(),
                });
            }
        }

        // All time spans must parse.
        for (option, value) in [
            ("startup_time", &self.startup_time),
            ("run_time", &self.run_time),
            ("graceful_ramp_down", &self.graceful_ramp_down),
            ("think_time", &self.think_time),
        ] {
            if util::parse_timespan(value).is_none() {
                return Err(StampedeError::InvalidOption {
                    option: format!("`configuration.{}`", option),
                    value: value.to_string(),
                    detail: format!(
                        "`configuration.{}` must be integer seconds or a time span like \"1m30s\" or \"500ms\".",
                        option
                    ),
                });
            }
        }

        // If set, timeout must be greater than zero.
        if let Some(timeout) = self.timeout.as_ref() {
            match util::parse_timespan(timeout) {
                Some(t) if !t.is_zero() => (),
                _ => {
                    return Err(StampedeError::InvalidOption {
                        option: "`configuration.timeout`".to_string(),
                        value: timeout.to_string(),
                        detail: "`configuration.timeout` must be a time span greater than 0."
                            .to_string(),
                    })
                }
            }
        }

        // Validate `max_users`.
        if self.max_users == Some(0) {
            return Err(StampedeError::InvalidOption {
                option: "`configuration.max_users`".to_string(),
                value: "0".to_string(),
                detail: "`configuration.max_users` must be set to at least 1.".to_string(),
            });
        }

        // Validate `shards`.
        if self.shards == Some(0) {
            return Err(StampedeError::InvalidOption {
                option: "`configuration.shards`".to_string(),
                value: "0".to_string(),
                detail: "`configuration.shards` must be set to at least 1.".to_string(),
            });
        }

        // Validate `failure_rate_threshold`.
        if let Some(threshold) = self.failure_rate_threshold {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(StampedeError::InvalidOption {
                    option: "`configuration.failure_rate_threshold`".to_string(),
                    value: threshold.to_string(),
                    detail: "`configuration.failure_rate_threshold` must be between 0 and 1."
                        .to_string(),
                });
            }
        }

        // Request format requires a request log.
        if self.request_format.is_some() && self.request_log.is_empty() {
            return Err(StampedeError::InvalidOption {
                option: "`configuration.request_format`".to_string(),
                value: format!("{:?}", self.request_format),
                detail: "`configuration.request_format` can not be set without setting `configuration.request_log`."
                    .to_string(),
            });
        }

        Ok(())
    }

    /// The resolved think time, falling back to zero.
    pub(crate) fn think_time(&self) -> Duration {
        util::parse_timespan(&self.think_time).unwrap_or_default()
    }

    /// The resolved per-request timeout, if any.
    pub(crate) fn request_timeout(&self) -> Option<Duration> {
        self.timeout.as_deref().and_then(util::parse_timespan)
    }

    /// Configure the process-wide logger: stdout at a level driven by `--verbose` and
    /// `--quiet`, plus an optional log file at a level driven by `--log-level`.
    pub(crate) fn initialize_logger(&self) -> Result<(), StampedeError> {
        // Configure debug output level.
        let debug_level = match self.verbose {
            0 => match self.quiet {
                0 => LevelFilter::Info,
                _ => LevelFilter::Warn,
            },
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Configure log file level.
        let log_level = match self.log_level {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Open the log file if configured.
        let log_file: Option<PathBuf> = if !self.log_file.is_empty() {
            Some(PathBuf::from(&self.log_file))
        } else {
            None
        };

        let mut loggers: Vec<Box<dyn SharedLogger>> =
            vec![SimpleLogger::new(debug_level, Config::default())];
        if let Some(log_to_file) = log_file.as_ref() {
            loggers.push(WriteLogger::new(
                log_level,
                Config::default(),
                std::fs::File::create(log_to_file)?,
            ));
        }
        match CombinedLogger::init(loggers) {
            Ok(_) => (),
            // Only one logger per process, later runs (ie tests) reuse the first.
            Err(e) => info!("failed to initialize CombinedLogger: {}", e),
        }
        if let Some(log_to_file) = log_file {
            info!("Writing to log file: {}", log_to_file.display());
        }

        info!("Output verbosity level: {}", debug_level);
        info!("Logfile verbosity level: {}", log_level);
        Ok(())
    }
}
