//! Test plan structures and the stage scheduler.
//!
//! A load test is described as an ordered list of [`Stage`]s. Each stage ramps the
//! number of active virtual users linearly from where the previous stage ended to
//! its own target, over its own duration. The [`StageScheduler`] turns that list
//! into a time-varying target and tracks which phase of the run is active.

use chrono::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::config::StampedeConfiguration;
use crate::util;
use crate::StampedeError;

/// One ramp segment: reach `target` users over `duration`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    /// The number of virtual users active when this stage ends.
    pub target: usize,
    /// How long it takes to get there. A zero duration is an instant jump.
    pub duration: Duration,
}
impl Stage {
    pub fn new(target: usize, duration: Duration) -> Self {
        Stage { target, duration }
    }
}

/// A list of stages as configured with `--test-plan`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TestPlan {
    pub stages: Vec<Stage>,
}

/// Implement [`FromStr`] to convert `"target,timespan"` string formatted test plans to a
/// list of [`Stage`]s.
///
/// Targets are represented simply as an integer.
///
/// Time span can be specified as an integer, indicating seconds. Or can use integers together
/// with one or more of "h", "m", "s" and "ms", in that order. Valid formats include: 20, 20s,
/// 3m, 2h, 1h20m, 3h30m10s, 500ms, etc.
impl FromStr for TestPlan {
    type Err = StampedeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut stages = Vec::new();
        // Each line of the test plan must be in the format "{target},{timespan}", white space is ignored
        let re = Regex::new(r"^\s*(\d+)\s*,\s*([0-9hms]+)\s*$")
            .expect("failed to compile test plan regex");
        // A test plan can have multiple lines split by the semicolon ";".
        for line in s.split(';') {
            let stage = re.captures(line).and_then(|cap| {
                let target = cap[1].parse::<usize>().ok()?;
                let duration = util::parse_timespan(&cap[2])?;
                Some(Stage { target, duration })
            });
            match stage {
                Some(stage) => stages.push(stage),
                None => {
                    // Logger isn't initialized yet, provide helpful debug output.
                    eprintln!("ERROR: invalid `configuration.test_plan` value: '{}'", line);
                    eprintln!("  Expected format: --test-plan \"{{target}},{{timespan}};{{target}},{{timespan}}\"");
                    eprintln!("    {{target}} must be an integer, ie \"100\"");
                    eprintln!("    {{timespan}} can be integer seconds or \"30s\", \"20m\", \"3h\", \"500ms\", etc");
                    return Err(StampedeError::InvalidOption {
                        option: "`configuration.test_plan`".to_string(),
                        value: line.to_string(),
                        detail: "invalid `configuration.test_plan` value.".to_string(),
                    });
                }
            }
        }
        Ok(TestPlan { stages })
    }
}

/// The complete, validated schedule for one run.
///
/// Total wall-clock time of a run is the sum of the stage durations plus the graceful
/// ramp-down.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RunSchedule {
    stages: Vec<Stage>,
    start_users: usize,
    graceful_ramp_down: Duration,
    max_users: Option<usize>,
}
impl RunSchedule {
    /// Build a schedule, failing if there are no stages.
    ///
    /// # Example
    /// ```rust
    /// use stampede::test_plan::{RunSchedule, Stage};
    /// use std::time::Duration;
    ///
    /// let schedule = RunSchedule::new(
    ///     vec![Stage::new(10, Duration::from_secs(10))],
    ///     1,
    ///     Duration::ZERO,
    /// ).unwrap();
    /// assert_eq!(schedule.target_at(Duration::ZERO), 1);
    /// assert_eq!(schedule.target_at(Duration::from_secs(5)), 6);
    /// assert_eq!(schedule.target_at(Duration::from_secs(10)), 10);
    /// ```
    pub fn new(
        stages: Vec<Stage>,
        start_users: usize,
        graceful_ramp_down: Duration,
    ) -> Result<Self, StampedeError> {
        if stages.is_empty() {
            return Err(StampedeError::InvalidOption {
                option: "`configuration.test_plan`".to_string(),
                value: "".to_string(),
                detail: "A test plan must have at least one stage.".to_string(),
            });
        }
        // Every later sum of durations is bounded by this total.
        let total = stages
            .iter()
            .map(|s| s.duration)
            .chain(std::iter::once(graceful_ramp_down))
            .try_fold(Duration::ZERO, |total, duration| total.checked_add(duration));
        if total.is_none() {
            return Err(StampedeError::InvalidOption {
                option: "`configuration.test_plan`".to_string(),
                value: format!("{:?}", stages),
                detail: "The stages and graceful ramp-down add up to more time than can be represented."
                    .to_string(),
            });
        }
        Ok(RunSchedule {
            stages,
            start_users,
            graceful_ramp_down,
            max_users: None,
        })
    }

    /// Clamp every target to at most `max_users`.
    pub fn with_max_users(mut self, max_users: Option<usize>) -> Self {
        self.max_users = max_users;
        self
    }

    /// Build the schedule from a configuration that has already been through
    /// [`StampedeConfiguration::configure`].
    pub(crate) fn build(configuration: &StampedeConfiguration) -> Result<Self, StampedeError> {
        let stages = if let Some(test_plan) = configuration.test_plan.as_ref() {
            test_plan.stages.clone()
        } else if let Some(users) = configuration.users {
            // A flat plan: ramp to `users` over the startup time, then hold for the run time.
            let startup_time = parse_option_timespan("startup_time", &configuration.startup_time)?;
            let run_time = parse_option_timespan("run_time", &configuration.run_time)?;
            if run_time.is_zero() {
                return Err(StampedeError::InvalidOption {
                    option: "`configuration.run_time`".to_string(),
                    value: configuration.run_time.to_string(),
                    detail: "`configuration.run_time` must be set when `configuration.users` is set."
                        .to_string(),
                });
            }
            vec![Stage::new(users, startup_time), Stage::new(users, run_time)]
        } else {
            return Err(StampedeError::InvalidOption {
                option: "`configuration.test_plan`".to_string(),
                value: "".to_string(),
                detail: "A test plan is required, set `configuration.test_plan` or `configuration.users`."
                    .to_string(),
            });
        };

        let graceful_ramp_down =
            parse_option_timespan("graceful_ramp_down", &configuration.graceful_ramp_down)?;

        Ok(RunSchedule::new(
            stages,
            configuration.start_users.unwrap_or(1),
            graceful_ramp_down,
        )?
        .with_max_users(configuration.max_users))
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn start_users(&self) -> usize {
        self.start_users
    }

    pub fn graceful_ramp_down(&self) -> Duration {
        self.graceful_ramp_down
    }

    pub fn max_users(&self) -> Option<usize> {
        self.max_users
    }

    /// Elapsed time at which stage `index` ends.
    pub fn stage_end(&self, index: usize) -> Duration {
        self.stages.iter().take(index + 1).map(|s| s.duration).sum()
    }

    /// Sum of all stage durations.
    pub fn stages_duration(&self) -> Duration {
        self.stages.iter().map(|s| s.duration).sum()
    }

    /// Sum of all stage durations plus the graceful ramp-down.
    pub fn total_duration(&self) -> Duration {
        self.stages_duration() + self.graceful_ramp_down
    }

    /// The highest concurrency this schedule ever asks for.
    pub fn max_target(&self) -> usize {
        let max = self
            .stages
            .iter()
            .map(|s| s.target)
            .fold(self.start_users, usize::max);
        self.clamp(max)
    }

    fn clamp(&self, target: usize) -> usize {
        match self.max_users {
            Some(max_users) => target.min(max_users),
            None => target,
        }
    }

    /// Target concurrency `elapsed` into the run.
    ///
    /// Within a stage the target is interpolated linearly from the previous stage's
    /// target (or the start users, for the first stage), rounded to the nearest
    /// integer. The end of a stage is inclusive. Zero-duration stages that end at the
    /// same instant resolve to the last of them. Once the last stage has ended the
    /// target is zero.
    pub fn target_at(&self, elapsed: Duration) -> usize {
        let mut previous = self.start_users as f64;
        let mut stage_start = Duration::ZERO;
        for (index, stage) in self.stages.iter().enumerate() {
            let stage_end = stage_start + stage.duration;
            if elapsed <= stage_end {
                if elapsed == stage_end {
                    if let Some(jump) = self.stages[index + 1..]
                        .iter()
                        .take_while(|s| s.duration.is_zero())
                        .last()
                    {
                        return self.clamp(jump.target);
                    }
                }
                if stage.duration.is_zero() {
                    return self.clamp(stage.target);
                }
                let progress = (elapsed - stage_start).as_secs_f64() / stage.duration.as_secs_f64();
                let target = previous + (stage.target as f64 - previous) * progress;
                return self.clamp(target.round().max(0.0) as usize);
            }
            previous = stage.target as f64;
            stage_start = stage_end;
        }
        0
    }
}

fn parse_option_timespan(option: &str, value: &str) -> Result<Duration, StampedeError> {
    util::parse_timespan(value).ok_or_else(|| StampedeError::InvalidOption {
        option: format!("`configuration.{}`", option),
        value: value.to_string(),
        detail: format!(
            "`configuration.{}` must be integer seconds or a time span like \"1m30s\" or \"500ms\".",
            option
        ),
    })
}

/// The phases a run moves through, strictly in this order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SchedulerState {
    /// The run hasn't started.
    NotStarted,
    /// Stage number `usize` (zero-based) is running.
    Staging(usize),
    /// All stages have ended; in-flight iterations may finish.
    RampingDown,
    /// The run is over.
    Finished,
}
impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SchedulerState::NotStarted => write!(f, "not started"),
            SchedulerState::Staging(index) => write!(f, "stage {}", index + 1),
            SchedulerState::RampingDown => write!(f, "ramping down"),
            SchedulerState::Finished => write!(f, "finished"),
        }
    }
}

/// A historical record of a single scheduler transition, used to generate reports.
#[derive(Clone, Debug, Serialize)]
pub struct StageHistory {
    /// The state entered.
    pub state: SchedulerState,
    /// When the state was entered.
    pub timestamp: DateTime<Utc>,
    /// How far into the run the state was entered, in milliseconds.
    pub elapsed_ms: u64,
    /// The target concurrency when the state was entered.
    pub target: usize,
}

/// Tracks the active phase of a run and its target concurrency.
///
/// # Example
/// ```rust
/// use stampede::test_plan::{RunSchedule, SchedulerState, Stage, StageScheduler};
/// use std::time::Duration;
///
/// let schedule = RunSchedule::new(
///     vec![Stage::new(4, Duration::from_secs(2)), Stage::new(0, Duration::from_secs(2))],
///     0,
///     Duration::from_secs(5),
/// ).unwrap();
/// let mut scheduler = StageScheduler::new(schedule);
/// scheduler.start();
/// assert_eq!(scheduler.update(Duration::from_secs(1), 0), SchedulerState::Staging(0));
/// assert_eq!(scheduler.current_target(), 2);
/// assert_eq!(scheduler.update(Duration::from_secs(3), 2), SchedulerState::Staging(1));
/// assert_eq!(scheduler.update(Duration::from_secs(4), 1), SchedulerState::RampingDown);
/// assert_eq!(scheduler.update(Duration::from_secs(4), 0), SchedulerState::Finished);
/// ```
#[derive(Clone, Debug)]
pub struct StageScheduler {
    schedule: RunSchedule,
    state: SchedulerState,
    target: usize,
    elapsed: Duration,
    history: Vec<StageHistory>,
}
impl StageScheduler {
    pub fn new(schedule: RunSchedule) -> Self {
        let target = schedule.clamp(schedule.start_users);
        StageScheduler {
            schedule,
            state: SchedulerState::NotStarted,
            target,
            elapsed: Duration::ZERO,
            history: Vec::new(),
        }
    }

    pub fn schedule(&self) -> &RunSchedule {
        &self.schedule
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// The target concurrency as of the last [`update`](StageScheduler::update).
    pub fn current_target(&self) -> usize {
        self.target
    }

    pub fn history(&self) -> &[StageHistory] {
        &self.history
    }

    /// Move from NotStarted to the first stage.
    pub fn start(&mut self) {
        if self.state == SchedulerState::NotStarted {
            self.target = self.schedule.target_at(Duration::ZERO);
            self.transition(SchedulerState::Staging(0));
        }
    }

    /// Jump straight to Finished, used when the run is aborted.
    pub fn finish(&mut self) {
        if self.state != SchedulerState::Finished {
            self.target = 0;
            self.transition(SchedulerState::Finished);
        }
    }

    /// Advance the state machine to `elapsed`, given the number of virtual users
    /// that have not yet exited.
    pub fn update(&mut self, elapsed: Duration, active_users: usize) -> SchedulerState {
        // Time never moves backwards for the scheduler.
        self.elapsed = self.elapsed.max(elapsed);
        let elapsed = self.elapsed;

        loop {
            match self.state {
                SchedulerState::NotStarted | SchedulerState::Finished => break,
                SchedulerState::Staging(index) => {
                    if elapsed < self.schedule.stage_end(index) {
                        break;
                    }
                    if index + 1 < self.schedule.stages.len() {
                        self.target = self.schedule.target_at(elapsed);
                        self.transition(SchedulerState::Staging(index + 1));
                    } else {
                        self.target = 0;
                        self.transition(SchedulerState::RampingDown);
                    }
                }
                SchedulerState::RampingDown => {
                    if active_users == 0 || elapsed >= self.schedule.total_duration() {
                        self.transition(SchedulerState::Finished);
                    } else {
                        break;
                    }
                }
            }
        }

        self.target = match self.state {
            SchedulerState::Staging(_) => self.schedule.target_at(elapsed),
            SchedulerState::NotStarted => self.schedule.clamp(self.schedule.start_users),
            SchedulerState::RampingDown | SchedulerState::Finished => 0,
        };
        self.state
    }

    fn transition(&mut self, state: SchedulerState) {
        debug!(
            "scheduler: {} -> {} at {:?}, target {}",
            self.state, state, self.elapsed, self.target
        );
        self.state = state;
        self.history.push(StageHistory {
            state,
            timestamp: Utc::now(),
            elapsed_ms: self.elapsed.as_millis() as u64,
            target: self.target,
        });
    }
}
