use chrono::Utc;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::logger::RequestLoggerTx;
use crate::metrics::{Aggregator, Outcome, RequestSample};
use crate::scenario::{ScenarioContext, ScenarioError, ScenarioFunction};

/// Lifecycle of a single virtual user.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum VirtualUserState {
    /// Spawned, first iteration not yet started.
    Idle = 0,
    /// Looping over scenario iterations.
    Running = 1,
    /// Finishing the current iteration, then exiting.
    Stopping = 2,
    /// Exited.
    Stopped = 3,
}
impl VirtualUserState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => VirtualUserState::Idle,
            1 => VirtualUserState::Running,
            2 => VirtualUserState::Stopping,
            _ => VirtualUserState::Stopped,
        }
    }

    /// Idle and Running users count toward the pool's concurrency.
    pub fn is_active(self) -> bool {
        matches!(self, VirtualUserState::Idle | VirtualUserState::Running)
    }
}

/// A virtual user's state, shared between the user task and the pool registry.
#[derive(Clone, Debug)]
pub(crate) struct UserState(Arc<AtomicU8>);
impl UserState {
    pub(crate) fn new() -> Self {
        UserState(Arc::new(AtomicU8::new(VirtualUserState::Idle as u8)))
    }

    pub(crate) fn get(&self) -> VirtualUserState {
        VirtualUserState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: VirtualUserState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Idle -> Running. Fails if the user was told to stop before it started.
    fn start(&self) -> bool {
        self.0
            .compare_exchange(
                VirtualUserState::Idle as u8,
                VirtualUserState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Idle or Running -> Stopping. Returns `false` if already stopping or stopped.
    pub(crate) fn stop(&self) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if VirtualUserState::from_u8(current).is_active() {
                    Some(VirtualUserState::Stopping as u8)
                } else {
                    None
                }
            })
            .is_ok()
    }
}

/// How a virtual user's loop ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum UserExit {
    /// Told to stop, exited between iterations.
    Stopped,
    /// The run was canceled mid-iteration.
    Canceled,
    /// The scenario returned a fatal error or panicked.
    Faulted,
}

/// Everything a virtual user task owns.
pub(crate) struct VirtualUser {
    pub(crate) id: usize,
    pub(crate) scenario_name: String,
    pub(crate) function: ScenarioFunction,
    pub(crate) context: ScenarioContext,
    pub(crate) think_time: Duration,
    pub(crate) state: UserState,
    /// Canceled when this user is retired, cuts think time short.
    pub(crate) stop: CancellationToken,
    pub(crate) aggregator: Arc<Aggregator>,
    pub(crate) logger: RequestLoggerTx,
}
impl VirtualUser {
    fn record(&self, samples: Vec<RequestSample>) {
        for sample in samples {
            // If request-log is enabled, send a copy of the sample to the logger task.
            if let Some(logger) = self.logger.as_ref() {
                // Best effort, the logger may already be gone during shutdown.
                let _ = logger.send(Some(sample.clone()));
            }
            self.aggregator.record(sample);
        }
    }

    fn keep_running(&self) -> bool {
        self.state.get() == VirtualUserState::Running
    }
}

pub(crate) async fn user_main(user: VirtualUser) -> UserExit {
    if !user.state.start() {
        debug!("user {} retired before starting", user.id);
        return UserExit::Stopped;
    }
    debug!("launching user {} from {}...", user.id, user.scenario_name);

    let mut iteration = 0;
    let exit = loop {
        let ctx = user.context.for_iteration(iteration);
        let started = Utc::now();
        let timer = Instant::now();

        // A panicking scenario must not take the run down with it.
        let result = AssertUnwindSafe((user.function)(ctx)).catch_unwind().await;
        match result {
            Ok(Ok(samples)) => user.record(samples),
            Ok(Err(ScenarioError::Canceled)) => break UserExit::Canceled,
            Ok(Err(ScenarioError::Fatal(reason))) => {
                error!(
                    "user {} from {}: scenario failed: {}",
                    user.id, user.scenario_name, reason
                );
                user.record(vec![fault_sample(user.id, started, timer, reason)]);
                break UserExit::Faulted;
            }
            Err(panic) => {
                let reason = panic_reason(panic.as_ref());
                error!(
                    "user {} from {}: scenario panicked: {}",
                    user.id, user.scenario_name, reason
                );
                user.record(vec![fault_sample(user.id, started, timer, reason)]);
                break UserExit::Faulted;
            }
        }
        iteration += 1;

        if !user.keep_running() {
            break UserExit::Stopped;
        }

        if user.think_time.is_zero() {
            // Let other tasks run between back-to-back iterations.
            tokio::task::yield_now().await;
        } else {
            tokio::select! {
                _ = tokio::time::sleep(user.think_time) => {},
                _ = user.stop.cancelled() => break UserExit::Stopped,
                _ = user.context.cancellation().cancelled() => break UserExit::Canceled,
            }
        }

        if !user.keep_running() {
            break UserExit::Stopped;
        }
    };

    user.state.set(VirtualUserState::Stopped);
    debug!(
        "exiting user {} from {} after {} iterations ({:?})...",
        user.id, user.scenario_name, iteration, exit
    );
    exit
}

fn fault_sample(
    user: usize,
    started: chrono::DateTime<Utc>,
    timer: Instant,
    reason: String,
) -> RequestSample {
    RequestSample::new(user, started, timer.elapsed(), Outcome::Failure(reason))
}

fn panic_reason(panic: &(dyn Any + Send)) -> String {
    if let Some(reason) = panic.downcast_ref::<&str>() {
        format!("panic: {}", reason)
    } else if let Some(reason) = panic.downcast_ref::<String>() {
        format!("panic: {}", reason)
    } else {
        "panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{HttpTransport, TransportRequest, TransportResponse};
    use crate::scenario::{Scenario, ScenarioResult};
    use async_trait::async_trait;

    struct NoTransport;

    #[async_trait]
    impl HttpTransport for NoTransport {
        async fn do_request(&self, _request: TransportRequest) -> TransportResponse {
            TransportResponse::default()
        }
    }

    fn virtual_user(scenario: Scenario, think_time: Duration) -> (VirtualUser, Arc<Aggregator>) {
        let aggregator = Arc::new(Aggregator::new(1));
        let user = VirtualUser {
            id: 1,
            scenario_name: scenario.name.clone(),
            function: scenario.function.clone(),
            context: ScenarioContext::new(1, None, Arc::new(NoTransport), CancellationToken::new()),
            think_time,
            state: UserState::new(),
            stop: CancellationToken::new(),
            aggregator: aggregator.clone(),
            logger: None,
        };
        (user, aggregator)
    }

    async fn one_sample(ctx: ScenarioContext) -> ScenarioResult {
        Ok(vec![RequestSample::new(
            ctx.user,
            Utc::now(),
            Duration::from_millis(1),
            Outcome::Success,
        )])
    }

    #[test]
    fn state_transitions() {
        let state = UserState::new();
        assert_eq!(state.get(), VirtualUserState::Idle);
        assert!(state.start());
        assert_eq!(state.get(), VirtualUserState::Running);
        assert!(!state.start());
        assert!(state.stop());
        assert_eq!(state.get(), VirtualUserState::Stopping);
        assert!(!state.stop());
        state.set(VirtualUserState::Stopped);
        assert!(!state.stop());
        assert!(!VirtualUserState::Stopped.is_active());
    }

    #[tokio::test]
    async fn retired_before_start() {
        let (user, aggregator) = virtual_user(Scenario::new("one", one_sample), Duration::ZERO);
        user.state.stop();
        assert_eq!(user_main(user).await, UserExit::Stopped);
        assert_eq!(aggregator.snapshot().count, 0);
    }

    #[tokio::test]
    async fn stops_between_iterations() {
        let (user, aggregator) =
            virtual_user(Scenario::new("one", one_sample), Duration::from_secs(60));
        let state = user.state.clone();
        let stop = user.stop.clone();
        let task = tokio::spawn(user_main(user));
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Sitting in think time, stopping cuts it short.
        state.stop();
        stop.cancel();
        assert_eq!(task.await.unwrap(), UserExit::Stopped);
        assert_eq!(state.get(), VirtualUserState::Stopped);
        assert_eq!(aggregator.snapshot().count, 1);
    }

    #[tokio::test]
    async fn fatal_error_is_a_failure_sample() {
        let scenario = Scenario::new("fatal", |_ctx: ScenarioContext| async {
            Err(ScenarioError::Fatal("bad payload".to_string()))
        });
        let (user, aggregator) = virtual_user(scenario, Duration::ZERO);
        assert_eq!(user_main(user).await, UserExit::Faulted);
        let stats = aggregator.snapshot();
        assert_eq!(stats.count, 1);
        assert_eq!(stats.failure_count, 1);
    }

    #[tokio::test]
    async fn panic_is_contained() {
        let scenario = Scenario::new("panics", |_ctx: ScenarioContext| async {
            if true {
                panic!("scenario bug");
            }
            Ok(vec![])
        });
        let (user, aggregator) = virtual_user(scenario, Duration::ZERO);
        assert_eq!(user_main(user).await, UserExit::Faulted);
        assert_eq!(aggregator.snapshot().failure_count, 1);
    }

    #[tokio::test]
    async fn cancel_during_think_time() {
        let (user, _) = virtual_user(Scenario::new("one", one_sample), Duration::from_secs(60));
        let token = user.context.cancellation().clone();
        let task = tokio::spawn(user_main(user));
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        assert_eq!(task.await.unwrap(), UserExit::Canceled);
    }
}
