/// Validate that Stampede properly shuts down when it receives SIGINT (control-c), or
/// when the run's cancellation token is canceled.
use nix::sys::signal::{kill, SIGINT};
use nix::unistd::getpid;
use serial_test::serial;
use std::sync::Arc;
use tokio::time::{sleep, Duration, Instant};

mod common;

use common::{get_index, FakeTransport, Responses};
use stampede::prelude::*;

const HOST: &str = "http://localhost:9999";

// A plan that would run far longer than the tests wait.
const TEST_PLAN: &str = "4,200ms;4,60s";

// Requests never finish on their own during these tests.
const LATENCY: Duration = Duration::from_secs(30);

fn build_load_test() -> (Stampede, Arc<FakeTransport>) {
    let transport = Arc::new(FakeTransport::new(LATENCY, Responses::Success));
    let configuration = common::build_configuration(
        HOST,
        vec!["--test-plan", TEST_PLAN, "--graceful-ramp-down", "30s"],
    );
    let stampede =
        common::build_load_test(configuration, scenario!(get_index)).set_transport(transport.clone());
    (stampede, transport)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
/// Cancel the run with ctrl-c.
async fn test_cancel_sigint() {
    let (stampede, transport) = build_load_test();

    // Send SIGINT once the users are running.
    tokio::spawn(async {
        sleep(Duration::from_millis(500)).await;
        kill(getpid(), SIGINT).expect("failed to send SIGINT");
    });

    let started = Instant::now();
    let report = common::run_load_test(stampede).await;

    // In-flight requests were canceled, not waited for.
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(report.canceled);
    assert!(transport.requests() > 0);
    assert_eq!(report.count, 0);
    assert_eq!(
        report.history.last().map(|h| h.state),
        Some(SchedulerState::Finished)
    );
    // The ramp-down was skipped.
    assert!(report
        .history
        .iter()
        .all(|h| h.state != SchedulerState::RampingDown));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
/// Cancel the run through its cancellation token, with completed requests recorded.
async fn test_cancel_token() {
    let transport = Arc::new(FakeTransport::new(
        Duration::from_millis(10),
        Responses::Success,
    ));
    let configuration = common::build_configuration(HOST, vec!["--test-plan", TEST_PLAN]);
    let stampede =
        common::build_load_test(configuration, scenario!(get_index)).set_transport(transport);
    let token = stampede.cancellation_token();

    tokio::spawn(async move {
        sleep(Duration::from_millis(500)).await;
        token.cancel();
    });

    let started = Instant::now();
    let report = common::run_load_test(stampede).await;

    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(report.canceled);
    // A partial report is still produced.
    assert!(report.count > 0);
    assert!(report.max_users >= 1);
    assert!(report.duration_secs < 5.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
/// A token canceled before the run starts produces an empty report.
async fn test_cancel_before_start() {
    let (stampede, _) = build_load_test();
    stampede.cancellation_token().cancel();

    let report = common::run_load_test(stampede).await;
    assert!(report.canceled);
    assert_eq!(report.count, 0);
    assert_eq!(report.max_users, 0);
}
