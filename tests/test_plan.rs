use std::sync::Arc;
use std::time::Duration;

mod common;

use common::{get_index, FakeTransport, Responses};
use stampede::prelude::*;

const HOST: &str = "http://localhost:9999";

// Requests take 5ms, users don't wait between iterations.
const LATENCY: Duration = Duration::from_millis(5);

fn states(report: &SummaryReport) -> Vec<SchedulerState> {
    report.history.iter().map(|h| h.state).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
/// Ramp from 1 to 10 users, then stop.
async fn test_ramp_up() {
    let transport = Arc::new(FakeTransport::new(LATENCY, Responses::Success));
    let configuration =
        common::build_configuration(HOST, vec!["--test-plan", "10,1s", "--start-users", "1"]);
    let stampede = common::build_load_test(configuration, scenario!(get_index))
        .set_transport(transport.clone());
    let report = common::run_load_test(stampede).await;

    // The last reconcile may land just before the end of the stage.
    assert!(report.max_users >= 9 && report.max_users <= 10);
    assert!(report.count > 0);
    assert_eq!(report.failure_count, 0);
    assert!(!report.canceled);
    assert!(!report.threshold_breached);
    // Every request that reached the transport finished during the ramp-down.
    assert_eq!(report.count as usize, transport.requests());
    assert_eq!(
        states(&report),
        vec![
            SchedulerState::Staging(0),
            SchedulerState::RampingDown,
            SchedulerState::Finished
        ]
    );
    // The run lasts as long as the plan, plus however long the last iteration took.
    assert!(report.duration_secs >= 1.0);
    assert!(report.duration_secs < 3.0);
    // Latency is at least the transport's.
    assert!(report.min_ms >= 4.9);
    assert!(report.p99_ms >= report.min_ms);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
/// Increase, hold, then decrease to zero.
async fn test_multiple_stages() {
    let transport = Arc::new(FakeTransport::new(LATENCY, Responses::Success));
    let configuration = common::build_configuration(
        HOST,
        vec!["--test-plan", "4,300ms;4,300ms;0,300ms", "--start-users", "0"],
    );
    let stampede = common::build_load_test(configuration, scenario!(get_index))
        .set_transport(transport);
    let report = common::run_load_test(stampede).await;

    assert_eq!(report.max_users, 4);
    assert!(report.count > 0);
    assert_eq!(
        states(&report),
        vec![
            SchedulerState::Staging(0),
            SchedulerState::Staging(1),
            SchedulerState::Staging(2),
            SchedulerState::RampingDown,
            SchedulerState::Finished
        ]
    );
    // Stage transitions are recorded in order.
    let elapsed: Vec<u64> = report.history.iter().map(|h| h.elapsed_ms).collect();
    assert!(elapsed.windows(2).all(|w| w[0] <= w[1]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
/// Never run more users than --max-users.
async fn test_max_users() {
    let transport = Arc::new(FakeTransport::new(LATENCY, Responses::Success));
    let configuration = common::build_configuration(
        HOST,
        vec!["--test-plan", "20,500ms", "--max-users", "3"],
    );
    let stampede = common::build_load_test(configuration, scenario!(get_index))
        .set_transport(transport);
    let report = common::run_load_test(stampede).await;

    assert_eq!(report.max_users, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
/// A flat plan: --users held for --run-time.
async fn test_users_and_run_time() {
    let transport = Arc::new(FakeTransport::new(LATENCY, Responses::AlternateFailures));
    let configuration = common::build_configuration(
        HOST,
        vec!["--users", "2", "--run-time", "500ms", "--start-users", "2"],
    );
    let stampede = common::build_load_test(configuration, scenario!(get_index))
        .set_transport(transport.clone());
    let report = common::run_load_test(stampede).await;

    assert_eq!(report.max_users, 2);
    // Every other request failed.
    assert_eq!(report.count as usize, transport.requests());
    assert_eq!(report.failure_count, report.count / 2);
    assert!((report.failure_rate - 0.5).abs() < 0.05);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
/// Think time is waited between iterations.
async fn test_think_time() {
    let transport = Arc::new(FakeTransport::new(LATENCY, Responses::Success));
    let configuration = common::build_configuration(
        HOST,
        vec![
            "--users",
            "1",
            "--run-time",
            "1s",
            "--start-users",
            "1",
            "--think-time",
            "400ms",
        ],
    );
    let stampede = common::build_load_test(configuration, scenario!(get_index))
        .set_transport(transport);
    let report = common::run_load_test(stampede).await;

    // One request at 0ms, 405ms and 810ms, then the ramp-down stops the user.
    assert!(report.count >= 2);
    assert!(report.count <= 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
/// Without a graceful ramp-down, in-flight requests are canceled and not recorded.
async fn test_no_graceful_ramp_down() {
    let transport = Arc::new(FakeTransport::new(
        Duration::from_secs(30),
        Responses::Success,
    ));
    let configuration = common::build_configuration(
        HOST,
        vec!["--test-plan", "3,300ms", "--graceful-ramp-down", "0"],
    );
    let stampede = common::build_load_test(configuration, scenario!(get_index))
        .set_transport(transport.clone());
    let report = common::run_load_test(stampede).await;

    assert!(transport.requests() > 0);
    assert_eq!(report.count, 0);
    assert!(report.duration_secs < 5.0);
}
