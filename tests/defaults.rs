/// Validate that programmatic defaults configure a run, and that the command line
/// overrides them.
use httpmock::{Method::GET, MockServer};
use std::sync::Arc;
use std::time::Duration;

mod common;

use common::{get_index, FakeTransport, Responses};
use stampede::logger::LogFormat;
use stampede::prelude::*;

// Paths used in load tests performed during these tests.
const INDEX_PATH: &str = "/";

const REQUEST_LOG: &str = "defaults-request.log";
const REPORT_FILE: &str = "defaults-report.json";

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
/// Configure a run entirely through defaults.
async fn test_defaults() {
    common::cleanup_files(vec![REQUEST_LOG, REPORT_FILE]);

    let server = MockServer::start_async().await;
    let index = server
        .mock_async(|when, then| {
            when.method(GET).path(INDEX_PATH);
            then.status(200);
        })
        .await;

    let report = Stampede::initialize_with_config(StampedeConfiguration::default())
        .register_scenario(scenario!(get_index))
        .set_default(StampedeDefault::Host, server.base_url().as_str())
        .unwrap()
        .set_default(StampedeDefault::TestPlan, "3,300ms;0,200ms")
        .unwrap()
        .set_default(StampedeDefault::StartUsers, 3)
        .unwrap()
        .set_default(StampedeDefault::GracefulRampDown, "1s")
        .unwrap()
        .set_default(StampedeDefault::ThinkTime, "50ms")
        .unwrap()
        .set_default(StampedeDefault::Timeout, "2s")
        .unwrap()
        .set_default(StampedeDefault::Percentiles, "90,99")
        .unwrap()
        .set_default(StampedeDefault::Shards, 2)
        .unwrap()
        .set_default(StampedeDefault::FailureRateThreshold, 0.1)
        .unwrap()
        .set_default(StampedeDefault::RequestLog, REQUEST_LOG)
        .unwrap()
        .set_default(StampedeDefault::RequestFormat, LogFormat::Raw)
        .unwrap()
        .set_default(StampedeDefault::ReportFile, REPORT_FILE)
        .unwrap()
        .set_default(StampedeDefault::NoPrintMetrics, true)
        .unwrap()
        .set_default(StampedeDefault::Quiet, 1)
        .unwrap()
        .execute()
        .await
        .unwrap();

    assert_eq!(report.max_users, 3);
    assert!(report.count > 0);
    assert_eq!(report.failure_count, 0);
    assert_eq!(index.hits_async().await, report.count as usize);
    assert_eq!(
        report
            .percentiles
            .iter()
            .map(|p| p.percentile)
            .collect::<Vec<f64>>(),
        vec![90.0, 99.0]
    );
    assert_eq!(report.failure_rate_threshold, Some(0.1));
    assert!(!report.threshold_breached);
    assert_eq!(common::file_length(REQUEST_LOG), report.count as usize);
    assert!(std::path::Path::new(REPORT_FILE).exists());

    common::cleanup_files(vec![REQUEST_LOG, REPORT_FILE]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
/// Options on the command line override defaults.
async fn test_cli_overrides_defaults() {
    let transport = Arc::new(FakeTransport::new(
        Duration::from_millis(5),
        Responses::Success,
    ));
    let configuration = common::build_configuration(
        "http://localhost:9999",
        vec!["--test-plan", "2,300ms", "--max-users", "1"],
    );
    let report = common::build_load_test(configuration, scenario!(get_index))
        .set_transport(transport)
        .set_default(StampedeDefault::TestPlan, "10,300ms")
        .unwrap()
        .set_default(StampedeDefault::MaxUsers, 5)
        .unwrap()
        .execute()
        .await
        .unwrap();

    assert_eq!(report.max_users, 1);
}

#[test]
/// Defaults of the wrong type are rejected.
fn test_invalid_defaults() {
    let stampede = Stampede::initialize_with_config(StampedeConfiguration::default());
    assert!(matches!(
        stampede.clone().set_default(StampedeDefault::Users, "10"),
        Err(StampedeError::InvalidOption { .. })
    ));
    assert!(matches!(
        stampede.clone().set_default(StampedeDefault::Host, 10),
        Err(StampedeError::InvalidOption { .. })
    ));
    assert!(matches!(
        stampede.set_default(StampedeDefault::Percentiles, "0,50"),
        Err(StampedeError::InvalidOption { .. })
    ));
}
