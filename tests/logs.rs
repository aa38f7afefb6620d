/// Validate the report file and the request log.
use std::sync::Arc;
use std::time::Duration;

mod common;

use common::{get_index, FakeTransport, Responses};
use stampede::prelude::*;

const HOST: &str = "http://localhost:9999";
const LATENCY: Duration = Duration::from_millis(5);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
/// --report-file writes the summary as JSON.
async fn test_report_file() {
    const REPORT_FILE: &str = "report-test.json";
    common::cleanup_files(vec![REPORT_FILE]);

    let configuration = common::build_configuration(
        HOST,
        vec![
            "--report-file",
            REPORT_FILE,
            "--percentiles",
            "50,99.9",
            "--failure-rate-threshold",
            "0.75",
        ],
    );
    let stampede = common::build_load_test(configuration, scenario!(get_index)).set_transport(
        Arc::new(FakeTransport::new(LATENCY, Responses::AlternateFailures)),
    );
    let report = common::run_load_test(stampede).await;

    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(REPORT_FILE).unwrap()).unwrap();
    assert_eq!(json["scenario"], "get_index");
    assert_eq!(json["count"], report.count);
    assert_eq!(json["failure_count"], report.failure_count);
    assert_eq!(json["percentiles"].as_array().unwrap().len(), 2);
    assert_eq!(json["percentiles"][1]["percentile"], 99.9);
    assert!(json["p99_ms"].as_f64().unwrap() >= 4.9);
    assert_eq!(json["failure_rate_threshold"], 0.75);
    // Half the requests failed, below the threshold.
    assert_eq!(json["threshold_breached"], false);
    assert!(json["history"].as_array().unwrap().len() >= 3);

    common::cleanup_files(vec![REPORT_FILE]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
/// A failure rate above --failure-rate-threshold marks the run as failed.
async fn test_threshold_breached() {
    let configuration =
        common::build_configuration(HOST, vec!["--failure-rate-threshold", "0.25"]);
    let stampede = common::build_load_test(configuration, scenario!(get_index))
        .set_transport(Arc::new(FakeTransport::new(LATENCY, Responses::Failure)));
    let report = common::run_load_test(stampede).await;

    assert!(report.count > 0);
    assert_eq!(report.failure_rate, 1.0);
    assert!(report.threshold_breached);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
/// --request-log writes one line per request, plus a header for csv.
async fn test_request_log_csv() {
    const REQUEST_LOG: &str = "request-test.csv";
    common::cleanup_files(vec![REQUEST_LOG]);

    let configuration = common::build_configuration(
        HOST,
        vec!["--request-log", REQUEST_LOG, "--request-format", "csv"],
    );
    let stampede = common::build_load_test(configuration, scenario!(get_index))
        .set_transport(Arc::new(FakeTransport::new(LATENCY, Responses::Success)));
    let report = common::run_load_test(stampede).await;

    assert!(report.count > 0);
    assert_eq!(common::file_length(REQUEST_LOG), report.count as usize + 1);
    let log = std::fs::read_to_string(REQUEST_LOG).unwrap();
    assert!(log.starts_with("started,user,latency_us,success,reason,size_bytes,clamped\n"));

    common::cleanup_files(vec![REQUEST_LOG]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
/// The request log defaults to one JSON object per line.
async fn test_request_log_json() {
    const REQUEST_LOG: &str = "request-test.json";
    common::cleanup_files(vec![REQUEST_LOG]);

    let configuration = common::build_configuration(HOST, vec!["--request-log", REQUEST_LOG]);
    let stampede = common::build_load_test(configuration, scenario!(get_index))
        .set_transport(Arc::new(FakeTransport::new(LATENCY, Responses::Failure)));
    let report = common::run_load_test(stampede).await;

    let log = std::fs::read_to_string(REQUEST_LOG).unwrap();
    let lines: Vec<serde_json::Value> = log
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(lines.len(), report.count as usize);
    assert!(lines
        .iter()
        .all(|line| line["outcome"]["Failure"] == "500 Internal Server Error"));

    common::cleanup_files(vec![REQUEST_LOG]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
/// An unwritable request log fails the run before it starts.
async fn test_request_log_unwritable() {
    let configuration = common::build_configuration(
        HOST,
        vec!["--request-log", "/nonexistent/directory/requests.log"],
    );
    let transport = Arc::new(FakeTransport::new(LATENCY, Responses::Success));
    let result = common::build_load_test(configuration, scenario!(get_index))
        .set_transport(transport.clone())
        .execute()
        .await;

    assert!(matches!(result, Err(StampedeError::Io(_))));
    assert_eq!(transport.requests(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
/// A request log that fails mid-run still leaves the report intact.
async fn test_request_log_write_failure_keeps_report() {
    let configuration = common::build_configuration(HOST, vec!["--request-log", "/dev/full"]);
    let transport = Arc::new(FakeTransport::new(LATENCY, Responses::Success));
    let report = common::build_load_test(configuration, scenario!(get_index))
        .set_transport(transport.clone())
        .execute()
        .await
        .unwrap();

    assert!(report.count > 0);
    assert!(report.count as usize <= transport.requests());
    assert_eq!(report.failure_count, 0);
}
