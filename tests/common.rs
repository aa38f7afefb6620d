use async_trait::async_trait;
use gumdrop::Options;
use std::io::{self, BufRead};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use stampede::prelude::*;

/// Not all functions are used by all tests, so we enable allow(dead_code) to avoid
/// compiler warnings during testing.

/// The following options are configured by default, if not set to a custom value:
///  --host <host>
///  --test-plan "2,500ms" (unless --users is set)
///  --graceful-ramp-down 1s
///  --no-print-metrics
///  --quiet
pub fn build_configuration(host: &str, custom: Vec<&str>) -> StampedeConfiguration {
    // Start with an empty configuration.
    let mut configuration: Vec<&str> = vec![];

    // Merge in all custom options first.
    configuration.extend_from_slice(&custom);

    // Default to the provided host if not otherwise configured.
    if !configuration.contains(&"--host") {
        configuration.extend_from_slice(&["--host", host]);
    }

    // Default to a short ramp to 2 users if not otherwise configured.
    if !configuration.contains(&"--test-plan") && !configuration.contains(&"--users") {
        configuration.extend_from_slice(&["--test-plan", "2,500ms"]);
    }

    // Let in-flight requests finish so counts can be asserted precisely.
    if !configuration.contains(&"--graceful-ramp-down") {
        configuration.extend_from_slice(&["--graceful-ramp-down", "1s"]);
    }

    configuration.extend_from_slice(&["--no-print-metrics", "--quiet"]);

    // Parse these options to generate a StampedeConfiguration.
    StampedeConfiguration::parse_args_default(&configuration)
        .expect("failed to parse options and generate a configuration")
}

/// Build a Stampede run from the configuration and a scenario.
#[allow(dead_code)]
pub fn build_load_test(configuration: StampedeConfiguration, scenario: Scenario) -> Stampede {
    Stampede::initialize_with_config(configuration).register_scenario(scenario)
}

/// Run the actual load test, returning the SummaryReport.
#[allow(dead_code)]
pub async fn run_load_test(stampede: Stampede) -> SummaryReport {
    stampede
        .execute()
        .await
        .expect("load test failed to execute")
}

/// Test scenario: one GET request to the index.
#[allow(dead_code)]
pub async fn get_index(ctx: ScenarioContext) -> ScenarioResult {
    Ok(vec![ctx.get("/").await?])
}

/// How a [`FakeTransport`] answers.
#[allow(dead_code)]
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Responses {
    /// Every request returns 200.
    Success,
    /// Every other request returns 503, starting with the second.
    AlternateFailures,
    /// Every request returns 500.
    Failure,
}

/// A transport that answers locally after a fixed latency.
pub struct FakeTransport {
    latency: Duration,
    responses: Responses,
    requests: AtomicUsize,
}
#[allow(dead_code)]
impl FakeTransport {
    pub fn new(latency: Duration, responses: Responses) -> Self {
        FakeTransport {
            latency,
            responses,
            requests: AtomicUsize::new(0),
        }
    }

    /// Requests that reached the transport.
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HttpTransport for FakeTransport {
    async fn do_request(&self, _request: TransportRequest) -> TransportResponse {
        let request = self.requests.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;
        let status = match self.responses {
            Responses::Success => 200,
            Responses::AlternateFailures if request % 2 == 0 => 200,
            Responses::AlternateFailures => 503,
            Responses::Failure => 500,
        };
        TransportResponse {
            status: Some(status),
            elapsed: self.latency,
            error: None,
            size_bytes: Some(0),
        }
    }
}

/// Helper to count the number of lines in a test artifact.
#[allow(dead_code)]
pub fn file_length(file_name: &str) -> usize {
    if let Ok(file) = std::fs::File::open(std::path::Path::new(file_name)) {
        io::BufReader::new(file).lines().count()
    } else {
        0
    }
}

/// Helper to delete test artifacts, if existing.
#[allow(dead_code)]
pub fn cleanup_files(files: Vec<&str>) {
    for file in files {
        if std::path::Path::new(file).exists() {
            std::fs::remove_file(file).expect("failed to remove file");
        }
    }
}
