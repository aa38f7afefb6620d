//! Scenarios: the unit of work each virtual user repeats.
//!
//! A scenario is an async function taking a [`ScenarioContext`] and returning the
//! [`RequestSample`]s it produced. The context carries the user's id, the base host,
//! the shared transport, and the run's cancellation token.
//!
//! ```rust
//! use stampede::prelude::*;
//!
//! async fn front_page(ctx: ScenarioContext) -> ScenarioResult {
//!     let sample = ctx.get("/").await?;
//!     Ok(vec![sample])
//! }
//!
//! let scenario = scenario!(front_page).set_think_time(std::time::Duration::from_secs(1));
//! assert_eq!(scenario.name, "front_page");
//! ```

use chrono::Utc;
use http::{Method, StatusCode};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::client::{HttpTransport, TransportRequest, TransportResponse};
use crate::metrics::{Outcome, RequestSample};
use crate::util;

/// Failure reasons are truncated to keep samples and logs small.
const MAX_REASON_LENGTH: usize = 120;

/// Why a scenario iteration ended early.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScenarioError {
    /// The run was canceled while the iteration was in flight.
    Canceled,
    /// Something other than a request went wrong; the virtual user is retired.
    Fatal(String),
}
impl fmt::Display for ScenarioError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ScenarioError::Canceled => write!(f, "ScenarioError: canceled"),
            ScenarioError::Fatal(reason) => write!(f, "ScenarioError: fatal ({})", reason),
        }
    }
}
impl std::error::Error for ScenarioError {}

/// Auto-convert URL errors, a bad path is a bug in the scenario.
impl From<url::ParseError> for ScenarioError {
    fn from(err: url::ParseError) -> ScenarioError {
        ScenarioError::Fatal(err.to_string())
    }
}

/// Auto-convert serde_json errors.
impl From<serde_json::Error> for ScenarioError {
    fn from(err: serde_json::Error) -> ScenarioError {
        ScenarioError::Fatal(err.to_string())
    }
}

/// What one scenario iteration returns.
pub type ScenarioResult = Result<Vec<RequestSample>, ScenarioError>;

/// The boxed future returned by a [`ScenarioFunction`].
pub type ScenarioFuture = Pin<Box<dyn Future<Output = ScenarioResult> + Send>>;

/// A type-erased scenario function, cheap to clone into every virtual user.
pub type ScenarioFunction = Arc<dyn Fn(ScenarioContext) -> ScenarioFuture + Send + Sync>;

/// scenario!(foo) expands to Scenario::new("foo", foo).
#[macro_export]
macro_rules! scenario {
    ($scenario_func:ident) => {
        $crate::scenario::Scenario::new(stringify!($scenario_func), $scenario_func)
    };
    ($name:expr, $scenario_func:expr) => {
        $crate::scenario::Scenario::new($name, $scenario_func)
    };
}

/// A named scenario plus its per-scenario settings.
#[derive(Clone)]
pub struct Scenario {
    /// The name of the scenario, selected with `--scenario`.
    pub name: String,
    /// Base host for relative paths, overrides `--host`.
    pub host: Option<String>,
    /// Fixed delay between iterations, overrides `--think-time`.
    pub think_time: Option<Duration>,
    pub function: ScenarioFunction,
}
impl Scenario {
    pub fn new<F, Fut>(name: &str, function: F) -> Self
    where
        F: Fn(ScenarioContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ScenarioResult> + Send + 'static,
    {
        trace!("new scenario: name: {}", name);
        Scenario {
            name: name.to_string(),
            host: None,
            think_time: None,
            function: Arc::new(move |ctx: ScenarioContext| -> ScenarioFuture {
                Box::pin(function(ctx))
            }),
        }
    }

    pub fn set_host(mut self, host: &str) -> Self {
        trace!("{} set_host: {}", self.name, host);
        self.host = Some(host.to_string());
        self
    }

    pub fn set_think_time(mut self, think_time: Duration) -> Self {
        trace!("{} set_think_time: {:?}", self.name, think_time);
        self.think_time = Some(think_time);
        self
    }
}
impl fmt::Debug for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Scenario")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("think_time", &self.think_time)
            .finish()
    }
}

/// Everything a scenario iteration can use.
#[derive(Clone)]
pub struct ScenarioContext {
    /// Id of the virtual user running this iteration.
    pub user: usize,
    /// Zero-based iteration count for this virtual user.
    pub iteration: usize,
    host: Option<Url>,
    transport: Arc<dyn HttpTransport>,
    cancel: CancellationToken,
}
impl ScenarioContext {
    pub fn new(
        user: usize,
        host: Option<Url>,
        transport: Arc<dyn HttpTransport>,
        cancel: CancellationToken,
    ) -> Self {
        ScenarioContext {
            user,
            iteration: 0,
            host,
            transport,
            cancel,
        }
    }

    pub(crate) fn for_iteration(&self, iteration: usize) -> Self {
        let mut ctx = self.clone();
        ctx.iteration = iteration;
        ctx
    }

    /// The token canceled on hard shutdown. Long-running scenario code should
    /// select on [`CancellationToken::cancelled`].
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolve `path` against the configured host. Absolute URLs are used as is.
    pub fn build_url(&self, path: &str) -> Result<Url, ScenarioError> {
        if let Ok(url) = Url::parse(path) {
            return Ok(url);
        }
        match &self.host {
            Some(host) => Ok(host.join(path)?),
            None => Err(ScenarioError::Fatal(format!(
                "no host configured for relative path {}",
                path
            ))),
        }
    }

    /// Send one request and turn the response into a sample.
    ///
    /// Network errors, timeouts and non-2xx statuses become [`Outcome::Failure`].
    /// If the run is canceled first, the request is dropped and
    /// [`ScenarioError::Canceled`] is returned.
    pub async fn request(&self, request: TransportRequest) -> Result<RequestSample, ScenarioError> {
        if self.is_canceled() {
            return Err(ScenarioError::Canceled);
        }
        let started = Utc::now();
        let response = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(ScenarioError::Canceled),
            response = self.transport.do_request(request) => response,
        };
        Ok(sample_from_response(self.user, started, response))
    }

    /// `GET` a path.
    pub async fn get(&self, path: &str) -> Result<RequestSample, ScenarioError> {
        let url = self.build_url(path)?;
        self.request(TransportRequest::new(Method::GET, url)).await
    }

    /// `POST` a JSON body to a path, setting `Content-Type: application/json`.
    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<RequestSample, ScenarioError> {
        let url = self.build_url(path)?;
        let body = serde_json::to_string(body)?;
        let request = TransportRequest::new(Method::POST, url)
            .header("Content-Type", "application/json")
            .body(body);
        self.request(request).await
    }

    /// Sleep inside an iteration, waking early if the run is canceled.
    pub async fn sleep(&self, duration: Duration) -> Result<(), ScenarioError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ScenarioError::Canceled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

fn sample_from_response(
    user: usize,
    started: chrono::DateTime<Utc>,
    response: TransportResponse,
) -> RequestSample {
    let outcome = match (&response.error, response.status) {
        (Some(error), _) => Outcome::Failure(util::truncate_string(error, MAX_REASON_LENGTH)),
        (None, Some(status)) if (200..300).contains(&status) => Outcome::Success,
        (None, Some(status)) => Outcome::Failure(match StatusCode::from_u16(status) {
            Ok(code) => code.to_string(),
            Err(_) => status.to_string(),
        }),
        (None, None) => Outcome::Failure("no response".to_string()),
    };
    RequestSample::new(user, started, response.elapsed, outcome).set_size_bytes(response.size_bytes)
}
