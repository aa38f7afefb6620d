//! The HTTP transport virtual users send requests through.
//!
//! The run controller only ever talks to the [`HttpTransport`] trait. By default it
//! uses [`ReqwestTransport`]; tests and custom clients can supply their own with
//! [`Stampede::set_transport`](../struct.Stampede.html#method.set_transport).

use async_trait::async_trait;
use http::Method;
use reqwest::Client;
use std::time::{Duration, Instant};
use url::Url;

use crate::StampedeError;

static APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// A single request to send.
#[derive(Clone, Debug)]
pub struct TransportRequest {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}
impl TransportRequest {
    pub fn new(method: Method, url: Url) -> Self {
        TransportRequest {
            method,
            url,
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn body(mut self, body: String) -> Self {
        self.body = Some(body);
        self
    }
}

/// What came back: a status code if a response arrived, how long it took, and an
/// error if the request failed before or while reading the response.
#[derive(Clone, Debug, Default)]
pub struct TransportResponse {
    pub status: Option<u16>,
    pub elapsed: Duration,
    pub error: Option<String>,
    pub size_bytes: Option<u64>,
}

/// Sends requests on behalf of virtual users. Shared by every user, so must be
/// safe to call concurrently.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn do_request(&self, request: TransportRequest) -> TransportResponse;
}

/// The default [`HttpTransport`], one shared [`reqwest::Client`] connection pool.
#[derive(Clone, Debug)]
pub struct ReqwestTransport {
    client: Client,
}
impl ReqwestTransport {
    pub fn new(timeout: Option<Duration>) -> Result<Self, StampedeError> {
        let mut builder = Client::builder().user_agent(APP_USER_AGENT);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Ok(ReqwestTransport {
            client: builder.build()?,
        })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn do_request(&self, request: TransportRequest) -> TransportResponse {
        let started = Instant::now();
        let mut request_builder = self.client.request(request.method, request.url);
        for (name, value) in &request.headers {
            request_builder = request_builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            request_builder = request_builder.body(body);
        }

        match request_builder.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                // Latency includes reading the body.
                match response.bytes().await {
                    Ok(body) => TransportResponse {
                        status: Some(status),
                        elapsed: started.elapsed(),
                        error: None,
                        size_bytes: Some(body.len() as u64),
                    },
                    Err(e) => TransportResponse {
                        status: Some(status),
                        elapsed: started.elapsed(),
                        error: Some(e.to_string()),
                        size_bytes: None,
                    },
                }
            }
            Err(e) => TransportResponse {
                status: e.status().map(|s| s.as_u16()),
                elapsed: started.elapsed(),
                error: Some(e.to_string()),
                size_bytes: None,
            },
        }
    }
}
