//! Built-in scenarios for the payments service.
//!
//! - `payments_summary`: `GET /payments-summary` against `http://localhost:9999`.
//! - `create_payment`: `POST /payments` against `http://localhost:9998`, with a
//!   fresh correlation id on every request.
//!
//! Both wait one second between iterations.

use serde_json::json;
use std::time::Duration;
use uuid::Uuid;

use crate::scenario;
use crate::scenario::{Scenario, ScenarioContext, ScenarioResult};

/// Default host for [`payments_summary`].
pub const PAYMENTS_SUMMARY_HOST: &str = "http://localhost:9999";
/// Default host for [`create_payment`].
pub const CREATE_PAYMENT_HOST: &str = "http://localhost:9998";
/// Amount sent with every payment.
pub const PAYMENT_AMOUNT: f64 = 19.90;
/// Peak users when neither `--max-users` nor `MAX_REQUESTS` is set.
pub const DEFAULT_MAX_USERS: usize = 500;

/// Fetch the payments summary.
pub async fn payments_summary(ctx: ScenarioContext) -> ScenarioResult {
    Ok(vec![ctx.get("/payments-summary").await?])
}

/// Create one payment.
pub async fn create_payment(ctx: ScenarioContext) -> ScenarioResult {
    let payment = json!({
        "correlationId": Uuid::new_v4().to_string(),
        "amount": PAYMENT_AMOUNT,
    });
    Ok(vec![ctx.post_json("/payments", &payment).await?])
}

/// The built-in scenarios, each with its default host and a one second think time.
pub fn builtin() -> Vec<Scenario> {
    vec![
        scenario!(payments_summary)
            .set_host(PAYMENTS_SUMMARY_HOST)
            .set_think_time(Duration::from_secs(1)),
        scenario!(create_payment)
            .set_host(CREATE_PAYMENT_HOST)
            .set_think_time(Duration::from_secs(1)),
    ]
}

/// The default test plan of a built-in scenario: a single stage ramping to
/// `max_users` over ten seconds (`payments_summary`) or a minute (`create_payment`).
pub fn default_test_plan(scenario: &str, max_users: usize) -> Option<String> {
    match scenario {
        "payments_summary" => Some(format!("{},10s", max_users)),
        "create_payment" => Some(format!("{},60s", max_users)),
        _ => None,
    }
}
