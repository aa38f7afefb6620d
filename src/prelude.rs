//! The Stampede prelude: everything commonly needed to write a load test.
//!
//! ```rust
//! use stampede::prelude::*;
//! ```

pub use crate::client::{HttpTransport, TransportRequest, TransportResponse};
pub use crate::config::{StampedeConfiguration, StampedeDefault, StampedeDefaultType};
pub use crate::metrics::{AggregateStats, Outcome, RequestSample};
pub use crate::report::SummaryReport;
pub use crate::scenario::{Scenario, ScenarioContext, ScenarioError, ScenarioResult};
pub use crate::test_plan::{SchedulerState, Stage};
pub use crate::{scenario, Stampede, StampedeError};
