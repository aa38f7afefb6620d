use gumdrop::Options;

use stampede::prelude::*;
use stampede::{scenarios, util};

#[tokio::main]
async fn main() {
    let configuration = StampedeConfiguration::parse_args_default_or_exit();
    let code = match run(configuration).await {
        Ok(report) => {
            println!("p99 latency: {:.2} ms", report.p99_ms);
            if report.threshold_breached {
                1
            } else {
                0
            }
        }
        Err(e) => {
            eprintln!("{}", e);
            1
        }
    };
    std::process::exit(code);
}

async fn run(configuration: StampedeConfiguration) -> Result<SummaryReport, StampedeError> {
    let scenario = if configuration.scenario.is_empty() {
        "payments_summary".to_string()
    } else {
        configuration.scenario.clone()
    };
    let max_users = configuration
        .max_users
        .or_else(util::max_users_from_env)
        .unwrap_or(scenarios::DEFAULT_MAX_USERS);

    let mut stampede = Stampede::initialize_with_config(configuration)
        .set_default(StampedeDefault::Scenario, scenario.as_str())?
        .set_default(StampedeDefault::StartUsers, 1)?
        .set_default(StampedeDefault::GracefulRampDown, "0s")?
        .set_default(StampedeDefault::Percentiles, "99")?;
    if let Some(test_plan) = scenarios::default_test_plan(&scenario, max_users) {
        stampede = stampede.set_default(StampedeDefault::TestPlan, test_plan.as_str())?;
    }
    for scenario in scenarios::builtin() {
        stampede = Box::new(stampede.register_scenario(scenario));
    }

    stampede.execute().await
}
