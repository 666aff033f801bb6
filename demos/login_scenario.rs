use anyhow::Result;
use clap::Parser;
use stampede::assertion::{json_path_exists, response_time_under, status_is};
use stampede::{Engine, EngineConfig, ExtractRule, Scenario};

/// Run a login-then-fetch scenario for a handful of virtual users.
#[derive(Parser)]
struct Opts {
    /// Base URL of the system under test.
    base_url: String,

    /// Number of virtual users to run.
    #[clap(long, short = 'u', default_value_t = 5)]
    users: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let opts = Opts::parse();
    let base = opts.base_url.trim_end_matches('/');

    let engine = Engine::new(EngineConfig::default())?;
    let scenario = Scenario::new("login-and-fetch")
        .post(format!("{base}/login"), r#"{"username":"demo","password":"demo"}"#)
        .assert(status_is(200))
        .assert(json_path_exists("access_token"))
        .extract(ExtractRule::json_path("access_token", "tok"))
        .extract(ExtractRule::json_path("user.id", "uid"))
        .get(format!("{base}/users/${{uid}}"))
        .assert(status_is(200))
        .assert(response_time_under(1_000));

    let mut tasks = tokio::task::JoinSet::new();
    let engine = std::sync::Arc::new(engine);
    for user in 0..opts.users {
        let engine = std::sync::Arc::clone(&engine);
        let scenario = scenario.clone();
        tasks.spawn(async move {
            let user_id = format!("vu-{user}");
            engine.run_scenario(&user_id, &scenario).await
        });
    }

    let mut failed = 0usize;
    while let Some(res) = tasks.join_next().await {
        let report = res??;
        for failure in report.failures() {
            eprintln!("assertion failed: {failure}");
        }
        if !report.passed() {
            failed += 1;
        }
    }

    println!("{}", serde_json::to_string_pretty(&engine.metrics())?);
    if failed > 0 {
        anyhow::bail!("{failed} of {} virtual users failed validation", opts.users);
    }
    Ok(())
}
