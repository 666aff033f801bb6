use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use stampede::assertion::{
    avg_response_time_under, error_rate_below, success_rate_at_least, MetricsAssertionGroup,
};
use stampede::{Engine, EngineConfig, Request};

/// Fire a burst of HTTP requests at one URL and check the aggregate SLA.
#[derive(Parser)]
struct Opts {
    /// Target URL.
    url: String,

    /// Number of requests to send.
    #[clap(long, short = 'n', default_value_t = 100)]
    iterations: u64,

    /// Per-request timeout.
    #[clap(long, short = 't', default_value = "5s")]
    timeout: humantime::Duration,

    /// Number of workers used for throughput accounting.
    #[clap(long, short = 'w', default_value_t = 10)]
    workers: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let opts = Opts::parse();

    let engine = Engine::new(EngineConfig {
        max_connections: 1_000,
        worker_count: opts.workers,
    })?;
    let request = Request::get(&opts.url).with_timeout(opts.timeout.into());

    for _ in 0..opts.iterations {
        let response = engine.execute(&request).await?;
        if !response.success {
            tracing::warn!(status = response.status_code, error = %response.error, "request failed");
        }
    }

    let snapshot = engine.metrics();
    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    let sla = MetricsAssertionGroup::all()
        .add(success_rate_at_least(99.0))
        .add(error_rate_below(1.0))
        .add(avg_response_time_under(Duration::from_millis(500).as_millis() as f64));
    let outcome = sla.check_all(&snapshot);
    if outcome.passed {
        println!("SLA: PASS");
        Ok(())
    } else {
        println!("SLA: FAIL\n{}", sla.report(&snapshot));
        std::process::exit(1);
    }
}
