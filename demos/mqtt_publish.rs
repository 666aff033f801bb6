use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use stampede::{Engine, EngineConfig, MqttQos};

/// Connect to an MQTT broker, publish a message, disconnect.
#[derive(Parser)]
struct Opts {
    /// Broker host.
    #[clap(long, default_value = "127.0.0.1")]
    host: String,

    /// Broker port.
    #[clap(long, default_value_t = 1883)]
    port: u16,

    /// Client identifier.
    #[clap(long, default_value = "stampede-demo")]
    client_id: String,

    /// Topic to publish on.
    #[clap(long, default_value = "demo/topic")]
    topic: String,

    /// Message payload.
    #[clap(long, default_value = "hello from stampede")]
    payload: String,

    /// Quality of service (0 or 1).
    #[clap(long, default_value_t = 1)]
    qos: u8,

    /// Publish with the retain flag.
    #[clap(long)]
    retain: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let opts = Opts::parse();
    let qos = match opts.qos {
        0 => MqttQos::AtMostOnce,
        1 => MqttQos::AtLeastOnce,
        _ => MqttQos::ExactlyOnce,
    };

    let engine = Engine::new(EngineConfig::default())?;

    let resp = engine
        .mqtt_connect(&opts.host, opts.port, &opts.client_id, None, None, Duration::from_secs(60))
        .await?;
    println!("connect: {} ({} us)", resp.body, resp.response_time_us);
    if !resp.success {
        anyhow::bail!("connect failed: {}", resp.error);
    }

    let resp = engine
        .mqtt_publish(
            &opts.host,
            opts.port,
            &opts.client_id,
            &opts.topic,
            &opts.payload,
            qos,
            opts.retain,
        )
        .await?;
    println!("publish: {} ({} us)", resp.body, resp.response_time_us);

    let resp = engine.mqtt_disconnect(&opts.host, opts.port, &opts.client_id).await?;
    println!("disconnect: {} ({} us)", resp.body, resp.response_time_us);

    println!("{}", serde_json::to_string_pretty(&engine.metrics())?);
    Ok(())
}
