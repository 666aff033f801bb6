//! Stampede is a multi-protocol load-execution engine: it drives many
//! concurrent virtual users through scripted request sequences over HTTP(S),
//! WebSocket, raw TCP/UDP, MQTT and pluggable database back-ends, aggregates
//! timing and outcome data, and validates the aggregate against declared
//! thresholds.
//!
//! The engine is the core only: command-line front ends, configuration
//! loaders, report renderers and load-pattern generators are external
//! collaborators that feed it requests and consume its snapshots.
//!
//! ```no_run
//! use stampede::{Engine, EngineConfig, Request};
//!
//! # async fn run() -> stampede::Result<()> {
//! let engine = Engine::new(EngineConfig::default())?;
//! let response = engine.execute(&Request::get("https://example.test/health")).await?;
//! assert!(response.success);
//! let snapshot = engine.metrics();
//! assert_eq!(snapshot.total_requests, 1);
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod assertion;
pub mod auth;
pub mod clock;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod registry;
pub mod request;
pub mod response;
pub mod scenario;
pub mod session;
pub mod worker;

pub use engine::{Engine, EngineConfig};
pub use error::{Error, Result};
pub use metrics::{Metrics, MetricsSnapshot};
pub use request::{DbOptions, MqttOptions, MqttQos, Payload, Protocol, Request, WsOptions};
pub use response::{Response, Trailer};
pub use scenario::{Scenario, ScenarioReport, Step, StepReport};
pub use session::{ExtractRule, ExtractSource, SessionManager, SessionStore};
pub use worker::WorkerPool;
