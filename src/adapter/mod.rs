//! Protocol adapters.
//!
//! Each adapter owns its connection registry and exposes the per-protocol
//! operations the engine dispatches to. Adapters build complete
//! [`Response`](crate::Response) records (including `response_time_us` on
//! failure); crediting the metrics aggregator is the engine's job so every
//! executed operation is counted exactly once.

pub mod db;
pub mod http;
pub mod mqtt;
pub mod tcp;
pub mod udp;
pub mod ws;

pub use db::{DbAdapter, DbConfig, DbDriver, DbKind, DbResult, SimulatedDriver};
pub use http::HttpAdapter;
pub use mqtt::MqttAdapter;
pub use tcp::TcpAdapter;
pub use udp::UdpAdapter;
pub use ws::WsAdapter;
