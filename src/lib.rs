pub mod app;
pub mod chunk;
pub mod config;
pub mod dispatch;
pub mod host;
pub mod liveness;
pub mod peer;
pub mod protocol;
pub mod reconnect;
pub mod safety;
pub mod session;
pub mod telemetry;
