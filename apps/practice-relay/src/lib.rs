pub mod cli;
pub mod config;
pub mod handlers;
pub mod registry;
pub mod relay;
pub mod server;
pub mod telemetry;
pub mod websocket;
