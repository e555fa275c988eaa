pub mod client;
pub mod config;
pub mod connection;
pub mod event;
pub mod input;
pub mod model;
pub mod protocol;
pub mod render;
pub mod replica;
pub mod session;
pub mod subscription;
pub mod telemetry;
pub mod transport;
