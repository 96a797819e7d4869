//! Library crate for scan-console-rs: the real-time scan session controller
//! and the scan backend it talks to.
pub mod config;
pub mod controller;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod hub;
pub mod logging;
pub mod render;
pub mod server;
pub mod store;
pub mod stream;
pub mod types;
