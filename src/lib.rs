// Library crate for integration tests and the binary.

pub mod backend;
pub mod config;
pub mod error;
pub mod event_ingestor;
pub mod history_poller;
pub mod log_capture;
pub mod log_tailer;
pub mod metrics;
pub mod model;
pub mod producer;
pub mod report;
pub mod routes;
pub mod server;
pub mod state;
pub mod store;
