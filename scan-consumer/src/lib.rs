pub mod config;
pub mod dead_letter;
pub mod error;
pub mod ingest;
pub mod kafka;
pub mod metrics_consts;
pub mod offset_tracker;
pub mod transport;
