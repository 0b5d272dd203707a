pub mod decoder;
pub mod manager;
pub mod memory;
pub mod metrics;
pub mod metrics_consts;
pub mod optimistic;
pub mod pgstore;
pub mod repository;
pub mod scan;
