// src/lib.rs

pub mod config;
pub mod context;

pub use context::AppContext;

pub mod entities {
    pub mod prelude;
    pub mod alerts;
    pub mod rate_samples;
}

pub mod services {
    pub mod bucket_clock;
    pub mod lock_gate;
    pub mod rate_repository;
    pub mod memory_store;
    pub mod rate_source;
    pub mod official_rate;
    pub mod market_rate;
    pub mod notifier;
    pub mod sampling;
    pub mod backfill;
    pub mod simulate;
    pub mod report;
    pub mod export;
}

pub mod jobs;
pub mod models;
