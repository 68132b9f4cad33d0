pub mod aligned_scheduler;
pub mod rate_sample_job;
