pub mod alert;
pub mod rate_sample;

pub use alert::{AlertDirection, AlertRecord, NewAlert};
pub use rate_sample::{RateSample, SampleStatus};
