pub use super::alerts::Entity as Alerts;
pub use super::rate_samples::Entity as RateSamples;
