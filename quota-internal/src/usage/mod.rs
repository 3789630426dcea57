//! Usage accounting: appending records after a call and summarising them for display.

pub mod recorder;
pub mod stats;

pub use recorder::UsageRecorder;
pub use stats::{ResetTimes, UsageStats, UsageStatsAggregator};
