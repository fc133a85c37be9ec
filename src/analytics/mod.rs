pub mod aggregator;
pub mod models;

pub use aggregator::Analytics;
pub use models::{
    AbReport, AbRow, AnalyticsReport, BotReport, BreakdownEntry, Breakdowns, DayCount, Overview,
    TimeRange,
};
