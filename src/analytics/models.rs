//! Report shapes served to dashboards and exports.

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::storage::DateWindow;

/// Dashboard-facing time range, resolved to an inclusive day window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "range")]
pub enum TimeRange {
    Last7Days,
    Last30Days,
    Last90Days,
    Custom { start: NaiveDate, end: NaiveDate },
}

impl TimeRange {
    pub fn window(&self, today: NaiveDate) -> DateWindow {
        let last = |days: u64| {
            DateWindow::new(
                today.checked_sub_days(Days::new(days - 1)).expect("date underflow"),
                today,
            )
        };
        match self {
            TimeRange::Last7Days => last(7),
            TimeRange::Last30Days => last(30),
            TimeRange::Last90Days => last(90),
            TimeRange::Custom { start, end } => DateWindow::new(*start, *end),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            TimeRange::Last7Days => "7d",
            TimeRange::Last30Days => "30d",
            TimeRange::Last90Days => "90d",
            TimeRange::Custom { .. } => "custom",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Overview {
    pub total_clicks: i64,
    /// Distinct visitor IPs in the window.
    pub unique_visitors: i64,
    pub avg_clicks_per_day: f64,
    /// Percent change against the immediately preceding period of equal
    /// length. Zero previous clicks map to 100 (current > 0) or 0.
    pub growth_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DayCount {
    pub date: NaiveDate,
    pub clicks: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakdownEntry {
    pub value: String,
    pub clicks: i64,
    /// Share of the scope total, rounded to one decimal place.
    pub percentage: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Breakdowns {
    pub country: Vec<BreakdownEntry>,
    pub region: Vec<BreakdownEntry>,
    pub city: Vec<BreakdownEntry>,
    pub browser: Vec<BreakdownEntry>,
    pub os: Vec<BreakdownEntry>,
    pub device: Vec<BreakdownEntry>,
    pub referrer: Vec<BreakdownEntry>,
    pub utm_source: Vec<BreakdownEntry>,
    pub utm_medium: Vec<BreakdownEntry>,
    pub utm_campaign: Vec<BreakdownEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsReport {
    pub overview: Overview,
    /// One entry per calendar day in the window, zero-filled, ascending.
    pub series: Vec<DayCount>,
    pub breakdowns: Breakdowns,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotReport {
    pub total_clicks: i64,
    pub bot_clicks: i64,
    pub human_clicks: i64,
    pub bot_percentage: f64,
    pub top_bots: Vec<BreakdownEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbRow {
    /// `None` is the control group.
    pub variant_id: Option<i64>,
    pub target_url: String,
    pub clicks: i64,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbReport {
    pub link_id: i64,
    /// Human clicks only; bots never count toward split performance.
    pub total_clicks: i64,
    pub rows: Vec<AbRow>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_7_days_window_includes_today() {
        let today = NaiveDate::from_ymd_opt(2024, 6, 10).unwrap();
        let window = TimeRange::Last7Days.window(today);
        assert_eq!(window.days(), 7);
        assert_eq!(window.end, today);
        assert_eq!(window.start, NaiveDate::from_ymd_opt(2024, 6, 4).unwrap());
    }

    #[test]
    fn custom_window_passes_through() {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 1, 31).unwrap();
        let window = TimeRange::Custom { start, end }.window(start);
        assert_eq!(window.days(), 31);
    }
}
