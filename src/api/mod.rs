//! HTTP surface: a visitor-facing redirect router and a dashboard-facing
//! analytics router, served on separate listeners.

pub mod analytics;
pub mod redirect;

pub use analytics::{create_analytics_router, AnalyticsState};
pub use redirect::{create_redirect_router, RedirectState};
