//! External data source traits.
//!
//! Providers are narrow and optional: a missing, failing, or slow provider
//! means "no data this cycle", never a hard error.

use crate::types::{Reading, ScheduleEntry, Track};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Current weather for the user's location.
#[async_trait]
pub trait WeatherProvider: Send + Sync {
    async fn current(&self) -> anyhow::Result<Reading>;
}

/// Upcoming schedule entries for the bound user.
#[async_trait]
pub trait CalendarProvider: Send + Sync {
    async fn upcoming(&self) -> anyhow::Result<Vec<ScheduleEntry>>;
}

/// What the user is currently listening to, if anything.
#[async_trait]
pub trait MusicProvider: Send + Sync {
    async fn now_playing(&self) -> anyhow::Result<Option<Track>>;
}

/// The optional set of providers wired into the core.
#[derive(Clone, Default)]
pub struct Providers {
    pub weather: Option<Arc<dyn WeatherProvider>>,
    pub calendar: Option<Arc<dyn CalendarProvider>>,
    pub music: Option<Arc<dyn MusicProvider>>,
}

/// Run a provider call under a deadline. Failures and timeouts are logged and
/// collapse to `None`; the caller keeps whatever data it already had.
pub async fn fetch_with_deadline<T, F>(operation: &str, timeout_ms: u64, fut: F) -> Option<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(Duration::from_millis(timeout_ms), fut).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            warn!("Provider call {operation} failed: {e:#}");
            None
        }
        Err(_) => {
            warn!("Provider call {operation} timed out after {timeout_ms}ms");
            None
        }
    }
}
