use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use api_client::responses::{FundingInfo, MarketSnapshot};
use api_client::Venue;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use core_types::Kline;
use strategies::{MarketView, StrategyError};
use tokio::sync::Mutex;

/// How stale a cached snapshot may be before it is no longer an acceptable
/// stand-in for a live read (spec.md §5: "reads degrade to a cached value up
/// to 5s old" under venue rate-limit backpressure, rather than stalling a
/// strategy tick on every hiccup).
const STALE_CACHE_TOLERANCE: StdDuration = StdDuration::from_secs(5);

/// Bridges the `Venue` port into the read-only `MarketView` a `Ctx` hands to
/// strategies. The one bit of state this adds beyond a pass-through is the
/// short-lived snapshot cache backing the backpressure-degrade behavior
/// above; funding and kline reads are not latency-sensitive enough to need
/// the same treatment.
pub struct VenueMarketView {
    venue: Arc<dyn Venue>,
    cache: Mutex<HashMap<String, (MarketSnapshot, DateTime<Utc>)>>,
}

impl VenueMarketView {
    pub fn new(venue: Arc<dyn Venue>) -> Self {
        Self { venue, cache: Mutex::new(HashMap::new()) }
    }
}

#[async_trait]
impl MarketView for VenueMarketView {
    async fn snapshot(&self, symbol: &str) -> Result<MarketSnapshot, StrategyError> {
        match self.venue.market_snapshot(symbol).await {
            Ok(snapshot) => {
                self.cache.lock().await.insert(symbol.to_string(), (snapshot.clone(), Utc::now()));
                Ok(snapshot)
            }
            Err(e) if e.is_retryable() => {
                let cache = self.cache.lock().await;
                if let Some((snapshot, fetched_at)) = cache.get(symbol) {
                    let age = (Utc::now() - *fetched_at).to_std().unwrap_or(StdDuration::MAX);
                    if age <= STALE_CACHE_TOLERANCE {
                        tracing::debug!(symbol, "serving cached market snapshot under venue backpressure");
                        return Ok(snapshot.clone());
                    }
                }
                Err(StrategyError::Market(e))
            }
            Err(e) => Err(StrategyError::Market(e)),
        }
    }

    async fn funding(&self, symbol: &str) -> Result<FundingInfo, StrategyError> {
        Ok(self.venue.funding(symbol).await?)
    }

    async fn klines(
        &self,
        symbol: &str,
        interval: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Kline>, StrategyError> {
        Ok(self.venue.fetch_klines(symbol, interval, start, end).await?)
    }
}
