use std::error::Error;
use std::fmt;
use tokio::time::{Duration, Instant};

use crate::ports::venue::{ExecutionGateway, MarketQuote, VenueError};

pub const DEFAULT_STALENESS_MS: u64 = 3000;

#[derive(Debug, Clone)]
pub struct MarketSnapshot {
    pub spot: MarketQuote,
    pub future: MarketQuote,
    /// Wall time of the joined fetch.
    pub elapsed: Duration,
}

impl MarketSnapshot {
    pub fn is_stale(&self, bound: Duration) -> bool {
        self.elapsed > bound
    }
}

/// Every failure of the joined fetch, not only the first.
#[derive(Debug)]
pub struct SnapshotError {
    errors: Vec<(String, VenueError)>,
    elapsed: Duration,
}

impl SnapshotError {
    pub fn errors(&self) -> &[(String, VenueError)] {
        &self.errors
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }
}

impl fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .errors
            .iter()
            .map(|(market, err)| format!("{}: {}", market, err))
            .collect();
        write!(f, "market snapshot failed [{}]", parts.join("; "))
    }
}

impl Error for SnapshotError {}

/// Fetches both quotes concurrently and waits for both, even when one fails.
pub async fn fetch_snapshot(
    gateway: &dyn ExecutionGateway,
    spot_market: &str,
    future_market: &str,
) -> Result<MarketSnapshot, SnapshotError> {
    let since = Instant::now();
    let (spot_res, future_res) = tokio::join!(
        gateway.get_market(spot_market),
        gateway.get_market(future_market)
    );
    let elapsed = since.elapsed();

    match (spot_res, future_res) {
        (Ok(spot), Ok(future)) => Ok(MarketSnapshot {
            spot,
            future,
            elapsed,
        }),
        (spot_res, future_res) => {
            let mut errors = Vec::new();
            if let Err(e) = spot_res {
                errors.push((spot_market.to_string(), e));
            }
            if let Err(e) = future_res {
                errors.push((future_market.to_string(), e));
            }
            Err(SnapshotError { errors, elapsed })
        }
    }
}
