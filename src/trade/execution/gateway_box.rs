use async_trait::async_trait;
use std::sync::Arc;
use tokio::time::Duration;

use crate::ports::paper_venue::PaperVenue;
use crate::ports::venue::{
    ExecutionGateway, MarketQuote, NotificationSource, PlaceOrderAck, PlaceOrderRequest, Position,
    VenueError, VenueOrder,
};
use crate::rate_limit_notifier::notify_rate_limit;

/// Venue selected by name; every call is forwarded and 429 errors raise a
/// rate-limit alert.
pub struct GatewayBox {
    pub inner: Arc<dyn ExecutionGateway>,
}

impl GatewayBox {
    fn report_rate_limit(&self, operation: &str, detail: &str, err: &VenueError) {
        let err_text = err.to_string();
        if matches!(err, VenueError::RateLimited(_))
            || err_text.contains("429")
            || err_text.contains("Too Many Requests")
        {
            let context = format!("{} ({})", operation, detail);
            notify_rate_limit(&context, &err_text);
        }
    }

    pub fn new(inner: Arc<dyn ExecutionGateway>) -> Self {
        Self { inner }
    }

    /// Builds the named venue and returns it with its notification source.
    /// A replay file is only meaningful for the paper venue.
    pub fn create(
        venue_name: &str,
        replay_file: Option<&str>,
        replay_tick: Duration,
    ) -> Result<(Self, Arc<dyn NotificationSource>), VenueError> {
        match venue_name {
            "paper" => {
                let venue = match replay_file {
                    Some(path) => {
                        let venue = Arc::new(PaperVenue::from_replay_file(path)?);
                        venue.spawn_replay_clock(replay_tick);
                        venue
                    }
                    None => Arc::new(PaperVenue::new()),
                };
                let notifications: Arc<dyn NotificationSource> = venue.clone();
                Ok((GatewayBox::new(venue), notifications))
            }
            _ => Err(VenueError::Other(format!(
                "Unsupported venue '{}'",
                venue_name
            ))),
        }
    }
}

#[async_trait]
impl ExecutionGateway for GatewayBox {
    async fn get_market(&self, market: &str) -> Result<MarketQuote, VenueError> {
        let result = self.inner.get_market(market).await;
        if let Err(ref err) = result {
            self.report_rate_limit("get_market", market, err);
        }
        result
    }

    async fn place_order(&self, request: &PlaceOrderRequest) -> Result<PlaceOrderAck, VenueError> {
        let result = self.inner.place_order(request).await;
        if let Err(ref err) = result {
            self.report_rate_limit(
                "place_order",
                &format!(
                    "{} | side={} size={}",
                    request.market, request.side, request.size
                ),
                err,
            );
        }
        result
    }

    async fn get_open_orders(&self, market: &str) -> Result<Vec<VenueOrder>, VenueError> {
        let result = self.inner.get_open_orders(market).await;
        if let Err(ref err) = result {
            self.report_rate_limit("get_open_orders", market, err);
        }
        result
    }

    async fn get_order_by_client_id(&self, client_id: &str) -> Result<VenueOrder, VenueError> {
        let result = self.inner.get_order_by_client_id(client_id).await;
        if let Err(ref err) = result {
            self.report_rate_limit(
                "get_order_by_client_id",
                &format!("client_id={}", client_id),
                err,
            );
        }
        result
    }

    async fn get_positions(&self) -> Result<Vec<Position>, VenueError> {
        let result = self.inner.get_positions().await;
        if let Err(ref err) = result {
            self.report_rate_limit("get_positions", "all markets", err);
        }
        result
    }
}
