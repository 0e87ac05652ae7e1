use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub enum VenueError {
    NotFound(String),
    RateLimited(String),
    Rejected(String),
    Other(String),
}

impl fmt::Display for VenueError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            VenueError::NotFound(id) => write!(f, "Order not found: {}", id),
            VenueError::RateLimited(e) => write!(f, "Too Many Requests: {}", e),
            VenueError::Rejected(e) => write!(f, "Order rejected: {}", e),
            VenueError::Other(e) => write!(f, "{}", e),
        }
    }
}

impl Error for VenueError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "buy"),
            OrderSide::Sell => write!(f, "sell"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

/// Best bid/ask for one market.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketQuote {
    pub market: String,
    pub bid: Decimal,
    pub ask: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlaceOrderRequest {
    pub client_id: String,
    pub market: String,
    pub side: OrderSide,
    pub price: Option<Decimal>,
    pub order_type: OrderType,
    pub size: Decimal,
    pub reduce_only: bool,
    pub post_only: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PlaceOrderAck {
    pub venue_order_id: Option<String>,
}

/// Authoritative order state as reported by the venue.
#[derive(Debug, Clone, PartialEq)]
pub struct VenueOrder {
    pub client_id: String,
    pub venue_id: Option<String>,
    pub market: String,
    pub side: OrderSide,
    pub size: Decimal,
    pub filled_size: Decimal,
    pub closed: bool,
}

/// Fill/update notification keyed by the correlation id used at placement.
/// `filled_size` is cumulative for the order.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderUpdate {
    pub client_id: String,
    pub venue_id: Option<String>,
    pub market: String,
    pub filled_size: Decimal,
    pub closed: bool,
}

impl From<&VenueOrder> for OrderUpdate {
    fn from(order: &VenueOrder) -> Self {
        Self {
            client_id: order.client_id.clone(),
            venue_id: order.venue_id.clone(),
            market: order.market.clone(),
            filled_size: order.filled_size,
            closed: order.closed,
        }
    }
}

/// Net position on one market; negative is short.
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub market: String,
    pub size: Decimal,
}

#[async_trait]
pub trait ExecutionGateway: Send + Sync {
    async fn get_market(&self, market: &str) -> Result<MarketQuote, VenueError>;

    async fn place_order(&self, request: &PlaceOrderRequest) -> Result<PlaceOrderAck, VenueError>;

    async fn get_open_orders(&self, market: &str) -> Result<Vec<VenueOrder>, VenueError>;

    async fn get_order_by_client_id(&self, client_id: &str) -> Result<VenueOrder, VenueError>;

    /// Venues without a positions endpoint report none.
    async fn get_positions(&self) -> Result<Vec<Position>, VenueError> {
        Ok(Vec::new())
    }
}

/// Push channel for order updates. A closed receiver means the connection
/// dropped; callers resubscribe.
#[async_trait]
pub trait NotificationSource: Send + Sync {
    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<OrderUpdate>, VenueError>;

    async fn keep_alive(&self) -> Result<(), VenueError>;
}
