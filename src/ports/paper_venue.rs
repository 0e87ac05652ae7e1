use async_trait::async_trait;
use lazy_static::lazy_static;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::env;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

use crate::ports::venue::{
    ExecutionGateway, MarketQuote, NotificationSource, OrderSide, OrderType, OrderUpdate,
    PlaceOrderAck, PlaceOrderRequest, Position, VenueError, VenueOrder,
};

lazy_static! {
    static ref FILL_RATIO_IN_EMULATION: Decimal = {
        match env::var("FILL_RATIO_IN_EMULATION") {
            Ok(val) => val
                .parse::<Decimal>()
                .unwrap_or(Decimal::ONE)
                .clamp(Decimal::ZERO, Decimal::ONE),
            Err(_) => Decimal::ONE,
        }
    };
}

// Mirrors one line of the JSONL quote file
#[derive(Debug, Clone, Deserialize)]
struct ReplayQuote {
    bid: Decimal,
    ask: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
struct ReplayEntry {
    #[allow(dead_code)]
    timestamp: i64,
    quotes: HashMap<String, ReplayQuote>,
}

/// In-process venue: quotes are set directly or replayed from a file, market
/// orders fill immediately at `size * fill_ratio` and close.
#[derive(Debug, Default)]
pub struct PaperVenue {
    quotes: Mutex<HashMap<String, MarketQuote>>,
    replay: Vec<ReplayEntry>,
    cursor: AtomicUsize,
    quote_latency: Mutex<Duration>,
    fill_ratios: Mutex<HashMap<String, Decimal>>,
    hold_orders: Mutex<bool>,
    placement_failures: Mutex<VecDeque<VenueError>>,
    orders: Mutex<HashMap<String, VenueOrder>>,
    placed: Mutex<Vec<PlaceOrderRequest>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<OrderUpdate>>>,
}

impl PaperVenue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_replay_file(path: &str) -> Result<Self, VenueError> {
        let file = File::open(path)
            .map_err(|e| VenueError::Other(format!("failed to open replay file: {}", e)))?;
        let reader = BufReader::new(file);
        let mut data = Vec::new();

        for line in reader.lines() {
            let line =
                line.map_err(|e| VenueError::Other(format!("failed to read replay line: {}", e)))?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: ReplayEntry = serde_json::from_str(&line).map_err(|e| {
                VenueError::Other(format!("failed to parse replay entry '{}': {}", line, e))
            })?;
            data.push(entry);
        }

        if data.is_empty() {
            return Err(VenueError::Other(
                "Replay file is empty or invalid".to_string(),
            ));
        }

        Ok(Self {
            replay: data,
            ..Self::default()
        })
    }

    // Advances the replay by one entry. Returns false at the end of the file.
    pub fn tick(&self) -> bool {
        let current_cursor = self.cursor.load(AtomicOrdering::SeqCst);
        if current_cursor + 1 < self.replay.len() {
            self.cursor.fetch_add(1, AtomicOrdering::SeqCst);
            true
        } else {
            false
        }
    }

    pub fn spawn_replay_clock(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let venue = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !venue.tick() {
                    log::info!("[PAPER] End of replay file reached; holding last quotes.");
                    break;
                }
            }
        })
    }

    pub fn set_quote(&self, market: &str, bid: Decimal, ask: Decimal) {
        self.quotes.lock().unwrap().insert(
            market.to_string(),
            MarketQuote {
                market: market.to_string(),
                bid,
                ask,
            },
        );
    }

    pub fn set_quote_latency(&self, latency: Duration) {
        *self.quote_latency.lock().unwrap() = latency;
    }

    pub fn set_fill_ratio(&self, market: &str, ratio: Decimal) {
        self.fill_ratios
            .lock()
            .unwrap()
            .insert(market.to_string(), ratio.clamp(Decimal::ZERO, Decimal::ONE));
    }

    /// Keeps new orders open with no fill until `complete_order` is called.
    pub fn hold_orders(&self, hold: bool) {
        *self.hold_orders.lock().unwrap() = hold;
    }

    pub fn fail_next_placement(&self, err: VenueError) {
        self.placement_failures.lock().unwrap().push_back(err);
    }

    pub fn placed_orders(&self) -> Vec<PlaceOrderRequest> {
        self.placed.lock().unwrap().clone()
    }

    /// Sets the cumulative fill of a held order and broadcasts the update.
    pub fn complete_order(&self, client_id: &str, filled_size: Decimal, closed: bool) -> bool {
        let update = {
            let mut orders = self.orders.lock().unwrap();
            let Some(order) = orders.get_mut(client_id) else {
                return false;
            };
            order.filled_size = filled_size.min(order.size);
            order.closed = closed;
            OrderUpdate::from(&*order)
        };
        self.broadcast(update);
        true
    }

    /// Drops an order from the venue's books, as if it had never been seen.
    pub fn forget_order(&self, client_id: &str) {
        self.orders.lock().unwrap().remove(client_id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }

    fn fill_ratio(&self, market: &str) -> Decimal {
        self.fill_ratios
            .lock()
            .unwrap()
            .get(market)
            .cloned()
            .unwrap_or(*FILL_RATIO_IN_EMULATION)
    }

    fn broadcast(&self, update: OrderUpdate) {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|tx| tx.send(update.clone()).is_ok());
    }

    fn current_quote(&self, market: &str) -> Result<MarketQuote, VenueError> {
        if !self.replay.is_empty() {
            let current_cursor = self.cursor.load(AtomicOrdering::SeqCst);
            let entry = self
                .replay
                .get(current_cursor)
                .ok_or_else(|| VenueError::Other("Cursor out of bounds".to_string()))?;
            if let Some(quote) = entry.quotes.get(market) {
                return Ok(MarketQuote {
                    market: market.to_string(),
                    bid: quote.bid,
                    ask: quote.ask,
                });
            }
        }
        self.quotes
            .lock()
            .unwrap()
            .get(market)
            .cloned()
            .ok_or_else(|| VenueError::Other(format!("No quote for market '{}'", market)))
    }
}

#[async_trait]
impl ExecutionGateway for PaperVenue {
    async fn get_market(&self, market: &str) -> Result<MarketQuote, VenueError> {
        let latency = *self.quote_latency.lock().unwrap();
        if !latency.is_zero() {
            sleep(latency).await;
        }
        self.current_quote(market)
    }

    async fn place_order(&self, request: &PlaceOrderRequest) -> Result<PlaceOrderAck, VenueError> {
        self.placed.lock().unwrap().push(request.clone());
        if let Some(err) = self.placement_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        if request.size <= Decimal::ZERO {
            return Err(VenueError::Rejected(format!(
                "invalid size {} for {}",
                request.size, request.market
            )));
        }

        let venue_id = rand::random::<u64>().to_string();
        let held = *self.hold_orders.lock().unwrap();
        let (filled_size, closed) = if held {
            (Decimal::ZERO, false)
        } else {
            match request.order_type {
                OrderType::Market => (request.size * self.fill_ratio(&request.market), true),
                OrderType::Limit => (Decimal::ZERO, false),
            }
        };
        let order = VenueOrder {
            client_id: request.client_id.clone(),
            venue_id: Some(venue_id.clone()),
            market: request.market.clone(),
            side: request.side,
            size: request.size,
            filled_size,
            closed,
        };
        log::info!(
            "[PAPER_FILL] market={}, side={}, size={}, filled={}, closed={}",
            order.market,
            order.side,
            order.size,
            order.filled_size,
            order.closed
        );
        let update = OrderUpdate::from(&order);
        self.orders
            .lock()
            .unwrap()
            .insert(request.client_id.clone(), order);
        if !held {
            self.broadcast(update);
        }

        Ok(PlaceOrderAck {
            venue_order_id: Some(venue_id),
        })
    }

    async fn get_open_orders(&self, market: &str) -> Result<Vec<VenueOrder>, VenueError> {
        Ok(self
            .orders
            .lock()
            .unwrap()
            .values()
            .filter(|o| o.market == market && !o.closed)
            .cloned()
            .collect())
    }

    async fn get_order_by_client_id(&self, client_id: &str) -> Result<VenueOrder, VenueError> {
        self.orders
            .lock()
            .unwrap()
            .get(client_id)
            .cloned()
            .ok_or_else(|| VenueError::NotFound(client_id.to_string()))
    }

    async fn get_positions(&self) -> Result<Vec<Position>, VenueError> {
        let mut net: HashMap<String, Decimal> = HashMap::new();
        for order in self.orders.lock().unwrap().values() {
            let signed = match order.side {
                OrderSide::Buy => order.filled_size,
                OrderSide::Sell => -order.filled_size,
            };
            *net.entry(order.market.clone()).or_insert(Decimal::ZERO) += signed;
        }
        let mut positions: Vec<Position> = net
            .into_iter()
            .filter(|(_, size)| !size.is_zero())
            .map(|(market, size)| Position { market, size })
            .collect();
        positions.sort_by(|a, b| a.market.cmp(&b.market));
        Ok(positions)
    }
}

#[async_trait]
impl NotificationSource for PaperVenue {
    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<OrderUpdate>, VenueError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        Ok(rx)
    }

    async fn keep_alive(&self) -> Result<(), VenueError> {
        Ok(())
    }
}
