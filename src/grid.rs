use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::ports::venue::OrderSide;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Leg {
    Spot,
    Future,
}

impl Leg {
    pub const BOTH: [Leg; 2] = [Leg::Spot, Leg::Future];
}

impl fmt::Display for Leg {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Leg::Spot => write!(f, "spot"),
            Leg::Future => write!(f, "future"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PairDirection {
    Open,
    Close,
}

impl PairDirection {
    pub const BOTH: [PairDirection; 2] = [PairDirection::Open, PairDirection::Close];

    /// Open buys spot and sells the future; close unwinds the other way.
    pub fn side_for(self, leg: Leg) -> OrderSide {
        match (self, leg) {
            (PairDirection::Open, Leg::Spot) => OrderSide::Buy,
            (PairDirection::Open, Leg::Future) => OrderSide::Sell,
            (PairDirection::Close, Leg::Spot) => OrderSide::Sell,
            (PairDirection::Close, Leg::Future) => OrderSide::Buy,
        }
    }
}

impl fmt::Display for PairDirection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PairDirection::Open => write!(f, "open"),
            PairDirection::Close => write!(f, "close"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairStatus {
    /// At least one leg is still working at the venue.
    Pending,
    /// Both legs closed with a quantity mismatch.
    AwaitingRepair,
    Reconciled,
    Abandoned,
}

impl fmt::Display for PairStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PairStatus::Pending => write!(f, "Pending"),
            PairStatus::AwaitingRepair => write!(f, "AwaitingRepair"),
            PairStatus::Reconciled => write!(f, "Reconciled"),
            PairStatus::Abandoned => write!(f, "Abandoned"),
        }
    }
}

/// One placement attempt for one leg of a pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridOrder {
    pub client_id: String,
    #[serde(default)]
    pub venue_id: Option<String>,
    pub pair_id: String,
    pub leg: Leg,
    pub qty: Decimal,
    #[serde(default)]
    pub filled_qty: Decimal,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub closed: bool,
}

impl GridOrder {
    pub fn new(pair_id: &str, leg: Leg, qty: Decimal, now: DateTime<Utc>) -> Self {
        Self {
            client_id: Uuid::new_v4().to_string(),
            venue_id: None,
            pair_id: pair_id.to_string(),
            leg,
            qty,
            filled_qty: Decimal::ZERO,
            created_at: now,
            updated_at: None,
            finished_at: None,
            closed: false,
        }
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.updated_at.unwrap_or(self.created_at)
    }

    pub fn close(&mut self, now: DateTime<Utc>) {
        self.closed = true;
        self.finished_at = Some(now);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HedgePair {
    pub id: String,
    pub level_id: String,
    pub direction: PairDirection,
    pub target_qty: Decimal,
    #[serde(default)]
    pub spot_qty: Decimal,
    #[serde(default)]
    pub future_qty: Decimal,
    #[serde(default)]
    pub retry_place: u32,
    #[serde(default)]
    pub repair_reported: bool,
    pub created_at: DateTime<Utc>,
    pub spot: GridOrder,
    pub future: GridOrder,
}

impl HedgePair {
    pub fn new(level_id: &str, direction: PairDirection, qty: Decimal, now: DateTime<Utc>) -> Self {
        let id = Uuid::new_v4().to_string();
        Self {
            spot: GridOrder::new(&id, Leg::Spot, qty, now),
            future: GridOrder::new(&id, Leg::Future, qty, now),
            id,
            level_id: level_id.to_string(),
            direction,
            target_qty: qty,
            spot_qty: Decimal::ZERO,
            future_qty: Decimal::ZERO,
            retry_place: 0,
            repair_reported: false,
            created_at: now,
        }
    }

    pub fn order(&self, leg: Leg) -> &GridOrder {
        match leg {
            Leg::Spot => &self.spot,
            Leg::Future => &self.future,
        }
    }

    pub fn order_mut(&mut self, leg: Leg) -> &mut GridOrder {
        match leg {
            Leg::Spot => &mut self.spot,
            Leg::Future => &mut self.future,
        }
    }

    pub fn filled(&self, leg: Leg) -> Decimal {
        match leg {
            Leg::Spot => self.spot_qty,
            Leg::Future => self.future_qty,
        }
    }

    /// Quantities only grow; non-positive deltas are dropped.
    pub fn add_filled(&mut self, leg: Leg, delta: Decimal) {
        if delta <= Decimal::ZERO {
            return;
        }
        match leg {
            Leg::Spot => self.spot_qty += delta,
            Leg::Future => self.future_qty += delta,
        }
    }

    pub fn both_closed(&self) -> bool {
        self.spot.closed && self.future.closed
    }

    pub fn is_reconciled(&self) -> bool {
        self.both_closed() && self.spot_qty == self.target_qty && self.future_qty == self.target_qty
    }

    pub fn status(&self) -> PairStatus {
        if !self.both_closed() {
            PairStatus::Pending
        } else if self.is_reconciled() {
            PairStatus::Reconciled
        } else if self.spot_qty.is_zero() && self.future_qty.is_zero() {
            PairStatus::Abandoned
        } else {
            PairStatus::AwaitingRepair
        }
    }

    /// Swaps in a fresh order for `leg`. The old order must already be closed.
    pub fn replace_leg(&mut self, leg: Leg, qty: Decimal, now: DateTime<Utc>) -> &GridOrder {
        let order = GridOrder::new(&self.id, leg, qty, now);
        *self.order_mut(leg) = order;
        self.order(leg)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridLevel {
    pub id: String,
    pub open_at: Decimal,
    pub close_at: Decimal,
    pub open_chance: u32,
    pub close_chance: u32,
    pub place_qty: Decimal,
    #[serde(default)]
    pub open_pairs: BTreeMap<String, HedgePair>,
    #[serde(default)]
    pub close_pairs: BTreeMap<String, HedgePair>,
}

impl GridLevel {
    pub fn new(
        open_at: Decimal,
        close_at: Decimal,
        open_chance: u32,
        close_chance: u32,
        place_qty: Decimal,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            open_at,
            close_at,
            open_chance,
            close_chance,
            place_qty,
            open_pairs: BTreeMap::new(),
            close_pairs: BTreeMap::new(),
        }
    }

    pub fn pairs(&self, direction: PairDirection) -> &BTreeMap<String, HedgePair> {
        match direction {
            PairDirection::Open => &self.open_pairs,
            PairDirection::Close => &self.close_pairs,
        }
    }

    pub fn pairs_mut(&mut self, direction: PairDirection) -> &mut BTreeMap<String, HedgePair> {
        match direction {
            PairDirection::Open => &mut self.open_pairs,
            PairDirection::Close => &mut self.close_pairs,
        }
    }

    pub fn chance(&self, direction: PairDirection) -> u32 {
        match direction {
            PairDirection::Open => self.open_chance,
            PairDirection::Close => self.close_chance,
        }
    }

    /// Consumes one chance. Returns false when none is left.
    pub fn take_chance(&mut self, direction: PairDirection) -> bool {
        let chance = match direction {
            PairDirection::Open => &mut self.open_chance,
            PairDirection::Close => &mut self.close_chance,
        };
        if *chance == 0 {
            return false;
        }
        *chance -= 1;
        true
    }
}

/// A leg that has to be sent to the venue.
#[derive(Debug, Clone, PartialEq)]
pub struct LegPlacement {
    pub client_id: String,
    pub pair_id: String,
    pub market: String,
    pub leg: Leg,
    pub side: OrderSide,
    pub qty: Decimal,
}

/// Grid levels for one spot/future market couple, in configured priority order.
#[derive(Debug, Clone, PartialEq)]
pub struct GridBook {
    pub spot_market: String,
    pub future_market: String,
    pub levels: Vec<GridLevel>,
}

impl GridBook {
    pub fn new(spot_market: &str, future_market: &str, levels: Vec<GridLevel>) -> Self {
        Self {
            spot_market: spot_market.to_string(),
            future_market: future_market.to_string(),
            levels,
        }
    }

    pub fn market_for(&self, leg: Leg) -> &str {
        match leg {
            Leg::Spot => &self.spot_market,
            Leg::Future => &self.future_market,
        }
    }

    pub fn leg_for_market(&self, market: &str) -> Option<Leg> {
        if market == self.spot_market {
            Some(Leg::Spot)
        } else if market == self.future_market {
            Some(Leg::Future)
        } else {
            None
        }
    }

    pub fn pair(&self, level: usize, direction: PairDirection, pair_id: &str) -> Option<&HedgePair> {
        self.levels.get(level)?.pairs(direction).get(pair_id)
    }

    pub fn pair_mut(
        &mut self,
        level: usize,
        direction: PairDirection,
        pair_id: &str,
    ) -> Option<&mut HedgePair> {
        self.levels.get_mut(level)?.pairs_mut(direction).get_mut(pair_id)
    }

    pub fn placement_for(&self, pair: &HedgePair, leg: Leg) -> LegPlacement {
        let order = pair.order(leg);
        LegPlacement {
            client_id: order.client_id.clone(),
            pair_id: pair.id.clone(),
            market: self.market_for(leg).to_string(),
            leg,
            side: pair.direction.side_for(leg),
            qty: order.qty,
        }
    }

    pub fn pair_count(&self) -> usize {
        self.levels
            .iter()
            .map(|level| level.open_pairs.len() + level.close_pairs.len())
            .sum()
    }

    pub fn count_by_status(&self, status: PairStatus) -> usize {
        self.levels
            .iter()
            .flat_map(|level| level.open_pairs.values().chain(level.close_pairs.values()))
            .filter(|pair| pair.status() == status)
            .count()
    }
}
