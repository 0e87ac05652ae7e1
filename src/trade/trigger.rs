use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::grid::{GridBook, GridLevel, HedgePair, Leg, LegPlacement, PairDirection};
use crate::order_index::{CorrelationIndex, OrderRef};
use crate::ports::venue::MarketQuote;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Spreads {
    /// (future bid - spot ask) / spot ask
    pub open: Decimal,
    /// (future ask - spot bid) / spot bid
    pub close: Decimal,
}

pub fn compute_spreads(spot: &MarketQuote, future: &MarketQuote) -> Option<Spreads> {
    if spot.ask <= Decimal::ZERO || spot.bid <= Decimal::ZERO {
        return None;
    }
    let open = (future.bid - spot.ask).checked_div(spot.ask)?;
    let close = (future.ask - spot.bid).checked_div(spot.bid)?;
    Some(Spreads { open, close })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerDecision {
    pub level: usize,
    pub open: bool,
    pub close: bool,
}

impl TriggerDecision {
    pub fn directions(&self) -> impl Iterator<Item = PairDirection> {
        let open = self.open.then_some(PairDirection::Open);
        let close = self.close.then_some(PairDirection::Close);
        open.into_iter().chain(close)
    }
}

/// Scans levels in configured order; the first level that would open or close
/// wins and the scan stops there.
pub fn evaluate(levels: &[GridLevel], spreads: &Spreads) -> Option<TriggerDecision> {
    for (index, level) in levels.iter().enumerate() {
        let open = spreads.open >= level.open_at && level.open_chance > 0;
        let close = spreads.close <= level.close_at && level.close_chance > 0;
        if open || close {
            return Some(TriggerDecision {
                level: index,
                open,
                close,
            });
        }
    }
    None
}

/// Creates one pair per triggered direction, consumes the chance and registers
/// both legs. Returns the legs to place, spot first.
pub fn apply_trigger(
    book: &mut GridBook,
    index: &mut CorrelationIndex,
    decision: &TriggerDecision,
    now: DateTime<Utc>,
) -> Vec<LegPlacement> {
    let mut placements = Vec::new();
    for direction in decision.directions() {
        let Some(level) = book.levels.get_mut(decision.level) else {
            log::warn!("[TRIGGER] level {} out of range", decision.level);
            return placements;
        };
        if !level.take_chance(direction) {
            continue;
        }
        let pair = HedgePair::new(&level.id, direction, level.place_qty, now);
        for leg in Leg::BOTH {
            index.add(
                &pair.order(leg).client_id,
                OrderRef {
                    level: decision.level,
                    direction,
                    pair_id: pair.id.clone(),
                    leg,
                },
            );
        }
        let pair_id = pair.id.clone();
        level.pairs_mut(direction).insert(pair_id.clone(), pair);

        if let Some(pair) = book.pair(decision.level, direction, &pair_id) {
            for leg in Leg::BOTH {
                placements.push(book.placement_for(pair, leg));
            }
        }
    }
    placements
}
