use chrono::{DateTime, Utc};

use crate::grid::{GridBook, Leg, LegPlacement, PairDirection, PairStatus};
use crate::order_index::{CorrelationIndex, OrderRef};

/// Repair attempts allowed per pair before it is left for an operator.
pub const MAX_REPAIR_RETRIES: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairKey {
    pub level: usize,
    pub direction: PairDirection,
    pub pair_id: String,
}

#[derive(Debug, Default)]
pub struct RepairOutcome {
    pub placements: Vec<LegPlacement>,
    pub abandoned: Vec<PairKey>,
    /// Pairs that ran out of retries during this sweep. Each pair shows up here once.
    pub exhausted: Vec<PairKey>,
}

impl RepairOutcome {
    pub fn is_empty(&self) -> bool {
        self.placements.is_empty() && self.abandoned.is_empty() && self.exhausted.is_empty()
    }
}

/// One pass over every pair whose legs have both closed.
///
/// Pairs with zero fill on both legs are dropped from their level. Pairs with a
/// leg short of target get that leg replaced by a new order for the remainder,
/// which is registered in `index` and returned for placement. Abandoned pairs
/// are collected during the scan and removed afterwards.
pub fn repair_sweep(
    book: &mut GridBook,
    index: &mut CorrelationIndex,
    now: DateTime<Utc>,
) -> RepairOutcome {
    let mut outcome = RepairOutcome::default();
    let spot_market = book.spot_market.clone();
    let future_market = book.future_market.clone();

    for (level_idx, level) in book.levels.iter_mut().enumerate() {
        for direction in PairDirection::BOTH {
            let mut abandoned_ids = Vec::new();
            for (pair_id, pair) in level.pairs_mut(direction).iter_mut() {
                if !pair.both_closed() || pair.is_reconciled() {
                    continue;
                }

                let key = PairKey {
                    level: level_idx,
                    direction,
                    pair_id: pair_id.clone(),
                };

                if pair.retry_place > MAX_REPAIR_RETRIES {
                    if !pair.repair_reported {
                        pair.repair_reported = true;
                        log::error!(
                            "[REPAIR] pair {} ({}) gave up after {} retries: target={} spot={} future={}",
                            pair_id,
                            direction,
                            pair.retry_place,
                            pair.target_qty,
                            pair.spot_qty,
                            pair.future_qty
                        );
                        outcome.exhausted.push(key);
                    }
                    continue;
                }

                if pair.status() == PairStatus::Abandoned {
                    log::info!(
                        "[REPAIR] pair {} ({}) closed with no fill on either leg; abandoning",
                        pair_id,
                        direction
                    );
                    abandoned_ids.push(pair_id.clone());
                    outcome.abandoned.push(key);
                    continue;
                }

                pair.retry_place += 1;
                for leg in Leg::BOTH {
                    let filled = pair.filled(leg);
                    if filled == pair.target_qty {
                        continue;
                    }
                    if filled > pair.target_qty {
                        log::warn!(
                            "[REPAIR] pair {} {} leg overfilled: filled={} target={}",
                            pair_id,
                            leg,
                            filled,
                            pair.target_qty
                        );
                        continue;
                    }
                    let remaining = pair.target_qty - filled;
                    let order = pair.replace_leg(leg, remaining, now);
                    let client_id = order.client_id.clone();
                    index.add(
                        &client_id,
                        OrderRef {
                            level: level_idx,
                            direction,
                            pair_id: pair_id.clone(),
                            leg,
                        },
                    );
                    let market = match leg {
                        Leg::Spot => spot_market.clone(),
                        Leg::Future => future_market.clone(),
                    };
                    log::warn!(
                        "[REPAIR] pair {} ({}) retry {} re-placing {} leg qty={} on {}",
                        pair_id,
                        direction,
                        pair.retry_place,
                        leg,
                        remaining,
                        market
                    );
                    outcome.placements.push(LegPlacement {
                        client_id,
                        pair_id: pair_id.clone(),
                        market,
                        leg,
                        side: direction.side_for(leg),
                        qty: remaining,
                    });
                }
            }

            let pairs = level.pairs_mut(direction);
            for pair_id in abandoned_ids {
                pairs.remove(&pair_id);
            }
        }
    }

    outcome
}
