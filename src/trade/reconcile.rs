use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::grid::{GridBook, Leg};
use crate::order_index::CorrelationIndex;
use crate::ports::venue::OrderUpdate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateEffect {
    /// Unknown client id or a leg that no longer exists.
    Ignored,
    Applied {
        leg: Leg,
        /// Zero when the notification carried no new fill.
        delta: Decimal,
        closed: bool,
    },
}

/// Applies a fill notification to the owning pair.
///
/// Only the positive difference against the last known filled size is added,
/// so replays and out-of-order notifications are harmless.
pub fn apply_order_update(
    book: &mut GridBook,
    index: &mut CorrelationIndex,
    update: &OrderUpdate,
    now: DateTime<Utc>,
) -> UpdateEffect {
    let Some(order_ref) = index.get(&update.client_id).cloned() else {
        log::debug!("[FILL] unknown client id {}", update.client_id);
        return UpdateEffect::Ignored;
    };
    let qty_leg = book
        .leg_for_market(&update.market)
        .unwrap_or(order_ref.leg);

    let Some(pair) = book.pair_mut(order_ref.level, order_ref.direction, &order_ref.pair_id)
    else {
        log::warn!(
            "[FILL] pair {} for client id {} is gone; dropping index entry",
            order_ref.pair_id,
            update.client_id
        );
        index.remove(&update.client_id);
        return UpdateEffect::Ignored;
    };

    let order = pair.order_mut(order_ref.leg);
    let delta = update.filled_size - order.filled_qty;
    let delta = if delta > Decimal::ZERO {
        order.filled_qty = update.filled_size;
        delta
    } else {
        Decimal::ZERO
    };
    if order.venue_id.is_none() {
        order.venue_id = update.venue_id.clone();
    }
    order.updated_at = Some(now);
    if update.closed {
        order.close(now);
    }
    pair.add_filled(qty_leg, delta);

    if delta > Decimal::ZERO {
        log::info!(
            "[FILL] pair {} {} leg +{} (spot={} future={} target={})",
            pair.id,
            qty_leg,
            delta,
            pair.spot_qty,
            pair.future_qty,
            pair.target_qty
        );
    }
    if update.closed {
        log::info!(
            "[FILL] pair {} {} leg closed ({})",
            pair.id,
            order_ref.leg,
            update.client_id
        );
        index.remove(&update.client_id);
    }

    UpdateEffect::Applied {
        leg: order_ref.leg,
        delta,
        closed: update.closed,
    }
}

/// Closes a rejected leg without adding fill. Unknown ids are ignored.
pub fn apply_rejection(
    book: &mut GridBook,
    index: &mut CorrelationIndex,
    client_id: &str,
    now: DateTime<Utc>,
) -> bool {
    let Some(order_ref) = index.remove(client_id) else {
        log::debug!("[REJECT] unknown client id {}", client_id);
        return false;
    };
    let Some(pair) = book.pair_mut(order_ref.level, order_ref.direction, &order_ref.pair_id)
    else {
        log::warn!(
            "[REJECT] pair {} for client id {} is gone",
            order_ref.pair_id,
            client_id
        );
        return false;
    };
    pair.order_mut(order_ref.leg).close(now);
    log::warn!(
        "[REJECT] pair {} {} leg rejected ({})",
        pair.id,
        order_ref.leg,
        client_id
    );
    true
}
