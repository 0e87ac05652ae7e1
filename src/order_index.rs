use std::collections::HashMap;

use crate::grid::{GridBook, Leg, PairDirection};

/// Where a live leg lives inside the book.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderRef {
    pub level: usize,
    pub direction: PairDirection,
    pub pair_id: String,
    pub leg: Leg,
}

/// Correlation id -> live leg. A client id is present from placement until the
/// leg is closed or rejected; lookups that miss mean the notification is no
/// longer relevant.
#[derive(Debug, Default)]
pub struct CorrelationIndex {
    orders: HashMap<String, OrderRef>,
}

impl CorrelationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-registers every leg that is not yet closed.
    pub fn rebuild(book: &GridBook) -> Self {
        let mut index = Self::new();
        for (level_idx, level) in book.levels.iter().enumerate() {
            for direction in PairDirection::BOTH {
                for pair in level.pairs(direction).values() {
                    for leg in Leg::BOTH {
                        let order = pair.order(leg);
                        if order.closed {
                            continue;
                        }
                        index.add(
                            &order.client_id,
                            OrderRef {
                                level: level_idx,
                                direction,
                                pair_id: pair.id.clone(),
                                leg,
                            },
                        );
                    }
                }
            }
        }
        index
    }

    pub fn add(&mut self, client_id: &str, order_ref: OrderRef) {
        if let Some(prev) = self.orders.insert(client_id.to_string(), order_ref) {
            log::warn!(
                "[INDEX] client id {} re-registered (previous pair {})",
                client_id,
                prev.pair_id
            );
        }
    }

    pub fn get(&self, client_id: &str) -> Option<&OrderRef> {
        self.orders.get(client_id)
    }

    pub fn remove(&mut self, client_id: &str) -> Option<OrderRef> {
        self.orders.remove(client_id)
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.orders.contains_key(client_id)
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &OrderRef)> {
        self.orders.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::{GridLevel, HedgePair};
    use chrono::Utc;
    use rust_decimal::Decimal;

    #[test]
    fn rebuild_registers_only_open_legs() {
        let now = Utc::now();
        let mut level = GridLevel::new(Decimal::ONE, Decimal::ZERO, 1, 1, Decimal::ONE);
        let mut pair = HedgePair::new(&level.id, PairDirection::Open, Decimal::ONE, now);
        pair.spot.close(now);
        let spot_id = pair.spot.client_id.clone();
        let future_id = pair.future.client_id.clone();
        let pair_id = pair.id.clone();
        level.open_pairs.insert(pair.id.clone(), pair);

        let mut closed = HedgePair::new(&level.id, PairDirection::Close, Decimal::ONE, now);
        closed.spot.close(now);
        closed.future.close(now);
        level.close_pairs.insert(closed.id.clone(), closed);

        let book = GridBook::new("S", "F", vec![level]);
        let index = CorrelationIndex::rebuild(&book);

        assert_eq!(index.len(), 1);
        assert!(!index.contains(&spot_id));
        let found = index.get(&future_id).unwrap();
        assert_eq!(found.level, 0);
        assert_eq!(found.direction, PairDirection::Open);
        assert_eq!(found.pair_id, pair_id);
        assert_eq!(found.leg, Leg::Future);
    }

    #[test]
    fn remove_makes_id_unknown() {
        let mut index = CorrelationIndex::new();
        index.add(
            "abc",
            OrderRef {
                level: 0,
                direction: PairDirection::Close,
                pair_id: "p".to_string(),
                leg: Leg::Spot,
            },
        );
        assert!(index.remove("abc").is_some());
        assert!(index.get("abc").is_none());
        assert!(index.remove("abc").is_none());
        assert!(index.is_empty());
    }
}
