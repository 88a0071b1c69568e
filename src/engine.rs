//! The matching engine.
//!
//! [`execute_market`] is a pure function over the full order state of one
//! market: it never touches storage and never suspends, so it can run inside
//! the per-market critical section and be unit-tested in isolation. Its
//! output is a [`MatchResult`] of deltas that the settlement applier commits
//! in a single transaction.
//!
//! Two kinds of match are produced:
//!
//! - **Direct**: a buy and a sell on the same outcome whose prices cross,
//!   filled at the midpoint so the surplus splits evenly.
//! - **Synthetic**: buys across distinct outcomes whose bid prices sum to at
//!   least 1.00, which lets the exchange mint complete baskets. Contracts of
//!   outcomes nobody in the set bid on are handed back to the participants
//!   pro-rata by bid price.
//!
//! Each outer iteration attempts every direct match first and falls back to
//! a single synthetic match only when no direct match fired. Every fired
//! match removes at least one whole contract of open quantity, so the loop
//! terminates.

use std::collections::{BTreeMap, BTreeSet};

use crate::state::{
    Execution, ExecutionParticipant, Order, OrderDirection, OrderId, OutcomeId, UserId,
    CONTRACT_PRECISION, PRICE_PRECISION,
};
use crate::utils::IdGen;

// ============================================================================
// Engine output
// ============================================================================

/// Rewrite of one resting order. `new_quantity == 0` means delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderUpdate {
    pub order_id: OrderId,
    pub new_quantity: u64,
    pub new_escrow_e6: u64,
}

/// Signed micro-contract delta for one (user, outcome) holding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionDelta {
    pub user_id: UserId,
    pub outcome_id: OutcomeId,
    pub delta_e6: i64,
}

/// Signed micro-currency deltas for one user's balance and locked escrow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceDelta {
    pub user_id: UserId,
    pub balance_delta_e6: i64,
    pub locked_delta_e6: i64,
}

/// Everything the settlement applier needs to commit one matching round.
#[derive(Debug, Clone, Default)]
pub struct MatchResult {
    pub executions: Vec<Execution>,
    pub order_updates: Vec<OrderUpdate>,
    pub position_updates: Vec<PositionDelta>,
    pub balance_updates: Vec<BalanceDelta>,
    /// Complete sets minted by synthetic matches this round
    pub minted_sets: u64,
    /// Gross direct-match volume (micro-currency)
    pub volume_e6: u64,
}

impl MatchResult {
    pub fn is_empty(&self) -> bool {
        self.executions.is_empty()
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Run matching over a market's resting orders until quiescent.
///
/// `orders` is the complete set of resting orders of `market_id`;
/// `outcome_ids` the market's outcomes. The id generator and clock are
/// injected so the engine itself stays deterministic and storage-free.
pub fn execute_market(
    market_id: &str,
    orders: &[Order],
    outcome_ids: &[OutcomeId],
    now_ms: i64,
    ids: &IdGen,
) -> MatchResult {
    let mut ctx = MatchContext::new(orders);

    loop {
        let mut progress = false;
        for outcome_id in outcome_ids {
            progress |= ctx.try_direct_match(market_id, outcome_id, now_ms, ids);
        }
        if !progress {
            progress = ctx.try_synthetic_match(market_id, outcome_ids, now_ms, ids);
        }
        if !progress {
            break;
        }
    }

    ctx.into_result(orders)
}

/// Working state of one engine run: order clones whose quantity and escrow
/// shrink as matches fire, plus accumulated deltas.
struct MatchContext {
    working: Vec<Order>,
    balances: BTreeMap<UserId, (i64, i64)>,
    positions: BTreeMap<(UserId, OutcomeId), i64>,
    executions: Vec<Execution>,
    minted_sets: u64,
    volume_e6: u64,
}

impl MatchContext {
    fn new(orders: &[Order]) -> Self {
        Self {
            working: orders.to_vec(),
            balances: BTreeMap::new(),
            positions: BTreeMap::new(),
            executions: Vec::new(),
            minted_sets: 0,
            volume_e6: 0,
        }
    }

    /// Live order indices on one side of one outcome, best price first,
    /// FIFO (then id) within a price level.
    fn side_indices(&self, outcome_id: &str, direction: OrderDirection) -> Vec<usize> {
        let mut indices: Vec<usize> = self
            .working
            .iter()
            .enumerate()
            .filter(|(_, o)| {
                o.quantity > 0 && o.outcome_id == outcome_id && o.direction == direction
            })
            .map(|(i, _)| i)
            .collect();
        indices.sort_by(|&a, &b| {
            let (oa, ob) = (&self.working[a], &self.working[b]);
            let by_price = match direction {
                OrderDirection::Buy => ob.price_e6.cmp(&oa.price_e6),
                OrderDirection::Sell => oa.price_e6.cmp(&ob.price_e6),
            };
            by_price
                .then(oa.created_at.cmp(&ob.created_at))
                .then(oa.id.cmp(&ob.id))
        });
        indices
    }

    /// Attempt one direct match on `outcome_id`. Returns whether at least
    /// one contract traded.
    fn try_direct_match(
        &mut self,
        market_id: &str,
        outcome_id: &str,
        now_ms: i64,
        ids: &IdGen,
    ) -> bool {
        let bids = self.side_indices(outcome_id, OrderDirection::Buy);
        let asks = self.side_indices(outcome_id, OrderDirection::Sell);
        let (Some(&best_bid), Some(&best_ask)) = (bids.first(), asks.first()) else {
            return false;
        };

        let bid_price = self.working[best_bid].price_e6;
        let ask_price = self.working[best_ask].price_e6;
        if bid_price < ask_price {
            return false;
        }

        // All orders resting at the two best prices compete for the fill.
        let best_bids: Vec<usize> = bids
            .into_iter()
            .filter(|&i| self.working[i].price_e6 == bid_price)
            .collect();
        let best_asks: Vec<usize> = asks
            .into_iter()
            .filter(|&i| self.working[i].price_e6 == ask_price)
            .collect();

        let total_bid: u64 = best_bids.iter().map(|&i| self.working[i].quantity).sum();
        let total_ask: u64 = best_asks.iter().map(|&i| self.working[i].quantity).sum();

        // The oversubscribed side is rationed pro-rata (rounded down,
        // residual units stay on the book); the other side fills FIFO up to
        // the rationed total.
        let (bid_fills, ask_fills) = if total_bid > total_ask {
            let fills = self.prorate(&best_bids, total_ask);
            let matched: u64 = fills.iter().sum();
            (fills, self.fifo_fill(&best_asks, matched))
        } else if total_ask > total_bid {
            let fills = self.prorate(&best_asks, total_bid);
            let matched: u64 = fills.iter().sum();
            (self.fifo_fill(&best_bids, matched), fills)
        } else {
            let bid_fills: Vec<u64> = best_bids.iter().map(|&i| self.working[i].quantity).collect();
            let ask_fills: Vec<u64> = best_asks.iter().map(|&i| self.working[i].quantity).collect();
            (bid_fills, ask_fills)
        };

        let matched: u64 = bid_fills.iter().sum();
        if matched == 0 {
            return false;
        }

        // Midpoint splits the crossed surplus evenly between the sides.
        let match_price = (bid_price + ask_price) / 2;
        let mut participants = Vec::new();

        for (&idx, &fill) in best_bids.iter().zip(&bid_fills) {
            if fill > 0 {
                participants.push(self.fill_buyer(idx, fill, match_price));
            }
        }
        for (&idx, &fill) in best_asks.iter().zip(&ask_fills) {
            if fill > 0 {
                participants.push(self.fill_seller(idx, fill, match_price));
            }
        }

        self.volume_e6 += matched * match_price;
        self.executions.push(Execution {
            id: ids.next(now_ms),
            market_id: market_id.to_string(),
            timestamp_ms: now_ms,
            participants,
        });
        true
    }

    /// Attempt one synthetic (basket-mint) match. Returns whether baskets
    /// were minted.
    fn try_synthetic_match(
        &mut self,
        market_id: &str,
        outcome_ids: &[OutcomeId],
        now_ms: i64,
        ids: &IdGen,
    ) -> bool {
        // Best bid per outcome, then greedy by descending price until the
        // bid prices cover a whole basket.
        let mut best_bids: Vec<usize> = outcome_ids
            .iter()
            .filter_map(|outcome_id| {
                self.side_indices(outcome_id, OrderDirection::Buy)
                    .first()
                    .copied()
            })
            .collect();
        best_bids.sort_by(|&a, &b| {
            let (oa, ob) = (&self.working[a], &self.working[b]);
            ob.price_e6
                .cmp(&oa.price_e6)
                .then(oa.created_at.cmp(&ob.created_at))
                .then(oa.id.cmp(&ob.id))
        });

        let mut chosen: Vec<usize> = Vec::new();
        let mut bid_sum = 0u64;
        for idx in best_bids {
            chosen.push(idx);
            bid_sum += self.working[idx].price_e6;
            if bid_sum >= PRICE_PRECISION {
                break;
            }
        }
        if bid_sum < PRICE_PRECISION {
            return false;
        }

        let quantity = chosen
            .iter()
            .map(|&i| self.working[i].quantity)
            .min()
            .unwrap_or(0);
        debug_assert!(quantity > 0);

        let mut participants = Vec::new();
        let chosen_outcomes: BTreeSet<OutcomeId> = chosen
            .iter()
            .map(|&i| self.working[i].outcome_id.clone())
            .collect();

        for &idx in &chosen {
            let (user_id, outcome_id, price_e6) = {
                let o = &self.working[idx];
                (o.user_id.clone(), o.outcome_id.clone(), o.price_e6)
            };
            // Each participant pays their full bid; that cash is what
            // collateralises the minted baskets.
            let cost_e6 = quantity * price_e6;
            let entry = self.balances.entry(user_id.clone()).or_insert((0, 0));
            entry.0 -= cost_e6 as i64;
            entry.1 -= cost_e6 as i64;
            *self
                .positions
                .entry((user_id.clone(), outcome_id.clone()))
                .or_insert(0) += quantity as i64 * CONTRACT_PRECISION;

            let o = &mut self.working[idx];
            o.quantity -= quantity;
            o.escrow_e6 -= cost_e6;

            participants.push(ExecutionParticipant {
                user_id,
                outcome_id,
                direction: OrderDirection::Buy,
                quantity,
                price_e6,
            });
        }

        // Contracts of the outcomes nobody in the set bid on go back to the
        // participants pro-rata by bid price.
        for outcome_id in outcome_ids {
            if !chosen_outcomes.contains(outcome_id) {
                self.distribute_surplus(outcome_id, quantity, &participants, bid_sum);
            }
        }

        self.minted_sets += quantity;
        self.executions.push(Execution {
            id: ids.next(now_ms),
            market_id: market_id.to_string(),
            timestamp_ms: now_ms,
            participants,
        });
        true
    }

    /// Split `quantity` whole contracts of a surplus outcome among the
    /// participants, weighted by bid price. Shares are floored in
    /// micro-contracts and the remaining micros go to the largest
    /// remainders, so the per-outcome sums stay exactly equal.
    fn distribute_surplus(
        &mut self,
        outcome_id: &str,
        quantity: u64,
        participants: &[ExecutionParticipant],
        bid_sum_e6: u64,
    ) {
        let total_e6 = quantity as u128 * CONTRACT_PRECISION as u128;
        let mut shares = Vec::with_capacity(participants.len());
        let mut assigned: u128 = 0;
        for (seq, p) in participants.iter().enumerate() {
            let numerator = total_e6 * p.price_e6 as u128;
            let share = numerator / bid_sum_e6 as u128;
            let remainder = numerator % bid_sum_e6 as u128;
            assigned += share;
            shares.push((share, remainder, p.price_e6, seq));
        }

        let mut leftover = (total_e6 - assigned) as usize;
        // Highest remainder first; ties go to the higher bid, then to the
        // earlier participant.
        let mut by_remainder: Vec<usize> = (0..shares.len()).collect();
        by_remainder.sort_by(|&a, &b| {
            shares[b]
                .1
                .cmp(&shares[a].1)
                .then(shares[b].2.cmp(&shares[a].2))
                .then(shares[a].3.cmp(&shares[b].3))
        });
        for &i in &by_remainder {
            if leftover == 0 {
                break;
            }
            shares[i].0 += 1;
            leftover -= 1;
        }

        for (share, p) in shares.iter().zip(participants) {
            if share.0 > 0 {
                *self
                    .positions
                    .entry((p.user_id.clone(), outcome_id.to_string()))
                    .or_insert(0) += share.0 as i64;
            }
        }
    }

    /// Pro-rata allocation: `floor(own * available / total)` per order.
    fn prorate(&self, indices: &[usize], available: u64) -> Vec<u64> {
        let total: u64 = indices.iter().map(|&i| self.working[i].quantity).sum();
        indices
            .iter()
            .map(|&i| {
                let own = self.working[i].quantity;
                ((own as u128 * available as u128) / total as u128) as u64
            })
            .collect()
    }

    /// FIFO allocation: earlier orders fill fully until `target` runs out.
    fn fifo_fill(&self, indices: &[usize], target: u64) -> Vec<u64> {
        let mut remaining = target;
        indices
            .iter()
            .map(|&i| {
                let fill = self.working[i].quantity.min(remaining);
                remaining -= fill;
                fill
            })
            .collect()
    }

    /// Apply one buyer fill: pay the match price, release escrow at the bid
    /// price, receive contracts.
    fn fill_buyer(&mut self, idx: usize, fill: u64, match_price_e6: u64) -> ExecutionParticipant {
        let (user_id, outcome_id, bid_price) = {
            let o = &self.working[idx];
            (o.user_id.clone(), o.outcome_id.clone(), o.price_e6)
        };
        let release_e6 = fill * bid_price;
        let entry = self.balances.entry(user_id.clone()).or_insert((0, 0));
        entry.0 -= (fill * match_price_e6) as i64;
        entry.1 -= release_e6 as i64;
        *self
            .positions
            .entry((user_id.clone(), outcome_id.clone()))
            .or_insert(0) += fill as i64 * CONTRACT_PRECISION;

        let o = &mut self.working[idx];
        o.quantity -= fill;
        o.escrow_e6 -= release_e6;

        ExecutionParticipant {
            user_id,
            outcome_id,
            direction: OrderDirection::Buy,
            quantity: fill,
            price_e6: match_price_e6,
        }
    }

    /// Apply one seller fill: receive the match price, release escrow
    /// proportionally (exact remainder on the closing fill), deliver
    /// contracts - going short when not covered.
    fn fill_seller(&mut self, idx: usize, fill: u64, match_price_e6: u64) -> ExecutionParticipant {
        let (user_id, outcome_id, remaining, escrow_e6) = {
            let o = &self.working[idx];
            (
                o.user_id.clone(),
                o.outcome_id.clone(),
                o.quantity,
                o.escrow_e6,
            )
        };
        let escrow_used_e6 = if fill == remaining {
            escrow_e6
        } else {
            ((escrow_e6 as u128 * fill as u128) / (remaining as u128)) as u64
        };
        let entry = self.balances.entry(user_id.clone()).or_insert((0, 0));
        entry.0 += (fill * match_price_e6) as i64;
        entry.1 -= escrow_used_e6 as i64;
        *self
            .positions
            .entry((user_id.clone(), outcome_id.clone()))
            .or_insert(0) -= fill as i64 * CONTRACT_PRECISION;

        let o = &mut self.working[idx];
        o.quantity -= fill;
        o.escrow_e6 -= escrow_used_e6;

        ExecutionParticipant {
            user_id,
            outcome_id,
            direction: OrderDirection::Sell,
            quantity: fill,
            price_e6: match_price_e6,
        }
    }

    /// Diff the working set against the input and collect the deltas.
    fn into_result(self, orders: &[Order]) -> MatchResult {
        let mut result = MatchResult {
            executions: self.executions,
            minted_sets: self.minted_sets,
            volume_e6: self.volume_e6,
            ..Default::default()
        };

        for (original, worked) in orders.iter().zip(&self.working) {
            if worked.quantity != original.quantity {
                result.order_updates.push(OrderUpdate {
                    order_id: original.id.clone(),
                    new_quantity: worked.quantity,
                    new_escrow_e6: if worked.quantity == 0 {
                        0
                    } else {
                        worked.escrow_e6
                    },
                });
            }
        }
        for ((user_id, outcome_id), delta_e6) in self.positions {
            if delta_e6 != 0 {
                result.position_updates.push(PositionDelta {
                    user_id,
                    outcome_id,
                    delta_e6,
                });
            }
        }
        for (user_id, (balance_delta_e6, locked_delta_e6)) in self.balances {
            if balance_delta_e6 != 0 || locked_delta_e6 != 0 {
                result.balance_updates.push(BalanceDelta {
                    user_id,
                    balance_delta_e6,
                    locked_delta_e6,
                });
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escrow::required_escrow_e6;

    const YES: &str = "out-yes";
    const NO: &str = "out-no";

    fn outcome_ids(ids: &[&str]) -> Vec<OutcomeId> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    /// Build an order with the escrow admission would have locked for a
    /// user holding nothing.
    fn order(
        id: &str,
        user: &str,
        outcome: &str,
        direction: OrderDirection,
        quantity: u64,
        price_e6: u64,
        created_at: i64,
    ) -> Order {
        Order {
            id: id.to_string(),
            user_id: user.to_string(),
            market_id: "m1".to_string(),
            outcome_id: outcome.to_string(),
            direction,
            quantity,
            price_e6,
            escrow_e6: required_escrow_e6(direction, quantity, price_e6, 0),
            created_at,
        }
    }

    fn run(orders: &[Order], outcomes: &[&str]) -> MatchResult {
        let ids = IdGen::new(0);
        execute_market("m1", orders, &outcome_ids(outcomes), 1_000, &ids)
    }

    fn balance_of<'a>(result: &'a MatchResult, user: &str) -> &'a BalanceDelta {
        result
            .balance_updates
            .iter()
            .find(|b| b.user_id == user)
            .expect("balance delta present")
    }

    fn position_of(result: &MatchResult, user: &str, outcome: &str) -> i64 {
        result
            .position_updates
            .iter()
            .filter(|p| p.user_id == user && p.outcome_id == outcome)
            .map(|p| p.delta_e6)
            .sum()
    }

    fn update_of<'a>(result: &'a MatchResult, order_id: &str) -> &'a OrderUpdate {
        result
            .order_updates
            .iter()
            .find(|u| u.order_id == order_id)
            .expect("order update present")
    }

    /// The engine's own conservation laws: per-outcome position sums are
    /// identical, and every released micro of locked escrow matches an
    /// order's escrow reduction.
    fn check_conservation(orders: &[Order], outcomes: &[&str], result: &MatchResult) {
        let mut per_outcome: BTreeMap<&str, i64> = outcomes.iter().map(|&o| (o, 0)).collect();
        for p in &result.position_updates {
            *per_outcome.get_mut(p.outcome_id.as_str()).unwrap() += p.delta_e6;
        }
        let sums: Vec<i64> = per_outcome.values().copied().collect();
        assert!(
            sums.windows(2).all(|w| w[0] == w[1]),
            "per-outcome sums diverge: {per_outcome:?}"
        );

        let escrow_released: i64 = orders
            .iter()
            .map(|o| {
                let new = result
                    .order_updates
                    .iter()
                    .find(|u| u.order_id == o.id)
                    .map(|u| u.new_escrow_e6)
                    .unwrap_or(o.escrow_e6);
                o.escrow_e6 as i64 - new as i64
            })
            .sum();
        let locked_released: i64 = result
            .balance_updates
            .iter()
            .map(|b| -b.locked_delta_e6)
            .sum();
        assert_eq!(escrow_released, locked_released);
    }

    #[test]
    fn test_no_orders_no_result() {
        let result = run(&[], &[YES, NO]);
        assert!(result.is_empty());
        assert!(result.order_updates.is_empty());
    }

    #[test]
    fn test_direct_fill_at_midpoint() {
        let orders = vec![
            order("o-a", "alice", YES, OrderDirection::Buy, 10, 700_000, 1),
            order("o-b", "bob", YES, OrderDirection::Sell, 10, 300_000, 2),
        ];
        let result = run(&orders, &[YES, NO]);

        assert_eq!(result.executions.len(), 1);
        let execution = &result.executions[0];
        assert_eq!(execution.participants.len(), 2);
        assert!(execution
            .participants
            .iter()
            .all(|p| p.price_e6 == 500_000 && p.quantity == 10));

        // Alice pays 10 * 0.50 and releases her full 7.00 escrow
        let alice = balance_of(&result, "alice");
        assert_eq!(alice.balance_delta_e6, -5_000_000);
        assert_eq!(alice.locked_delta_e6, -7_000_000);
        // Bob receives 10 * 0.50 and releases his full short escrow
        let bob = balance_of(&result, "bob");
        assert_eq!(bob.balance_delta_e6, 5_000_000);
        assert_eq!(bob.locked_delta_e6, -7_000_000);

        assert_eq!(position_of(&result, "alice", YES), 10_000_000);
        assert_eq!(position_of(&result, "bob", YES), -10_000_000);

        // Both orders fully filled and deleted
        assert_eq!(update_of(&result, "o-a").new_quantity, 0);
        assert_eq!(update_of(&result, "o-b").new_quantity, 0);
        assert_eq!(update_of(&result, "o-b").new_escrow_e6, 0);

        assert_eq!(result.volume_e6, 5_000_000);
        assert_eq!(result.minted_sets, 0);
        check_conservation(&orders, &[YES, NO], &result);
    }

    #[test]
    fn test_uncrossed_book_rests() {
        let orders = vec![
            order("o-a", "alice", YES, OrderDirection::Buy, 10, 400_000, 1),
            order("o-b", "bob", YES, OrderDirection::Sell, 10, 600_000, 2),
        ];
        let result = run(&orders, &[YES, NO]);
        assert!(result.is_empty());
        assert!(result.balance_updates.is_empty());
    }

    #[test]
    fn test_partial_fill_keeps_buyer_escrow_consistent() {
        let orders = vec![
            order("o-a", "alice", YES, OrderDirection::Buy, 10, 600_000, 1),
            order("o-b", "bob", YES, OrderDirection::Sell, 4, 400_000, 2),
        ];
        let result = run(&orders, &[YES, NO]);

        assert_eq!(result.executions.len(), 1);
        let alice_update = update_of(&result, "o-a");
        assert_eq!(alice_update.new_quantity, 6);
        // Remaining escrow still covers 6 contracts at the 0.60 bid
        assert_eq!(alice_update.new_escrow_e6, 3_600_000);
        assert_eq!(update_of(&result, "o-b").new_quantity, 0);

        // Fill price is the 0.50 midpoint
        let alice = balance_of(&result, "alice");
        assert_eq!(alice.balance_delta_e6, -2_000_000);
        assert_eq!(alice.locked_delta_e6, -2_400_000);
        check_conservation(&orders, &[YES, NO], &result);
    }

    #[test]
    fn test_prorata_rations_oversubscribed_bids() {
        let orders = vec![
            order("o-a", "alice", YES, OrderDirection::Buy, 10, 600_000, 1),
            order("o-b", "bella", YES, OrderDirection::Buy, 30, 600_000, 2),
            order("o-c", "carl", YES, OrderDirection::Sell, 20, 400_000, 3),
        ];
        let result = run(&orders, &[YES, NO]);

        // 40 demanded, 20 available: 10 -> 5, 30 -> 15
        assert_eq!(position_of(&result, "alice", YES), 5_000_000);
        assert_eq!(position_of(&result, "bella", YES), 15_000_000);
        assert_eq!(position_of(&result, "carl", YES), -20_000_000);
        assert_eq!(update_of(&result, "o-a").new_quantity, 5);
        assert_eq!(update_of(&result, "o-b").new_quantity, 15);
        assert_eq!(update_of(&result, "o-c").new_quantity, 0);
        check_conservation(&orders, &[YES, NO], &result);
    }

    #[test]
    fn test_prorata_residual_stays_on_book() {
        let orders = vec![
            order("o-a", "alice", YES, OrderDirection::Buy, 10, 600_000, 1),
            order("o-b", "bella", YES, OrderDirection::Buy, 10, 600_000, 2),
            order("o-c", "carl", YES, OrderDirection::Sell, 11, 400_000, 3),
        ];
        let result = run(&orders, &[YES, NO]);

        // floor(10 * 11 / 20) = 5 each; the 11th contract rests
        assert_eq!(update_of(&result, "o-a").new_quantity, 5);
        assert_eq!(update_of(&result, "o-b").new_quantity, 5);
        assert_eq!(update_of(&result, "o-c").new_quantity, 1);
        check_conservation(&orders, &[YES, NO], &result);
    }

    #[test]
    fn test_prorata_all_zero_is_no_match() {
        let orders = vec![
            order("o-a", "alice", YES, OrderDirection::Buy, 10, 600_000, 1),
            order("o-b", "bella", YES, OrderDirection::Buy, 10, 600_000, 2),
            order("o-c", "carl", YES, OrderDirection::Sell, 1, 400_000, 3),
        ];
        // floor(10 * 1 / 20) = 0 for both bidders, so nothing can trade -
        // and the engine must terminate rather than spin.
        let result = run(&orders, &[YES, NO]);
        assert!(result.is_empty());
    }

    #[test]
    fn test_fifo_fills_earlier_order_first() {
        let orders = vec![
            order("o-a", "alice", YES, OrderDirection::Buy, 10, 600_000, 1),
            order("o-b", "bella", YES, OrderDirection::Buy, 10, 600_000, 5),
            order("o-c", "carl", YES, OrderDirection::Sell, 16, 400_000, 7),
            order("o-d", "dana", YES, OrderDirection::Sell, 7, 400_000, 8),
        ];
        let result = run(&orders, &[YES, NO]);

        // Ask side oversubscribed (23 vs 20): carl floor(16*20/23)=13,
        // dana floor(7*20/23)=6, matched 19. Bid side fills FIFO: alice
        // takes her full 10, bella the remaining 9.
        assert_eq!(update_of(&result, "o-a").new_quantity, 0);
        assert_eq!(update_of(&result, "o-b").new_quantity, 1);
        assert_eq!(update_of(&result, "o-c").new_quantity, 3);
        assert_eq!(update_of(&result, "o-d").new_quantity, 1);
        check_conservation(&orders, &[YES, NO], &result);
    }

    #[test]
    fn test_covered_seller_releases_no_escrow() {
        let mut sell = order("o-b", "bob", YES, OrderDirection::Sell, 10, 300_000, 2);
        // Fully covered sale: admission locked nothing
        sell.escrow_e6 = 0;
        let orders = vec![
            order("o-a", "alice", YES, OrderDirection::Buy, 10, 700_000, 1),
            sell,
        ];
        let result = run(&orders, &[YES, NO]);

        let bob = balance_of(&result, "bob");
        assert_eq!(bob.balance_delta_e6, 5_000_000);
        assert_eq!(bob.locked_delta_e6, 0);
        check_conservation(&orders, &[YES, NO], &result);
    }

    #[test]
    fn test_synthetic_two_outcome_mint() {
        let orders = vec![
            order("o-c", "carol", YES, OrderDirection::Buy, 10, 600_000, 1),
            order("o-d", "dave", NO, OrderDirection::Buy, 10, 550_000, 2),
        ];
        let result = run(&orders, &[YES, NO]);

        assert_eq!(result.executions.len(), 1);
        assert_eq!(result.minted_sets, 10);

        let carol = balance_of(&result, "carol");
        assert_eq!(carol.balance_delta_e6, -6_000_000);
        assert_eq!(carol.locked_delta_e6, -6_000_000);
        let dave = balance_of(&result, "dave");
        assert_eq!(dave.balance_delta_e6, -5_500_000);
        assert_eq!(dave.locked_delta_e6, -5_500_000);

        assert_eq!(position_of(&result, "carol", YES), 10_000_000);
        assert_eq!(position_of(&result, "dave", NO), 10_000_000);
        // Both outcomes covered by the set: no surplus contracts
        assert_eq!(position_of(&result, "carol", NO), 0);
        assert_eq!(position_of(&result, "dave", YES), 0);

        // Effective price in the record is each participant's own bid
        let execution = &result.executions[0];
        assert!(execution.participants.iter().any(|p| p.price_e6 == 600_000));
        assert!(execution.participants.iter().any(|p| p.price_e6 == 550_000));
        check_conservation(&orders, &[YES, NO], &result);
    }

    #[test]
    fn test_synthetic_bids_below_basket_rest() {
        let orders = vec![
            order("o-e", "eve", YES, OrderDirection::Buy, 10, 400_000, 1),
            order("o-f", "frank", NO, OrderDirection::Buy, 10, 450_000, 2),
        ];
        let result = run(&orders, &[YES, NO]);
        assert!(result.is_empty());
    }

    #[test]
    fn test_synthetic_surplus_distribution() {
        let orders = vec![
            order("o-a", "ana", "out-a", OrderDirection::Buy, 10, 550_000, 1),
            order("o-b", "ben", "out-b", OrderDirection::Buy, 10, 500_000, 2),
            order("o-c", "cyn", "out-c", OrderDirection::Buy, 10, 300_000, 3),
        ];
        let outcomes = ["out-a", "out-b", "out-c"];
        let result = run(&orders, &outcomes);

        // Greedy set is {a, b} (0.55 + 0.50 = 1.05); cyn's bid rests
        assert_eq!(result.minted_sets, 10);
        assert!(result
            .order_updates
            .iter()
            .all(|u| u.order_id != "o-c"));

        assert_eq!(position_of(&result, "ana", "out-a"), 10_000_000);
        assert_eq!(position_of(&result, "ben", "out-b"), 10_000_000);

        // 10 contracts of out-c split 0.55 : 0.50; the odd micro goes to
        // the larger remainder (ben's share)
        assert_eq!(position_of(&result, "ana", "out-c"), 5_238_095);
        assert_eq!(position_of(&result, "ben", "out-c"), 4_761_905);
        check_conservation(&orders, &outcomes, &result);
    }

    #[test]
    fn test_direct_preferred_over_synthetic() {
        let orders = vec![
            order("o-a", "alice", YES, OrderDirection::Buy, 10, 700_000, 1),
            order("o-b", "bob", YES, OrderDirection::Sell, 10, 300_000, 2),
            order("o-c", "carol", NO, OrderDirection::Buy, 10, 500_000, 3),
        ];
        let result = run(&orders, &[YES, NO]);

        // The crossed pair fills directly; 0.50 alone cannot mint
        assert_eq!(result.executions.len(), 1);
        assert_eq!(result.minted_sets, 0);
        assert!(result.order_updates.iter().all(|u| u.order_id != "o-c"));
        check_conservation(&orders, &[YES, NO], &result);
    }

    #[test]
    fn test_direct_then_synthetic_cascade() {
        let orders = vec![
            order("o-a", "alice", YES, OrderDirection::Buy, 10, 600_000, 1),
            order("o-b", "bob", YES, OrderDirection::Sell, 5, 550_000, 2),
            order("o-c", "carol", NO, OrderDirection::Buy, 10, 550_000, 3),
        ];
        let result = run(&orders, &[YES, NO]);

        // Round 1: alice x bob fill 5 directly at 0.575. Round 2: alice's
        // remaining 5 and carol's bid sum to 1.15 and mint 5 baskets.
        assert_eq!(result.executions.len(), 2);
        assert_eq!(result.minted_sets, 5);
        assert_eq!(update_of(&result, "o-a").new_quantity, 0);
        assert_eq!(update_of(&result, "o-b").new_quantity, 0);
        assert_eq!(update_of(&result, "o-c").new_quantity, 5);
        check_conservation(&orders, &[YES, NO], &result);
    }

    #[test]
    fn test_seller_escrow_releases_proportionally_across_fills() {
        // Carl's 7.00 short escrow drains in proportion to each fill: 2.80
        // against alice's 4, then 2.10 against bella's 3, leaving exactly
        // the 2.10 that still covers his 3 remaining contracts.
        let orders = vec![
            order("o-a", "alice", YES, OrderDirection::Buy, 4, 700_000, 1),
            order("o-b", "bella", YES, OrderDirection::Buy, 3, 650_000, 2),
            order("o-c", "carl", YES, OrderDirection::Sell, 10, 300_000, 3),
        ];
        let result = run(&orders, &[YES, NO]);

        assert_eq!(result.executions.len(), 2);
        let carl_update = update_of(&result, "o-c");
        assert_eq!(carl_update.new_quantity, 3);
        assert_eq!(carl_update.new_escrow_e6, 2_100_000);

        // Fills at midpoints 0.50 and 0.475
        let carl = balance_of(&result, "carl");
        assert_eq!(carl.balance_delta_e6, 4 * 500_000 + 3 * 475_000);
        assert_eq!(carl.locked_delta_e6, -4_900_000);
        check_conservation(&orders, &[YES, NO], &result);
    }
}
