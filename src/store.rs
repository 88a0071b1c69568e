//! Persistence contract and the in-memory reference driver.
//!
//! The exchange core specifies what it needs from storage, not a database:
//! typed reads plus an atomic [`Store::commit`] of a [`WriteBatch`]. A
//! driver must guarantee that
//!
//! - `commit` applies every op or none (all-or-nothing), and commits are
//!   serialised against each other;
//! - [`WriteOp::AdjustUser`] deltas are applied as atomic arithmetic on the
//!   stored row, never as caller-side read-modify-write, because the user
//!   row is contended across markets;
//! - a batch that would drive any balance or escrow negative, or locked
//!   above balance, is rejected whole.
//!
//! [`MemoryStore`] is the reference driver: a single world under an async
//! `RwLock`, committed by applying the batch to a copy and swapping it in.
//! It can serialise its whole world through borsh ([`MemoryStore::snapshot`]
//! / [`MemoryStore::restore`]) for host-driven durability.

use std::collections::BTreeMap;

use async_trait::async_trait;
use borsh::{BorshDeserialize, BorshSerialize};
use tokio::sync::RwLock;

use crate::error::{ExchangeError, ExchangeResult};
use crate::state::{
    Execution, Market, MarketId, MarketStatus, OpenMarketsPage, Order, OrderId, Outcome, OutcomeId,
    Position, User, UserId,
};
use crate::utils::{apply_delta_u64, safe_add_u64};

// ============================================================================
// Write batch
// ============================================================================

/// One storage mutation. Batched and committed atomically.
#[derive(Debug, Clone)]
pub enum WriteOp {
    /// Insert the user row if it does not exist yet (first reference).
    EnsureUser { user: User },
    /// Atomically add signed deltas to a user's balance and locked escrow.
    AdjustUser {
        user_id: UserId,
        balance_delta_e6: i64,
        locked_delta_e6: i64,
    },
    InsertMarket { market: Market },
    InsertOutcome { outcome: Outcome },
    /// Accumulate informational market stats.
    BumpMarketStats {
        market_id: MarketId,
        minted_sets: u64,
        volume_e6: u64,
    },
    /// Transition a market open -> resolved.
    MarkResolved {
        market_id: MarketId,
        winning_outcome_id: OutcomeId,
        resolved_at: i64,
    },
    InsertOrder { order: Order },
    /// Rewrite an order's remaining quantity and escrow (both > 0).
    UpdateOrder {
        order_id: OrderId,
        quantity: u64,
        escrow_e6: u64,
    },
    DeleteOrder { order_id: OrderId },
    /// Apply a signed micro-contract delta to one (user, market, outcome)
    /// holding, creating the position row (with `position_id`) on first
    /// touch, dropping zeroed entries and deleting the row when emptied.
    ApplyPositionDelta {
        position_id: String,
        user_id: UserId,
        market_id: MarketId,
        outcome_id: OutcomeId,
        delta_e6: i64,
        now_ms: i64,
    },
    DeletePosition {
        user_id: UserId,
        market_id: MarketId,
    },
    InsertExecution { execution: Execution },
}

/// An ordered set of mutations applied in one transaction.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    pub ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: WriteOp) {
        self.ops.push(op);
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

// ============================================================================
// Contract
// ============================================================================

/// Typed storage interface the exchange runs against.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_user(&self, user_id: &str) -> ExchangeResult<Option<User>>;

    async fn get_market(&self, market_id: &str) -> ExchangeResult<Option<Market>>;

    async fn get_market_by_number(&self, number: u64) -> ExchangeResult<Option<Market>>;

    /// The next human-visible market number (monotone per exchange).
    async fn next_market_number(&self) -> ExchangeResult<u64>;

    /// Open markets ordered by number, paginated.
    async fn list_open_markets(&self, offset: u64, limit: u64) -> ExchangeResult<OpenMarketsPage>;

    /// A market's outcomes ordered by outcome number.
    async fn get_outcomes(&self, market_id: &str) -> ExchangeResult<Vec<Outcome>>;

    /// The single resting order of (user, market), if any.
    async fn get_order(&self, user_id: &str, market_id: &str) -> ExchangeResult<Option<Order>>;

    async fn list_market_orders(&self, market_id: &str) -> ExchangeResult<Vec<Order>>;

    async fn list_user_orders(&self, user_id: &str) -> ExchangeResult<Vec<Order>>;

    /// The user row together with the summed escrow of the user's resting
    /// orders across all markets, read as one consistent snapshot. Used by
    /// the post-commit audit, which must not race settlements in other
    /// markets.
    async fn get_user_escrow_state(&self, user_id: &str)
        -> ExchangeResult<Option<(User, u64)>>;

    async fn get_position(&self, user_id: &str, market_id: &str)
        -> ExchangeResult<Option<Position>>;

    async fn list_market_positions(&self, market_id: &str) -> ExchangeResult<Vec<Position>>;

    async fn list_user_positions(&self, user_id: &str) -> ExchangeResult<Vec<Position>>;

    async fn list_executions(&self, market_id: &str) -> ExchangeResult<Vec<Execution>>;

    /// Apply the batch atomically: all ops or none.
    async fn commit(&self, batch: WriteBatch) -> ExchangeResult<()>;
}

// ============================================================================
// In-memory reference driver
// ============================================================================

#[derive(Debug, Clone, Default, BorshSerialize, BorshDeserialize)]
struct MemoryState {
    users: BTreeMap<UserId, User>,
    markets: BTreeMap<MarketId, Market>,
    outcomes: BTreeMap<MarketId, Vec<Outcome>>,
    orders: BTreeMap<OrderId, Order>,
    positions: BTreeMap<(UserId, MarketId), Position>,
    executions: BTreeMap<MarketId, Vec<Execution>>,
}

impl MemoryState {
    /// Apply one op, failing without partial effect on the enclosing
    /// commit's working copy.
    fn apply(&mut self, op: WriteOp) -> ExchangeResult<()> {
        match op {
            WriteOp::EnsureUser { user } => {
                self.users.entry(user.id.clone()).or_insert(user);
            }
            WriteOp::AdjustUser {
                user_id,
                balance_delta_e6,
                locked_delta_e6,
            } => {
                let user = self
                    .users
                    .get_mut(&user_id)
                    .ok_or(ExchangeError::Internal)?;
                user.balance_e6 = apply_delta_u64(user.balance_e6, balance_delta_e6)?;
                user.locked_e6 = apply_delta_u64(user.locked_e6, locked_delta_e6)?;
                if user.locked_e6 > user.balance_e6 {
                    return Err(ExchangeError::Internal);
                }
            }
            WriteOp::InsertMarket { market } => {
                if self.markets.contains_key(&market.id)
                    || self.markets.values().any(|m| m.number == market.number)
                {
                    return Err(ExchangeError::Internal);
                }
                self.markets.insert(market.id.clone(), market);
            }
            WriteOp::InsertOutcome { outcome } => {
                if !self.markets.contains_key(&outcome.market_id) {
                    return Err(ExchangeError::Internal);
                }
                self.outcomes
                    .entry(outcome.market_id.clone())
                    .or_default()
                    .push(outcome);
            }
            WriteOp::BumpMarketStats {
                market_id,
                minted_sets,
                volume_e6,
            } => {
                let market = self
                    .markets
                    .get_mut(&market_id)
                    .ok_or(ExchangeError::Internal)?;
                market.total_minted_sets = safe_add_u64(market.total_minted_sets, minted_sets)?;
                market.volume_e6 = safe_add_u64(market.volume_e6, volume_e6)?;
            }
            WriteOp::MarkResolved {
                market_id,
                winning_outcome_id,
                resolved_at,
            } => {
                let market = self
                    .markets
                    .get_mut(&market_id)
                    .ok_or(ExchangeError::Internal)?;
                if market.status != MarketStatus::Open {
                    return Err(ExchangeError::Internal);
                }
                market.status = MarketStatus::Resolved;
                market.winning_outcome_id = Some(winning_outcome_id);
                market.resolved_at = Some(resolved_at);
            }
            WriteOp::InsertOrder { order } => {
                if self.orders.contains_key(&order.id) {
                    return Err(ExchangeError::Internal);
                }
                // One resting order per (user, market)
                if self
                    .orders
                    .values()
                    .any(|o| o.user_id == order.user_id && o.market_id == order.market_id)
                {
                    return Err(ExchangeError::Internal);
                }
                self.orders.insert(order.id.clone(), order);
            }
            WriteOp::UpdateOrder {
                order_id,
                quantity,
                escrow_e6,
            } => {
                if quantity == 0 {
                    return Err(ExchangeError::Internal);
                }
                let order = self
                    .orders
                    .get_mut(&order_id)
                    .ok_or(ExchangeError::Internal)?;
                order.quantity = quantity;
                order.escrow_e6 = escrow_e6;
            }
            WriteOp::DeleteOrder { order_id } => {
                self.orders
                    .remove(&order_id)
                    .ok_or(ExchangeError::Internal)?;
            }
            WriteOp::ApplyPositionDelta {
                position_id,
                user_id,
                market_id,
                outcome_id,
                delta_e6,
                now_ms,
            } => {
                let key = (user_id.clone(), market_id.clone());
                let position = self.positions.entry(key.clone()).or_insert_with(|| {
                    Position::new(position_id, user_id, market_id, now_ms)
                });
                position.apply_delta(&outcome_id, delta_e6, now_ms);
                if position.is_empty() {
                    self.positions.remove(&key);
                }
            }
            WriteOp::DeletePosition { user_id, market_id } => {
                self.positions
                    .remove(&(user_id, market_id))
                    .ok_or(ExchangeError::Internal)?;
            }
            WriteOp::InsertExecution { execution } => {
                self.executions
                    .entry(execution.market_id.clone())
                    .or_default()
                    .push(execution);
            }
        }
        Ok(())
    }
}

/// Reference in-memory driver. Suitable for tests and small single-process
/// deployments that persist via snapshots.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialise the whole world for durable storage.
    pub async fn snapshot(&self) -> ExchangeResult<Vec<u8>> {
        let state = self.state.read().await;
        state.try_to_vec().map_err(|e| {
            tracing::error!(error = %e, "snapshot serialisation failed");
            ExchangeError::Internal
        })
    }

    /// Rebuild a store from a snapshot.
    pub fn restore(bytes: &[u8]) -> ExchangeResult<Self> {
        let state = MemoryState::try_from_slice(bytes).map_err(|e| {
            tracing::error!(error = %e, "snapshot deserialisation failed");
            ExchangeError::Internal
        })?;
        Ok(Self {
            state: RwLock::new(state),
        })
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_user(&self, user_id: &str) -> ExchangeResult<Option<User>> {
        Ok(self.state.read().await.users.get(user_id).cloned())
    }

    async fn get_market(&self, market_id: &str) -> ExchangeResult<Option<Market>> {
        Ok(self.state.read().await.markets.get(market_id).cloned())
    }

    async fn get_market_by_number(&self, number: u64) -> ExchangeResult<Option<Market>> {
        Ok(self
            .state
            .read()
            .await
            .markets
            .values()
            .find(|m| m.number == number)
            .cloned())
    }

    async fn next_market_number(&self) -> ExchangeResult<u64> {
        let state = self.state.read().await;
        Ok(state
            .markets
            .values()
            .map(|m| m.number)
            .max()
            .unwrap_or(0)
            + 1)
    }

    async fn list_open_markets(&self, offset: u64, limit: u64) -> ExchangeResult<OpenMarketsPage> {
        let state = self.state.read().await;
        let mut open: Vec<Market> = state
            .markets
            .values()
            .filter(|m| m.is_open())
            .cloned()
            .collect();
        open.sort_by_key(|m| m.number);
        let total = open.len() as u64;
        let markets = open
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect();
        Ok(OpenMarketsPage { markets, total })
    }

    async fn get_outcomes(&self, market_id: &str) -> ExchangeResult<Vec<Outcome>> {
        let mut outcomes = self
            .state
            .read()
            .await
            .outcomes
            .get(market_id)
            .cloned()
            .unwrap_or_default();
        outcomes.sort_by_key(|o| o.number);
        Ok(outcomes)
    }

    async fn get_order(&self, user_id: &str, market_id: &str) -> ExchangeResult<Option<Order>> {
        Ok(self
            .state
            .read()
            .await
            .orders
            .values()
            .find(|o| o.user_id == user_id && o.market_id == market_id)
            .cloned())
    }

    async fn list_market_orders(&self, market_id: &str) -> ExchangeResult<Vec<Order>> {
        Ok(self
            .state
            .read()
            .await
            .orders
            .values()
            .filter(|o| o.market_id == market_id)
            .cloned()
            .collect())
    }

    async fn list_user_orders(&self, user_id: &str) -> ExchangeResult<Vec<Order>> {
        Ok(self
            .state
            .read()
            .await
            .orders
            .values()
            .filter(|o| o.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn get_user_escrow_state(
        &self,
        user_id: &str,
    ) -> ExchangeResult<Option<(User, u64)>> {
        let state = self.state.read().await;
        let Some(user) = state.users.get(user_id).cloned() else {
            return Ok(None);
        };
        let escrow_sum = state
            .orders
            .values()
            .filter(|o| o.user_id == user_id)
            .map(|o| o.escrow_e6)
            .sum();
        Ok(Some((user, escrow_sum)))
    }

    async fn get_position(
        &self,
        user_id: &str,
        market_id: &str,
    ) -> ExchangeResult<Option<Position>> {
        Ok(self
            .state
            .read()
            .await
            .positions
            .get(&(user_id.to_string(), market_id.to_string()))
            .cloned())
    }

    async fn list_market_positions(&self, market_id: &str) -> ExchangeResult<Vec<Position>> {
        Ok(self
            .state
            .read()
            .await
            .positions
            .values()
            .filter(|p| p.market_id == market_id)
            .cloned()
            .collect())
    }

    async fn list_user_positions(&self, user_id: &str) -> ExchangeResult<Vec<Position>> {
        Ok(self
            .state
            .read()
            .await
            .positions
            .values()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn list_executions(&self, market_id: &str) -> ExchangeResult<Vec<Execution>> {
        Ok(self
            .state
            .read()
            .await
            .executions
            .get(market_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn commit(&self, batch: WriteBatch) -> ExchangeResult<()> {
        let mut state = self.state.write().await;
        // All-or-nothing: apply against a copy, swap on success.
        let mut next = state.clone();
        for op in batch.ops {
            if let Err(e) = next.apply(op.clone()) {
                tracing::error!(?op, error = %e, "write batch rejected");
                return Err(e);
            }
        }
        *state = next;
        Ok(())
    }
}
