//! The exchange service.
//!
//! Binds the pure matching engine to a storage driver and carries the four
//! stateful components: order admission, settlement, market resolution, and
//! market lifecycle. All mutations of one market run under that market's
//! lock and commit through atomic write batches, so committed transactions
//! are totally ordered per market while distinct markets proceed in
//! parallel.
//!
//! Each operation commits at most twice: admission commits the locked
//! escrow and the new order, then matching output commits as one settlement
//! batch. A caller-side timeout that fires between the two leaves the order
//! resting in a consistent state; the next execute pass picks it up.

use std::collections::BTreeMap;
use std::sync::Arc;

use borsh::{BorshDeserialize, BorshSerialize};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::engine::{self, MatchResult};
use crate::error::{ExchangeError, ExchangeResult};
use crate::escrow::required_escrow_e6;
use crate::state::{
    BookLevel, Execution, Market, MarketId, MarketStatus, MarketWithOutcomes, OpenMarketsPage,
    Order, OrderDirection, Outcome, OutcomeBook, OrderBookView, Payout, Position, ResolveSummary,
    User, MAX_DESCRIPTION_LEN, MAX_ORDER_QUANTITY, MAX_OUTCOMES, MAX_OUTCOME_DESCRIPTION_LEN,
};
use crate::store::{Store, WriteBatch, WriteOp};
use crate::utils::{now_ms, validate_price, validate_quantity, IdGen};

/// Default id-generation epoch: 2024-01-01T00:00:00Z.
const DEFAULT_ID_EPOCH_MS: i64 = 1_704_067_200_000;

// ============================================================================
// Configuration
// ============================================================================

/// Tunable limits of one exchange instance.
#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    /// Order size cap in contracts
    pub max_order_quantity: u64,
    /// Outcome count cap per market
    pub max_outcomes: usize,
    /// Market description length cap (bytes)
    pub max_description_len: usize,
    /// Outcome description length cap (bytes)
    pub max_outcome_description_len: usize,
    /// Epoch for the id generator (Unix millis)
    pub id_epoch_ms: i64,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            max_order_quantity: MAX_ORDER_QUANTITY,
            max_outcomes: MAX_OUTCOMES,
            max_description_len: MAX_DESCRIPTION_LEN,
            max_outcome_description_len: MAX_OUTCOME_DESCRIPTION_LEN,
            id_epoch_ms: DEFAULT_ID_EPOCH_MS,
        }
    }
}

// ============================================================================
// Operation arguments
// ============================================================================

/// Arguments for market creation.
#[derive(BorshSerialize, BorshDeserialize, Debug, Clone)]
pub struct CreateMarketArgs {
    pub guild_id: String,
    pub creator_id: String,
    pub oracle_user_id: String,
    pub description: String,
    /// One descriptor per outcome, at least two
    pub outcome_descriptions: Vec<String>,
}

/// Arguments for order placement.
#[derive(BorshSerialize, BorshDeserialize, Debug, Clone)]
pub struct PlaceOrderArgs {
    pub user_id: String,
    pub market_id: String,
    pub outcome_id: String,
    pub direction: OrderDirection,
    /// Whole contracts
    pub quantity: u64,
    /// Limit price (micro-currency per contract)
    pub price_e6: u64,
}

/// Arguments for market resolution.
#[derive(BorshSerialize, BorshDeserialize, Debug, Clone)]
pub struct ResolveMarketArgs {
    pub market_id: String,
    pub winning_outcome_id: String,
    /// Must be the market's oracle
    pub caller_user_id: String,
}

// ============================================================================
// Exchange
// ============================================================================

/// One exchange instance over a storage driver.
pub struct Exchange<S: Store> {
    store: S,
    config: ExchangeConfig,
    ids: IdGen,
    /// Per-market mutation locks; entries are created on first touch and
    /// kept for the process lifetime.
    market_locks: DashMap<MarketId, Arc<Mutex<()>>>,
    /// Serialises market-number allocation.
    create_lock: Mutex<()>,
}

impl<S: Store> Exchange<S> {
    pub fn new(store: S) -> Self {
        Self::with_config(store, ExchangeConfig::default())
    }

    pub fn with_config(store: S, config: ExchangeConfig) -> Self {
        let ids = IdGen::new(config.id_epoch_ms);
        Self {
            store,
            config,
            ids,
            market_locks: DashMap::new(),
            create_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn market_lock(&self, market_id: &str) -> Arc<Mutex<()>> {
        self.market_locks
            .entry(market_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // ========================================================================
    // Balance seeding
    // ========================================================================

    /// Credit currency to a user, creating the account on first reference.
    /// This is the interface for the host's external currency-granting
    /// subsystem; the core itself never creates money anywhere else.
    pub async fn credit(&self, user_id: &str, amount_e6: u64) -> ExchangeResult<User> {
        if amount_e6 == 0 {
            return Err(ExchangeError::InvalidParameters);
        }
        let now = now_ms();
        let mut batch = WriteBatch::new();
        batch.push(WriteOp::EnsureUser {
            user: User::new(user_id.to_string(), now),
        });
        batch.push(WriteOp::AdjustUser {
            user_id: user_id.to_string(),
            balance_delta_e6: amount_e6 as i64,
            locked_delta_e6: 0,
        });
        self.store.commit(batch).await?;
        info!(user_id, amount_e6, "balance credited");
        self.store
            .get_user(user_id)
            .await?
            .ok_or(ExchangeError::Internal)
    }

    // ========================================================================
    // Market lifecycle
    // ========================================================================

    /// Create a market with its outcomes (numbered 1..N).
    pub async fn create_market(
        &self,
        args: CreateMarketArgs,
    ) -> ExchangeResult<MarketWithOutcomes> {
        if args.outcome_descriptions.len() < 2
            || args.outcome_descriptions.len() > self.config.max_outcomes
        {
            return Err(ExchangeError::InvalidParameters);
        }
        if args.description.is_empty() || args.description.len() > self.config.max_description_len
        {
            return Err(ExchangeError::InvalidParameters);
        }
        if args.outcome_descriptions.iter().any(|d| {
            d.is_empty() || d.len() > self.config.max_outcome_description_len
        }) {
            return Err(ExchangeError::InvalidParameters);
        }

        // Market numbers are allocated read-then-insert; serialise creators.
        let _guard = self.create_lock.lock().await;
        let now = now_ms();
        let number = self.store.next_market_number().await?;

        let market = Market {
            id: self.ids.next(now),
            number,
            guild_id: args.guild_id,
            creator_id: args.creator_id,
            description: args.description,
            oracle_user_id: args.oracle_user_id,
            status: MarketStatus::Open,
            winning_outcome_id: None,
            total_minted_sets: 0,
            volume_e6: 0,
            created_at: now,
            resolved_at: None,
        };
        let outcomes: Vec<Outcome> = args
            .outcome_descriptions
            .into_iter()
            .enumerate()
            .map(|(i, description)| Outcome {
                id: self.ids.next(now),
                market_id: market.id.clone(),
                number: (i + 1) as u16,
                description,
            })
            .collect();

        let mut batch = WriteBatch::new();
        batch.push(WriteOp::InsertMarket {
            market: market.clone(),
        });
        for outcome in &outcomes {
            batch.push(WriteOp::InsertOutcome {
                outcome: outcome.clone(),
            });
        }
        self.store.commit(batch).await?;

        info!(
            market_id = %market.id,
            number = market.number,
            outcomes = outcomes.len(),
            "market created"
        );
        Ok(MarketWithOutcomes { market, outcomes })
    }

    // ========================================================================
    // Order admission + matching
    // ========================================================================

    /// Admit an order, then run matching for the market. Returns the
    /// admitted order (as persisted by admission; it may already be partly
    /// or fully filled by the returned executions) and the executions.
    pub async fn place_order(
        &self,
        args: PlaceOrderArgs,
    ) -> ExchangeResult<(Order, Vec<Execution>)> {
        let lock = self.market_lock(&args.market_id);
        let _guard = lock.lock().await;

        let market = self
            .store
            .get_market(&args.market_id)
            .await?
            .filter(|m| m.is_open())
            .ok_or(ExchangeError::MarketClosed)?;

        let outcomes = self.store.get_outcomes(&market.id).await?;
        if !outcomes.iter().any(|o| o.id == args.outcome_id) {
            return Err(ExchangeError::InvalidOutcome);
        }

        validate_quantity(args.quantity, self.config.max_order_quantity)?;
        validate_price(args.price_e6)?;

        if self
            .store
            .get_order(&args.user_id, &market.id)
            .await?
            .is_some()
        {
            return Err(ExchangeError::OrderAlreadyExists);
        }

        let holding_e6 = self
            .store
            .get_position(&args.user_id, &market.id)
            .await?
            .map(|p| p.holding_e6(&args.outcome_id))
            .unwrap_or(0);
        let escrow_e6 =
            required_escrow_e6(args.direction, args.quantity, args.price_e6, holding_e6);

        let now = now_ms();
        let user = self
            .store
            .get_user(&args.user_id)
            .await?
            .unwrap_or_else(|| User::new(args.user_id.clone(), now));
        if user.available_e6() < escrow_e6 {
            return Err(ExchangeError::InsufficientBalance);
        }

        let order = Order {
            id: self.ids.next(now),
            user_id: args.user_id.clone(),
            market_id: market.id.clone(),
            outcome_id: args.outcome_id.clone(),
            direction: args.direction,
            quantity: args.quantity,
            price_e6: args.price_e6,
            escrow_e6,
            created_at: now,
        };

        let mut batch = WriteBatch::new();
        batch.push(WriteOp::EnsureUser { user });
        batch.push(WriteOp::AdjustUser {
            user_id: args.user_id.clone(),
            balance_delta_e6: 0,
            locked_delta_e6: escrow_e6 as i64,
        });
        batch.push(WriteOp::InsertOrder {
            order: order.clone(),
        });
        self.store.commit(batch).await?;

        info!(
            order_id = %order.id,
            user_id = %order.user_id,
            market_id = %order.market_id,
            outcome_id = %order.outcome_id,
            direction = ?order.direction,
            quantity = order.quantity,
            price_e6 = order.price_e6,
            escrow_e6 = order.escrow_e6,
            "order admitted"
        );

        let executions = self.run_matching(&market, &outcomes).await?;
        Ok((order, executions))
    }

    /// Run the engine over the market's full resting state and settle its
    /// output in one transaction.
    async fn run_matching(
        &self,
        market: &Market,
        outcomes: &[Outcome],
    ) -> ExchangeResult<Vec<Execution>> {
        let orders = self.store.list_market_orders(&market.id).await?;
        let outcome_ids: Vec<String> = outcomes.iter().map(|o| o.id.clone()).collect();
        let now = now_ms();

        let result = engine::execute_market(&market.id, &orders, &outcome_ids, now, &self.ids);
        if result.is_empty() {
            return Ok(Vec::new());
        }

        let batch = self.settlement_batch(&market.id, &result, now);
        self.store.commit(batch).await?;
        info!(
            market_id = %market.id,
            executions = result.executions.len(),
            minted_sets = result.minted_sets,
            volume_e6 = result.volume_e6,
            "match settled"
        );

        self.audit_market(&market.id).await?;
        Ok(result.executions)
    }

    /// Translate a `MatchResult` into one atomic write batch.
    fn settlement_batch(&self, market_id: &str, result: &MatchResult, now: i64) -> WriteBatch {
        let mut batch = WriteBatch::new();
        for update in &result.balance_updates {
            batch.push(WriteOp::AdjustUser {
                user_id: update.user_id.clone(),
                balance_delta_e6: update.balance_delta_e6,
                locked_delta_e6: update.locked_delta_e6,
            });
        }
        for delta in &result.position_updates {
            batch.push(WriteOp::ApplyPositionDelta {
                position_id: self.ids.next(now),
                user_id: delta.user_id.clone(),
                market_id: market_id.to_string(),
                outcome_id: delta.outcome_id.clone(),
                delta_e6: delta.delta_e6,
                now_ms: now,
            });
        }
        for update in &result.order_updates {
            if update.new_quantity == 0 {
                batch.push(WriteOp::DeleteOrder {
                    order_id: update.order_id.clone(),
                });
            } else {
                batch.push(WriteOp::UpdateOrder {
                    order_id: update.order_id.clone(),
                    quantity: update.new_quantity,
                    escrow_e6: update.new_escrow_e6,
                });
            }
        }
        for execution in &result.executions {
            batch.push(WriteOp::InsertExecution {
                execution: execution.clone(),
            });
        }
        if result.minted_sets > 0 || result.volume_e6 > 0 {
            batch.push(WriteOp::BumpMarketStats {
                market_id: market_id.to_string(),
                minted_sets: result.minted_sets,
                volume_e6: result.volume_e6,
            });
        }
        batch
    }

    // ========================================================================
    // Order cancellation
    // ========================================================================

    /// Cancel the caller's resting order, refunding its escrow. Restores
    /// the exact pre-admission balance state.
    pub async fn cancel_order(&self, user_id: &str, market_id: &str) -> ExchangeResult<Order> {
        let lock = self.market_lock(market_id);
        let _guard = lock.lock().await;

        let order = self
            .store
            .get_order(user_id, market_id)
            .await?
            .ok_or(ExchangeError::NoSuchOrder)?;

        let mut batch = WriteBatch::new();
        batch.push(WriteOp::AdjustUser {
            user_id: user_id.to_string(),
            balance_delta_e6: 0,
            locked_delta_e6: -(order.escrow_e6 as i64),
        });
        batch.push(WriteOp::DeleteOrder {
            order_id: order.id.clone(),
        });
        self.store.commit(batch).await?;

        info!(
            order_id = %order.id,
            user_id,
            market_id,
            refunded_escrow_e6 = order.escrow_e6,
            "order cancelled"
        );
        Ok(order)
    }

    // ========================================================================
    // Market resolution
    // ========================================================================

    /// Resolve a market: cancel outstanding orders with escrow refunds, pay
    /// 1.00 per winning contract (shorts settle as the mirrored debit),
    /// clear all positions.
    pub async fn resolve_market(&self, args: ResolveMarketArgs) -> ExchangeResult<ResolveSummary> {
        let lock = self.market_lock(&args.market_id);
        let _guard = lock.lock().await;

        // An unknown id and a resolved market look the same to the caller:
        // nothing is left to resolve.
        let market = self
            .store
            .get_market(&args.market_id)
            .await?
            .ok_or(ExchangeError::AlreadyResolved)?;
        if market.oracle_user_id != args.caller_user_id {
            return Err(ExchangeError::NotOracle);
        }
        if !market.is_open() {
            return Err(ExchangeError::AlreadyResolved);
        }
        let outcomes = self.store.get_outcomes(&market.id).await?;
        if !outcomes.iter().any(|o| o.id == args.winning_outcome_id) {
            return Err(ExchangeError::InvalidOutcome);
        }

        let orders = self.store.list_market_orders(&market.id).await?;
        let positions = self.store.list_market_positions(&market.id).await?;
        let now = now_ms();

        let mut batch = WriteBatch::new();
        batch.push(WriteOp::MarkResolved {
            market_id: market.id.clone(),
            winning_outcome_id: args.winning_outcome_id.clone(),
            resolved_at: now,
        });
        for order in &orders {
            batch.push(WriteOp::AdjustUser {
                user_id: order.user_id.clone(),
                balance_delta_e6: 0,
                locked_delta_e6: -(order.escrow_e6 as i64),
            });
            batch.push(WriteOp::DeleteOrder {
                order_id: order.id.clone(),
            });
        }

        let mut payouts = Vec::new();
        let mut total_paid_e6: u64 = 0;
        let mut winner_count: u64 = 0;
        for position in &positions {
            let payout_e6 = position.payout_e6(&args.winning_outcome_id);
            if payout_e6 != 0 {
                batch.push(WriteOp::AdjustUser {
                    user_id: position.user_id.clone(),
                    balance_delta_e6: payout_e6,
                    locked_delta_e6: 0,
                });
                payouts.push(Payout {
                    user_id: position.user_id.clone(),
                    amount_e6: payout_e6,
                });
                if payout_e6 > 0 {
                    total_paid_e6 += payout_e6 as u64;
                    winner_count += 1;
                }
            }
            batch.push(WriteOp::DeletePosition {
                user_id: position.user_id.clone(),
                market_id: market.id.clone(),
            });
        }
        self.store.commit(batch).await?;

        info!(
            market_id = %market.id,
            winning_outcome_id = %args.winning_outcome_id,
            cancelled_orders = orders.len(),
            winner_count,
            total_paid_e6,
            "market resolved"
        );

        self.audit_market(&market.id).await?;
        Ok(ResolveSummary {
            market_id: market.id,
            winning_outcome_id: args.winning_outcome_id,
            payouts,
            total_paid_e6,
            winner_count,
        })
    }

    // ========================================================================
    // Read queries
    // ========================================================================

    pub async fn user(&self, user_id: &str) -> ExchangeResult<Option<User>> {
        self.store.get_user(user_id).await
    }

    pub async fn market(&self, market_id: &str) -> ExchangeResult<Option<MarketWithOutcomes>> {
        let Some(market) = self.store.get_market(market_id).await? else {
            return Ok(None);
        };
        let outcomes = self.store.get_outcomes(market_id).await?;
        Ok(Some(MarketWithOutcomes { market, outcomes }))
    }

    pub async fn market_by_number(&self, number: u64) -> ExchangeResult<Option<MarketWithOutcomes>> {
        let Some(market) = self.store.get_market_by_number(number).await? else {
            return Ok(None);
        };
        let outcomes = self.store.get_outcomes(&market.id).await?;
        Ok(Some(MarketWithOutcomes { market, outcomes }))
    }

    pub async fn open_markets(&self, offset: u64, limit: u64) -> ExchangeResult<OpenMarketsPage> {
        self.store.list_open_markets(offset, limit).await
    }

    /// Aggregated per-outcome bid/ask ladders of one market.
    pub async fn order_book(&self, market_id: &str) -> ExchangeResult<Option<OrderBookView>> {
        if self.store.get_market(market_id).await?.is_none() {
            return Ok(None);
        }
        let outcomes = self.store.get_outcomes(market_id).await?;
        let orders = self.store.list_market_orders(market_id).await?;

        let books = outcomes
            .into_iter()
            .map(|outcome| {
                let mut bids: BTreeMap<u64, u64> = BTreeMap::new();
                let mut asks: BTreeMap<u64, u64> = BTreeMap::new();
                for order in orders.iter().filter(|o| o.outcome_id == outcome.id) {
                    let side = if order.is_buy() { &mut bids } else { &mut asks };
                    *side.entry(order.price_e6).or_insert(0) += order.quantity;
                }
                OutcomeBook {
                    outcome_id: outcome.id,
                    number: outcome.number,
                    description: outcome.description,
                    bids: bids
                        .into_iter()
                        .rev()
                        .map(|(price_e6, quantity)| BookLevel { price_e6, quantity })
                        .collect(),
                    asks: asks
                        .into_iter()
                        .map(|(price_e6, quantity)| BookLevel { price_e6, quantity })
                        .collect(),
                }
            })
            .collect();
        Ok(Some(OrderBookView {
            market_id: market_id.to_string(),
            outcomes: books,
        }))
    }

    pub async fn user_positions(&self, user_id: &str) -> ExchangeResult<Vec<Position>> {
        self.store.list_user_positions(user_id).await
    }

    /// All of a user's resting orders across markets.
    pub async fn user_orders(&self, user_id: &str) -> ExchangeResult<Vec<Order>> {
        self.store.list_user_orders(user_id).await
    }

    pub async fn executions(&self, market_id: &str) -> ExchangeResult<Vec<Execution>> {
        self.store.list_executions(market_id).await
    }

    // ========================================================================
    // Post-commit audit
    // ========================================================================

    /// Verify the exchange invariants around one market after a settling
    /// commit. A failure here means committed state is corrupt; the process
    /// must not continue serving, so this panics rather than returning.
    async fn audit_market(&self, market_id: &str) -> ExchangeResult<()> {
        let market = self
            .store
            .get_market(market_id)
            .await?
            .ok_or(ExchangeError::Internal)?;
        let orders = self.store.list_market_orders(market_id).await?;
        let positions = self.store.list_market_positions(market_id).await?;

        if orders.iter().any(|o| o.quantity == 0) {
            self.audit_failure(market_id, "zero-quantity order persisted");
        }
        if !market.is_open() && (!orders.is_empty() || !positions.is_empty()) {
            self.audit_failure(market_id, "resolved market still has orders or positions");
        }

        // Basket conservation: every outcome's holding total equals the
        // others'.
        if market.is_open() {
            let outcomes = self.store.get_outcomes(market_id).await?;
            let mut sums: Vec<i64> = Vec::with_capacity(outcomes.len());
            for outcome in &outcomes {
                sums.push(
                    positions
                        .iter()
                        .map(|p| p.holding_e6(&outcome.id))
                        .sum::<i64>(),
                );
            }
            if sums.windows(2).any(|w| w[0] != w[1]) {
                self.audit_failure(market_id, "basket conservation violated");
            }
        }

        // Per touched user: balance covers locked, and locked equals the
        // escrow of all resting orders across every market.
        let mut user_ids: Vec<&str> = orders
            .iter()
            .map(|o| o.user_id.as_str())
            .chain(positions.iter().map(|p| p.user_id.as_str()))
            .collect();
        user_ids.sort_unstable();
        user_ids.dedup();
        for user_id in user_ids {
            let Some((user, escrow_sum)) = self.store.get_user_escrow_state(user_id).await?
            else {
                self.audit_failure(market_id, "participant without user row");
            };
            if user.locked_e6 > user.balance_e6 {
                self.audit_failure(market_id, "locked exceeds balance");
            }
            if user.locked_e6 != escrow_sum {
                self.audit_failure(market_id, "locked diverges from resting escrow");
            }
        }
        Ok(())
    }

    fn audit_failure(&self, market_id: &str, reason: &str) -> ! {
        error!(market_id, reason, "exchange invariant violated");
        panic!("exchange invariant violated for market {market_id}: {reason}");
    }
}
