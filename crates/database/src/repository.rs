use async_trait::async_trait;
use core_types::{
    CircuitState, EngineOwner, Fill, Order, OrderStatus, Portfolio, Position, PositionSide,
    StrategyMeta,
};
use rust_decimal::Decimal;
use sqlx::postgres::PgPool;
use uuid::Uuid;

use crate::DbError;

/// Durable record of positions, orders, fills, portfolio snapshots, circuit
/// state, and per-strategy metadata. Every operation here is idempotent by
/// key; a tick that results in a place+fill+position delta is recorded as
/// one atomic transaction via `record_fill_and_position`.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn upsert_position(&self, position: &Position) -> Result<(), DbError>;
    async fn delete_position(
        &self,
        symbol: &str,
        owner: EngineOwner,
        side: PositionSide,
    ) -> Result<(), DbError>;
    async fn load_all_positions(&self) -> Result<Vec<Position>, DbError>;

    async fn record_order(&self, order: &Order) -> Result<(), DbError>;
    async fn update_order_status(
        &self,
        client_id: Uuid,
        status: OrderStatus,
        filled_qty: Decimal,
        avg_fill_price: Option<Decimal>,
        venue_id: Option<String>,
    ) -> Result<(), DbError>;
    async fn load_open_orders(&self) -> Result<Vec<Order>, DbError>;

    /// Appends an immutable fill record.
    async fn record_fill(&self, fill: &Fill) -> Result<(), DbError>;

    /// Records a fill and the position delta it produced as one atomic
    /// transaction. `position = None` means the fill fully closed the
    /// position (the caller has already deleted it in memory).
    async fn record_fill_and_position(
        &self,
        fill: &Fill,
        position: Option<&Position>,
        owner: EngineOwner,
        side: PositionSide,
    ) -> Result<(), DbError>;

    async fn set_portfolio_snapshot(&self, snapshot: &Portfolio) -> Result<(), DbError>;
    async fn get_portfolio_snapshot(&self) -> Result<Option<Portfolio>, DbError>;

    async fn set_circuit_state(&self, state: &CircuitState) -> Result<(), DbError>;
    async fn get_circuit_state(&self) -> Result<Option<CircuitState>, DbError>;

    async fn set_strategy_meta(
        &self,
        owner: EngineOwner,
        symbol: &str,
        key: &str,
        value: &str,
    ) -> Result<(), DbError>;
    async fn get_strategy_meta(
        &self,
        owner: EngineOwner,
        symbol: &str,
        key: &str,
    ) -> Result<Option<StrategyMeta>, DbError>;
}

/// The `PostgresStateStore` implements `StateStore` against a Postgres
/// schema (see `migrations/`). Uses the runtime-checked `sqlx::query_as`
/// function rather than the `query_as!` macro (see crate docs for why).
#[derive(Debug, Clone)]
pub struct PostgresStateStore {
    pool: PgPool,
}

impl PostgresStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StateStore for PostgresStateStore {
    async fn upsert_position(&self, position: &Position) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT INTO positions (symbol, side, owner, size, avg_entry_price, unrealized_pnl, last_updated)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (symbol, owner, side) DO UPDATE SET
                size = EXCLUDED.size,
                avg_entry_price = EXCLUDED.avg_entry_price,
                unrealized_pnl = EXCLUDED.unrealized_pnl,
                last_updated = EXCLUDED.last_updated
            "#,
        )
        .bind(&position.symbol)
        .bind(side_str(position.side))
        .bind(owner_str(position.owner))
        .bind(position.size)
        .bind(position.avg_entry_price)
        .bind(position.unrealized_pnl)
        .bind(position.last_updated)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_position(
        &self,
        symbol: &str,
        owner: EngineOwner,
        side: PositionSide,
    ) -> Result<(), DbError> {
        sqlx::query("DELETE FROM positions WHERE symbol = $1 AND owner = $2 AND side = $3")
            .bind(symbol)
            .bind(owner_str(owner))
            .bind(side_str(side))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load_all_positions(&self) -> Result<Vec<Position>, DbError> {
        let rows = sqlx::query_as::<_, Position>(
            "SELECT symbol, side, owner, size, avg_entry_price, unrealized_pnl, last_updated FROM positions",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn record_order(&self, order: &Order) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT INTO orders (
                client_id, venue_id, symbol, owner, side, kind, qty, limit_price,
                trigger_price, reduce_only, post_only, status, filled_qty,
                avg_fill_price, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (client_id) DO NOTHING
            "#,
        )
        .bind(order.client_id)
        .bind(&order.venue_id)
        .bind(&order.symbol)
        .bind(owner_str(order.owner))
        .bind(format!("{:?}", order.side).to_uppercase())
        .bind(format!("{:?}", order.kind).to_uppercase())
        .bind(order.qty)
        .bind(order.limit_price)
        .bind(order.trigger_price)
        .bind(order.reduce_only)
        .bind(order.post_only)
        .bind(status_str(order.status))
        .bind(order.filled_qty)
        .bind(order.avg_fill_price)
        .bind(order.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_order_status(
        &self,
        client_id: Uuid,
        status: OrderStatus,
        filled_qty: Decimal,
        avg_fill_price: Option<Decimal>,
        venue_id: Option<String>,
    ) -> Result<(), DbError> {
        sqlx::query(
            r#"
            UPDATE orders SET status = $2, filled_qty = $3, avg_fill_price = $4,
                venue_id = COALESCE($5, venue_id)
            WHERE client_id = $1
            "#,
        )
        .bind(client_id)
        .bind(status_str(status))
        .bind(filled_qty)
        .bind(avg_fill_price)
        .bind(venue_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_open_orders(&self) -> Result<Vec<Order>, DbError> {
        let rows = sqlx::query_as::<_, Order>(
            r#"
            SELECT client_id, venue_id, symbol, owner, side, kind, qty, limit_price,
                   trigger_price, reduce_only, post_only, status, filled_qty,
                   avg_fill_price, created_at
            FROM orders
            WHERE status IN ('PENDING', 'LIVE', 'PARTIALLY_FILLED')
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn record_fill(&self, fill: &Fill) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT INTO fills (fill_id, client_id, symbol, side, price, qty, fee, fee_asset, timestamp)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (fill_id) DO NOTHING
            "#,
        )
        .bind(fill.fill_id)
        .bind(fill.client_id)
        .bind(&fill.symbol)
        .bind(format!("{:?}", fill.side).to_uppercase())
        .bind(fill.price)
        .bind(fill.qty)
        .bind(fill.fee)
        .bind(&fill.fee_asset)
        .bind(fill.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_fill_and_position(
        &self,
        fill: &Fill,
        position: Option<&Position>,
        owner: EngineOwner,
        side: PositionSide,
    ) -> Result<(), DbError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO fills (fill_id, client_id, symbol, side, price, qty, fee, fee_asset, timestamp)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (fill_id) DO NOTHING
            "#,
        )
        .bind(fill.fill_id)
        .bind(fill.client_id)
        .bind(&fill.symbol)
        .bind(format!("{:?}", fill.side).to_uppercase())
        .bind(fill.price)
        .bind(fill.qty)
        .bind(fill.fee)
        .bind(&fill.fee_asset)
        .bind(fill.timestamp)
        .execute(&mut *tx)
        .await?;

        match position {
            Some(p) => {
                sqlx::query(
                    r#"
                    INSERT INTO positions (symbol, side, owner, size, avg_entry_price, unrealized_pnl, last_updated)
                    VALUES ($1, $2, $3, $4, $5, $6, $7)
                    ON CONFLICT (symbol, owner, side) DO UPDATE SET
                        size = EXCLUDED.size,
                        avg_entry_price = EXCLUDED.avg_entry_price,
                        unrealized_pnl = EXCLUDED.unrealized_pnl,
                        last_updated = EXCLUDED.last_updated
                    "#,
                )
                .bind(&p.symbol)
                .bind(side_str(p.side))
                .bind(owner_str(p.owner))
                .bind(p.size)
                .bind(p.avg_entry_price)
                .bind(p.unrealized_pnl)
                .bind(p.last_updated)
                .execute(&mut *tx)
                .await?;
            }
            None => {
                sqlx::query("DELETE FROM positions WHERE symbol = $1 AND owner = $2 AND side = $3")
                    .bind(&fill.symbol)
                    .bind(owner_str(owner))
                    .bind(side_str(side))
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn set_portfolio_snapshot(&self, snapshot: &Portfolio) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT INTO portfolio_snapshots (id, equity_usd, available_usd, used_margin_usd, peak_equity_usd, realized_pnl_today, snapshot_at)
            VALUES (1, $1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE SET
                equity_usd = EXCLUDED.equity_usd,
                available_usd = EXCLUDED.available_usd,
                used_margin_usd = EXCLUDED.used_margin_usd,
                peak_equity_usd = EXCLUDED.peak_equity_usd,
                realized_pnl_today = EXCLUDED.realized_pnl_today,
                snapshot_at = EXCLUDED.snapshot_at
            "#,
        )
        .bind(snapshot.equity_usd)
        .bind(snapshot.available_usd)
        .bind(snapshot.used_margin_usd)
        .bind(snapshot.peak_equity_usd)
        .bind(snapshot.realized_pnl_today)
        .bind(snapshot.snapshot_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_portfolio_snapshot(&self) -> Result<Option<Portfolio>, DbError> {
        let row = sqlx::query_as::<_, Portfolio>(
            "SELECT equity_usd, available_usd, used_margin_usd, peak_equity_usd, realized_pnl_today, snapshot_at FROM portfolio_snapshots WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn set_circuit_state(&self, state: &CircuitState) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT INTO circuit_state (id, level, since, triggering_drawdown, kill_flag)
            VALUES (1, $1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE SET
                level = EXCLUDED.level,
                since = EXCLUDED.since,
                triggering_drawdown = EXCLUDED.triggering_drawdown,
                kill_flag = EXCLUDED.kill_flag
            "#,
        )
        .bind(level_str(state.level))
        .bind(state.since)
        .bind(state.triggering_drawdown)
        .bind(state.kill_flag)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_circuit_state(&self) -> Result<Option<CircuitState>, DbError> {
        let row = sqlx::query_as::<_, CircuitState>(
            "SELECT level, since, triggering_drawdown, kill_flag FROM circuit_state WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn set_strategy_meta(
        &self,
        owner: EngineOwner,
        symbol: &str,
        key: &str,
        value: &str,
    ) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT INTO strategy_meta (owner, symbol, key, value, updated_at)
            VALUES ($1, $2, $3, $4, now())
            ON CONFLICT (owner, symbol, key) DO UPDATE SET
                value = EXCLUDED.value,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(owner_str(owner))
        .bind(symbol)
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_strategy_meta(
        &self,
        owner: EngineOwner,
        symbol: &str,
        key: &str,
    ) -> Result<Option<StrategyMeta>, DbError> {
        let row = sqlx::query_as::<_, StrategyMeta>(
            "SELECT owner, symbol, key, value, updated_at FROM strategy_meta WHERE owner = $1 AND symbol = $2 AND key = $3",
        )
        .bind(owner_str(owner))
        .bind(symbol)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}

fn owner_str(owner: EngineOwner) -> &'static str {
    match owner {
        EngineOwner::CoreHodl => "CORE_HODL",
        EngineOwner::Trend => "TREND",
        EngineOwner::Funding => "FUNDING",
        EngineOwner::Tactical => "TACTICAL",
    }
}

fn side_str(side: PositionSide) -> &'static str {
    match side {
        PositionSide::Long => "LONG",
        PositionSide::Short => "SHORT",
    }
}

fn status_str(status: OrderStatus) -> &'static str {
    match status {
        OrderStatus::Pending => "PENDING",
        OrderStatus::Live => "LIVE",
        OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
        OrderStatus::Filled => "FILLED",
        OrderStatus::Cancelled => "CANCELLED",
        OrderStatus::Rejected => "REJECTED",
    }
}

fn level_str(level: core_types::CircuitLevel) -> &'static str {
    match level {
        core_types::CircuitLevel::Normal => "NORMAL",
        core_types::CircuitLevel::Caution => "CAUTION",
        core_types::CircuitLevel::Warning => "WARNING",
        core_types::CircuitLevel::Alert => "ALERT",
        core_types::CircuitLevel::Emergency => "EMERGENCY",
    }
}
