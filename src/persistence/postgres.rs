use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::store::TradeStore;
use crate::domain::{
    DenyCode, ExitType, Order, OrderRole, OrderSide, OrderStatus, OrderType, Position,
    PortfolioSnapshot, RiskDecision, RiskEvent, RiskEventType, Side, Trade, TradeStatus,
};
use crate::error::Result;

const TRADE_COLUMNS: &str = r#"
    trade_id, symbol, side, size, remaining_size, entry_price, stop_loss, take_profit,
    status, realized_pnl, exit_price, exit_reason, strategy_id, reasoning,
    entry_order_id, stop_order_id, take_profit_order_id, needs_reconciliation,
    failure_reason, created_at, opened_at, closed_at
"#;

const ORDER_COLUMNS: &str = r#"
    order_id, trade_id, exchange_order_id, symbol, side, role, order_type, size, price,
    stop_price, status, filled_qty, avg_fill_price, error, created_at, updated_at
"#;

/// PostgreSQL storage backend
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn trade_from_row(r: &PgRow) -> Result<Trade> {
    Ok(Trade {
        trade_id: r.try_get("trade_id")?,
        symbol: r.try_get("symbol")?,
        side: Side::try_from(r.try_get::<String, _>("side")?.as_str())?,
        size: r.try_get("size")?,
        remaining_size: r.try_get("remaining_size")?,
        entry_price: r.try_get("entry_price")?,
        stop_loss: r.try_get("stop_loss")?,
        take_profit: r.try_get("take_profit")?,
        status: TradeStatus::try_from(r.try_get::<String, _>("status")?.as_str())?,
        realized_pnl: r.try_get("realized_pnl")?,
        exit_price: r.try_get("exit_price")?,
        exit_reason: r
            .try_get::<Option<String>, _>("exit_reason")?
            .map(|s| ExitType::try_from(s.as_str()))
            .transpose()?,
        strategy_id: r.try_get("strategy_id")?,
        reasoning: r.try_get("reasoning")?,
        entry_order_id: r.try_get("entry_order_id")?,
        stop_order_id: r.try_get("stop_order_id")?,
        take_profit_order_id: r.try_get("take_profit_order_id")?,
        needs_reconciliation: r.try_get("needs_reconciliation")?,
        failure_reason: r.try_get("failure_reason")?,
        created_at: r.try_get("created_at")?,
        opened_at: r.try_get("opened_at")?,
        closed_at: r.try_get("closed_at")?,
    })
}

fn order_from_row(r: &PgRow) -> Result<Order> {
    Ok(Order {
        order_id: r.try_get("order_id")?,
        trade_id: r.try_get("trade_id")?,
        exchange_order_id: r.try_get("exchange_order_id")?,
        symbol: r.try_get("symbol")?,
        side: OrderSide::try_from(r.try_get::<String, _>("side")?.as_str())?,
        role: OrderRole::try_from(r.try_get::<String, _>("role")?.as_str())?,
        order_type: OrderType::try_from(r.try_get::<String, _>("order_type")?.as_str())?,
        size: r.try_get("size")?,
        price: r.try_get("price")?,
        stop_price: r.try_get("stop_price")?,
        status: OrderStatus::try_from(r.try_get::<String, _>("status")?.as_str())?,
        filled_qty: r.try_get("filled_qty")?,
        avg_fill_price: r.try_get("avg_fill_price")?,
        error: r.try_get("error")?,
        created_at: r.try_get("created_at")?,
        updated_at: r.try_get("updated_at")?,
    })
}

fn event_from_row(r: &PgRow) -> Result<RiskEvent> {
    let snapshot: serde_json::Value = r.try_get("snapshot")?;
    Ok(RiskEvent {
        event_id: r.try_get("event_id")?,
        correlation_id: r.try_get("correlation_id")?,
        event_type: RiskEventType::try_from(r.try_get::<String, _>("event_type")?.as_str())?,
        symbol: r.try_get("symbol")?,
        decision: RiskDecision::try_from(r.try_get::<String, _>("decision")?.as_str())?,
        code: r
            .try_get::<Option<String>, _>("code")?
            .map(|s| DenyCode::try_from(s.as_str()))
            .transpose()?,
        reason: r.try_get("reason")?,
        actor: r.try_get("actor")?,
        snapshot: serde_json::from_value::<PortfolioSnapshot>(snapshot)?,
        timestamp: r.try_get("created_at")?,
    })
}

#[async_trait]
impl TradeStore for PostgresStore {
    #[instrument(skip(self, trade), fields(trade_id = %trade.trade_id, status = %trade.status))]
    async fn save_trade(&self, trade: &Trade) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trades (
                trade_id, symbol, side, size, remaining_size, entry_price, stop_loss,
                take_profit, status, realized_pnl, exit_price, exit_reason, strategy_id,
                reasoning, entry_order_id, stop_order_id, take_profit_order_id,
                needs_reconciliation, failure_reason, created_at, opened_at, closed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                    $17, $18, $19, $20, $21, $22)
            ON CONFLICT (trade_id) DO UPDATE SET
                size = EXCLUDED.size,
                remaining_size = EXCLUDED.remaining_size,
                entry_price = EXCLUDED.entry_price,
                stop_loss = EXCLUDED.stop_loss,
                take_profit = EXCLUDED.take_profit,
                status = EXCLUDED.status,
                realized_pnl = EXCLUDED.realized_pnl,
                exit_price = EXCLUDED.exit_price,
                exit_reason = EXCLUDED.exit_reason,
                entry_order_id = EXCLUDED.entry_order_id,
                stop_order_id = EXCLUDED.stop_order_id,
                take_profit_order_id = EXCLUDED.take_profit_order_id,
                needs_reconciliation = EXCLUDED.needs_reconciliation,
                failure_reason = EXCLUDED.failure_reason,
                opened_at = EXCLUDED.opened_at,
                closed_at = EXCLUDED.closed_at
            "#,
        )
        .bind(trade.trade_id)
        .bind(&trade.symbol)
        .bind(trade.side.as_str())
        .bind(trade.size)
        .bind(trade.remaining_size)
        .bind(trade.entry_price)
        .bind(trade.stop_loss)
        .bind(trade.take_profit)
        .bind(trade.status.as_str())
        .bind(trade.realized_pnl)
        .bind(trade.exit_price)
        .bind(trade.exit_reason.map(|e| e.as_str()))
        .bind(&trade.strategy_id)
        .bind(&trade.reasoning)
        .bind(trade.entry_order_id)
        .bind(trade.stop_order_id)
        .bind(trade.take_profit_order_id)
        .bind(trade.needs_reconciliation)
        .bind(&trade.failure_reason)
        .bind(trade.created_at)
        .bind(trade.opened_at)
        .bind(trade.closed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_trade(&self, trade_id: Uuid) -> Result<Option<Trade>> {
        let row = sqlx::query(&format!("SELECT {} FROM trades WHERE trade_id = $1", TRADE_COLUMNS))
            .bind(trade_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(trade_from_row).transpose()
    }

    async fn load_active_trades(&self) -> Result<Vec<Trade>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM trades WHERE status IN ('PENDING', 'OPEN') ORDER BY created_at",
            TRADE_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(trade_from_row).collect()
    }

    async fn closed_trades_since(&self, since: DateTime<Utc>) -> Result<Vec<Trade>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM trades WHERE status = 'CLOSED' AND closed_at >= $1 ORDER BY closed_at",
            TRADE_COLUMNS
        ))
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(trade_from_row).collect()
    }

    async fn recent_closed_trades(&self, limit: usize) -> Result<Vec<Trade>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM trades WHERE status = 'CLOSED' ORDER BY closed_at DESC LIMIT $1",
            TRADE_COLUMNS
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(trade_from_row).collect()
    }

    #[instrument(skip(self, order), fields(order_id = %order.order_id, status = %order.status))]
    async fn save_order(&self, order: &Order) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO orders (
                order_id, trade_id, exchange_order_id, symbol, side, role, order_type, size,
                price, stop_price, status, filled_qty, avg_fill_price, error, created_at,
                updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ON CONFLICT (order_id) DO UPDATE SET
                exchange_order_id = EXCLUDED.exchange_order_id,
                status = EXCLUDED.status,
                filled_qty = EXCLUDED.filled_qty,
                avg_fill_price = EXCLUDED.avg_fill_price,
                error = EXCLUDED.error,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(order.order_id)
        .bind(order.trade_id)
        .bind(&order.exchange_order_id)
        .bind(&order.symbol)
        .bind(order.side.as_str())
        .bind(order.role.as_str())
        .bind(order.order_type.as_str())
        .bind(order.size)
        .bind(order.price)
        .bind(order.stop_price)
        .bind(order.status.as_str())
        .bind(order.filled_qty)
        .bind(order.avg_fill_price)
        .bind(&order.error)
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn orders_for_trade(&self, trade_id: Uuid) -> Result<Vec<Order>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM orders WHERE trade_id = $1 ORDER BY created_at",
            ORDER_COLUMNS
        ))
        .bind(trade_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(order_from_row).collect()
    }

    async fn load_active_orders(&self) -> Result<Vec<Order>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM orders WHERE status IN ('PENDING', 'SUBMITTED', 'PARTIALLY_FILLED') ORDER BY created_at",
            ORDER_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(order_from_row).collect()
    }

    #[instrument(skip(self, position), fields(trade_id = %position.trade_id))]
    async fn save_position(&self, position: &Position) -> Result<()> {
        let state = serde_json::to_value(position)?;
        sqlx::query(
            r#"
            INSERT INTO position_checkpoints (trade_id, symbol, state, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (trade_id) DO UPDATE SET
                state = EXCLUDED.state,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(position.trade_id)
        .bind(&position.symbol)
        .bind(state)
        .bind(position.updated_at)
        .execute(&self.pool)
        .await?;

        debug!("position checkpoint written");
        Ok(())
    }

    async fn delete_position(&self, trade_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM position_checkpoints WHERE trade_id = $1")
            .bind(trade_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load_positions(&self) -> Result<Vec<Position>> {
        let rows = sqlx::query("SELECT state FROM position_checkpoints")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| {
                let state: serde_json::Value = r.try_get("state")?;
                Ok(serde_json::from_value(state)?)
            })
            .collect()
    }

    #[instrument(skip(self, event), fields(correlation_id = %event.correlation_id, event_type = %event.event_type))]
    async fn append_risk_event(&self, event: &RiskEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO risk_events (
                event_id, correlation_id, event_type, symbol, decision, code, reason, actor,
                snapshot, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(event.event_id)
        .bind(event.correlation_id)
        .bind(event.event_type.as_str())
        .bind(&event.symbol)
        .bind(event.decision.as_str())
        .bind(event.code.map(|c| c.as_str()))
        .bind(&event.reason)
        .bind(&event.actor)
        .bind(serde_json::to_value(&event.snapshot)?)
        .bind(event.timestamp)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn risk_events(&self, limit: usize) -> Result<Vec<RiskEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM (
                SELECT seq, event_id, correlation_id, event_type, symbol, decision, code,
                       reason, actor, snapshot, created_at
                FROM risk_events ORDER BY seq DESC LIMIT $1
            ) recent ORDER BY seq
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(event_from_row).collect()
    }

    async fn last_event_of(&self, types: &[RiskEventType]) -> Result<Option<RiskEvent>> {
        let names: Vec<&str> = types.iter().map(|t| t.as_str()).collect();
        let row = sqlx::query(
            r#"
            SELECT seq, event_id, correlation_id, event_type, symbol, decision, code,
                   reason, actor, snapshot, created_at
            FROM risk_events WHERE event_type = ANY($1) ORDER BY seq DESC LIMIT 1
            "#,
        )
        .bind(&names)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(event_from_row).transpose()
    }
}
