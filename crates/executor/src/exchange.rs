use std::sync::Arc;

use api_client::responses::PlaceAck;
use api_client::Venue;
use async_trait::async_trait;
use core_types::{ApprovedAction, EngineOwner, Fill, Order, OrderStatus, Position, PositionSide};
use database::StateStore;
use events::messages::{OrderFilled, OrderSubmitted, PositionClosed, PositionOpened};
use events::EngineEvent;
use rust_decimal::Decimal;
use tokio::sync::{broadcast, Mutex};

use crate::error::ExecutorError;
use crate::portfolio::{FillOutcome, PositionBook};

/// The Position/Order state machine that sits between the Arbiter's approval
/// and the `Venue`. Every approved action passes through exactly one of
/// `submit`/`submit_group`; every venue fill passes through `handle_fill`,
/// which is the only place `PositionBook` mutates.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Submits one approved action. Persists the order as `Pending` before
    /// the venue call (so a crash mid-call still has a durable record keyed
    /// by `client_id`), then promotes it to `Live` on acknowledgement.
    async fn submit(&self, approved: &ApprovedAction) -> Result<Order, ExecutorError>;

    /// Submits a multi-leg atomic group (FUNDING's long-spot/short-perp
    /// pair). If a leg after the first fails, already-submitted legs are
    /// cancelled best-effort before the error is returned.
    async fn submit_group(&self, legs: &[ApprovedAction]) -> Result<Vec<Order>, ExecutorError>;

    /// Applies a fill reported by the venue (via the subscription stream or
    /// the reconciliation sweep) to the position book and the durable
    /// record, atomically, then emits the resulting event.
    async fn handle_fill(&self, fill: Fill, owner: EngineOwner) -> Result<(), ExecutorError>;

    /// A snapshot of all currently open positions.
    async fn positions(&self) -> Vec<Position>;

    /// Replaces the in-memory book wholesale. Used by the reconciler at
    /// startup and on its periodic sweep.
    async fn seed_positions(&self, positions: Vec<Position>);
}

/// The sole `Executor` implementor: every approved action and every fill
/// really does cross the network to a live (or sandbox) venue. There is no
/// simulated counterpart in this build — backtesting is explicitly out of
/// scope (spec.md §1).
pub struct VenueExecutor {
    venue: Arc<dyn Venue>,
    store: Arc<dyn StateStore>,
    events: broadcast::Sender<EngineEvent>,
    book: Mutex<PositionBook>,
}

impl VenueExecutor {
    pub fn new(
        venue: Arc<dyn Venue>,
        store: Arc<dyn StateStore>,
        events: broadcast::Sender<EngineEvent>,
    ) -> Self {
        Self {
            venue,
            store,
            events,
            book: Mutex::new(PositionBook::new()),
        }
    }

    fn emit(&self, event: EngineEvent) {
        // No subscriber is not an error: the bus is best-effort observability,
        // never load-bearing for trading correctness.
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl Executor for VenueExecutor {
    async fn submit(&self, approved: &ApprovedAction) -> Result<Order, ExecutorError> {
        let action = &approved.action;
        let mut order = Order {
            client_id: action.client_id,
            venue_id: None,
            symbol: action.symbol.clone(),
            owner: action.owner,
            side: action.side,
            kind: action.kind,
            qty: action.qty,
            limit_price: action.limit_price,
            trigger_price: action.stop_price,
            reduce_only: action.reduce_only,
            post_only: false,
            status: OrderStatus::Pending,
            filled_qty: Decimal::ZERO,
            avg_fill_price: None,
            created_at: approved.approved_at,
        };
        self.store.record_order(&order).await?;

        let ack: PlaceAck = self.venue.place(action).await?;
        order.venue_id = ack.venue_id.clone();
        order.status = OrderStatus::Live;
        self.store
            .update_order_status(
                order.client_id,
                order.status,
                order.filled_qty,
                order.avg_fill_price,
                ack.venue_id,
            )
            .await?;

        self.emit(EngineEvent::OrderSubmitted(OrderSubmitted {
            owner: action.owner,
            symbol: action.symbol.clone(),
            client_id: action.client_id,
        }));

        Ok(order)
    }

    async fn submit_group(&self, legs: &[ApprovedAction]) -> Result<Vec<Order>, ExecutorError> {
        let mut submitted = Vec::with_capacity(legs.len());
        for (i, leg) in legs.iter().enumerate() {
            match self.submit(leg).await {
                Ok(order) => submitted.push(order),
                Err(e) => {
                    for order in &submitted {
                        let _ = self.venue.cancel(order.client_id).await;
                    }
                    return Err(ExecutorError::GroupLegFailed(i, e.to_string()));
                }
            }
        }
        Ok(submitted)
    }

    async fn handle_fill(&self, fill: Fill, owner: EngineOwner) -> Result<(), ExecutorError> {
        let natural_side = PositionSide::from_order_side(fill.side);
        let outcome = {
            let mut book = self.book.lock().await;
            book.apply_fill(owner, &fill.symbol, fill.side, fill.qty, fill.price, fill.timestamp)?
        };

        let (position_for_store, side_for_store) = match &outcome {
            FillOutcome::Opened(p) | FillOutcome::Increased(p) | FillOutcome::Reduced(p) => {
                (Some(p.clone()), p.side)
            }
            FillOutcome::Closed { .. } => (None, natural_side.opposite()),
        };
        self.store
            .record_fill_and_position(&fill, position_for_store.as_ref(), owner, side_for_store)
            .await?;

        match outcome {
            FillOutcome::Opened(position) => {
                self.emit(EngineEvent::PositionOpened(PositionOpened { position }));
            }
            FillOutcome::Closed { realized_pnl } => {
                self.emit(EngineEvent::PositionClosed(PositionClosed {
                    symbol: fill.symbol.clone(),
                    owner,
                    realized_pnl,
                }));
            }
            FillOutcome::Increased(_) | FillOutcome::Reduced(_) => {}
        }

        self.emit(EngineEvent::OrderFilled(OrderFilled { owner, fill }));
        Ok(())
    }

    async fn positions(&self) -> Vec<Position> {
        self.book.lock().await.all().cloned().collect()
    }

    async fn seed_positions(&self, positions: Vec<Position>) {
        self.book.lock().await.replace_all(positions);
    }
}
