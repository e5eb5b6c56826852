//! Single-slot position state machine
//!
//! The book lives behind one `parking_lot::Mutex`. Every transition is a
//! check-and-set under that lock, and the lock is never held across a
//! gateway call. Work that spans an await re-validates the position id and
//! state when it takes the lock again, so a concurrent path (premium poll vs
//! manual exit) that got there first simply wins.

use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::gateway::OrderGateway;
use super::types::{
    Contract, ExitReason, OrderHandle, OrderStatus, Position, PositionId, PositionState,
};
use crate::audit::{AuditSink, LifecycleEvent};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::regime::Regime;
use crate::signal::Signal;

/// Sizing and order-timing knobs
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ManagerSettings {
    pub lot_size: u32,
    pub lot_count: u32,
    pub order_poll: Duration,
    pub entry_fill_timeout: Duration,
    pub exit_fill_timeout: Duration,
}

impl ManagerSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            lot_size: config.lot_size,
            lot_count: config.lot_count,
            order_poll: Duration::from_millis(config.order_poll_millis),
            entry_fill_timeout: Duration::from_secs(config.entry_fill_timeout_secs),
            exit_fill_timeout: Duration::from_secs(config.exit_fill_timeout_secs),
        }
    }
}

/// Result of handing a signal to the manager
#[derive(Debug, Clone, PartialEq)]
pub enum EntryOutcome {
    /// NONE signal; nothing to do
    NotActionable,
    /// A position is already active
    Busy(PositionState),
    /// Entry rejected, not filled in time, or not placed; back to FLAT
    Aborted {
        position_id: PositionId,
        reason: String,
    },
    /// Filled and protected
    Opened(Position),
    /// Filled but unprotected, exit was started immediately
    ProtectionFailed(Position),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExitOutcome {
    Closed(Position),
    /// Exit order working; the order poll will finish it
    Pending(Position),
    NotOpen(PositionState),
}

enum FillWait {
    Filled(f64),
    Rejected(String),
    TimedOut,
}

/// What became of a protective order we tried to cancel
enum StopDisposal {
    Dead,
    Filled(f64),
    Working,
}

struct PendingEntry {
    id: PositionId,
}

struct Book {
    state: PositionState,
    position: Option<Position>,
    pending: Option<PendingEntry>,
    stop_order: Option<OrderHandle>,
    /// Protective order being cancelled; no market exit until it is dead
    stop_cancel: Option<OrderHandle>,
    exit_order: Option<OrderHandle>,
    /// Some task owns exit placement right now
    exit_claimed: bool,
    next_id: PositionId,
    closed: Vec<Position>,
}

impl Book {
    fn new() -> Self {
        Self {
            state: PositionState::Flat,
            position: None,
            pending: None,
            stop_order: None,
            stop_cancel: None,
            exit_order: None,
            exit_claimed: false,
            next_id: 1,
            closed: Vec::new(),
        }
    }

    fn transition(&mut self, next: PositionState) -> EngineResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(invariant_violation(
                self.state,
                format!("illegal transition {} -> {}", self.state, next),
            ));
        }
        debug!(from = %self.state, to = %next, "Position transition");
        self.state = next;
        if let Some(position) = self.position.as_mut() {
            position.status = next;
        }
        Ok(())
    }

    /// Id of whatever occupies the slot
    fn active_id(&self) -> Option<PositionId> {
        self.position
            .as_ref()
            .map(|p| p.id)
            .or_else(|| self.pending.as_ref().map(|p| p.id))
    }

    fn owns(&self, id: PositionId, state: PositionState) -> bool {
        self.state == state && self.active_id() == Some(id)
    }
}

fn invariant_violation(state: PositionState, message: impl Into<String>) -> EngineError {
    let message = message.into();
    error!(state = %state, message = %message, "Position invariant violated");
    EngineError::InvariantViolation { state, message }
}

pub struct PositionManager {
    regime: Arc<dyn Regime>,
    gateway: Arc<dyn OrderGateway>,
    audit: Arc<dyn AuditSink>,
    settings: ManagerSettings,
    book: Mutex<Book>,
}

impl PositionManager {
    pub fn new(
        regime: Arc<dyn Regime>,
        gateway: Arc<dyn OrderGateway>,
        audit: Arc<dyn AuditSink>,
        settings: ManagerSettings,
    ) -> EngineResult<Self> {
        if regime.allowed_concurrent_positions() != 1 {
            return Err(EngineError::config(format!(
                "regime '{}' allows {} concurrent positions; only 1 is supported",
                regime.name(),
                regime.allowed_concurrent_positions()
            )));
        }

        Ok(Self {
            regime,
            gateway,
            audit,
            settings,
            book: Mutex::new(Book::new()),
        })
    }

    pub fn state(&self) -> PositionState {
        self.book.lock().state
    }

    /// Snapshot of the active position, if any
    pub fn position(&self) -> Option<Position> {
        self.book.lock().position.clone()
    }

    /// Positions closed this session, oldest first
    pub fn closed_positions(&self) -> Vec<Position> {
        self.book.lock().closed.clone()
    }

    // =========================================================================
    // Entry
    // =========================================================================

    /// Act on an aggregated signal.
    ///
    /// Only one caller can move the book out of FLAT; everyone else gets
    /// [`EntryOutcome::Busy`].
    pub async fn on_signal(&self, signal: &Signal) -> EngineResult<EntryOutcome> {
        let Some(request) = signal.entry.filter(|_| signal.is_actionable()) else {
            return Ok(EntryOutcome::NotActionable);
        };
        let contract = Contract {
            option_type: request.option_type,
            strike: request.strike,
        };

        let id = {
            let mut book = self.book.lock();
            if book.state != PositionState::Flat {
                debug!(state = %book.state, "Signal ignored, position slot taken");
                return Ok(EntryOutcome::Busy(book.state));
            }
            if book.position.is_some() || book.pending.is_some() {
                return Err(invariant_violation(book.state, "FLAT book holds a position"));
            }
            book.transition(PositionState::EntryPending)?;
            let id = book.next_id;
            book.next_id += 1;
            book.pending = Some(PendingEntry { id });
            id
        };

        info!(
            position_id = id,
            contract = %contract,
            quantity = request.quantity,
            signal = %signal.signal_type,
            "Placing entry"
        );
        self.audit.record_event(&LifecycleEvent::EntryRequested {
            position_id: id,
            contract,
            quantity: request.quantity,
        });

        let handle = match self.gateway.place_entry(&contract, request.quantity).await {
            Ok(handle) => handle,
            Err(e) => {
                self.gateway_error(Some(id), "place_entry", &e);
                return self.abort_entry(id, format!("entry placement failed: {e}"));
            }
        };

        let fill = match self.await_fill(&handle, self.settings.entry_fill_timeout).await {
            FillWait::Filled(price) => price,
            FillWait::Rejected(reason) => {
                return self.abort_entry(id, format!("entry rejected: {reason}"));
            }
            FillWait::TimedOut => {
                if let Err(e) = self.gateway.cancel(&handle).await {
                    self.gateway_error(Some(id), "cancel", &e);
                }
                // A fill can land while the cancel is in flight
                match self.gateway.get_status(&handle).await {
                    Ok(OrderStatus::Filled { average_price }) => average_price,
                    _ => return self.abort_entry(id, "entry not filled within timeout"),
                }
            }
        };

        self.on_entry_filled(id, contract, request.quantity, fill, signal)
            .await
    }

    async fn on_entry_filled(
        &self,
        id: PositionId,
        contract: Contract,
        quantity: u32,
        fill: f64,
        signal: &Signal,
    ) -> EngineResult<EntryOutcome> {
        let levels = self.regime.compute_stop_loss(fill);

        {
            let mut book = self.book.lock();
            if !book.owns(id, PositionState::EntryPending) {
                return Err(invariant_violation(
                    book.state,
                    format!("entry {id} filled but no longer pending"),
                ));
            }
            let (stop_loss_points, stop_loss_price) = levels
                .as_ref()
                .map(|l| (l.stop_loss_points, l.stop_loss_price))
                .unwrap_or((0.0, 0.0));

            let mut position = Position {
                id,
                contract,
                quantity,
                lot_size: self.settings.lot_size,
                lot_count: self.settings.lot_count,
                entry_premium: fill,
                entry_timestamp: signal.timestamp,
                stop_loss_points,
                stop_loss_price,
                status: PositionState::EntryPending,
                current_premium: fill,
                pnl_points: 0.0,
                pnl_value: 0.0,
                exit_premium: None,
                exit_reason: None,
                exit_timestamp: None,
            };
            position.update_premium(fill);
            book.position = Some(position);
            book.pending = None;
        }
        self.audit.record_event(&LifecycleEvent::EntryFilled {
            position_id: id,
            premium: fill,
        });

        let levels = match levels {
            Ok(levels) => levels,
            Err(e) => return self.protection_failed(id, e.to_string()).await,
        };

        let placed = self
            .gateway
            .place_stop_loss(&contract, levels.trigger, levels.limit, quantity)
            .await;
        let handle = match placed {
            Ok(handle) => handle,
            Err(e) => {
                self.gateway_error(Some(id), "place_stop_loss", &e);
                return self
                    .protection_failed(id, format!("stop-loss placement failed: {e}"))
                    .await;
            }
        };

        let snapshot = {
            let mut book = self.book.lock();
            if !book.owns(id, PositionState::EntryPending) {
                return Err(invariant_violation(
                    book.state,
                    format!("stop-loss placed for {id} but entry no longer pending"),
                ));
            }
            book.transition(PositionState::Open)?;
            book.stop_order = Some(handle);
            book.position.clone()
        };
        let Some(position) = snapshot else {
            return Err(invariant_violation(PositionState::Open, "OPEN without position"));
        };

        self.audit.record_event(&LifecycleEvent::StopLossPlaced {
            position_id: id,
            trigger: levels.trigger,
            limit: levels.limit,
        });
        info!(
            position_id = id,
            contract = %position.contract,
            entry = fill,
            stop = levels.stop_loss_price,
            trigger = levels.trigger,
            limit = levels.limit,
            "Position opened"
        );

        Ok(EntryOutcome::Opened(position))
    }

    fn abort_entry(&self, id: PositionId, reason: impl Into<String>) -> EngineResult<EntryOutcome> {
        let reason = reason.into();
        {
            let mut book = self.book.lock();
            if !book.owns(id, PositionState::EntryPending) {
                return Err(invariant_violation(
                    book.state,
                    format!("abort of entry {id} that is not pending"),
                ));
            }
            book.transition(PositionState::Flat)?;
            book.pending = None;
        }

        warn!(position_id = id, reason = %reason, "Entry aborted");
        self.audit.record_event(&LifecycleEvent::EntryAborted {
            position_id: id,
            reason: reason.clone(),
        });

        Ok(EntryOutcome::Aborted {
            position_id: id,
            reason,
        })
    }

    /// Filled without protection: never stay exposed, flatten now.
    async fn protection_failed(&self, id: PositionId, reason: String) -> EngineResult<EntryOutcome> {
        error!(position_id = id, reason = %reason, "Position unprotected, exiting");
        {
            let mut book = self.book.lock();
            if !book.owns(id, PositionState::EntryPending) {
                return Err(invariant_violation(
                    book.state,
                    format!("protection failure for {id} outside ENTRY_PENDING"),
                ));
            }
            book.transition(PositionState::Exiting)?;
            book.exit_claimed = true;
            if let Some(position) = book.position.as_mut() {
                position.exit_reason = Some(ExitReason::ProtectionFailed);
            }
        }

        self.audit.record_event(&LifecycleEvent::ProtectionFailed {
            position_id: id,
            reason,
        });
        self.audit.record_event(&LifecycleEvent::ExitStarted {
            position_id: id,
            reason: ExitReason::ProtectionFailed,
        });

        let position = self.execute_exit(id, true).await?;
        Ok(EntryOutcome::ProtectionFailed(position))
    }

    // =========================================================================
    // Premium and order polling
    // =========================================================================

    /// Record a premium observation for the active position.
    ///
    /// Touches nothing but the premium and the derived P&L.
    pub fn on_premium(&self, premium: f64) -> EngineResult<Option<Position>> {
        if !premium.is_finite() || premium < 0.0 {
            return Err(EngineError::DataQuality(format!("invalid premium {premium}")));
        }

        let mut book = self.book.lock();
        if !book.state.is_active() {
            return Ok(None);
        }
        Ok(book.position.as_mut().map(|position| {
            position.update_premium(premium);
            position.clone()
        }))
    }

    /// Check the working protective or exit order and advance the state
    /// machine. Returns the position if it closed during this poll.
    pub async fn poll_orders(&self) -> EngineResult<Option<Position>> {
        let (id, state, stop, stop_cancel, exit, needs_exit) = {
            let book = self.book.lock();
            let Some(position) = book.position.as_ref() else {
                return Ok(None);
            };
            (
                position.id,
                book.state,
                book.stop_order.clone(),
                book.stop_cancel.clone().filter(|_| !book.exit_claimed),
                book.exit_order.clone(),
                book.state == PositionState::Exiting
                    && book.stop_cancel.is_none()
                    && book.exit_order.is_none()
                    && !book.exit_claimed,
            )
        };

        if let (PositionState::Exiting, Some(stop)) = (state, stop_cancel) {
            return match self.dispose_stop(id, &stop).await {
                StopDisposal::Dead => {
                    self.stop_retired(&stop);
                    let position = self.execute_exit(id, false).await?;
                    Ok((position.status == PositionState::Closed).then_some(position))
                }
                StopDisposal::Filled(price) => self.close(id, price).map(Some),
                StopDisposal::Working => Ok(None),
            };
        }

        match state {
            PositionState::Open => {
                let Some(stop) = stop else {
                    return Err(invariant_violation(state, "OPEN position without stop-loss"));
                };
                self.poll_stop_loss(id, stop).await
            }
            PositionState::Exiting if needs_exit => {
                let position = self.execute_exit(id, false).await?;
                Ok((position.status == PositionState::Closed).then_some(position))
            }
            PositionState::Exiting => {
                let Some(exit) = exit else {
                    return Ok(None);
                };
                match self.gateway.get_status(&exit).await {
                    Ok(OrderStatus::Filled { average_price }) => {
                        self.close(id, average_price).map(Some)
                    }
                    Ok(OrderStatus::Rejected { reason }) => {
                        warn!(position_id = id, order = %exit, reason = %reason, "Exit order rejected, will re-place");
                        let mut book = self.book.lock();
                        if book.exit_order.as_ref() == Some(&exit) {
                            book.exit_order = None;
                        }
                        Ok(None)
                    }
                    Ok(OrderStatus::Pending | OrderStatus::Triggered) => Ok(None),
                    Err(e) => {
                        self.gateway_error(Some(id), "get_status", &e);
                        Ok(None)
                    }
                }
            }
            _ => Ok(None),
        }
    }

    async fn poll_stop_loss(
        &self,
        id: PositionId,
        stop: OrderHandle,
    ) -> EngineResult<Option<Position>> {
        match self.gateway.get_status(&stop).await {
            Ok(OrderStatus::Pending) => Ok(None),
            Ok(OrderStatus::Triggered) => {
                self.begin_exit(id, ExitReason::StopLoss, Some(stop))?;
                Ok(None)
            }
            Ok(OrderStatus::Filled { average_price }) => {
                if self.begin_exit(id, ExitReason::StopLoss, Some(stop))? {
                    self.close(id, average_price).map(Some)
                } else {
                    Ok(None)
                }
            }
            Ok(OrderStatus::Rejected { reason }) => {
                if !self.begin_exit(id, ExitReason::ProtectionFailed, None)? {
                    return Ok(None);
                }
                error!(position_id = id, reason = %reason, "Stop-loss order lost, exiting");
                self.audit.record_event(&LifecycleEvent::ProtectionFailed {
                    position_id: id,
                    reason: format!("stop-loss rejected: {reason}"),
                });
                let position = self.execute_exit(id, false).await?;
                Ok((position.status == PositionState::Closed).then_some(position))
            }
            Err(e) => {
                self.gateway_error(Some(id), "get_status", &e);
                Ok(None)
            }
        }
    }

    // =========================================================================
    // Exit
    // =========================================================================

    /// Operator-requested exit of an OPEN position.
    ///
    /// The protective order is cancelled first. If the broker will not
    /// confirm it dead, no market exit is placed: the position stays EXITING
    /// and the order poll keeps retrying the cancel, or closes the position
    /// on the stop's own fill.
    pub async fn request_exit(&self) -> EngineResult<ExitOutcome> {
        let (id, stop) = {
            let mut book = self.book.lock();
            if book.state != PositionState::Open {
                return Ok(ExitOutcome::NotOpen(book.state));
            }
            let Some(id) = book.position.as_ref().map(|p| p.id) else {
                return Err(invariant_violation(book.state, "OPEN without position"));
            };
            book.transition(PositionState::Exiting)?;
            book.exit_claimed = true;
            if let Some(position) = book.position.as_mut() {
                position.exit_reason = Some(ExitReason::Manual);
            }
            let stop = book.stop_order.take();
            book.stop_cancel = stop.clone();
            (id, stop)
        };

        info!(position_id = id, "Manual exit requested");
        self.audit.record_event(&LifecycleEvent::ExitStarted {
            position_id: id,
            reason: ExitReason::Manual,
        });

        if let Some(stop) = stop {
            match self.dispose_stop(id, &stop).await {
                StopDisposal::Dead => self.stop_retired(&stop),
                StopDisposal::Filled(price) => {
                    return self.close(id, price).map(ExitOutcome::Closed);
                }
                StopDisposal::Working => {
                    warn!(position_id = id, order = %stop, "Stop-loss still working, exit left to order poll");
                    let snapshot = {
                        let mut book = self.book.lock();
                        if book.owns(id, PositionState::Exiting) {
                            book.exit_claimed = false;
                        }
                        book.position.clone()
                    };
                    return match snapshot {
                        Some(position) => Ok(ExitOutcome::Pending(position)),
                        None => self.snapshot(id).map(ExitOutcome::Closed),
                    };
                }
            }
        }

        let position = self.execute_exit(id, true).await?;
        if position.status == PositionState::Closed {
            Ok(ExitOutcome::Closed(position))
        } else {
            Ok(ExitOutcome::Pending(position))
        }
    }

    /// Cancel a protective order and find out whether it is really gone
    async fn dispose_stop(&self, id: PositionId, stop: &OrderHandle) -> StopDisposal {
        let Err(e) = self.gateway.cancel(stop).await else {
            return StopDisposal::Dead;
        };
        self.gateway_error(Some(id), "cancel", &e);

        match self.gateway.get_status(stop).await {
            Ok(OrderStatus::Filled { average_price }) => StopDisposal::Filled(average_price),
            Ok(OrderStatus::Rejected { .. }) => StopDisposal::Dead,
            Ok(OrderStatus::Pending | OrderStatus::Triggered) => StopDisposal::Working,
            Err(e) => {
                self.gateway_error(Some(id), "get_status", &e);
                StopDisposal::Working
            }
        }
    }

    fn stop_retired(&self, stop: &OrderHandle) {
        let mut book = self.book.lock();
        if book.stop_cancel.as_ref() == Some(stop) {
            book.stop_cancel = None;
        }
    }

    /// OPEN -> EXITING. Returns `false` if another path already moved the
    /// position on.
    fn begin_exit(
        &self,
        id: PositionId,
        reason: ExitReason,
        exit_order: Option<OrderHandle>,
    ) -> EngineResult<bool> {
        {
            let mut book = self.book.lock();
            if !book.owns(id, PositionState::Open) {
                return Ok(false);
            }
            book.transition(PositionState::Exiting)?;
            book.stop_order = None;
            book.exit_order = exit_order;
            if let Some(position) = book.position.as_mut() {
                position.exit_reason = Some(reason);
            }
        }

        info!(position_id = id, reason = %reason, "Exit started");
        self.audit.record_event(&LifecycleEvent::ExitStarted {
            position_id: id,
            reason,
        });
        Ok(true)
    }

    /// Place a market exit and wait for its fill. `claimed` is true when the
    /// caller already reserved exit placement under the lock.
    async fn execute_exit(&self, id: PositionId, claimed: bool) -> EngineResult<Position> {
        let (contract, quantity) = {
            let mut book = self.book.lock();
            if !book.owns(id, PositionState::Exiting) {
                drop(book);
                return self.snapshot(id);
            }
            if book.stop_cancel.is_some() {
                if claimed {
                    book.exit_claimed = false;
                }
                drop(book);
                return self.snapshot(id);
            }
            if !claimed {
                if book.exit_claimed || book.exit_order.is_some() {
                    drop(book);
                    return self.snapshot(id);
                }
                book.exit_claimed = true;
            }
            match book.position.as_ref() {
                Some(p) => (p.contract, p.quantity),
                None => {
                    return Err(invariant_violation(book.state, "EXITING without position"));
                }
            }
        };

        let placed = self.gateway.place_exit(&contract, quantity).await;
        let handle = {
            let mut book = self.book.lock();
            book.exit_claimed = false;
            match placed {
                Ok(handle) => {
                    book.exit_order = Some(handle.clone());
                    Some(handle)
                }
                Err(e) => {
                    drop(book);
                    self.gateway_error(Some(id), "place_exit", &e);
                    None
                }
            }
        };
        let Some(handle) = handle else {
            return self.snapshot(id);
        };

        match self.await_fill(&handle, self.settings.exit_fill_timeout).await {
            FillWait::Filled(price) => self.close(id, price),
            FillWait::Rejected(reason) => {
                warn!(position_id = id, order = %handle, reason = %reason, "Exit order rejected, will re-place");
                {
                    let mut book = self.book.lock();
                    if book.exit_order.as_ref() == Some(&handle) {
                        book.exit_order = None;
                    }
                }
                self.snapshot(id)
            }
            FillWait::TimedOut => {
                warn!(position_id = id, order = %handle, "Exit not filled yet, leaving to order poll");
                self.snapshot(id)
            }
        }
    }

    /// EXITING -> CLOSED -> FLAT
    fn close(&self, id: PositionId, exit_premium: f64) -> EngineResult<Position> {
        let position = {
            let mut book = self.book.lock();
            if !book.owns(id, PositionState::Exiting) {
                // Another path closed it first
                drop(book);
                return self.snapshot(id);
            }

            book.transition(PositionState::Closed)?;
            let Some(mut position) = book.position.take() else {
                return Err(invariant_violation(book.state, "CLOSED without position"));
            };
            position.update_premium(exit_premium);
            position.exit_premium = Some(exit_premium);
            position.exit_timestamp = Some(Utc::now());
            position.status = PositionState::Closed;

            book.stop_order = None;
            book.stop_cancel = None;
            book.exit_order = None;
            book.exit_claimed = false;
            book.closed.push(position.clone());
            book.transition(PositionState::Flat)?;
            position
        };

        let reason = position.exit_reason.unwrap_or(ExitReason::Manual);
        info!(
            position_id = id,
            contract = %position.contract,
            entry = position.entry_premium,
            exit = exit_premium,
            pnl_points = position.pnl_points,
            pnl_value = position.pnl_value,
            reason = %reason,
            "Position closed"
        );
        self.audit.record_event(&LifecycleEvent::PositionClosed {
            position_id: id,
            exit_premium,
            pnl_points: position.pnl_points,
            pnl_value: position.pnl_value,
            reason,
        });

        Ok(position)
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Current view of position `id`, live or closed
    fn snapshot(&self, id: PositionId) -> EngineResult<Position> {
        let book = self.book.lock();
        book.position
            .iter()
            .chain(book.closed.iter().rev())
            .find(|p| p.id == id)
            .cloned()
            .ok_or_else(|| invariant_violation(book.state, format!("position {id} vanished")))
    }

    async fn await_fill(&self, handle: &OrderHandle, timeout: Duration) -> FillWait {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.gateway.get_status(handle).await {
                Ok(OrderStatus::Filled { average_price }) => return FillWait::Filled(average_price),
                Ok(OrderStatus::Rejected { reason }) => return FillWait::Rejected(reason),
                Ok(OrderStatus::Pending | OrderStatus::Triggered) => {}
                Err(e) => warn!(order = %handle, error = %e, "Order status poll failed"),
            }
            if tokio::time::Instant::now() >= deadline {
                return FillWait::TimedOut;
            }
            tokio::time::sleep(self.settings.order_poll).await;
        }
    }

    fn gateway_error(&self, position_id: Option<PositionId>, operation: &str, error: &EngineError) {
        warn!(?position_id, operation, error = %error, "Gateway call failed");
        self.audit.record_event(&LifecycleEvent::GatewayError {
            position_id,
            operation: operation.to_string(),
            error: error.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::config::RegimePolicy;
    use crate::crossover::CrossoverEvent;
    use crate::oms::paper::{PaperGateway, PaperGatewayConfig};
    use crate::signal::{EntryRequest, SignalType};
    use crate::{Direction, OptionType};
    use approx::assert_relative_eq;

    fn settings() -> ManagerSettings {
        ManagerSettings {
            lot_size: 75,
            lot_count: 1,
            order_poll: Duration::from_millis(5),
            entry_fill_timeout: Duration::from_millis(60),
            exit_fill_timeout: Duration::from_millis(60),
        }
    }

    fn buy_ce() -> Signal {
        Signal {
            signal_type: SignalType::BuyCe,
            timestamp: Utc::now(),
            crossover: CrossoverEvent {
                direction: Direction::Up,
                detected_index: 20,
            },
            entry_index: 21,
            underlying_price: 21_510.0,
            outcomes: vec![],
            entry: Some(EntryRequest {
                option_type: OptionType::CE,
                strike: 21_500.0,
                quantity: 75,
            }),
        }
    }

    fn setup(config: PaperGatewayConfig) -> (PositionManager, Arc<PaperGateway>, Arc<MemoryAuditSink>) {
        let gateway = Arc::new(PaperGateway::new(config, 100.0));
        let audit = Arc::new(MemoryAuditSink::new());
        let manager = PositionManager::new(
            Arc::new(RegimePolicy::default()),
            gateway.clone(),
            audit.clone(),
            settings(),
        )
        .unwrap();
        (manager, gateway, audit)
    }

    #[tokio::test]
    async fn test_stop_loss_cycle() {
        let (manager, gateway, _audit) = setup(PaperGatewayConfig::default());

        let EntryOutcome::Opened(position) = manager.on_signal(&buy_ce()).await.unwrap() else {
            panic!("expected an open position");
        };
        assert_eq!(position.stop_loss_price, 70.0);
        assert_eq!(position.stop_loss_points, 30.0);
        assert_eq!(manager.state(), PositionState::Open);

        let update = manager.on_premium(85.0).unwrap().unwrap();
        assert_relative_eq!(update.pnl_points, -15.0);
        assert_relative_eq!(update.pnl_value, -1125.0);

        gateway.set_premium(70.0);
        manager.on_premium(70.0).unwrap();
        assert!(manager.poll_orders().await.unwrap().is_none());
        assert_eq!(manager.state(), PositionState::Exiting);

        let closed = manager.poll_orders().await.unwrap().unwrap();
        assert_eq!(closed.exit_reason, Some(ExitReason::StopLoss));
        assert_relative_eq!(closed.pnl_points, -30.0);
        assert_eq!(manager.state(), PositionState::Flat);
        assert_eq!(manager.closed_positions().len(), 1);
    }

    #[tokio::test]
    async fn test_second_signal_is_busy() {
        let (manager, _gateway, _audit) = setup(PaperGatewayConfig::default());
        manager.on_signal(&buy_ce()).await.unwrap();
        assert_eq!(
            manager.on_signal(&buy_ce()).await.unwrap(),
            EntryOutcome::Busy(PositionState::Open)
        );
    }

    #[tokio::test]
    async fn test_entry_timeout_returns_to_flat() {
        let (manager, gateway, audit) = setup(PaperGatewayConfig {
            hold_entries: true,
            ..Default::default()
        });

        let outcome = manager.on_signal(&buy_ce()).await.unwrap();
        assert!(matches!(outcome, EntryOutcome::Aborted { .. }));
        assert_eq!(manager.state(), PositionState::Flat);
        assert!(manager.position().is_none());
        assert_eq!(gateway.counts().cancels, 1);
        assert!(audit
            .events()
            .iter()
            .any(|e| matches!(e, LifecycleEvent::EntryAborted { .. })));
    }

    #[tokio::test]
    async fn test_stop_loss_failure_flattens() {
        let (manager, gateway, _audit) = setup(PaperGatewayConfig {
            fail_stop_loss: true,
            ..Default::default()
        });

        let EntryOutcome::ProtectionFailed(position) = manager.on_signal(&buy_ce()).await.unwrap()
        else {
            panic!("expected protection failure");
        };
        assert_eq!(position.status, PositionState::Closed);
        assert_eq!(position.exit_reason, Some(ExitReason::ProtectionFailed));
        assert_eq!(manager.state(), PositionState::Flat);
        assert_eq!(gateway.counts().exits, 1);
    }

    #[tokio::test]
    async fn test_manual_exit_cancels_stop() {
        let (manager, gateway, _audit) = setup(PaperGatewayConfig::default());
        manager.on_signal(&buy_ce()).await.unwrap();

        gateway.set_premium(120.0);
        let ExitOutcome::Closed(position) = manager.request_exit().await.unwrap() else {
            panic!("expected closed");
        };
        assert_relative_eq!(position.pnl_points, 20.0);
        assert_eq!(position.exit_reason, Some(ExitReason::Manual));
        assert_eq!(gateway.counts().cancels, 1);

        assert_eq!(
            manager.request_exit().await.unwrap(),
            ExitOutcome::NotOpen(PositionState::Flat)
        );
    }

    #[tokio::test]
    async fn test_manual_exit_waits_for_stop_when_cancel_fails() {
        let (manager, gateway, _audit) = setup(PaperGatewayConfig::default());
        manager.on_signal(&buy_ce()).await.unwrap();
        gateway.configure(PaperGatewayConfig {
            fail_cancel: true,
            ..Default::default()
        });

        let outcome = manager.request_exit().await.unwrap();
        assert!(matches!(outcome, ExitOutcome::Pending(_)));
        assert_eq!(manager.state(), PositionState::Exiting);
        assert!(manager.poll_orders().await.unwrap().is_none());
        assert_eq!(gateway.counts().exits, 0);

        // The stop is still live and closes the position itself
        gateway.set_premium(60.0);
        assert!(manager.poll_orders().await.unwrap().is_none());
        let closed = manager.poll_orders().await.unwrap().unwrap();
        assert_relative_eq!(closed.exit_premium.unwrap(), 70.0);
        assert_relative_eq!(closed.pnl_points, -30.0);
        assert_eq!(manager.state(), PositionState::Flat);
        assert_eq!(manager.closed_positions().len(), 1);

        let counts = gateway.counts();
        assert_eq!(counts.exits, 0);
        assert_eq!(counts.cancels, 0);
        assert!(manager.poll_orders().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_manual_exit_retries_cancel_before_market_exit() {
        let (manager, gateway, _audit) = setup(PaperGatewayConfig::default());
        manager.on_signal(&buy_ce()).await.unwrap();
        gateway.configure(PaperGatewayConfig {
            fail_cancel: true,
            ..Default::default()
        });
        gateway.set_premium(110.0);

        assert!(matches!(
            manager.request_exit().await.unwrap(),
            ExitOutcome::Pending(_)
        ));
        assert_eq!(gateway.counts().exits, 0);

        gateway.configure(PaperGatewayConfig::default());
        let closed = manager.poll_orders().await.unwrap().unwrap();
        assert_eq!(closed.exit_reason, Some(ExitReason::Manual));
        assert_relative_eq!(closed.pnl_points, 10.0);
        assert_eq!(manager.state(), PositionState::Flat);

        let counts = gateway.counts();
        assert_eq!(counts.cancels, 1);
        assert_eq!(counts.exits, 1);
    }

    #[test]
    fn test_rejects_multi_position_regime() {
        let mut policy = RegimePolicy::default();
        policy.max_concurrent_positions = 2;
        let result = PositionManager::new(
            Arc::new(policy),
            Arc::new(PaperGateway::new(PaperGatewayConfig::default(), 100.0)),
            Arc::new(MemoryAuditSink::new()),
            settings(),
        );
        assert!(matches!(result, Err(EngineError::Configuration(_))));
    }
}
