//! Paper trading gateway
//!
//! Simulates broker order handling against a single externally driven
//! premium. Entries and exits fill at the premium current when they are
//! placed. A stop-loss reports TRIGGERED the first time it is polled at or
//! below its trigger and FILLED (at the trigger) on the next poll.
//!
//! Failure injection covers the broker paths the position manager must
//! survive: rejected entries, entries that never fill, stop-loss placement
//! errors and failed cancels.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::debug;

use super::gateway::{OrderGateway, QuoteSource};
use super::types::{Contract, OrderHandle, OrderStatus};
use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PaperGatewayConfig {
    /// Entries are accepted then reported REJECTED
    pub reject_entries: bool,
    /// Entries stay PENDING until cancelled
    pub hold_entries: bool,
    /// `place_stop_loss` returns an error
    pub fail_stop_loss: bool,
    /// `cancel` returns an error
    pub fail_cancel: bool,
}

/// Orders placed so far, by kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PaperOrderCounts {
    pub entries: usize,
    pub stop_losses: usize,
    pub exits: usize,
    pub cancels: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum PaperOrderKind {
    Entry,
    StopLoss { trigger: f64 },
    Exit,
}

#[derive(Debug)]
struct PaperOrder {
    kind: PaperOrderKind,
    status: OrderStatus,
}

#[derive(Debug)]
struct PaperBook {
    config: PaperGatewayConfig,
    premium: f64,
    orders: HashMap<OrderHandle, PaperOrder>,
    seq: u64,
    counts: PaperOrderCounts,
}

impl PaperBook {
    fn insert(&mut self, kind: PaperOrderKind, status: OrderStatus) -> OrderHandle {
        self.seq += 1;
        let handle = OrderHandle(format!("PAPER-{}", self.seq));
        match kind {
            PaperOrderKind::Entry => self.counts.entries += 1,
            PaperOrderKind::StopLoss { .. } => self.counts.stop_losses += 1,
            PaperOrderKind::Exit => self.counts.exits += 1,
        }
        self.orders.insert(handle.clone(), PaperOrder { kind, status });
        handle
    }
}

pub struct PaperGateway {
    book: Mutex<PaperBook>,
}

impl PaperGateway {
    pub fn new(config: PaperGatewayConfig, initial_premium: f64) -> Self {
        Self {
            book: Mutex::new(PaperBook {
                config,
                premium: initial_premium,
                orders: HashMap::new(),
                seq: 0,
                counts: PaperOrderCounts::default(),
            }),
        }
    }

    pub fn set_premium(&self, premium: f64) {
        self.book.lock().premium = premium;
    }

    pub fn premium(&self) -> f64 {
        self.book.lock().premium
    }

    /// Change failure injection for subsequent orders
    pub fn configure(&self, config: PaperGatewayConfig) {
        self.book.lock().config = config;
    }

    pub fn counts(&self) -> PaperOrderCounts {
        self.book.lock().counts
    }
}

#[async_trait]
impl OrderGateway for PaperGateway {
    async fn place_entry(&self, contract: &Contract, quantity: u32) -> EngineResult<OrderHandle> {
        let mut book = self.book.lock();
        let status = if book.config.reject_entries {
            OrderStatus::Rejected {
                reason: "paper: entry rejected".to_string(),
            }
        } else if book.config.hold_entries {
            OrderStatus::Pending
        } else {
            OrderStatus::Filled {
                average_price: book.premium,
            }
        };
        let handle = book.insert(PaperOrderKind::Entry, status);
        debug!(order = %handle, contract = %contract, quantity, "Paper entry");
        Ok(handle)
    }

    async fn place_stop_loss(
        &self,
        contract: &Contract,
        trigger: f64,
        limit: f64,
        quantity: u32,
    ) -> EngineResult<OrderHandle> {
        let mut book = self.book.lock();
        if book.config.fail_stop_loss {
            return Err(EngineError::gateway("paper: stop-loss placement failed"));
        }
        let handle = book.insert(PaperOrderKind::StopLoss { trigger }, OrderStatus::Pending);
        debug!(order = %handle, contract = %contract, trigger, limit, quantity, "Paper stop-loss");
        Ok(handle)
    }

    async fn place_exit(&self, contract: &Contract, quantity: u32) -> EngineResult<OrderHandle> {
        let mut book = self.book.lock();
        let status = OrderStatus::Filled {
            average_price: book.premium,
        };
        let handle = book.insert(PaperOrderKind::Exit, status);
        debug!(order = %handle, contract = %contract, quantity, "Paper exit");
        Ok(handle)
    }

    async fn get_status(&self, handle: &OrderHandle) -> EngineResult<OrderStatus> {
        let mut book = self.book.lock();
        let premium = book.premium;
        let order = book
            .orders
            .get_mut(handle)
            .ok_or_else(|| EngineError::gateway(format!("unknown order {handle}")))?;

        if let PaperOrderKind::StopLoss { trigger } = order.kind {
            order.status = match order.status {
                OrderStatus::Pending if premium <= trigger => OrderStatus::Triggered,
                OrderStatus::Triggered => OrderStatus::Filled {
                    average_price: trigger,
                },
                ref other => other.clone(),
            };
        }
        Ok(order.status.clone())
    }

    async fn cancel(&self, handle: &OrderHandle) -> EngineResult<()> {
        let mut book = self.book.lock();
        if book.config.fail_cancel {
            return Err(EngineError::gateway("paper: cancel failed"));
        }
        book.counts.cancels += 1;
        let order = book
            .orders
            .get_mut(handle)
            .ok_or_else(|| EngineError::gateway(format!("unknown order {handle}")))?;

        match order.status {
            OrderStatus::Pending => {
                order.status = OrderStatus::Rejected {
                    reason: "cancelled".to_string(),
                };
                Ok(())
            }
            ref other => Err(EngineError::gateway(format!(
                "order {handle} cannot be cancelled in state {other:?}"
            ))),
        }
    }
}

#[async_trait]
impl QuoteSource for PaperGateway {
    async fn current_premium(&self, _contract: &Contract) -> EngineResult<f64> {
        Ok(self.premium())
    }
}
