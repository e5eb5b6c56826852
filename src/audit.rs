//! Decision and lifecycle audit trail
//!
//! Every signal the aggregator produces (actionable or not) and every
//! position lifecycle step is handed to an [`AuditSink`]. Sinks must not
//! fail the caller: write errors are logged and swallowed.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::oms::{Contract, ExitReason, PositionId};
use crate::signal::Signal;

/// Position lifecycle events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    EntryRequested {
        position_id: PositionId,
        contract: Contract,
        quantity: u32,
    },
    EntryFilled {
        position_id: PositionId,
        premium: f64,
    },
    EntryAborted {
        position_id: PositionId,
        reason: String,
    },
    StopLossPlaced {
        position_id: PositionId,
        trigger: f64,
        limit: f64,
    },
    ProtectionFailed {
        position_id: PositionId,
        reason: String,
    },
    ExitStarted {
        position_id: PositionId,
        reason: ExitReason,
    },
    PositionClosed {
        position_id: PositionId,
        exit_premium: f64,
        pnl_points: f64,
        pnl_value: f64,
        reason: ExitReason,
    },
    GatewayError {
        position_id: Option<PositionId>,
        operation: String,
        error: String,
    },
}

pub trait AuditSink: Send + Sync {
    fn record_signal(&self, signal: &Signal);

    fn record_event(&self, event: &LifecycleEvent);
}

/// Writes audit entries to the tracing log
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record_signal(&self, signal: &Signal) {
        let trail = signal
            .outcomes
            .iter()
            .map(|o| format!("{}={}", o.filter_name, if o.passed { "pass" } else { "fail" }))
            .collect::<Vec<_>>()
            .join(", ");
        info!(
            target: "audit",
            signal = %signal.signal_type,
            direction = %signal.crossover.direction,
            timestamp = %signal.timestamp,
            trail = %trail,
            "Signal"
        );
    }

    fn record_event(&self, event: &LifecycleEvent) {
        info!(target: "audit", event = ?event, "Lifecycle");
    }
}

#[derive(Serialize)]
struct AuditRecord<'a, T: Serialize> {
    recorded_at: DateTime<Utc>,
    kind: &'static str,
    payload: &'a T,
}

/// Appends one JSON object per line
pub struct JsonlAuditSink {
    writer: Mutex<BufWriter<File>>,
}

impl JsonlAuditSink {
    pub fn create(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    fn append<T: Serialize>(&self, kind: &'static str, payload: &T) {
        let record = AuditRecord {
            recorded_at: Utc::now(),
            kind,
            payload,
        };
        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(e) => {
                warn!(kind, error = %e, "Failed to serialize audit record");
                return;
            }
        };

        let mut writer = self.writer.lock();
        if let Err(e) = writeln!(writer, "{line}").and_then(|_| writer.flush()) {
            warn!(kind, error = %e, "Failed to write audit record");
        }
    }
}

impl AuditSink for JsonlAuditSink {
    fn record_signal(&self, signal: &Signal) {
        self.append("signal", signal);
    }

    fn record_event(&self, event: &LifecycleEvent) {
        self.append("lifecycle", event);
    }
}

/// Keeps everything in memory; used by tests and session summaries
#[derive(Default)]
pub struct MemoryAuditSink {
    signals: Mutex<Vec<Signal>>,
    events: Mutex<Vec<LifecycleEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signals(&self) -> Vec<Signal> {
        self.signals.lock().clone()
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().clone()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record_signal(&self, signal: &Signal) {
        self.signals.lock().push(signal.clone());
    }

    fn record_event(&self, event: &LifecycleEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Forwards to several sinks in order
pub struct FanoutAuditSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl FanoutAuditSink {
    pub fn new(sinks: Vec<Arc<dyn AuditSink>>) -> Self {
        Self { sinks }
    }
}

impl AuditSink for FanoutAuditSink {
    fn record_signal(&self, signal: &Signal) {
        for sink in &self.sinks {
            sink.record_signal(signal);
        }
    }

    fn record_event(&self, event: &LifecycleEvent) {
        for sink in &self.sinks {
            sink.record_event(event);
        }
    }
}
