//! State transfer metrics.
//!
//! Prometheus-style counters and gauges, one [`StateTransferMetrics`] per
//! cache per node. The admin surface exposes them through
//! [`StateTransferMetrics::snapshot`].
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                 StateTransferMetrics                 │
//! │  ┌──────────────────────────┐  ┌──────────────────┐  │
//! │  │ Counters                 │  │ Gauges           │  │
//! │  │ - segments requested     │  │ - inbound segs   │  │
//! │  │ - chunks / entries       │  │ - outbound segs  │  │
//! │  │ - stale writes discarded │  │ - inbound txs    │  │
//! │  │ - command retries        │  └──────────────────┘  │
//! │  └──────────────────────────┘                        │
//! └──────────────────────────────────────────────────────┘
//! ```

mod instruments;

pub use instruments::{Counter, Gauge, Instrument};

use serde::{Deserialize, Serialize};

/// Counters and gauges for one cache's topology and transfer activity.
#[derive(Debug)]
pub struct StateTransferMetrics {
    pub segments_requested: Counter,
    pub segments_completed: Counter,
    pub segments_cancelled: Counter,
    pub segments_lost: Counter,
    pub chunks_sent: Counter,
    pub entries_sent: Counter,
    pub entries_applied: Counter,
    /// Transfer writes dropped because a newer live write exists.
    pub stale_writes_discarded: Counter,
    pub transactions_received: Counter,
    pub transactions_sent: Counter,
    pub command_retries: Counter,
    pub topologies_applied: Counter,
    pub topologies_ignored: Counter,
    pub entries_invalidated: Counter,

    pub active_inbound_segments: Gauge,
    pub active_outbound_segments: Gauge,
    pub pending_transaction_requests: Gauge,
}

impl StateTransferMetrics {
    pub fn new() -> Self {
        Self {
            segments_requested: Counter::new(
                "st_segments_requested_total",
                "Segments requested from providers",
            ),
            segments_completed: Counter::new(
                "st_segments_completed_total",
                "Segments fully received",
            ),
            segments_cancelled: Counter::new(
                "st_segments_cancelled_total",
                "Inbound segment transfers cancelled by a newer topology",
            ),
            segments_lost: Counter::new(
                "st_segments_lost_total",
                "Segments with no remaining source to pull from",
            ),
            chunks_sent: Counter::new("st_chunks_sent_total", "State chunks sent"),
            entries_sent: Counter::new("st_entries_sent_total", "Entries sent to consumers"),
            entries_applied: Counter::new(
                "st_entries_applied_total",
                "Transferred entries written locally",
            ),
            stale_writes_discarded: Counter::new(
                "st_stale_writes_discarded_total",
                "Transferred entries dropped in favour of newer writes",
            ),
            transactions_received: Counter::new(
                "st_transactions_received_total",
                "Transactions received from previous owners",
            ),
            transactions_sent: Counter::new(
                "st_transactions_sent_total",
                "Transactions sent to new owners",
            ),
            command_retries: Counter::new(
                "st_command_retries_total",
                "Commands retried after an outdated topology",
            ),
            topologies_applied: Counter::new(
                "st_topologies_applied_total",
                "Topology updates installed",
            ),
            topologies_ignored: Counter::new(
                "st_topologies_ignored_total",
                "Out of order topology updates ignored",
            ),
            entries_invalidated: Counter::new(
                "st_entries_invalidated_total",
                "Entries removed after losing segment ownership",
            ),
            active_inbound_segments: Gauge::new(
                "st_active_inbound_segments",
                "Segments currently being received",
            ),
            active_outbound_segments: Gauge::new(
                "st_active_outbound_segments",
                "Segments currently being sent",
            ),
            pending_transaction_requests: Gauge::new(
                "st_pending_transaction_requests",
                "Transaction pulls not answered yet",
            ),
        }
    }

    fn instruments(&self) -> [&dyn Instrument; 17] {
        [
            &self.segments_requested,
            &self.segments_completed,
            &self.segments_cancelled,
            &self.segments_lost,
            &self.chunks_sent,
            &self.entries_sent,
            &self.entries_applied,
            &self.stale_writes_discarded,
            &self.transactions_received,
            &self.transactions_sent,
            &self.command_retries,
            &self.topologies_applied,
            &self.topologies_ignored,
            &self.entries_invalidated,
            &self.active_inbound_segments,
            &self.active_outbound_segments,
            &self.pending_transaction_requests,
        ]
    }

    /// Copy the values the admin surface reports.
    pub fn snapshot(&self) -> TransferStats {
        TransferStats {
            inbound_segments: self.active_inbound_segments.get_clamped(),
            outbound_segments: self.active_outbound_segments.get_clamped(),
            pending_transaction_requests: self.pending_transaction_requests.get_clamped(),
            segments_completed: self.segments_completed.get(),
            entries_applied: self.entries_applied.get(),
            stale_writes_discarded: self.stale_writes_discarded.get(),
            transactions_received: self.transactions_received.get(),
            command_retries: self.command_retries.get(),
        }
    }

    /// Prometheus exposition text, every sample labelled with `cache`.
    pub fn to_prometheus(&self, cache: &str) -> String {
        let mut output = String::new();
        for instrument in self.instruments() {
            instrument.render(cache, &mut output);
        }
        output
    }
}

impl Default for StateTransferMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// In-flight transfer counters reported to operational tooling.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferStats {
    pub inbound_segments: u64,
    pub outbound_segments: u64,
    pub pending_transaction_requests: u64,
    pub segments_completed: u64,
    pub entries_applied: u64,
    pub stale_writes_discarded: u64,
    pub transactions_received: u64,
    pub command_retries: u64,
}
