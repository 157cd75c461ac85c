//! State-change audit log: a bounded ring buffer on the master grid plus
//! a structured event stream exposed to the control surface.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::{Cause, Order, SlotId};

/// Category of an audit event, used both for the bounded grid-mutation
/// ring and for the broader audit stream exposed over the control
/// surface. Each category maps to a `log` target (`audit::<category>`)
/// so existing log-level filtering selects it without a bespoke event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditCategory {
    FundChanges,
    OrderStateChanges,
    FillEvents,
    BoundaryEvents,
    ErrorWarnings,
    EdgeCases,
}

impl AuditCategory {
    pub fn log_target(&self) -> &'static str {
        match self {
            AuditCategory::FundChanges => "audit::fund_changes",
            AuditCategory::OrderStateChanges => "audit::order_state_changes",
            AuditCategory::FillEvents => "audit::fill_events",
            AuditCategory::BoundaryEvents => "audit::boundary_events",
            AuditCategory::ErrorWarnings => "audit::error_warnings",
            AuditCategory::EdgeCases => "audit::edge_cases",
        }
    }
}

/// One entry in the master grid's bounded mutation ring: the order before
/// and after a call to `apply_order_update`, with the cause tag supplied
/// by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub slot_id: SlotId,
    pub old_order: Option<Order>,
    pub new_order: Order,
    pub cause: Cause,
    pub master_version: u64,
    pub at: DateTime<Utc>,
}

/// Bounded ring of the last `capacity` mutations applied to the master
/// grid. Oldest entries are dropped first.
#[derive(Debug, Clone)]
pub struct AuditRing {
    capacity: usize,
    entries: VecDeque<AuditEntry>,
}

impl AuditRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, entry: AuditEntry) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn iter(&self) -> impl Iterator<Item = &AuditEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Emit a structured audit line through the `log` facade under the
/// category's target, so category-level filtering works via
/// `RUST_LOG=audit::fund_changes=debug` style env filters.
#[macro_export]
macro_rules! audit_event {
    ($category:expr, $($arg:tt)+) => {{
        let target = $category.log_target();
        log::info!(target: target, $($arg)+);
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Order, OrderKind};

    fn dummy_order(id: &str) -> Order {
        Order::spread(id.to_string(), 100.0)
    }

    #[test]
    fn ring_drops_oldest_beyond_capacity() {
        let mut ring = AuditRing::new(2);
        for i in 0..3 {
            ring.push(AuditEntry {
                slot_id: format!("slot-{i}"),
                old_order: None,
                new_order: dummy_order(&format!("slot-{i}")),
                cause: "test".into(),
                master_version: i as u64,
                at: Utc::now(),
            });
        }
        assert_eq!(ring.len(), 2);
        let ids: Vec<_> = ring.iter().map(|e| e.slot_id.clone()).collect();
        assert_eq!(ids, vec!["slot-1", "slot-2"]);
    }

    #[test]
    fn categories_have_distinct_targets() {
        let all = [
            AuditCategory::FundChanges,
            AuditCategory::OrderStateChanges,
            AuditCategory::FillEvents,
            AuditCategory::BoundaryEvents,
            AuditCategory::ErrorWarnings,
            AuditCategory::EdgeCases,
        ];
        let mut targets: Vec<_> = all.iter().map(|c| c.log_target()).collect();
        targets.sort();
        targets.dedup();
        assert_eq!(targets.len(), all.len());
        let _ = OrderKind::Buy;
    }
}
