//! Test doubles shared by unit and integration tests.

pub mod mock_exchange;

pub use mock_exchange::{exchange_info_for, permissive_filters, MockExchange, SubmittedOrder};

use crate::audit::{AuditEvent, EventSink};
use std::sync::Mutex;

/// Keeps every emitted event in memory.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        MemorySink::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn order_events(&self) -> Vec<crate::audit::OrderEvent> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                AuditEvent::OrderStatusChange(order) => Some(order),
                _ => None,
            })
            .collect()
    }

    pub fn completed(&self) -> Vec<crate::audit::CompletedOpportunity> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                AuditEvent::ArbitrageCompleted(opp) => Some(opp),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: AuditEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
