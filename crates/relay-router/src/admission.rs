//! Admission: dedup, pool lookup, and bounded enqueue.
//!
//! A message is admitted when its id is not already in flight, its pool
//! exists, and the pool's channel has room. Membership in the in-flight
//! set means exactly one lifecycle owns the message's finalisation.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

use crate::pool::{DispatchJob, WorkerPool};
use crate::telemetry;
use relay_common::{InFlightEntry, MessagePointer};
use relay_queue::QueueConsumer;

/// Process-wide set of admitted-but-unfinalised message ids.
#[derive(Default)]
pub struct InFlightSet {
    entries: DashMap<String, InFlightEntry>,
}

impl InFlightSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert atomically; false when the id is already present.
    pub fn insert(&self, entry: InFlightEntry) -> bool {
        match self.entries.entry(entry.message_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(entry);
                true
            }
        }
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.entries.contains_key(message_id)
    }

    pub fn remove(&self, message_id: &str) {
        self.entries.remove(message_id);
        telemetry::set_in_flight_count(self.entries.len());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Oldest-first snapshot for the monitoring API.
    pub fn snapshot(&self, limit: usize) -> Vec<InFlightEntry> {
        let mut entries: Vec<InFlightEntry> =
            self.entries.iter().map(|e| e.value().clone()).collect();
        entries.sort_by(|a, b| b.elapsed_ms().cmp(&a.elapsed_ms()));
        entries.truncate(limit);
        entries
    }
}

/// Outcome of routing one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionVerdict {
    Admitted,
    /// Already in flight in this instance: leave unacked, the broker
    /// redelivers after its visibility timeout.
    Duplicate,
    /// No pool with the message's code: nack so the broker's
    /// max-receive-count eventually moves it to the DLQ.
    UnknownPool,
    /// The pool channel is full: leave unacked for redelivery.
    PoolFull,
}

pub struct Admission {
    in_flight: Arc<InFlightSet>,
    pools: Arc<DashMap<String, Arc<WorkerPool>>>,
}

impl Admission {
    pub fn new(
        in_flight: Arc<InFlightSet>,
        pools: Arc<DashMap<String, Arc<WorkerPool>>>,
    ) -> Self {
        Self { in_flight, pools }
    }

    /// Route a message: dedup, pool lookup, atomic in-flight insert,
    /// then a non-blocking send to the pool channel.
    pub fn route(
        &self,
        pointer: MessagePointer,
        consumer: Arc<dyn QueueConsumer>,
    ) -> AdmissionVerdict {
        let message_id = pointer.message.id.clone();
        let pool_code = pointer.message.pool_code.clone();

        if self.in_flight.contains(&message_id) {
            debug!(message_id = %message_id, "Duplicate message, already in flight");
            telemetry::record_admission_rejected(&pool_code, "duplicate");
            return AdmissionVerdict::Duplicate;
        }

        let Some(pool) = self.pools.get(&pool_code).map(|p| Arc::clone(&p)) else {
            telemetry::record_admission_rejected(&pool_code, "unknown_pool");
            return AdmissionVerdict::UnknownPool;
        };

        if !self.in_flight.insert(InFlightEntry::new(&pointer)) {
            // Lost the race with a concurrent delivery of the same id.
            debug!(message_id = %message_id, "Duplicate message, lost admission race");
            telemetry::record_admission_rejected(&pool_code, "duplicate");
            return AdmissionVerdict::Duplicate;
        }

        let job = DispatchJob { pointer, consumer };
        match pool.try_submit(job) {
            Ok(()) => AdmissionVerdict::Admitted,
            Err(_) => {
                self.in_flight.remove(&message_id);
                telemetry::record_admission_rejected(&pool_code, "pool_full");
                AdmissionVerdict::PoolFull
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_common::Message;

    fn entry(id: &str) -> InFlightEntry {
        let pointer = MessagePointer::new(
            Message {
                id: id.to_string(),
                pool_code: "P1".to_string(),
                mediation_target: "https://t.example".to_string(),
                auth_token: None,
                timeout_seconds: None,
            },
            "receipt".to_string(),
            "q".to_string(),
        );
        InFlightEntry::new(&pointer)
    }

    #[test]
    fn insert_is_exclusive() {
        let set = InFlightSet::new();

        assert!(set.insert(entry("m1")));
        assert!(!set.insert(entry("m1")));
        assert_eq!(set.len(), 1);

        set.remove("m1");
        assert!(set.is_empty());
        assert!(set.insert(entry("m1")));
    }

    #[test]
    fn snapshot_respects_limit() {
        let set = InFlightSet::new();
        for i in 0..5 {
            set.insert(entry(&format!("m{}", i)));
        }
        assert_eq!(set.snapshot(3).len(), 3);
        assert_eq!(set.snapshot(10).len(), 5);
    }
}
