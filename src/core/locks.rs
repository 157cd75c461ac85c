//! Per-slot lease locks.
//!
//! Per the redesign note in the design: rather than a lease map with a
//! background timer reaping expired entries, leases are a slot-indexed
//! table of `{holder, expires_at}` checked lazily on access. An expired
//! lease is simply treated as free the next time anyone asks for it.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use uuid::Uuid;

use super::types::SlotId;

/// Opaque lease ownership token.
pub type LeaseId = Uuid;

struct Lease {
    holder: LeaseId,
    expires_at: Instant,
}

/// Lazily-expiring per-slot lock table.
pub struct SlotLeases {
    timeout: Duration,
    leases: HashMap<SlotId, Lease>,
}

impl SlotLeases {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            leases: HashMap::new(),
        }
    }

    fn is_live(lease: &Lease, now: Instant) -> bool {
        lease.expires_at > now
    }

    /// Attempt to acquire the lease for `slot_id`. Succeeds if the slot is
    /// unleased or its existing lease has expired.
    pub fn acquire(&mut self, slot_id: &SlotId) -> Option<LeaseId> {
        let now = Instant::now();
        if let Some(existing) = self.leases.get(slot_id) {
            if Self::is_live(existing, now) {
                return None;
            }
        }
        let id = Uuid::new_v4();
        self.leases.insert(
            slot_id.clone(),
            Lease {
                holder: id,
                expires_at: now + self.timeout,
            },
        );
        Some(id)
    }

    /// Refresh a held lease, extending its expiry. Fails if the caller is
    /// not (or no longer) the holder.
    pub fn refresh(&mut self, slot_id: &SlotId, holder: LeaseId) -> bool {
        let now = Instant::now();
        match self.leases.get_mut(slot_id) {
            Some(lease) if lease.holder == holder && Self::is_live(lease, now) => {
                lease.expires_at = now + self.timeout;
                true
            }
            _ => false,
        }
    }

    /// Release a held lease early.
    pub fn release(&mut self, slot_id: &SlotId, holder: LeaseId) {
        if let Some(lease) = self.leases.get(slot_id) {
            if lease.holder == holder {
                self.leases.remove(slot_id);
            }
        }
    }

    /// Whether `slot_id` currently has a live lease (reclaiming it first
    /// if expired).
    pub fn is_locked(&mut self, slot_id: &SlotId) -> bool {
        let now = Instant::now();
        match self.leases.get(slot_id) {
            Some(lease) if Self::is_live(lease, now) => true,
            Some(_) => {
                self.leases.remove(slot_id);
                false
            }
            None => false,
        }
    }
}
