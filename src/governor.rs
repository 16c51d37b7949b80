//! Non-blocking admission control per (tier, resource class).
//!
//! [`QueueGovernor::reserve`] never waits: at capacity it answers `None`
//! straight away so the coordinator can reroute the work to the next tier.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::process::{ResourceClass, TierKind};

type PairKey = (TierKind, ResourceClass);

#[derive(Debug)]
struct Slot {
    capacity: usize,
    outstanding: AtomicUsize,
}

impl Slot {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            outstanding: AtomicUsize::new(0),
        }
    }

    fn try_acquire(&self) -> bool {
        self.outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .is_ok()
    }
}

/// Capacity bookkeeping shared by every job. Construct once and pass the
/// handle around.
#[derive(Debug)]
pub struct QueueGovernor {
    slots: RwLock<HashMap<PairKey, Arc<Slot>>>,
    default_capacity: usize,
    next_id: AtomicU64,
}

impl QueueGovernor {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            default_capacity,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        config
            .capacities
            .iter()
            .fold(Self::new(config.default_capacity), |g, c| {
                g.with_capacity(c.tier, c.class, c.capacity)
            })
    }

    pub fn with_capacity(self, tier: TierKind, class: ResourceClass, capacity: usize) -> Self {
        self.slots
            .write()
            .insert((tier, class), Arc::new(Slot::new(capacity)));
        self
    }

    fn slot(&self, tier: TierKind, class: ResourceClass) -> Arc<Slot> {
        if let Some(slot) = self.slots.read().get(&(tier, class)) {
            return Arc::clone(slot);
        }
        let mut slots = self.slots.write();
        Arc::clone(
            slots
                .entry((tier, class))
                .or_insert_with(|| Arc::new(Slot::new(self.default_capacity))),
        )
    }

    /// Check-and-increment. Returns `None` immediately when the pair is full.
    pub fn reserve(&self, tier: TierKind, class: ResourceClass) -> Option<Reservation> {
        let slot = self.slot(tier, class);
        if !slot.try_acquire() {
            debug!(%tier, %class, capacity = slot.capacity, "reservation rejected");
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(reservation = id, %tier, %class, "reservation granted");
        Some(Reservation {
            id,
            tier,
            class,
            slot,
            released: AtomicBool::new(false),
        })
    }

    pub fn outstanding(&self, tier: TierKind, class: ResourceClass) -> usize {
        self.slots
            .read()
            .get(&(tier, class))
            .map(|s| s.outstanding.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub fn capacity(&self, tier: TierKind, class: ResourceClass) -> usize {
        self.slots
            .read()
            .get(&(tier, class))
            .map(|s| s.capacity)
            .unwrap_or(self.default_capacity)
    }
}

/// One admitted unit of work against one (tier, class) pair.
///
/// Released exactly once: explicitly through [`Reservation::release`], or on
/// drop if the holder never released it.
#[derive(Debug)]
pub struct Reservation {
    id: u64,
    tier: TierKind,
    class: ResourceClass,
    slot: Arc<Slot>,
    released: AtomicBool,
}

impl Reservation {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn tier(&self) -> TierKind {
        self.tier
    }

    pub fn class(&self) -> ResourceClass {
        self.class
    }

    pub fn release(&self) -> Result<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Err(EngineError::ReservationReleased(self.id));
        }
        self.slot.outstanding.fetch_sub(1, Ordering::AcqRel);
        debug!(reservation = self.id, tier = %self.tier, class = %self.class, "reservation released");
        Ok(())
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !*self.released.get_mut() {
            warn!(reservation = self.id, tier = %self.tier, "reservation dropped without release");
            *self.released.get_mut() = true;
            self.slot.outstanding.fetch_sub(1, Ordering::AcqRel);
        }
    }
}
