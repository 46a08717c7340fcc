//! The slot table - maps every hash slot to its owning backend address.
//!
//! Readers and writers are concurrent behind a shared-read lock; the lock is
//! never held across an await point. A reader that observes a stale owner is
//! corrected downstream by the backend's redirection reply, so per-slot
//! atomicity is all that is required.

use std::sync::Arc;

use ferry_core::{Slot, SLOT_COUNT};
use tokio::sync::RwLock;

use crate::request::SlotInfo;

/// Maps slot number to owning backend address.
pub struct SlotTable {
    owners: RwLock<Vec<Option<Arc<str>>>>,
}

impl SlotTable {
    /// Creates an empty table; every slot is unowned until the first load.
    #[must_use]
    pub fn new() -> Self {
        Self {
            owners: RwLock::new(vec![None; SLOT_COUNT as usize]),
        }
    }

    /// Returns the current owner of a slot.
    pub async fn get(&self, slot: Slot) -> Option<Arc<str>> {
        self.owners.read().await[slot.get() as usize].clone()
    }

    /// Applies one range assignment.
    pub async fn set(&self, info: &SlotInfo) {
        let mut owners = self.owners.write().await;
        for slot in info.start.get()..=info.end.get() {
            owners[slot as usize] = Some(Arc::clone(&info.master));
        }
    }

    /// Applies a full set of range assignments.
    pub async fn set_bulk(&self, infos: &[SlotInfo]) {
        let mut owners = self.owners.write().await;
        for info in infos {
            for slot in info.start.get()..=info.end.get() {
                owners[slot as usize] = Some(Arc::clone(&info.master));
            }
        }
    }

    /// Number of slots that currently have an owner.
    pub async fn covered(&self) -> usize {
        self.owners
            .read()
            .await
            .iter()
            .filter(|owner| owner.is_some())
            .count()
    }
}

impl Default for SlotTable {
    fn default() -> Self {
        Self::new()
    }
}
