//! The process-wide bounded migration slot (§5, §9 "Global mutable state").
//!
//! A single counting primitive, initialized once at startup, caps concurrent
//! outbound migrations across every [`super::driver::MigrationDriver`] in the
//! process. `setCapacity` documents, rather than enforces with a runtime
//! error visible to callers other than the first writer, the "must not be
//! called after any VM has run" contract from the original source — here
//! it's enforced: a second call fails.

use std::sync::{Arc, OnceLock};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

static SLOT: OnceLock<Arc<Semaphore>> = OnceLock::new();

const DEFAULT_CAPACITY: usize = 1;

#[derive(Debug, Clone, thiserror::Error)]
pub enum SlotError {
    #[error(
        "migration slot capacity already initialized (first use sets it implicitly); \
         set_capacity must be called before the first migration"
    )]
    AlreadyInitialized,
}

/// The global migration slot. Zero-sized — all state lives in the process
/// `static`, matching the original's class-level `_ongoingMigrations`.
pub struct MigrationSlot;

impl MigrationSlot {
    /// Sets the slot capacity. Must be called, if at all, before the first
    /// [`MigrationSlot::acquire`] anywhere in the process; otherwise the
    /// default capacity of 1 has already taken effect and this errors.
    pub fn set_capacity(n: usize) -> Result<(), SlotError> {
        SLOT.set(Arc::new(Semaphore::new(n)))
            .map_err(|_| SlotError::AlreadyInitialized)
    }

    fn semaphore() -> Arc<Semaphore> {
        SLOT.get_or_init(|| Arc::new(Semaphore::new(DEFAULT_CAPACITY)))
            .clone()
    }

    /// Blocks until a slot is free, then holds it until the returned permit
    /// is dropped. Invariant 3 of §3: held for exactly the interval between
    /// acquire and the hypervisor call's return.
    pub async fn acquire() -> OwnedSemaphorePermit {
        Self::semaphore()
            .acquire_owned()
            .await
            .expect("migration slot semaphore is never closed")
    }
}

#[cfg(test)]
pub(crate) fn available_permits() -> usize {
    MigrationSlot::semaphore().available_permits()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn permit_is_released_on_drop() {
        let before = available_permits();
        let permit = MigrationSlot::acquire().await;
        assert_eq!(available_permits(), before - 1);
        drop(permit);
        assert_eq!(available_permits(), before);
    }
}
