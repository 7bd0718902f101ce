//! At-most-once injection of initial content into an empty room.
//!
//! ```text
//! wait synced ─► fire guard ─► empty? ─► parse ─► sleep(seed_delay) ─► still empty? ─► insert
//!                    │            │         │              │                  │
//!             AlreadyAttempted  NotEmpty  NothingToSeed  RoomClosed      RacedByPeer
//! ```
//!
//! The delay lets a faster peer's seed arrive before we re-check. Two
//! clients that both pass the re-check will each insert, and the document
//! then holds the content twice; both still converge on the same content.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::binding::EditorEngine;
use crate::provider::RoomHandle;

/// Per-room-instance record of whether seeding was attempted.
#[derive(Debug, Default)]
pub struct SeedGuard(AtomicBool);

impl SeedGuard {
    pub fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Mark as fired. Returns `true` only for the first caller.
    pub fn fire(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }

    pub fn has_fired(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeedOutcome {
    /// Content was inserted and broadcast.
    Inserted { blocks: usize },
    DocumentNotEmpty,
    /// A peer's content arrived during the delay.
    RacedByPeer,
    /// No initial content, or it parsed to nothing.
    NothingToSeed,
    AlreadyAttempted,
    /// The room was destroyed before it ever synced.
    NeverSynced,
    /// The room went away during the delay.
    RoomClosed,
    InsertFailed(String),
}

#[derive(Debug, Clone)]
pub struct SeedingController {
    delay: Duration,
}

impl SeedingController {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub async fn run<E: EditorEngine>(
        &self,
        handle: RoomHandle,
        engine: &E,
        initial: Option<&str>,
    ) -> SeedOutcome {
        if !handle.wait_synced().await {
            log::debug!("Room {} never synced, not seeding", handle.room());
            return SeedOutcome::NeverSynced;
        }
        if !handle.seed_guard().fire() {
            return SeedOutcome::AlreadyAttempted;
        }
        if !handle.document().is_empty() {
            log::debug!("Room {} already has content", handle.room());
            return SeedOutcome::DocumentNotEmpty;
        }

        let source = match initial {
            Some(source) if !source.trim().is_empty() => source,
            _ => return SeedOutcome::NothingToSeed,
        };
        let blocks = engine.deserialize(source);
        if blocks.is_empty() {
            return SeedOutcome::NothingToSeed;
        }

        // Only a weak reference is held across the delay.
        let weak = handle.downgrade();
        drop(handle);
        tokio::time::sleep(self.delay).await;

        let Some(handle) = weak.upgrade() else {
            return SeedOutcome::RoomClosed;
        };
        if handle.is_destroyed() {
            return SeedOutcome::RoomClosed;
        }
        if !handle.document().is_empty() {
            log::info!("Room {} was seeded by a peer first", handle.room());
            return SeedOutcome::RacedByPeer;
        }

        match handle.document().insert_blocks(0, &blocks) {
            Ok(update) => {
                handle.submit_update(update);
                log::info!("Seeded room {} with {} blocks", handle.room(), blocks.len());
                SeedOutcome::Inserted {
                    blocks: blocks.len(),
                }
            }
            Err(e) => {
                log::error!("Seeding room {} failed: {e}", handle.room());
                SeedOutcome::InsertFailed(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_guard_fires_once() {
        let guard = SeedGuard::new();
        assert!(!guard.has_fired());
        assert!(guard.fire());
        assert!(!guard.fire());
        assert!(guard.has_fired());
    }

    #[test]
    fn test_guards_are_independent() {
        let a = SeedGuard::new();
        let b = SeedGuard::default();
        a.fire();
        assert!(!b.has_fired());
    }
}
