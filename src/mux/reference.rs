//! Reference table: per data kind, which upstream feeds are open and how many
//! consumer fields hold each one.
//!
//! Every key runs a small state machine:
//!
//! ```text
//!  Absent ──acquire──▶ Activating ──ok──▶ Active
//!    ▲                     │                 │ last release
//!    └──────── failed ─────┘                 ▼
//!    └──────────── new holder ◀──────── Deactivating ──▶ (removed)
//! ```
//!
//! The table itself is plain data guarded by the multiplexer's registry lock.
//! Transitions that call out to the upstream are serialized per key through
//! the entry's `gate`, which callers hold across the hook call. Every settled
//! transition is announced on the entry's `settled` channel.

use std::sync::Arc;

use ahash::AHashMap as HashMap;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::warn;

use crate::mux::types::{ReferenceKey, UpstreamHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamState {
    Absent,
    Activating,
    Active(UpstreamHandle),
    Deactivating,
}

#[derive(Debug)]
pub struct ReferenceEntry {
    ref_count: usize,
    state: UpstreamState,
    generation: u64,
    gate: Arc<AsyncMutex<()>>,
    settled: watch::Sender<()>,
}

impl ReferenceEntry {
    pub fn ref_count(&self) -> usize {
        self.ref_count
    }

    pub fn state(&self) -> UpstreamState {
        self.state
    }

    /// Fires on the next settled transition, or closes when the entry is
    /// removed.
    pub fn watch(&self) -> watch::Receiver<()> {
        self.settled.subscribe()
    }

    fn announce(&self) {
        self.settled.send_replace(());
    }
}

/// Permission to drive one key's upstream transition.
///
/// A turn only acts on the entry it was issued for: once that entry is
/// removed and recreated the generation no longer matches and the turn is
/// a no-op.
#[derive(Debug, Clone)]
pub struct Turn {
    pub key: ReferenceKey,
    generation: u64,
    gate: Arc<AsyncMutex<()>>,
}

impl Turn {
    pub fn gate(&self) -> Arc<AsyncMutex<()>> {
        Arc::clone(&self.gate)
    }
}

#[derive(Debug, Default)]
pub struct ReferenceTable {
    entries: HashMap<ReferenceKey, ReferenceEntry>,
    next_generation: u64,
}

impl ReferenceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one holder. Returns a turn when the feed still has to be brought
    /// up (or is mid-transition) and the caller must settle it.
    pub fn acquire(&mut self, key: &ReferenceKey) -> Option<Turn> {
        let generation = &mut self.next_generation;
        let entry = self.entries.entry(key.clone()).or_insert_with(|| {
            *generation += 1;
            ReferenceEntry {
                ref_count: 0,
                state: UpstreamState::Absent,
                generation: *generation,
                gate: Arc::new(AsyncMutex::new(())),
                settled: watch::channel(()).0,
            }
        });
        entry.ref_count += 1;

        match entry.state {
            UpstreamState::Active(_) => None,
            _ => Some(Turn { key: key.clone(), generation: entry.generation, gate: Arc::clone(&entry.gate) }),
        }
    }

    /// Drop one holder. Returns a turn when this was the last one and the
    /// feed has to be torn down.
    pub fn release(&mut self, key: &ReferenceKey) -> Option<Turn> {
        let Some(entry) = self.entries.get_mut(key) else {
            warn!(%key, "Release of unknown reference ignored");
            return None;
        };
        if entry.ref_count == 0 {
            warn!(%key, "Release below zero ignored");
            return None;
        }
        entry.ref_count -= 1;
        (entry.ref_count == 0).then(|| Turn { key: key.clone(), generation: entry.generation, gate: Arc::clone(&entry.gate) })
    }

    fn current(&mut self, turn: &Turn) -> Option<&mut ReferenceEntry> {
        self.entries.get_mut(&turn.key).filter(|e| e.generation == turn.generation)
    }

    /// Claim the activation. `false` means someone else already brought the
    /// feed up, or nobody needs it any more.
    pub fn begin_activation(&mut self, turn: &Turn) -> bool {
        match self.current(turn) {
            Some(entry) if entry.state == UpstreamState::Absent && entry.ref_count > 0 => {
                entry.state = UpstreamState::Activating;
                true
            }
            _ => false,
        }
    }

    pub fn complete_activation(&mut self, turn: &Turn, handle: UpstreamHandle) {
        if let Some(entry) = self.current(turn) {
            entry.state = UpstreamState::Active(handle);
            entry.announce();
        }
    }

    /// Undo a failed activation. With `drop_holder` the caller's own count is
    /// taken back too. The entry disappears if nobody else holds it.
    pub fn abort_activation(&mut self, turn: &Turn, drop_holder: bool) {
        let Some(entry) = self.current(turn) else { return };
        if drop_holder {
            entry.ref_count = entry.ref_count.saturating_sub(1);
        }
        entry.state = UpstreamState::Absent;
        entry.announce();
        if entry.ref_count == 0 {
            self.entries.remove(&turn.key);
        }
    }

    /// Claim the teardown. Returns the handle to close when the feed is up
    /// and still unwanted. A holder that arrived since the last release
    /// supersedes the teardown and `None` is returned.
    pub fn begin_deactivation(&mut self, turn: &Turn) -> Option<UpstreamHandle> {
        let entry = self.current(turn)?;
        if entry.ref_count > 0 {
            return None;
        }
        let state = entry.state;
        match state {
            UpstreamState::Active(handle) => {
                entry.state = UpstreamState::Deactivating;
                Some(handle)
            }
            _ => {
                self.entries.remove(&turn.key);
                None
            }
        }
    }

    /// Finish a teardown. Holders that arrived meanwhile find the key
    /// `Absent` and re-activate it on their own turn.
    pub fn complete_deactivation(&mut self, turn: &Turn) {
        let Some(entry) = self.current(turn) else { return };
        if entry.ref_count == 0 {
            self.entries.remove(&turn.key);
        } else {
            entry.state = UpstreamState::Absent;
            entry.announce();
        }
    }

    pub fn get(&self, key: &ReferenceKey) -> Option<&ReferenceEntry> {
        self.entries.get(key)
    }

    pub fn ref_count(&self, key: &ReferenceKey) -> usize {
        self.entries.get(key).map_or(0, |e| e.ref_count)
    }

    pub fn is_active(&self, key: &ReferenceKey) -> bool {
        matches!(self.entries.get(key).map(|e| e.state), Some(UpstreamState::Active(_)))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
