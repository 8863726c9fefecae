//! Server-side cursors handed out in bounded batches.
//!
//! Cursors live in the slots of an arena. A [`CursorHandle`] carries the slot
//! index plus the slot's generation, so a handle kept past reclamation never
//! resolves to a newer cursor in the same slot. A batch checks the cursor out
//! of its slot for the duration of the store fetch; a second `next` on the
//! same handle meanwhile is rejected as busy.

use crate::Document;
use crate::error::Result;
use crate::store::StoreCursor;
use std::mem;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorError {
    #[error("unknown cursor")]
    Unknown,
    #[error("cursor is busy with another batch")]
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CursorHandle {
    index: u32,
    generation: u32,
}

/// One batch of results. `exhausted` means the cursor is gone.
#[derive(Debug)]
pub struct Batch {
    pub docs: Vec<Document>,
    pub exhausted: bool,
}

struct OpenCursor<C> {
    inner: C,
    lookahead: Option<Document>,
    batch_size: usize,
    last_access: Instant,
}

enum Slot<C> {
    Free,
    Idle(OpenCursor<C>),
    Busy { abandoned: bool },
}

struct Entry<C> {
    generation: u32,
    slot: Slot<C>,
}

struct Slots<C> {
    entries: Vec<Entry<C>>,
    free: Vec<u32>,
}

impl<C> Slots<C> {
    fn entry(&mut self, handle: CursorHandle) -> Option<&mut Entry<C>> {
        self.entries
            .get_mut(handle.index as usize)
            .filter(|e| e.generation == handle.generation)
    }

    fn release(&mut self, index: u32) {
        if let Some(e) = self.entries.get_mut(index as usize) {
            e.slot = Slot::Free;
            e.generation = e.generation.wrapping_add(1);
            self.free.push(index);
        }
    }
}

pub struct CursorManager<C> {
    slots: Mutex<Slots<C>>,
}

impl<C: StoreCursor> Default for CursorManager<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: StoreCursor> CursorManager<C> {
    pub fn new() -> Self {
        Self { slots: Mutex::new(Slots { entries: Vec::new(), free: Vec::new() }) }
    }

    /// Register a store cursor; batches hold at most `batch_size` documents.
    pub async fn open(&self, cursor: C, batch_size: usize) -> CursorHandle {
        let open = OpenCursor { inner: cursor, lookahead: None, batch_size: batch_size.max(1), last_access: Instant::now() };
        let mut slots = self.slots.lock().await;
        if let Some(index) = slots.free.pop() {
            let entry = &mut slots.entries[index as usize];
            entry.slot = Slot::Idle(open);
            return CursorHandle { index, generation: entry.generation };
        }
        let index = slots.entries.len() as u32;
        slots.entries.push(Entry { generation: 0, slot: Slot::Idle(open) });
        CursorHandle { index, generation: 0 }
    }

    /// Next batch. Reads one document past the batch so that a final batch
    /// of exactly `batch_size` is reported as exhausted.
    pub async fn next(&self, handle: CursorHandle) -> Result<Batch> {
        let mut open = self.checkout(handle).await?;
        let want = open.batch_size.saturating_add(1) - usize::from(open.lookahead.is_some());
        let fetched = match open.inner.fetch(want).await {
            Ok(docs) => docs,
            Err(e) => {
                self.slots.lock().await.release(handle.index);
                open.inner.close().await;
                return Err(e);
            }
        };
        let mut docs: Vec<Document> = open.lookahead.take().into_iter().chain(fetched).collect();
        if docs.len() > open.batch_size {
            open.lookahead = docs.pop();
            open.last_access = Instant::now();
            if let Some(orphan) = self.checkin(handle, open).await {
                orphan.inner.close().await;
            }
            return Ok(Batch { docs, exhausted: false });
        }
        self.slots.lock().await.release(handle.index);
        open.inner.close().await;
        Ok(Batch { docs, exhausted: true })
    }

    /// Abandon a cursor. A cursor in the middle of a batch is closed once
    /// that batch completes.
    pub async fn close(&self, handle: CursorHandle) {
        let open = {
            let mut slots = self.slots.lock().await;
            let Some(entry) = slots.entry(handle) else {
                return;
            };
            match mem::replace(&mut entry.slot, Slot::Free) {
                Slot::Idle(open) => {
                    slots.release(handle.index);
                    open
                }
                Slot::Busy { .. } => {
                    entry.slot = Slot::Busy { abandoned: true };
                    return;
                }
                Slot::Free => return,
            }
        };
        open.inner.close().await;
    }

    /// Reclaim idle cursors not touched for longer than `ttl`; returns how
    /// many were reclaimed. Busy cursors are left alone.
    pub async fn sweep(&self, ttl: Duration) -> usize {
        let now = Instant::now();
        let expired: Vec<OpenCursor<C>> = {
            let mut slots = self.slots.lock().await;
            let stale: Vec<u32> = slots
                .entries
                .iter()
                .enumerate()
                .filter_map(|(i, e)| match &e.slot {
                    Slot::Idle(open) if now.duration_since(open.last_access) > ttl => Some(i as u32),
                    _ => None,
                })
                .collect();
            let mut out = Vec::with_capacity(stale.len());
            for index in stale {
                if let Slot::Idle(open) = mem::replace(&mut slots.entries[index as usize].slot, Slot::Free) {
                    out.push(open);
                }
                slots.release(index);
            }
            out
        };
        let n = expired.len();
        for open in expired {
            open.inner.close().await;
        }
        if n > 0 {
            tracing::debug!(reclaimed = n, "reclaimed idle cursors");
        }
        n
    }

    /// Open cursors, busy ones included.
    pub async fn len(&self) -> usize {
        let slots = self.slots.lock().await;
        slots.entries.iter().filter(|e| !matches!(e.slot, Slot::Free)).count()
    }

    /// Whether `handle` still names an open cursor.
    pub async fn contains(&self, handle: CursorHandle) -> bool {
        let mut slots = self.slots.lock().await;
        slots.entry(handle).is_some_and(|e| !matches!(e.slot, Slot::Free))
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn checkout(&self, handle: CursorHandle) -> Result<OpenCursor<C>> {
        let mut slots = self.slots.lock().await;
        let entry = slots.entry(handle).ok_or(CursorError::Unknown)?;
        match mem::replace(&mut entry.slot, Slot::Busy { abandoned: false }) {
            Slot::Idle(open) => Ok(open),
            Slot::Busy { abandoned } => {
                entry.slot = Slot::Busy { abandoned };
                Err(CursorError::Busy.into())
            }
            Slot::Free => {
                entry.slot = Slot::Free;
                Err(CursorError::Unknown.into())
            }
        }
    }

    // Hands the cursor back when it was abandoned meanwhile.
    async fn checkin(&self, handle: CursorHandle, open: OpenCursor<C>) -> Option<OpenCursor<C>> {
        let mut slots = self.slots.lock().await;
        let Some(entry) = slots.entry(handle) else {
            return Some(open);
        };
        match entry.slot {
            Slot::Busy { abandoned: false } => {
                entry.slot = Slot::Idle(open);
                None
            }
            _ => {
                slots.release(handle.index);
                Some(open)
            }
        }
    }
}
