use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::disk::PAGE_SIZE;
use crate::error::{Error, Result};

/// Identifies a page on disk. `PageId(0)` is never a valid allocated page id,
/// which is what lets both page images use it as their "uninitialized" sentinel.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Debug)]
pub struct PageId(pub u32);

/// A page's bytes, shared between the frame that owns them and every
/// `PinnedPage` handle currently pointing at that frame. `RwLock` is doing
/// double duty here: it's both what keeps concurrent readers/writers of the
/// bytes memory-safe *and* the page latch the design calls for (§5) — shared
/// for `.read()`, exclusive for `.write()`, re-entrance not supported.
pub type Data = Arc<RwLock<Align4096>>;

#[repr(align(8))]
pub struct Align4096(pub(crate) [u8; PAGE_SIZE]);

impl Deref for Align4096 {
    type Target = [u8; PAGE_SIZE];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Align4096 {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// One frame's worth of buffer-pool bookkeeping: the bytes, which page they
/// currently hold (if any), whether they've been written since last flush,
/// and how many outstanding pins reference them.
#[derive(Clone)]
pub struct Frame {
    data: Data,
    page_id: Option<PageId>,
    is_dirty: bool,
    pin_count: usize,
}

impl Frame {
    pub fn new() -> Self {
        Frame {
            data: Arc::new(RwLock::new(Align4096([0u8; PAGE_SIZE]))),
            page_id: None,
            is_dirty: false,
            pin_count: 0,
        }
    }

    pub fn page_id(&self) -> Option<PageId> {
        self.page_id
    }

    pub fn data(&self) -> Data {
        self.data.clone()
    }

    pub fn is_dirty(&self) -> bool {
        self.is_dirty
    }

    pub fn pin_count(&self) -> usize {
        self.pin_count
    }

    pub fn set_page_id(&mut self, page_id: PageId) {
        self.page_id = Some(page_id);
    }

    pub fn set_dirty(&mut self, is_dirty: bool) {
        self.is_dirty = is_dirty;
    }

    pub fn set_pin_count(&mut self, pin_count: usize) {
        self.pin_count = pin_count;
    }

    pub fn increase_pin_count(&mut self) {
        self.pin_count += 1;
    }

    pub fn decrease_pin_count(&mut self) {
        self.pin_count = self.pin_count.saturating_sub(1);
    }

    pub fn reset_data(&mut self) {
        self.data = Arc::new(RwLock::new(Align4096([0u8; PAGE_SIZE])));
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self::new()
    }
}

/// Implemented by whatever owns the frame this pin came from, so a
/// `PinnedPage` can release its residency claim on drop without the caller
/// having to remember to call `unpin` on every exit path.
pub trait PageSource {
    fn unpin(&self, page_id: PageId, is_dirty: bool);
}

/// A residency claim on a page, paired with exactly one `unpin` on drop.
/// Reading or writing the page's bytes acquires the page latch (the
/// underlying `RwLock`) for the duration of the borrow.
pub struct PinnedPage<'a, P: PageSource> {
    pool: &'a P,
    id: PageId,
    data: Data,
    dirtied: AtomicBool,
}

impl<'a, P: PageSource> PinnedPage<'a, P> {
    pub fn new(pool: &'a P, id: PageId, data: Data) -> Self {
        PinnedPage {
            pool,
            id,
            data,
            dirtied: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    /// Acquire the page latch shared.
    pub fn read(&self) -> Result<RwLockReadGuard<'_, Align4096>> {
        self.data.read().map_err(|_| Error::Latch)
    }

    /// Acquire the page latch exclusive. The page is marked dirty as soon as
    /// a writer borrows it, not when the guard drops, since the caller may
    /// panic mid-mutation and the buffer pool still must not lose the write.
    pub fn write(&self) -> Result<RwLockWriteGuard<'_, Align4096>> {
        self.dirtied.store(true, Ordering::Relaxed);
        self.data.write().map_err(|_| Error::Latch)
    }

    /// Explicitly flag the page dirty without taking a write latch, e.g.
    /// when a caller already holds one from a prior `write()` call on a
    /// clone of this handle.
    pub fn mark_dirty(&self) {
        self.dirtied.store(true, Ordering::Relaxed);
    }
}

impl<'a, P: PageSource> Drop for PinnedPage<'a, P> {
    fn drop(&mut self) {
        self.pool.unpin(self.id, self.dirtied.load(Ordering::Relaxed));
    }
}
