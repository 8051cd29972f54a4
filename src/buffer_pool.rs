use std::collections::HashMap;
use std::sync::Mutex;

use log::{debug, warn};

use crate::disk::DiskManager;
use crate::error::{Error, Result};
use crate::page::{Frame, PageId, PageSource, PinnedPage};
use crate::replacer::{FrameId, Replacer};

struct Inner<R: Replacer, D: DiskManager> {
    frames: Vec<Frame>,
    page_table: HashMap<PageId, FrameId>,
    free_list: Vec<FrameId>,
    replacer: R,
    next_page_id: u32,
    deleted_page_ids: Vec<u32>,
    disk_manager: D,
}

impl<R: Replacer, D: DiskManager> Inner<R, D> {
    fn alloc_frame(&mut self) -> Option<FrameId> {
        self.free_list.pop().or_else(|| self.replacer.victim())
    }

    fn alloc_page_id(&mut self) -> PageId {
        if let Some(id) = self.deleted_page_ids.pop() {
            return PageId(id);
        }
        let id = self.next_page_id;
        self.next_page_id += 1;
        PageId(id)
    }

    fn evict_into(&mut self, frame_id: FrameId) -> Result<()> {
        let frame = &self.frames[frame_id.0];
        if frame.is_dirty() {
            if let Some(old_id) = frame.page_id() {
                let bytes = *frame.data().read().map_err(|_| Error::Latch)?;
                self.disk_manager.write_page(old_id, &bytes)?;
            }
        }
        if let Some(old_id) = frame.page_id() {
            self.page_table.remove(&old_id);
        }
        Ok(())
    }
}

/// Owns the frame array, the page table, the free list, and the replacer;
/// implements both the pin/unpin contract and the allocate/free contract
/// (§6.1, §6.2). A single `Mutex` guards everything — see DESIGN.md for why
/// the teacher's sharded `ParallelBufferPoolManager` isn't needed here.
pub struct BufferPoolManager<R: Replacer, D: DiskManager> {
    inner: Mutex<Inner<R, D>>,
}

impl<R: Replacer, D: DiskManager> BufferPoolManager<R, D> {
    pub fn new(pool_size: usize, disk_manager: D) -> Self {
        let free_list = (0..pool_size).map(FrameId).collect();
        BufferPoolManager {
            inner: Mutex::new(Inner {
                frames: vec![Frame::new(); pool_size],
                page_table: HashMap::new(),
                free_list,
                replacer: R::new(pool_size),
                next_page_id: 1, // PageId(0) is reserved as the "uninitialized" sentinel
                deleted_page_ids: Vec::new(),
                disk_manager,
            }),
        }
    }

    /// Reserve a fresh page id without touching the buffer pool.
    pub fn allocate(&self) -> Result<PageId> {
        let mut inner = self.inner.lock().map_err(|_| Error::Latch)?;
        Ok(inner.alloc_page_id())
    }

    /// Allocate a page id, pin it into a fresh zeroed frame, and return it
    /// latched for writing — the allocator's `alloc_latched` primitive (§6.2).
    pub fn alloc_latched(&self) -> Result<PinnedPage<'_, Self>> {
        let mut inner = self.inner.lock().map_err(|_| Error::Latch)?;
        let frame_id = inner.alloc_frame().ok_or(Error::Alloc)?;
        inner.evict_into(frame_id)?;
        let page_id = inner.alloc_page_id();

        let frame = &mut inner.frames[frame_id.0];
        frame.set_page_id(page_id);
        frame.set_dirty(true);
        frame.set_pin_count(1);
        frame.reset_data();
        let data = frame.data();
        inner.page_table.insert(page_id, frame_id);
        inner.replacer.pin(frame_id);
        debug!("allocated page {:?} in frame {:?}", page_id, frame_id);

        Ok(PinnedPage::new(self, page_id, data))
    }

    /// Mark a page id free. The caller must ensure no live directory slot
    /// still references it (§6.2).
    pub fn free(&self, page_id: PageId) {
        let mut inner = match self.inner.lock() {
            Ok(g) => g,
            Err(_) => return,
        };
        if let Some(frame_id) = inner.page_table.remove(&page_id) {
            let pin_count = inner.frames[frame_id.0].pin_count();
            if pin_count > 0 {
                warn!("freeing page {:?} while still pinned", page_id);
            }
            inner.free_list.push(frame_id);
        }
        inner.deleted_page_ids.push(page_id.0);
    }

    /// Pin a page, loading it from disk if it isn't already resident.
    pub fn pin(&self, page_id: PageId) -> Result<PinnedPage<'_, Self>> {
        let mut inner = self.inner.lock().map_err(|_| Error::Latch)?;

        if let Some(&frame_id) = inner.page_table.get(&page_id) {
            inner.replacer.pin(frame_id);
            let frame = &mut inner.frames[frame_id.0];
            frame.increase_pin_count();
            return Ok(PinnedPage::new(self, page_id, frame.data()));
        }

        let frame_id = inner.alloc_frame().ok_or(Error::Pin(page_id))?;
        inner.evict_into(frame_id)?;
        inner.replacer.pin(frame_id);

        let frame = &mut inner.frames[frame_id.0];
        frame.set_page_id(page_id);
        frame.set_dirty(false);
        frame.set_pin_count(1);
        {
            let mut bytes = frame.data().write().map_err(|_| Error::Latch)?;
            inner.disk_manager.read_page(page_id, &mut bytes)?;
        }
        let data = frame.data();
        inner.page_table.insert(page_id, frame_id);

        Ok(PinnedPage::new(self, page_id, data))
    }

    pub fn flush(&self, page_id: PageId) -> Result<()> {
        let inner = self.inner.lock().map_err(|_| Error::Latch)?;
        if let Some(&frame_id) = inner.page_table.get(&page_id) {
            let frame = &inner.frames[frame_id.0];
            if frame.is_dirty() {
                let bytes = *frame.data().read().map_err(|_| Error::Latch)?;
                inner.disk_manager.write_page(page_id, &bytes)?;
            }
        }
        Ok(())
    }

    pub fn flush_all(&self) -> Result<()> {
        let inner = self.inner.lock().map_err(|_| Error::Latch)?;
        for frame in inner.frames.iter() {
            if let Some(page_id) = frame.page_id() {
                if frame.is_dirty() {
                    let bytes = *frame.data().read().map_err(|_| Error::Latch)?;
                    inner.disk_manager.write_page(page_id, &bytes)?;
                }
            }
        }
        Ok(())
    }
}

impl<R: Replacer, D: DiskManager> PageSource for BufferPoolManager<R, D> {
    fn unpin(&self, page_id: PageId, is_dirty: bool) {
        let mut inner = match self.inner.lock() {
            Ok(g) => g,
            Err(_) => return,
        };
        let Some(&frame_id) = inner.page_table.get(&page_id) else {
            return;
        };
        let frame = &mut inner.frames[frame_id.0];
        frame.decrease_pin_count();
        if frame.pin_count() == 0 {
            inner.replacer.unpin(frame_id);
        }
        if is_dirty {
            frame.set_dirty(true);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::disk::FileDiskManager;
    use crate::replacer::LruReplacer;

    fn bpm(pool_size: usize) -> (tempfile::TempDir, BufferPoolManager<LruReplacer, FileDiskManager>) {
        let dir = tempfile::tempdir().unwrap();
        let dm = FileDiskManager::new(dir.path().join("test.db")).unwrap();
        (dir, BufferPoolManager::new(pool_size, dm))
    }

    #[test]
    fn alloc_write_unpin_refetch_roundtrips() {
        let (_dir, pool) = bpm(4);
        let page_id = {
            let page = pool.alloc_latched().unwrap();
            {
                let mut w = page.write().unwrap();
                w[0] = 42;
            }
            page.id()
        };

        let page = pool.pin(page_id).unwrap();
        assert_eq!(page.read().unwrap()[0], 42);
    }

    #[test]
    fn dirty_page_survives_eviction() {
        let (_dir, pool) = bpm(1);
        let first_id = {
            let page = pool.alloc_latched().unwrap();
            page.write().unwrap()[0] = 7;
            page.id()
        };
        // Only one frame: allocating a second page forces the first to evict.
        let second_id = {
            let page = pool.alloc_latched().unwrap();
            page.write().unwrap()[0] = 9;
            page.id()
        };
        assert_ne!(first_id, second_id);

        let page = pool.pin(first_id).unwrap();
        assert_eq!(page.read().unwrap()[0], 7);
    }

    #[test]
    fn free_then_reallocate_reuses_id() {
        let (_dir, pool) = bpm(4);
        let page_id = pool.alloc_latched().unwrap().id();
        pool.free(page_id);
        let reused = pool.allocate().unwrap();
        assert_eq!(reused, page_id);
    }
}
