use std::collections::linked_list::CursorMut;
use std::collections::LinkedList;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FrameId(pub usize);

/// Tracks which frames are eligible for eviction when the free list is
/// empty. `pin`/`unpin` mirror a page's residency: a frame becomes a victim
/// candidate only while unpinned.
pub trait Replacer {
    fn new(pool_size: usize) -> Self;
    fn victim(&mut self) -> Option<FrameId>;
    fn pin(&mut self, frame_id: FrameId);
    fn unpin(&mut self, frame_id: FrameId);
    fn size(&self) -> usize;
}

/// Least-recently-unpinned-first. `unpin` pushes to the back of the
/// candidate list; `victim` pops from the front.
#[derive(Debug)]
pub struct LruReplacer {
    container: LinkedList<FrameId>,
    index: Vec<Option<CursorMut<'static, FrameId>>>,
}

impl Replacer for LruReplacer {
    fn new(pool_size: usize) -> Self {
        let mut index = Vec::new();
        index.resize_with(pool_size, || None);
        LruReplacer {
            container: LinkedList::new(),
            index,
        }
    }

    fn victim(&mut self) -> Option<FrameId> {
        let frame_id = self.container.pop_front()?;
        debug_assert!(self.index[frame_id.0].is_some());
        self.index[frame_id.0] = None;
        Some(frame_id)
    }

    fn pin(&mut self, frame_id: FrameId) {
        if let Some(mut cursor) = self.index[frame_id.0].take() {
            cursor.remove_current().unwrap();
        }
    }

    fn unpin(&mut self, frame_id: FrameId) {
        debug_assert!(self.index[frame_id.0].is_none());
        self.container.push_back(frame_id);
        self.index[frame_id.0] =
            Some(unsafe { core::mem::transmute(self.container.cursor_back_mut()) });
    }

    fn size(&self) -> usize {
        self.container.len()
    }
}
