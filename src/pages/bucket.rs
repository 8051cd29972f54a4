use std::marker::PhantomData;
use std::mem::size_of;

use bytemuck::{Pod, Zeroable};

use crate::disk::PAGE_SIZE;
use crate::page::PageId;

/// Computes the slot count and padding for a bucket page storing
/// `(K, V)` entries, the way `r-bustub`'s `Tool<K, V>` does for a single
/// bitmap — extended here to size two independent bitmaps (`occupied`,
/// `readable`) instead of one. Picking `BYTE_NUM` first and deriving
/// `KV_NUM = BYTE_NUM * 8` keeps both bitmaps an exact whole number of
/// bytes, so no slot straddles a byte boundary.
pub struct Sizing<K, V>(PhantomData<(K, V)>);

impl<K, V> Sizing<K, V> {
    const ENTRY_SIZE: usize = size_of::<K>() + size_of::<V>();
    pub const BYTE_NUM: usize =
        (PAGE_SIZE - size_of::<PageId>()) / (8 * Self::ENTRY_SIZE + 2);
    pub const KV_NUM: usize = Self::BYTE_NUM * 8;
    pub const BLANK_SIZE: usize = PAGE_SIZE
        - size_of::<PageId>()
        - 2 * Self::BYTE_NUM
        - Self::ENTRY_SIZE * Self::KV_NUM;
}

pub enum InsertResult {
    Success(usize),
    Full,
}

/// One disk page's worth of a fixed-capacity open-addressing table. `occupied`
/// is sticky (set once, never cleared) so a probe chain can terminate at a
/// slot that was never written; `readable` is the tombstone bit.
#[derive(Debug, Clone, Copy)]
pub struct BucketPage<K, V>
where
    K: Default + Copy + PartialEq,
    V: Default + Copy + PartialEq,
    [(); Sizing::<K, V>::KV_NUM]:,
    [(); Sizing::<K, V>::BYTE_NUM]:,
    [(); Sizing::<K, V>::BLANK_SIZE]:,
{
    page_id: PageId,
    occupied: [u8; Sizing::<K, V>::BYTE_NUM],
    readable: [u8; Sizing::<K, V>::BYTE_NUM],
    entries: [(K, V); Sizing::<K, V>::KV_NUM],
    blank: [u8; Sizing::<K, V>::BLANK_SIZE],
}

unsafe impl<K: 'static, V: 'static> Zeroable for BucketPage<K, V>
where
    K: Default + Copy + PartialEq,
    V: Default + Copy + PartialEq,
    [(); Sizing::<K, V>::KV_NUM]:,
    [(); Sizing::<K, V>::BYTE_NUM]:,
    [(); Sizing::<K, V>::BLANK_SIZE]:,
{
}

unsafe impl<K: 'static, V: 'static> Pod for BucketPage<K, V>
where
    K: Default + Copy + PartialEq,
    V: Default + Copy + PartialEq,
    [(); Sizing::<K, V>::KV_NUM]:,
    [(); Sizing::<K, V>::BYTE_NUM]:,
    [(); Sizing::<K, V>::BLANK_SIZE]:,
{
}

impl<K, V> BucketPage<K, V>
where
    K: Default + Copy + PartialEq,
    V: Default + Copy + PartialEq,
    [(); Sizing::<K, V>::KV_NUM]:,
    [(); Sizing::<K, V>::BYTE_NUM]:,
    [(); Sizing::<K, V>::BLANK_SIZE]:,
{
    pub const CAPACITY: usize = Sizing::<K, V>::KV_NUM;

    pub fn new(page_id: PageId) -> Self {
        Self {
            page_id,
            occupied: [0u8; Sizing::<K, V>::BYTE_NUM],
            readable: [0u8; Sizing::<K, V>::BYTE_NUM],
            entries: [(K::default(), V::default()); Sizing::<K, V>::KV_NUM],
            blank: [0u8; Sizing::<K, V>::BLANK_SIZE],
        }
    }

    /// Both page images begin with a `page_id` sentinel (§6.3): if it
    /// doesn't match the page actually pinned, the image is stale or never
    /// written and is treated as freshly zeroed.
    pub fn init_if_stale(&mut self, pinned_id: PageId) {
        if self.page_id != pinned_id {
            *self = Self::new(pinned_id);
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    fn bit(bitmap: &[u8], index: usize) -> bool {
        bitmap[index / 8] & (1 << (index % 8)) != 0
    }

    fn set_bit(bitmap: &mut [u8], index: usize) {
        bitmap[index / 8] |= 1 << (index % 8);
    }

    fn clear_bit(bitmap: &mut [u8], index: usize) {
        bitmap[index / 8] &= !(1 << (index % 8));
    }

    pub fn is_occupied(&self, index: usize) -> bool {
        Self::bit(&self.occupied, index)
    }

    pub fn is_readable(&self, index: usize) -> bool {
        Self::bit(&self.readable, index)
    }

    /// `get(i)`: the entry at `i` if it's live, else `None` (§4.2).
    pub fn get(&self, index: usize) -> Option<(K, V)> {
        if self.is_readable(index) {
            Some(self.entries[index])
        } else {
            None
        }
    }

    /// `put(i, k, v)`: fails if the slot is already live (§4.2).
    pub fn put(&mut self, index: usize, key: K, value: V) -> bool {
        if self.is_readable(index) {
            return false;
        }
        self.entries[index] = (key, value);
        Self::set_bit(&mut self.occupied, index);
        Self::set_bit(&mut self.readable, index);
        true
    }

    /// Attempts `put(start, k, v)`; on failure linearly probes `start+1,
    /// start+2, …` modulo capacity, reusing tombstones, returning on first
    /// success. A full wrap-around back to `start` reports the bucket full
    /// for this key (§4.2).
    pub fn insert(&mut self, key: K, value: V, start: usize) -> InsertResult {
        let capacity = Self::CAPACITY;
        let mut index = start;
        loop {
            if !self.is_readable(index) {
                self.put(index, key, value);
                return InsertResult::Success(index);
            }
            index = (index + 1) % capacity;
            if index == start {
                return InsertResult::Full;
            }
        }
    }

    /// Tombstones slot `i` if it holds exactly `(key, value)` and is live.
    /// `occupied` is left set (§4.2).
    pub fn remove(&mut self, index: usize, key: &K, value: &V) -> bool {
        if self.is_readable(index) && self.entries[index].0 == *key && self.entries[index].1 == *value {
            Self::clear_bit(&mut self.readable, index);
            true
        } else {
            false
        }
    }

    pub fn force_remove(&mut self, index: usize) {
        Self::clear_bit(&mut self.readable, index);
    }

    /// Iterates the live `(index, key, value)` triples, in slot order. Used
    /// by the split rehash (§4.5) to drain the old bucket.
    pub fn live_entries(&self) -> impl Iterator<Item = (usize, K, V)> + '_ {
        (0..Self::CAPACITY).filter_map(move |i| self.get(i).map(|(k, v)| (i, k, v)))
    }
}
