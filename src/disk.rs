use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;

use crate::page::PageId;

pub const PAGE_SIZE: usize = 4096;

/// The raw file I/O layer. Fixed width reads/writes of exactly `PAGE_SIZE`
/// bytes at a page-aligned offset; everything above this trait (buffer pool,
/// hash table) is free to assume a page never partially lands on disk.
pub trait DiskManager: Send + Sync {
    fn read_page(&self, page_id: PageId, page: &mut [u8; PAGE_SIZE]) -> std::io::Result<()>;
    fn write_page(&self, page_id: PageId, page: &[u8; PAGE_SIZE]) -> std::io::Result<()>;
}

/// A single-file disk manager: page `i` lives at byte offset `i * PAGE_SIZE`.
#[derive(Debug)]
pub struct FileDiskManager {
    file: File,
}

impl FileDiskManager {
    pub fn new(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        Ok(Self { file })
    }
}

impl DiskManager for FileDiskManager {
    fn read_page(&self, page_id: PageId, page: &mut [u8; PAGE_SIZE]) -> std::io::Result<()> {
        self.file.read_at(page, page_id.0 as u64 * PAGE_SIZE as u64)?;
        Ok(())
    }

    fn write_page(&self, page_id: PageId, page: &[u8; PAGE_SIZE]) -> std::io::Result<()> {
        self.file.write_at(page, page_id.0 as u64 * PAGE_SIZE as u64)?;
        Ok(())
    }
}
