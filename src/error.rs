use thiserror::Error;

/// Everything that can go wrong below the public `ExtendibleHashTable` API.
#[derive(Debug, Error)]
pub enum Error {
    #[error("page allocator has no free page ids left")]
    Alloc,

    #[error("buffer pool could not pin page {0:?}")]
    Pin(crate::page::PageId),

    #[error("latch was poisoned by a panicking holder")]
    Latch,

    #[error("disk i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("page {0:?} failed its init-sentinel or invariant check")]
    Corrupt(crate::page::PageId),

    #[error("directory is already at maximum global depth, bucket cannot be split further")]
    DirectoryFull,
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod test {
    use super::*;
    use crate::page::PageId;

    #[test]
    fn messages_are_stable() {
        assert_eq!(
            Error::Alloc.to_string(),
            "page allocator has no free page ids left"
        );
        assert_eq!(
            Error::Pin(PageId(3)).to_string(),
            "buffer pool could not pin page PageId(3)"
        );
        assert_eq!(
            Error::Latch.to_string(),
            "latch was poisoned by a panicking holder"
        );
        assert_eq!(
            Error::Corrupt(PageId(5)).to_string(),
            "page PageId(5) failed its init-sentinel or invariant check"
        );
        assert_eq!(
            Error::DirectoryFull.to_string(),
            "directory is already at maximum global depth, bucket cannot be split further"
        );
    }

    #[test]
    fn io_error_wraps_via_from() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk offline");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("disk offline"));
    }
}
