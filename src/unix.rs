//! Unix platform layer: anonymous page mappings, the host page size, and the
//! fatal-diagnostic path. Everything platform-specific lives here.

use core::ptr::{null_mut, NonNull};
use core::sync::atomic::{AtomicUsize, Ordering};

use errno::{set_errno, Errno};

use crate::page::PageSource;

// Cached result of sysconf(_SC_PAGESIZE). Zero means not yet queried.
static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// Host page size in bytes. Queried from the kernel once, then memoized.
pub fn page_size() -> usize {
    let cached = PAGE_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    let ps = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if ps <= 0 {
        die("page_size: sysconf(_SC_PAGESIZE) failed");
    }
    PAGE_SIZE.store(ps as usize, Ordering::Relaxed);
    ps as usize
}

/// Write `msg` to standard error, newline-terminated, and exit with status 1.
///
/// Every unrecoverable condition funnels through here: a refused map or
/// unmap, or broken allocator bookkeeping. No unwinding, no allocation.
pub(crate) fn die(msg: &str) -> ! {
    unsafe {
        libc::write(
            libc::STDERR_FILENO,
            msg.as_ptr() as *const libc::c_void,
            msg.len(),
        );
        if !msg.ends_with('\n') {
            libc::write(libc::STDERR_FILENO, b"\n".as_ptr() as *const libc::c_void, 1);
        }
        libc::exit(1);
    }
}

/// The production page source: anonymous, private, read/write mappings.
///
/// Mapping failure is not reported to the caller; a host that refuses an
/// anonymous mapping leaves the allocator nothing sensible to do, so the
/// process exits with a diagnostic.
#[derive(Default)]
pub struct MmapSource {
    // Just for tracking, not load-bearing.
    pages: AtomicUsize,
    maps: AtomicUsize,
}

impl MmapSource {
    pub const fn new() -> Self {
        MmapSource {
            pages: AtomicUsize::new(0),
            maps: AtomicUsize::new(0),
        }
    }

    /// Pages currently mapped through this source.
    pub fn mapped_pages(&self) -> usize {
        self.pages.load(Ordering::Relaxed)
    }

    /// Number of map calls made so far.
    pub fn map_calls(&self) -> usize {
        self.maps.load(Ordering::Relaxed)
    }
}

impl PageSource for MmapSource {
    fn page_size(&self) -> usize {
        page_size()
    }

    unsafe fn map(&self, pnum: usize) -> NonNull<u8> {
        let len = pnum * page_size();
        let raw = libc::mmap(
            // No preferred address.
            null_mut(),
            len,
            // Plain data pages.
            libc::PROT_READ | libc::PROT_WRITE,
            // Anonymous: no backing file. Private: ours alone.
            libc::MAP_ANON | libc::MAP_PRIVATE,
            -1,
            0,
        );
        if raw == libc::MAP_FAILED {
            die("page allocator: anonymous mapping failed");
        }
        log::trace!("mapped {} pages at {:p}", pnum, raw);
        self.pages.fetch_add(pnum, Ordering::Relaxed);
        self.maps.fetch_add(1, Ordering::Relaxed);
        NonNull::new_unchecked(raw as *mut u8)
    }

    unsafe fn unmap(&self, base: NonNull<u8>, len: usize) {
        if libc::munmap(base.as_ptr() as *mut libc::c_void, len) != 0 {
            die("page allocator: munmap failed");
        }
        log::trace!("unmapped {} bytes at {:p}", len, base.as_ptr());
        self.pages.fetch_sub(len / page_size(), Ordering::Relaxed);
    }

    fn flag_invalid(&self) {
        set_errno(Errno(libc::EINVAL));
    }
}
