#![no_std]

//! Page-granular allocation over anonymous mappings, plus a bump arena.
//!
//! This crate is a runtime facility for native programs that want their bulk
//! memory straight from the kernel and their short-lived object clusters out
//! of a linear arena, with no general-purpose allocator underneath either.
//!
//! ## The two layers
//!
//! ### [`palloc`] / [`pfree`]
//!
//! The page allocator hands out contiguous runs of OS pages and keeps a
//! bounded cache of freed runs so steady-state traffic rarely reaches the
//! kernel. All of its bookkeeping lives on pages it maps for itself; see
//! [`page`] for how the bootstrap cycle is broken and how those metadata
//! pages are reclaimed. Calls may come from any thread; one process-wide
//! mutex serializes them.
//!
//! ### [`arena_create`] / [`arena_alloc`] / [`arena_free`]
//!
//! The arena is a chain of page runs with bump-pointer allocation and bulk
//! release, for call sites that allocate a burst of objects and drop them
//! all at once. It draws its pages from the page allocator.
//!
//! ## Instances
//!
//! The free functions above go through one process-wide [`PageAlloc`] over
//! [`MmapSource`]. The types behind them are public, and an allocator can
//! also be instantiated over any other [`PageSource`]; the tests run entire
//! scenarios against [`ToyPages`], which needs no kernel at all.
//!
//! ## Failure model
//!
//! Invalid arguments come back as null with `errno` set. A platform that
//! refuses a map or unmap, or bookkeeping found corrupt, is not recoverable:
//! the process writes one line to stderr and exits with status 1.

pub mod arena;
pub mod list;
pub mod page;
pub mod unix;

pub use arena::{Arena, ArenaPage};
pub use page::{
    BootPage, MetaPage, PageAlloc, PageSource, RunRecord, Stats, ToyPages, Validity, FREE_CAP,
    STATIC_SLOT_COUNT, TOY_PAGE_SIZE,
};
pub use unix::{page_size, MmapSource};

use core::cell::UnsafeCell;
use core::ptr::NonNull;

struct BootCell(UnsafeCell<BootPage>);

// The cell is only ever reached through the process-wide allocator, under
// its mutex.
unsafe impl Sync for BootCell {}

static BOOT: BootCell = BootCell(UnsafeCell::new(BootPage::new()));

static GLOBAL: PageAlloc<MmapSource> =
    unsafe { PageAlloc::with_boot(MmapSource::new(), BOOT.0.get()) };

/// The process-wide page allocator behind [`palloc`] and [`pfree`].
pub fn global() -> &'static PageAlloc<MmapSource> {
    &GLOBAL
}

/// Allocate a run of `pnum` pages from the process-wide allocator.
///
/// The returned base is page aligned; the caller owns every byte of the run
/// until it is passed to [`pfree`]. Returns null with `errno` set to
/// `EINVAL` when `pnum` is zero or overflows the address space.
pub fn palloc(pnum: usize) -> *mut u8 {
    GLOBAL.palloc(pnum)
}

/// Give a run back to the process-wide allocator.
///
/// `p` may point anywhere inside the run's first page; the base is recovered
/// by rounding down. A pointer that matches no live run is ignored, which is
/// also what makes a double free harmless.
///
/// # Safety
///
/// If `p` points into a live run, nothing may reference that run afterward.
pub unsafe fn pfree(p: *mut u8) {
    GLOBAL.pfree(p)
}

/// Create an arena over the process-wide allocator with default sizing (one
/// page initially, one page per growth step).
pub fn arena_create() -> Option<NonNull<Arena<MmapSource>>> {
    Arena::create_in(global())
}

/// Create an arena over the process-wide allocator with explicit initial
/// size and growth step, both in bytes.
pub fn arena_create_ext(
    initial_bytes: usize,
    bytes_growth: usize,
) -> Option<NonNull<Arena<MmapSource>>> {
    Arena::create_ext_in(global(), initial_bytes, bytes_growth)
}

/// Bump-allocate `bytes` from `arena`. Null when growing the arena fails.
///
/// # Safety
///
/// `arena` must be live and confined to the calling thread.
pub unsafe fn arena_alloc<S: PageSource + 'static>(
    arena: NonNull<Arena<S>>,
    bytes: usize,
) -> *mut u8 {
    (*arena.as_ptr()).alloc(bytes)
}

/// Release `arena` and every run it owns, invalidating every pointer it
/// ever returned.
///
/// # Safety
///
/// `arena` must be live, and nothing may use it or its allocations again.
pub unsafe fn arena_free<S: PageSource + 'static>(arena: NonNull<Arena<S>>) {
    Arena::destroy(arena)
}
