//! Bump arena layered on the page allocator.
//!
//! An arena is a chain of page runs with a bump offset per run. Allocation
//! is a pointer bump off the newest run; nothing is ever freed individually;
//! releasing the arena gives every chained run back at once. The handle
//! itself is embedded at the start of the first run, so the arena costs no
//! storage beyond the pages it hands out.
//!
//! Arenas are not internally synchronized. Confine each arena to one thread;
//! distinct arenas on distinct threads are fine.

use core::mem;
use core::ptr::{self, addr_of_mut, null_mut, NonNull};

use log::debug;
use static_assertions::const_assert;

use crate::list::SLink;
use crate::page::{PageAlloc, PageSource};
use crate::unix::MmapSource;

/// Header of one page run owned by an arena.
///
/// `idx` and `end` are byte offsets from the run base: `[idx, end)` is the
/// space still free in this run. On the first run the header is the leading
/// field of the [`Arena`] itself.
#[repr(C)]
pub struct ArenaPage {
    idx: usize,
    end: usize,
    next: SLink<ArenaPage>,
}

/// A growable bump allocator over page runs.
///
/// `head` points at the newest run; only the newest run is bumped, and older
/// runs keep whatever tail space they had when the chain grew past them.
/// That waste is the price of a single-comparison allocation path.
#[repr(C)]
pub struct Arena<S: 'static> {
    // Leading field on purpose: the handle and the first arena page share a
    // base address, so releasing the first run releases the handle too.
    page: ArenaPage,
    head: *mut ArenaPage,
    bytes_growth: usize,
    pager: &'static PageAlloc<S>,
}

const_assert!(mem::size_of::<ArenaPage>() % mem::size_of::<usize>() == 0);
const_assert!(mem::size_of::<Arena<MmapSource>>() % mem::size_of::<usize>() == 0);

fn pages_for(bytes: usize, ps: usize) -> usize {
    let pnum = bytes / ps + usize::from(bytes % ps != 0);
    pnum.max(1)
}

impl<S: PageSource + 'static> Arena<S> {
    /// Create an arena with default sizing: one page up front, one page per
    /// growth step.
    pub fn create_in(pager: &'static PageAlloc<S>) -> Option<NonNull<Self>> {
        let ps = pager.page_size();
        Self::create_ext_in(pager, ps, ps)
    }

    /// Create an arena sized `initial_bytes`, growing by at least
    /// `bytes_growth` whenever the head run is exhausted. Returns `None`
    /// when the initial page allocation fails.
    pub fn create_ext_in(
        pager: &'static PageAlloc<S>,
        initial_bytes: usize,
        bytes_growth: usize,
    ) -> Option<NonNull<Self>> {
        let ps = pager.page_size();
        let pnum = pages_for(initial_bytes.max(mem::size_of::<Self>()), ps);
        let base = NonNull::new(pager.palloc(pnum))?;
        let arena = base.cast::<Self>();
        unsafe {
            ptr::write(
                arena.as_ptr(),
                Arena {
                    page: ArenaPage {
                        idx: mem::size_of::<Self>(),
                        end: pnum * ps,
                        next: SLink::new(),
                    },
                    head: null_mut(),
                    bytes_growth,
                    pager,
                },
            );
            (*arena.as_ptr()).head = addr_of_mut!((*arena.as_ptr()).page);
        }
        Some(arena)
    }

    /// Carve `bytes` off the head run, growing the chain when the request
    /// does not fit. Returns null if growing fails; the arena is left
    /// untouched in that case.
    ///
    /// Bump offsets start word-aligned after the run headers and advance by
    /// exactly `bytes`; callers that need alignment across mixed sizes round
    /// `bytes` up themselves.
    ///
    /// # Safety
    ///
    /// The returned region is only valid until the arena is destroyed, and
    /// `self` must not be used from multiple threads.
    pub unsafe fn alloc(&mut self, bytes: usize) -> *mut u8 {
        let head = &mut *self.head;
        if bytes <= head.end - head.idx {
            let p = (self.head as *mut u8).add(head.idx);
            head.idx += bytes;
            return p;
        }
        let ps = self.pager.page_size();
        // The new run must hold its own header in front of the payload, so
        // the growth step is bumped past the raw max(bytes, growth) when the
        // request lands within a header's width of a page multiple.
        let want = match bytes.checked_add(mem::size_of::<ArenaPage>()) {
            Some(padded) => padded.max(self.bytes_growth),
            None => return null_mut(),
        };
        let pnum = pages_for(want, ps);
        let raw = self.pager.palloc(pnum);
        if raw.is_null() {
            return null_mut();
        }
        debug!("arena {:p}: grew by {} pages", self as *const Self, pnum);
        let page = raw as *mut ArenaPage;
        ptr::write(
            page,
            ArenaPage {
                idx: mem::size_of::<ArenaPage>(),
                end: pnum * ps,
                next: SLink::new(),
            },
        );
        (*page).next.set(self.head);
        self.head = page;
        let p = raw.add((*page).idx);
        (*page).idx += bytes;
        p
    }

    /// Release every run on the chain, the handle's own run last so the walk
    /// never reads freed memory. Invalidates every pointer the arena ever
    /// returned, and the handle itself.
    ///
    /// # Safety
    ///
    /// `arena` must have come from [`create_in`](Arena::create_in) or
    /// [`create_ext_in`](Arena::create_ext_in) and not have been destroyed
    /// before.
    pub unsafe fn destroy(arena: NonNull<Self>) {
        let pager = (*arena.as_ptr()).pager;
        let own = addr_of_mut!((*arena.as_ptr()).page);
        let mut cur = (*arena.as_ptr()).head;
        while !cur.is_null() {
            let next = (*cur).next.get();
            if cur != own {
                pager.pfree(cur as *mut u8);
            }
            cur = next;
        }
        pager.pfree(own as *mut u8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pages_for_rounds_up() {
        assert_eq!(pages_for(0, 256), 1);
        assert_eq!(pages_for(1, 256), 1);
        assert_eq!(pages_for(256, 256), 1);
        assert_eq!(pages_for(257, 256), 2);
        assert_eq!(pages_for(1024, 256), 4);
    }
}
