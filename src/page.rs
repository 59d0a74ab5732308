//! The page allocator: page-granular runs with self-hosted bookkeeping.
//!
//! ## Shape
//!
//! Every live or cached run is described by a [`RunRecord`] living in a slot
//! on a [`MetaPage`], a page the allocator maps for itself. That is a cycle:
//! recording the first allocation needs a slot, slots live on metadata pages,
//! and a metadata page is itself an allocation. A statically reserved
//! [`BootPage`] with a small fixed slot count breaks the cycle; it is
//! threaded onto the metadata-page list on first use and never reclaimed.
//!
//! ## Policy
//!
//! Freed runs are not returned to the kernel immediately. They are kept on a
//! free list bounded by [`FREE_CAP`] total pages and handed back out
//! first-fit, splitting oversized runs; the split tail stays cached. Nothing
//! is ever coalesced. Once the cache is at budget, freeing really unmaps,
//! and each such call also gives empty metadata pages a chance to go: a page
//! observed empty twice in a row by the reclaim sweep is unmapped too.
//!
//! ## Locking
//!
//! One mutex serializes everything. It is held across `map` on the
//! allocation path (the run finder's bookkeeping is coupled to the result)
//! and dropped before `unmap` on the free path.

use core::cell::{Cell, UnsafeCell};
use core::mem;
use core::ptr::{self, addr_of_mut, null_mut, NonNull};

use log::{debug, trace};
use spin::Mutex;
use static_assertions::const_assert;

use crate::list::{Linked, Links, List};
use crate::unix::die;

/// Slot count of the statically reserved metadata page.
pub const STATIC_SLOT_COUNT: usize = 32;

/// Page budget of the free-run cache, totalled across all cached runs.
pub const FREE_CAP: usize = 16;

// Second-chance mark, packed into the capacity word of a metadata page.
const CAP_MSB: usize = 1 << (usize::BITS - 1);

// Slots are laid out directly after the MetaPage header, so the header must
// leave them aligned.
const_assert!(mem::size_of::<MetaPage>() % mem::align_of::<RunRecord>() == 0);
const_assert!(mem::size_of::<RunRecord>() % mem::size_of::<usize>() == 0);

/// Source of page runs. The production implementation is
/// [`MmapSource`](crate::unix::MmapSource); tests substitute [`ToyPages`],
/// which has a tiny page size and needs no kernel.
///
/// A source does not report map failure: a source that cannot produce pages
/// terminates the process (the toy source panics instead, which only makes
/// sense under a test harness).
pub trait PageSource {
    /// Page size in bytes. Must be a power of two, constant for the life of
    /// the source, and large enough for a [`MetaPage`] header plus at least
    /// two record slots.
    fn page_size(&self) -> usize;

    /// Produce `pnum` fresh, zeroed, page-aligned pages.
    ///
    /// # Safety
    ///
    /// `pnum` must be nonzero and `pnum * page_size()` must not overflow.
    unsafe fn map(&self, pnum: usize) -> NonNull<u8>;

    /// Release `len` bytes at `base`, previously produced by `map` (or an
    /// exact page-aligned subrange of such a run).
    ///
    /// # Safety
    ///
    /// No live pointers into the range may remain.
    unsafe fn unmap(&self, base: NonNull<u8>, len: usize);

    /// Record an invalid-argument failure in the platform's errno analogue.
    fn flag_invalid(&self) {}
}

/// Bookkeeping entry for one page run.
///
/// Lives in a fixed slot on a metadata page. A record is threaded onto
/// exactly one of the used or free lists, or onto neither while its slot is
/// empty: `addr` is null exactly when the slot is free for reuse.
#[repr(C)]
pub struct RunRecord {
    link: Links<RunRecord>,
    addr: *mut u8,
    page_num: usize,
}

impl RunRecord {
    const EMPTY: RunRecord = RunRecord {
        link: Links::new(),
        addr: null_mut(),
        page_num: 0,
    };

    // Placeholder address for a slot that is reserved but not yet populated.
    // Never page-aligned, so it can never collide with a real run base.
    fn claim_mark() -> *mut u8 {
        NonNull::dangling().as_ptr()
    }
}

unsafe impl Linked for RunRecord {
    unsafe fn links(node: NonNull<Self>) -> NonNull<Links<Self>> {
        NonNull::new_unchecked(addr_of_mut!((*node.as_ptr()).link))
    }
}

/// Header of a metadata page. `cap` record slots follow the header within
/// the same page.
///
/// The most significant bit of the capacity word is the second-chance mark:
/// the reclaim sweep only unmaps a page it has already seen empty once, and
/// any touch (a slot taken, an allocation made) clears the mark. Without it,
/// a workload that allocates and frees the last record on a page would map
/// and unmap that page on every iteration.
#[repr(C)]
pub struct MetaPage {
    cap: usize,
    num: usize,
    link: Links<MetaPage>,
}

impl MetaPage {
    fn cap(&self) -> usize {
        self.cap & !CAP_MSB
    }

    // Mark the page as recently used so the reclaim sweep spares it.
    fn touch(&mut self) {
        self.cap &= !CAP_MSB;
    }

    // First empty observation marks the page and spares it; a page already
    // marked is condemned. Returns true when the page survives this sweep.
    fn spare_once(&mut self) -> bool {
        if self.cap & CAP_MSB != 0 {
            return false;
        }
        self.cap |= CAP_MSB;
        true
    }

    unsafe fn slots(page: NonNull<MetaPage>) -> *mut RunRecord {
        (page.as_ptr() as *mut u8).add(mem::size_of::<MetaPage>()) as *mut RunRecord
    }

    // Extent of the header-plus-slot-array, for container lookup. Covers the
    // statically reserved page too, whose capacity is far below a full page.
    unsafe fn span(page: NonNull<MetaPage>) -> (usize, usize) {
        let start = page.as_ptr() as usize;
        let end = MetaPage::slots(page) as usize
            + (*page.as_ptr()).cap() * mem::size_of::<RunRecord>();
        (start, end)
    }
}

unsafe impl Linked for MetaPage {
    unsafe fn links(node: NonNull<Self>) -> NonNull<Links<Self>> {
        NonNull::new_unchecked(addr_of_mut!((*node.as_ptr()).link))
    }
}

/// Backing storage for the statically reserved metadata page.
///
/// One instance backs the process-wide allocator; tests hand each allocator
/// instance its own so they bootstrap independently. The page is threaded
/// onto the metadata-page list by the first allocation and stays there for
/// the life of the allocator.
#[repr(C)]
pub struct BootPage {
    page: MetaPage,
    slots: [RunRecord; STATIC_SLOT_COUNT],
}

impl BootPage {
    pub const fn new() -> Self {
        BootPage {
            page: MetaPage {
                cap: STATIC_SLOT_COUNT,
                num: 0,
                link: Links::new(),
            },
            slots: [RunRecord::EMPTY; STATIC_SLOT_COUNT],
        }
    }
}

impl Default for BootPage {
    fn default() -> Self {
        BootPage::new()
    }
}

// Stack scratch for the run finder's split remainder. Needed only while a
// metadata page is being created: at that moment no slot exists anywhere to
// record the tail, so the finder parks it here and the caller commits it
// into slot 0 of the page it is initializing.
struct SplitTail {
    addr: *mut u8,
    page_num: usize,
}

impl SplitTail {
    fn none() -> Self {
        SplitTail {
            addr: null_mut(),
            page_num: 0,
        }
    }

    fn set(&mut self, addr: NonNull<u8>, page_num: usize) {
        self.addr = addr.as_ptr();
        self.page_num = page_num;
    }

    fn take(&mut self) -> Option<(NonNull<u8>, usize)> {
        let addr = NonNull::new(self.addr)?;
        self.addr = null_mut();
        Some((addr, self.page_num))
    }
}

/// Aggregate counts over the allocator's bookkeeping, from a [`stats`]
/// sweep.
///
/// [`stats`]: PageAlloc::stats
#[derive(Clone, Copy, Debug, Default)]
pub struct Stats {
    pub meta_pages: usize,
    pub used_runs: usize,
    pub used_pages: usize,
    pub free_runs: usize,
    pub free_pages: usize,
}

/// Invariant violations observed during a [`stats`] sweep. All-zero means
/// the bookkeeping is sound.
///
/// [`stats`]: PageAlloc::stats
#[derive(Debug, Default)]
pub struct Validity {
    /// Metadata pages whose live count disagrees with their occupied slots.
    pub bad_counts: usize,
    /// Used-list records whose run base is not page aligned.
    pub unaligned: usize,
    /// Listed records that no metadata page contains.
    pub orphans: usize,
    /// Free-cache page counter disagreeing with the walked total.
    pub drifted: bool,
    /// Free cache exceeding its page budget.
    pub over_budget: bool,
}

impl Validity {
    pub fn is_valid(&self) -> bool {
        self.bad_counts == 0
            && self.unaligned == 0
            && self.orphans == 0
            && !self.drifted
            && !self.over_budget
    }
}

struct State {
    /// All metadata pages, boot page included once threaded.
    meta: List<MetaPage>,
    /// Records describing freed-but-still-mapped runs.
    free: List<RunRecord>,
    /// Records describing live allocations.
    used: List<RunRecord>,
    /// Total pages over the free list; kept at or below FREE_CAP.
    free_pages: usize,
    /// The statically reserved metadata page. Never reclaimed.
    boot: *mut MetaPage,
}

// The raw pointers in State are only dereferenced by the allocator that owns
// them, under its mutex.
unsafe impl Send for State {}

/// A page allocator bound to a page source.
///
/// The process-wide instance lives in this crate and backs [`palloc`]; tests
/// build private instances over [`ToyPages`] to get hermetic, deterministic
/// layouts. All bookkeeping sits behind one mutex; the source stays outside
/// it so the free path can unmap after the lock is dropped.
///
/// [`palloc`]: crate::palloc
pub struct PageAlloc<S> {
    source: S,
    state: Mutex<State>,
}

impl<S: PageSource> PageAlloc<S> {
    /// Build an allocator over `source`, bootstrapping from `boot`.
    ///
    /// # Safety
    ///
    /// `boot` must outlive the allocator and be used by no other allocator
    /// instance.
    pub const unsafe fn with_boot(source: S, boot: *mut BootPage) -> Self {
        PageAlloc {
            source,
            state: Mutex::new(State {
                meta: List::new(),
                free: List::new(),
                used: List::new(),
                free_pages: 0,
                boot: boot as *mut MetaPage,
            }),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn page_size(&self) -> usize {
        self.source.page_size()
    }

    /// Allocate a run of `pnum` pages. The returned base is page aligned and
    /// the caller owns every byte of the run until it is passed to
    /// [`pfree`](PageAlloc::pfree). Returns null (with the platform's
    /// invalid-argument indicator set) when `pnum` is zero or absurd.
    pub fn palloc(&self, pnum: usize) -> *mut u8 {
        let ps = self.source.page_size();
        if pnum == 0 || pnum.checked_mul(ps).is_none() {
            self.source.flag_invalid();
            return null_mut();
        }
        debug!("palloc({} pages)", pnum);
        let mut st = self.state.lock();
        unsafe {
            st.ensure_boot();
            let slot = st.reserve_slot(&self.source);
            let base = st.find_free_run(&self.source, pnum, None);
            st.commit(slot, base, pnum);
            base.as_ptr()
        }
    }

    /// Retire the run whose first page contains `p` (any byte of it; the
    /// base is recovered by rounding down). An unknown address, which is
    /// what a second free of the same run is, is a silent no-op.
    ///
    /// # Safety
    ///
    /// If `p` points into a live run, that run must no longer be referenced.
    pub unsafe fn pfree(&self, p: *mut u8) {
        let ps = self.source.page_size();
        let base = ((p as usize) & !(ps - 1)) as *mut u8;
        let mut st = self.state.lock();
        let mut found = None;
        for rec in st.used.iter() {
            if (*rec.as_ptr()).addr == base {
                found = Some(rec);
                break;
            }
        }
        let rec = match found {
            None => return,
            Some(r) => r,
        };
        let pnum = (*rec.as_ptr()).page_num;
        st.used.remove(rec);
        if st.free_pages + pnum <= FREE_CAP {
            st.free_pages += pnum;
            st.free.push_front(rec);
            trace!("pfree({:p}): cached {} pages", base, pnum);
            return;
        }
        // Over budget: this run really goes back. Empty the slot first so
        // the reclaim sweep sees up-to-date counts.
        st.release_slot(rec);
        let victim = st.reclaim_victim();
        drop(st);
        debug!("pfree({:p}): unmapping {} pages", base, pnum);
        self.source.unmap(NonNull::new_unchecked(base), pnum * ps);
        if let Some(v) = victim {
            self.source.unmap(v.cast::<u8>(), ps);
        }
    }

    /// Walk all bookkeeping under the lock and report counts plus any
    /// invariant violations.
    pub fn stats(&self) -> (Validity, Stats) {
        let ps = self.source.page_size();
        let st = self.state.lock();
        let mut validity = Validity::default();
        let mut stats = Stats::default();
        unsafe {
            for page in st.meta.iter() {
                stats.meta_pages += 1;
                let slots = MetaPage::slots(page);
                let mut occupied = 0;
                for i in 0..(*page.as_ptr()).cap() {
                    if !(*slots.add(i)).addr.is_null() {
                        occupied += 1;
                    }
                }
                if occupied != (*page.as_ptr()).num {
                    validity.bad_counts += 1;
                }
            }
            for rec in st.used.iter() {
                stats.used_runs += 1;
                stats.used_pages += (*rec.as_ptr()).page_num;
                if ((*rec.as_ptr()).addr as usize) & (ps - 1) != 0 {
                    validity.unaligned += 1;
                }
                if st.container_lookup(rec).is_none() {
                    validity.orphans += 1;
                }
            }
            let mut walked = 0;
            for rec in st.free.iter() {
                stats.free_runs += 1;
                walked += (*rec.as_ptr()).page_num;
                if st.container_lookup(rec).is_none() {
                    validity.orphans += 1;
                }
            }
            stats.free_pages = walked;
            validity.drifted = walked != st.free_pages;
            validity.over_budget = walked > FREE_CAP;
        }
        (validity, stats)
    }
}

impl State {
    // Thread the boot page onto the (empty) metadata-page list. Runs under
    // the lock on every allocation; only the first ever does anything.
    unsafe fn ensure_boot(&mut self) {
        if self.meta.is_empty() {
            self.meta.push_front(NonNull::new_unchecked(self.boot));
        }
    }

    // Take an empty record slot, creating a metadata page if every slot
    // everywhere is occupied. The returned slot is marked with a placeholder
    // address so nested slot searches under this same lock acquisition
    // cannot hand it out again.
    unsafe fn reserve_slot<S: PageSource>(&mut self, source: &S) -> NonNull<RunRecord> {
        if let Some((page, slot)) = self.find_empty_slot() {
            self.claim(page, slot);
            return slot;
        }
        // No slot anywhere: dedicate a run to metadata. There is no slot to
        // record a split tail in either, hence the scratch.
        let mut tail = SplitTail::none();
        let base = self.find_free_run(source, 1, Some(&mut tail));
        let page = self.install_meta_page(source, base);
        if let Some((addr, page_num)) = tail.take() {
            // Commit the finder's split remainder into slot 0 so the cached
            // tail stays accounted for.
            let slot0 = NonNull::new_unchecked(MetaPage::slots(page));
            (*slot0.as_ptr()).addr = addr.as_ptr();
            (*slot0.as_ptr()).page_num = page_num;
            (*page.as_ptr()).num += 1;
            self.free.push_front(slot0);
        }
        let idx = (*page.as_ptr()).num;
        let slot = NonNull::new_unchecked(MetaPage::slots(page).add(idx));
        self.claim(page, slot);
        slot
    }

    unsafe fn find_empty_slot(&self) -> Option<(NonNull<MetaPage>, NonNull<RunRecord>)> {
        for page in self.meta.iter() {
            let slots = MetaPage::slots(page);
            for i in 0..(*page.as_ptr()).cap() {
                let slot = slots.add(i);
                if (*slot).addr.is_null() {
                    return Some((page, NonNull::new_unchecked(slot)));
                }
            }
        }
        None
    }

    unsafe fn claim(&mut self, page: NonNull<MetaPage>, slot: NonNull<RunRecord>) {
        (*slot.as_ptr()).addr = RunRecord::claim_mark();
        (*slot.as_ptr()).page_num = 0;
        (*page.as_ptr()).num += 1;
        (*page.as_ptr()).touch();
    }

    // Fill a reserved slot with a live run and thread it onto the used list.
    unsafe fn commit(&mut self, slot: NonNull<RunRecord>, base: NonNull<u8>, pnum: usize) {
        (*slot.as_ptr()).addr = base.as_ptr();
        (*slot.as_ptr()).page_num = pnum;
        self.used.push_front(slot);
    }

    // Return a record slot to the empty pool.
    unsafe fn release_slot(&mut self, rec: NonNull<RunRecord>) {
        let page = self.container_of(rec);
        (*rec.as_ptr()).addr = null_mut();
        (*rec.as_ptr()).page_num = 0;
        (*page.as_ptr()).num -= 1;
    }

    // Locate pnum contiguous pages: first fit from the free cache, splitting
    // an oversized run, else a fresh mapping.
    //
    // A consumed cache record releases its slot here, which is also what
    // guarantees the split tail a slot in the extra-less path: the release
    // frees one before the tail goes looking.
    unsafe fn find_free_run<S: PageSource>(
        &mut self,
        source: &S,
        pnum: usize,
        extra: Option<&mut SplitTail>,
    ) -> NonNull<u8> {
        let ps = source.page_size();
        let mut fit = None;
        for rec in self.free.iter() {
            if (*rec.as_ptr()).page_num >= pnum {
                fit = Some(rec);
                break;
            }
        }
        let rec = match fit {
            None => return source.map(pnum),
            Some(r) => r,
        };
        let base = NonNull::new_unchecked((*rec.as_ptr()).addr);
        let spare = (*rec.as_ptr()).page_num - pnum;
        self.free.remove(rec);
        self.free_pages -= pnum;
        self.release_slot(rec);
        if spare > 0 {
            let tail = NonNull::new_unchecked(base.as_ptr().add(pnum * ps));
            trace!("split {:p}: keeping {}, tail {} at {:p}", base, pnum, spare, tail);
            match extra {
                Some(out) => out.set(tail, spare),
                None => {
                    let (page, slot) = match self.find_empty_slot() {
                        Some(found) => found,
                        None => die("page allocator: no slot for split tail"),
                    };
                    (*slot.as_ptr()).addr = tail.as_ptr();
                    (*slot.as_ptr()).page_num = spare;
                    (*page.as_ptr()).num += 1;
                    self.free.push_front(slot);
                }
            }
        }
        base
    }

    // Turn a fresh one-page run into a metadata page and thread it onto the
    // list. The slot array is zeroed by hand: a run recycled from the cache
    // carries whatever its last user wrote.
    unsafe fn install_meta_page<S: PageSource>(
        &mut self,
        source: &S,
        base: NonNull<u8>,
    ) -> NonNull<MetaPage> {
        let ps = source.page_size();
        let cap = (ps - mem::size_of::<MetaPage>()) / mem::size_of::<RunRecord>();
        debug_assert!(cap >= 2);
        let page = base.cast::<MetaPage>();
        ptr::write(
            page.as_ptr(),
            MetaPage {
                cap,
                num: 0,
                link: Links::new(),
            },
        );
        let slots = MetaPage::slots(page);
        for i in 0..cap {
            ptr::write(slots.add(i), RunRecord::EMPTY);
        }
        self.meta.push_front(page);
        debug!("new metadata page at {:p}, {} slots", base.as_ptr(), cap);
        page
    }

    // Second-chance sweep, at most one victim per call. Occupied pages get
    // their mark cleared; empty pages are condemned only on the second
    // consecutive empty observation. The boot page is never a candidate.
    unsafe fn reclaim_victim(&mut self) -> Option<NonNull<MetaPage>> {
        let mut victim = None;
        for page in self.meta.iter() {
            if page.as_ptr() == self.boot {
                continue;
            }
            if (*page.as_ptr()).num > 0 {
                (*page.as_ptr()).touch();
                continue;
            }
            if !(*page.as_ptr()).spare_once() {
                victim = Some(page);
                break;
            }
        }
        if let Some(v) = victim {
            self.meta.remove(v);
            debug!("reclaiming metadata page {:p}", v.as_ptr());
        }
        victim
    }

    unsafe fn container_lookup(&self, rec: NonNull<RunRecord>) -> Option<NonNull<MetaPage>> {
        let needle = rec.as_ptr() as usize;
        for page in self.meta.iter() {
            let (start, end) = MetaPage::span(page);
            if needle > start && needle < end {
                return Some(page);
            }
        }
        None
    }

    // Find the metadata page whose slot array contains rec. A miss means
    // the bookkeeping is corrupt, which is not recoverable.
    unsafe fn container_of(&self, rec: NonNull<RunRecord>) -> NonNull<MetaPage> {
        match self.container_lookup(rec) {
            Some(page) => page,
            None => die("page allocator: record outside every metadata page"),
        }
    }
}

/// Page source backed by a fixed in-memory slab with an artificially small
/// page size, for tests.
///
/// Runs are carved off a bump cursor and "unmapped" runs are abandoned
/// rather than recycled, which keeps every run the source hands out fresh
/// and zeroed, the same guarantee a real anonymous mapping gives.
pub struct ToyPages {
    heap: UnsafeCell<ToySlab>,
    next: Cell<usize>,
    mapped: Cell<usize>,
    unmapped: Cell<usize>,
}

/// Page size of [`ToyPages`], chosen small so metadata pages hold only a
/// handful of slots and reclamation scenarios stay cheap to set up.
pub const TOY_PAGE_SIZE: usize = 256;

const TOY_SLAB_PAGES: usize = 2048;

#[repr(C, align(256))]
struct ToySlab([u8; TOY_PAGE_SIZE * TOY_SLAB_PAGES]);

const_assert!(TOY_PAGE_SIZE.is_power_of_two());

impl ToyPages {
    pub fn new() -> Self {
        ToyPages {
            heap: UnsafeCell::new(ToySlab([0; TOY_PAGE_SIZE * TOY_SLAB_PAGES])),
            next: Cell::new(0),
            mapped: Cell::new(0),
            unmapped: Cell::new(0),
        }
    }

    /// Pages handed out so far.
    pub fn mapped(&self) -> usize {
        self.mapped.get()
    }

    /// Pages given back (and abandoned) so far.
    pub fn unmapped(&self) -> usize {
        self.unmapped.get()
    }
}

impl Default for ToyPages {
    fn default() -> Self {
        ToyPages::new()
    }
}

impl PageSource for ToyPages {
    fn page_size(&self) -> usize {
        TOY_PAGE_SIZE
    }

    unsafe fn map(&self, pnum: usize) -> NonNull<u8> {
        let idx = self.next.get();
        if idx + pnum > TOY_SLAB_PAGES {
            panic!("toy slab exhausted: {} + {} pages", idx, pnum);
        }
        self.next.set(idx + pnum);
        self.mapped.set(self.mapped.get() + pnum);
        NonNull::new_unchecked((self.heap.get() as *mut u8).add(idx * TOY_PAGE_SIZE))
    }

    unsafe fn unmap(&self, _base: NonNull<u8>, len: usize) {
        self.unmapped.set(self.unmapped.get() + len / TOY_PAGE_SIZE);
    }
}
