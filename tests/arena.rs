//! Arena scenarios over an isolated in-memory page allocator.

use core::mem;

use pagerun::{Arena, BootPage, PageAlloc, ToyPages, TOY_PAGE_SIZE};

use test_log::test;

const PS: usize = TOY_PAGE_SIZE;

fn fresh() -> &'static PageAlloc<ToyPages> {
    let boot = Box::leak(Box::new(BootPage::new()));
    Box::leak(Box::new(unsafe {
        PageAlloc::with_boot(ToyPages::new(), boot as *mut BootPage)
    }))
}

#[test]
fn handle_is_embedded_in_the_first_run() {
    let pager = fresh();
    let arena = Arena::create_in(pager).unwrap();
    let p = unsafe { (*arena.as_ptr()).alloc(8) };
    // The first allocation begins right after the handle, in the same run.
    assert_eq!(
        p as usize,
        arena.as_ptr() as usize + mem::size_of::<Arena<ToyPages>>()
    );
    unsafe { Arena::destroy(arena) };
}

#[test]
fn bumps_are_linear_within_a_run() {
    let pager = fresh();
    let arena = Arena::create_ext_in(pager, 4 * PS, PS).unwrap();
    let sizes = [8usize, 24, 100, 3, 65];
    let mut last: Option<(usize, usize)> = None;
    for &k in &sizes {
        let p = unsafe { (*arena.as_ptr()).alloc(k) } as usize;
        if let Some((q, qk)) = last {
            assert!(p > q);
            assert!(p - q >= qk);
        }
        last = Some((p, k));
    }
    unsafe { Arena::destroy(arena) };
}

#[test]
fn exhausting_the_head_grows_the_chain() {
    let pager = fresh();
    let arena = Arena::create_ext_in(pager, PS, PS).unwrap();
    let room = PS - mem::size_of::<Arena<ToyPages>>();

    // Fill the initial run to the byte.
    let p1 = unsafe { (*arena.as_ptr()).alloc(room) };
    assert_eq!(p1 as usize % PS, mem::size_of::<Arena<ToyPages>>());
    let (_, stats) = pager.stats();
    assert_eq!(stats.used_runs, 1);

    // The next byte does not fit; a fresh run is chained in and the
    // allocation lands just past its header.
    let p2 = unsafe { (*arena.as_ptr()).alloc(1) };
    assert!(!p2.is_null());
    assert_eq!(p2 as usize % PS, mem::size_of::<pagerun::ArenaPage>());
    let (_, stats) = pager.stats();
    assert_eq!(stats.used_runs, 2);

    unsafe { Arena::destroy(arena) };
}

#[test]
fn requests_larger_than_the_growth_step_get_their_own_run() {
    let pager = fresh();
    let arena = Arena::create_ext_in(pager, PS, PS).unwrap();
    // 3 pages of payload plus the page header forces a 4-page run.
    let k = 3 * PS;
    let p = unsafe { (*arena.as_ptr()).alloc(k) };
    assert!(!p.is_null());
    let (_, stats) = pager.stats();
    assert_eq!(stats.used_pages, 1 + 4);

    // The whole request is writable.
    unsafe {
        p.write(0x5A);
        p.add(k - 1).write(0x5A);
        assert_eq!(p.read(), 0x5A);
    }
    unsafe { Arena::destroy(arena) };
}

#[test]
fn destroy_releases_every_run_exactly_once() {
    let pager = fresh();
    let arena = Arena::create_ext_in(pager, PS, PS).unwrap();
    unsafe {
        for _ in 0..4 {
            assert!(!(*arena.as_ptr()).alloc(PS / 2).is_null());
        }
    }
    let (_, stats) = pager.stats();
    let owned_pages = stats.used_pages;
    assert!(stats.used_runs >= 3);

    unsafe { Arena::destroy(arena) };
    let (validity, stats) = pager.stats();
    assert!(validity.is_valid(), "{:?}", validity);
    assert_eq!(stats.used_runs, 0);
    // Every run went back once: the cache holds exactly the pages the arena
    // owned, and none were unmapped.
    assert_eq!(stats.free_pages, owned_pages);
    assert_eq!(pager.source().unmapped(), 0);
}

#[test]
fn old_runs_keep_their_tail_waste() {
    let pager = fresh();
    let arena = Arena::create_ext_in(pager, PS, PS).unwrap();
    let p1 = unsafe { (*arena.as_ptr()).alloc(PS / 2) };
    // Too big for what's left, so the chain grows.
    let p2 = unsafe { (*arena.as_ptr()).alloc(PS / 2 + 8) };
    // Small again: bumped from the new head, not the old run's leftovers.
    let p3 = unsafe { (*arena.as_ptr()).alloc(8) };
    assert_eq!(p3 as usize, p2 as usize + PS / 2 + 8);
    assert_ne!(p1 as usize & !(PS - 1), p3 as usize & !(PS - 1));
    unsafe { Arena::destroy(arena) };
}
