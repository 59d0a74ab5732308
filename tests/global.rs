//! Smoke and concurrency tests against the process-wide allocator, i.e.
//! real anonymous mappings.
//!
//! Tests in this file share one allocator (and run concurrently), so they
//! assert validity and their own pointers' behavior, never global counts.

use std::thread;

use pagerun::{arena_alloc, arena_create_ext, arena_free, page_size, palloc, pfree};

use test_log::test;

#[test]
fn roundtrip_on_real_pages() {
    let ps = page_size();
    assert!(ps.is_power_of_two());

    let p = palloc(2);
    assert!(!p.is_null());
    assert_eq!(p as usize % ps, 0);
    unsafe {
        p.write(0xAA);
        p.add(2 * ps - 1).write(0x55);
        assert_eq!(p.read(), 0xAA);
        assert_eq!(p.add(2 * ps - 1).read(), 0x55);
        pfree(p);
    }

    let (validity, _) = pagerun::global().stats();
    assert!(validity.is_valid(), "{:?}", validity);
}

#[test]
fn invalid_count_sets_errno() {
    assert!(palloc(0).is_null());
    assert_eq!(errno::errno().0, libc::EINVAL);
}

#[test]
fn unknown_free_is_harmless() {
    unsafe { pfree(0x1 as *mut u8) };
    let p = palloc(1);
    assert!(!p.is_null());
    unsafe { pfree(p) };
}

#[test]
fn concurrent_alloc_free_stays_sound() {
    const THREADS: usize = 8;
    const ROUNDS: usize = 100;

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            thread::spawn(move || {
                let ps = page_size();
                for round in 0..ROUNDS {
                    let pnum = 1 + (t + round) % 3;
                    let p = palloc(pnum);
                    assert!(!p.is_null());
                    assert_eq!(p as usize % ps, 0);
                    // Runs are exclusive: our tag must survive everybody
                    // else's traffic.
                    let tag = (t * 31 + round) as u8;
                    unsafe {
                        p.write(tag);
                        p.add(pnum * ps - 1).write(tag);
                        assert_eq!(p.read(), tag);
                        assert_eq!(p.add(pnum * ps - 1).read(), tag);
                        pfree(p);
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let (validity, stats) = pagerun::global().stats();
    log::info!("post-hammer stats: {:?}", stats);
    assert!(validity.is_valid(), "{:?}", validity);
}

#[test]
fn arena_over_real_pages() {
    let ps = page_size();
    let arena = arena_create_ext(ps, ps).unwrap();
    unsafe {
        let mut prev: *mut u8 = std::ptr::null_mut();
        for _ in 0..64 {
            let p = arena_alloc(arena, 100);
            assert!(!p.is_null());
            p.write(0xC3);
            assert_ne!(p, prev);
            prev = p;
        }
        arena_free(arena);
    }
    let (validity, _) = pagerun::global().stats();
    assert!(validity.is_valid(), "{:?}", validity);
}
