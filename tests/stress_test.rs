//! Randomized alloc/free stress against an isolated in-memory instance,
//! validating the allocator's bookkeeping after every step.

use pagerun::{BootPage, PageAlloc, ToyPages, FREE_CAP, TOY_PAGE_SIZE};

use rand::distributions::Distribution;
use rand::seq::SliceRandom;
use rand::{RngCore, SeedableRng};
use test_log::test;

const STEPS: usize = 1000;
const SLOTS: usize = 64;

#[test]
fn test_stress() {
    let boot = Box::leak(Box::new(BootPage::new()));
    let alloc: &PageAlloc<ToyPages> = Box::leak(Box::new(unsafe {
        PageAlloc::with_boot(ToyPages::new(), boot as *mut BootPage)
    }));

    // (base, pages, tag); null base means the slot is free.
    let mut runs: [(*mut u8, usize, u8); SLOTS] = [(std::ptr::null_mut(), 0, 0); SLOTS];

    let seed: u64 = rand::thread_rng().next_u64();
    log::info!("Using seed {}", seed);
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let sizes = rand::distributions::Uniform::new_inclusive(1usize, 3);

    let mut tag: u8 = 0;
    for step in 0..STEPS {
        let chosen = runs.choose_mut(&mut rng).unwrap();
        let &mut (ptr, pages, old_tag) = chosen;
        if ptr.is_null() {
            let pnum = sizes.sample(&mut rng);
            let p = alloc.palloc(pnum);
            assert!(!p.is_null());
            assert_eq!(p as usize % TOY_PAGE_SIZE, 0);
            tag = tag.wrapping_add(1);
            // Tag the run's edges; a later mismatch means two live runs
            // overlapped.
            unsafe {
                p.write(tag);
                p.add(pnum * TOY_PAGE_SIZE - 1).write(tag);
            }
            *chosen = (p, pnum, tag);
        } else {
            unsafe {
                assert_eq!(ptr.read(), old_tag, "step {}: first byte clobbered", step);
                assert_eq!(
                    ptr.add(pages * TOY_PAGE_SIZE - 1).read(),
                    old_tag,
                    "step {}: last byte clobbered",
                    step
                );
                alloc.pfree(ptr);
            }
            *chosen = (std::ptr::null_mut(), 0, 0);
        }

        let (validity, stats) = alloc.stats();
        assert!(validity.is_valid(), "step {}: {:?}", step, validity);
        assert!(stats.free_pages <= FREE_CAP);
    }

    // Drain everything and make sure it all comes back.
    for chosen in runs.iter_mut() {
        let (ptr, _, _) = *chosen;
        if !ptr.is_null() {
            unsafe { alloc.pfree(ptr) };
            *chosen = (std::ptr::null_mut(), 0, 0);
        }
    }
    let (validity, stats) = alloc.stats();
    log::info!("final stats: {:?}", stats);
    assert!(validity.is_valid(), "{:?}", validity);
    assert_eq!(stats.used_runs, 0);
    assert_eq!(stats.used_pages, 0);
    assert!(stats.free_pages <= FREE_CAP);
}
