use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use rockmap::{CacheKey, DirMap, EntryMetadata, ShmSegment, SlotState};
use tempfile::tempdir;

const CACHE_DIR: &str = "/cache/concurrency";

/// Small deterministic generator so each thread gets its own op sequence.
struct XorShift(u64);

impl XorShift {
    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }
}

fn metadata_for(key: &CacheKey) -> EntryMetadata {
    let (lo, hi) = key.words();
    EntryMetadata {
        timestamp: lo as i64,
        lastref: hi as i64,
        swap_file_sz: lo,
        refcount: 1,
        ..Default::default()
    }
}

#[test]
fn test_distinct_slots_do_not_interfere() {
    let temp = tempdir().unwrap();
    let limit = 64;
    DirMap::create_in(temp.path(), CACHE_DIR, limit).unwrap();

    let shm_dir = Arc::new(temp.path().to_path_buf());
    let barrier = Arc::new(Barrier::new(limit));
    let handles: Vec<_> = (0..limit as u64)
        .map(|i| {
            let dir = shm_dir.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let map = DirMap::open_in(&dir, CACHE_DIR).unwrap();
                let key = CacheKey::from_words(i, 0);
                barrier.wait();
                let mut handle = map.open_for_writing(&key).expect("own slot must be free");
                *handle.metadata_mut() = metadata_for(&key);
                map.close_for_writing(handle);
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let map = DirMap::open_in(&shm_dir, CACHE_DIR).unwrap();
    assert_eq!(map.entry_count(), limit);
    assert!(map.full());
    for i in 0..limit as u64 {
        let key = CacheKey::from_words(i, 0);
        let handle = map.open_for_reading(&key).unwrap();
        assert_eq!(*handle.metadata(), metadata_for(&key));
        map.close_for_reading(handle);
    }
}

#[test]
fn test_exactly_one_writer_claims_empty_slot() {
    let region = ShmSegment::anonymous(DirMap::shared_size(4)).unwrap();
    let map = DirMap::with_region(CACHE_DIR, region, 4).unwrap();
    let threads = 16;
    let barrier = Barrier::new(threads);

    for round in 0..50u64 {
        let key = CacheKey::from_words(round, 0);
        let winners: Vec<_> = thread::scope(|s| {
            let spawned: Vec<_> = (0..threads)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        map.open_for_writing(&key)
                    })
                })
                .collect();
            spawned
                .into_iter()
                .filter_map(|h| h.join().unwrap())
                .collect()
        });

        assert_eq!(winners.len(), 1, "round {}", round);
        for handle in winners {
            map.close_for_writing(handle);
        }
    }
}

#[test]
fn test_mixed_workload_keeps_invariants() {
    let temp = tempdir().unwrap();
    let limit = 16usize;
    DirMap::create_in(temp.path(), CACHE_DIR, limit).unwrap();

    let threads = 8;
    let ops_per_thread = 5_000;
    let shm_dir = Arc::new(temp.path().to_path_buf());
    let barrier = Arc::new(Barrier::new(threads));
    let reads = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..threads as u64)
        .map(|t| {
            let dir = shm_dir.clone();
            let barrier = barrier.clone();
            let reads = reads.clone();
            thread::spawn(move || {
                // Every thread is its own "process" with its own mapping.
                let map = DirMap::open_in(&dir, CACHE_DIR).unwrap();
                let mut rng = XorShift(0x9E37_79B9_7F4A_7C15 ^ (t + 1));
                barrier.wait();
                for _ in 0..ops_per_thread {
                    let key = CacheKey::from_words(rng.next() % 64, 0);
                    match rng.next() % 4 {
                        0 => {
                            if let Some(mut handle) = map.open_for_writing(&key) {
                                *handle.metadata_mut() = metadata_for(&key);
                                map.close_for_writing(handle);
                            }
                        }
                        1 => {
                            map.free(map.slot_index(&key));
                        }
                        _ => {
                            if let Some(handle) = map.open_for_reading(&key) {
                                assert_eq!(handle.key(), &key);
                                assert_eq!(*handle.metadata(), metadata_for(&key));
                                reads.fetch_add(1, Ordering::Relaxed);
                                map.close_for_reading(handle);
                            }
                        }
                    }
                    assert!(map.entry_count() <= map.entry_limit());
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let map = DirMap::open_in(&shm_dir, CACHE_DIR).unwrap();
    let stats = map.stats();
    assert_eq!(stats.writing, 0);
    assert_eq!(stats.freeing, 0);
    assert_eq!(stats.waiting_to_be_freed, 0);
    assert_eq!(stats.count, stats.usable);
    assert_eq!(stats.empty + stats.usable, limit);
    for id in 0..limit as u32 {
        let snap = map.snapshot(id);
        assert_eq!(snap.read_level, 0);
        if snap.state == Some(SlotState::Empty) {
            assert!(snap.key.is_zero());
        } else {
            assert_eq!(map.slot_index(&snap.key), id);
        }
    }
    assert!(reads.load(Ordering::Relaxed) > 0);
}

#[test]
fn test_reader_pins_entry_against_concurrent_free() {
    let region = ShmSegment::anonymous(DirMap::shared_size(2)).unwrap();
    let map = DirMap::with_region(CACHE_DIR, region, 2).unwrap();
    let key = CacheKey::from_words(1, 0);
    let done = AtomicBool::new(false);

    thread::scope(|s| {
        // Writer keeps republishing the key; freer keeps evicting it.
        s.spawn(|| {
            while !done.load(Ordering::Relaxed) {
                if let Some(mut handle) = map.open_for_writing(&key) {
                    *handle.metadata_mut() = metadata_for(&key);
                    map.close_for_writing(handle);
                }
            }
        });
        s.spawn(|| {
            while !done.load(Ordering::Relaxed) {
                map.free(1);
            }
        });

        for _ in 0..20_000 {
            if let Some(handle) = map.open_for_reading(&key) {
                // Whatever happens to the slot meanwhile, the view holds.
                for _ in 0..10 {
                    assert_eq!(*handle.metadata(), metadata_for(&key));
                    std::hint::spin_loop();
                }
                assert_ne!(map.slot_state(1), Some(SlotState::Empty));
                map.close_for_reading(handle);
            }
        }
        done.store(true, Ordering::Relaxed);
    });

    assert_eq!(map.read_level(1), 0);
    let state = map.slot_state(1);
    assert!(matches!(state, Some(SlotState::Empty) | Some(SlotState::Usable)));
    assert_eq!(map.entry_count(), usize::from(state == Some(SlotState::Usable)));
}
