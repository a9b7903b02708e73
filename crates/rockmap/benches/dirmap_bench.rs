use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rockmap::{CacheKey, DirMap, ShmSegment};

const LIMIT: usize = 1 << 16;

fn new_map() -> DirMap {
    let region = ShmSegment::anonymous(DirMap::shared_size(LIMIT)).unwrap();
    DirMap::with_region("/bench/cache", region, LIMIT).unwrap()
}

fn bench_write_close(c: &mut Criterion) {
    let map = new_map();
    let mut i = 0u64;

    c.bench_function("dirmap_write_close", |b| {
        b.iter(|| {
            // Rewriting evicts the previous occupant, so this also covers free.
            let key = CacheKey::from_words(i % LIMIT as u64, 0);
            i += 1;
            let mut handle = map.open_for_writing(black_box(&key)).unwrap();
            handle.metadata_mut().swap_file_sz = i;
            map.close_for_writing(handle);
        })
    });
}

fn bench_read_close(c: &mut Criterion) {
    let map = new_map();
    let key = CacheKey::from_words(42, 7);
    let handle = map.open_for_writing(&key).unwrap();
    map.close_for_writing(handle);

    c.bench_function("dirmap_read_close_hit", |b| {
        b.iter(|| {
            let handle = map.open_for_reading(black_box(&key)).unwrap();
            black_box(handle.metadata().swap_file_sz);
            map.close_for_reading(handle);
        })
    });

    let miss = CacheKey::from_words(43, 7);
    c.bench_function("dirmap_read_miss", |b| {
        b.iter(|| map.open_for_reading(black_box(&miss)).is_none())
    });
}

fn bench_stats(c: &mut Criterion) {
    let map = new_map();
    c.bench_function("dirmap_stats_64k", |b| b.iter(|| black_box(map.stats())));
}

criterion_group!(benches, bench_write_close, bench_read_close, bench_stats);
criterion_main!(benches);
