//! Performance benchmarks for twinmap
//!
//! Run with: cargo bench --package twinmap-core

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use twinmap_core::layout::PAGE_SIZE;
use twinmap_core::Region;

fn write_word(addr: *mut u8, value: usize) {
    unsafe { (addr as *mut usize).write_volatile(value) }
}

fn bench_region_attach(c: &mut Criterion) {
    c.bench_function("region_attach", |b| {
        b.iter(|| {
            let region = Region::attach(16 * PAGE_SIZE, None, None);
            black_box(&region);
        });
    });
}

fn bench_fault_commit_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("fault_commit_cycle");

    for pages in [1usize, 4, 16].iter() {
        group.throughput(Throughput::Bytes((pages * PAGE_SIZE) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(pages), pages, |b, &pages| {
            let mut region = Region::attach(32 * PAGE_SIZE, None, None);
            region.open_protection();
            let base = region.base();
            let mut value = 0usize;

            b.iter(|| {
                region.begin_transaction();
                value = value.wrapping_add(1);
                for p in 0..pages {
                    let addr = unsafe { base.add(p * PAGE_SIZE) };
                    region.handle_write(addr);
                    write_word(addr, value);
                }
                region.commit(true);
                black_box(&region);
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_region_attach, bench_fault_commit_cycle);
criterion_main!(benches);
