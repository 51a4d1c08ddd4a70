use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;

const OPS: u64 = 100_000;

/// shadowheap alloc/free throughput through the thread cache.
fn shadowheap_alloc_free(size: usize) {
    for _ in 0..OPS {
        let ptr = shadowheap::GlobalHeap::allocate(size, 8, false).unwrap();
        black_box(ptr);
        unsafe { shadowheap::GlobalHeap::deallocate(ptr.as_ptr()) };
    }
}

/// libc alloc/free throughput.
fn libc_malloc_free(size: usize) {
    for _ in 0..OPS {
        unsafe {
            let ptr = libc::malloc(size);
            black_box(ptr);
            libc::free(ptr);
        }
    }
}

fn benchmark_alloc_throughput(c: &mut Criterion) {
    drop(shadowheap::init());

    let mut group = c.benchmark_group("alloc_throughput");

    // The last size is the largest class; its run budget is one, so every
    // iteration round-trips through the back end.
    for size in [16, 64, 256, 1024, 4096, 1 << 21] {
        group.throughput(Throughput::Elements(OPS));

        group.bench_with_input(BenchmarkId::new("shadowheap", size), &size, |b, &size| {
            b.iter(|| shadowheap_alloc_free(size))
        });

        group.bench_with_input(BenchmarkId::new("libc", size), &size, |b, &size| {
            b.iter(|| libc_malloc_free(size))
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_alloc_throughput);
criterion_main!(benches);
