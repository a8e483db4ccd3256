use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use zerotier_sendbuf::{ContigBuf, IoVec, RegionPool};

const CHUNK_SIZES: [usize; 3] = [16, 64, 256];

fn append(c: &mut Criterion) {
    let mut group = c.benchmark_group("append");
    for size in CHUNK_SIZES {
        let chunk = vec![0x42u8; size];
        group.throughput(Throughput::Bytes((size * 1024) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &chunk, |b, chunk| {
            b.iter(|| {
                let mut buf = ContigBuf::new().unwrap();
                for _ in 0..1024 {
                    buf.append(black_box(chunk)).unwrap();
                }
                buf
            })
        });
    }
    group.finish();
}

fn region_churn(c: &mut Criterion) {
    c.bench_function("region_churn", |b| {
        b.iter(|| {
            let mut pool = RegionPool::new().unwrap();
            for _ in 0..256 {
                let handle = pool.get_region(black_box(128)).unwrap();
                pool.free_region(handle);
            }
            pool
        })
    });
}

fn iov_assembly(c: &mut Criterion) {
    c.bench_function("iov_assembly", |b| {
        let mut pool = RegionPool::new().unwrap();
        let handles: Vec<_> = (0..16).map(|_| pool.get_region(64).unwrap()).collect();
        // A couple of holes so coalescing has work to do.
        pool.free_region(handles[3]);
        pool.free_region(handles[9]);

        let mut iov = [IoVec::null(); 8];
        b.iter(|| {
            let n = pool.iov_get(black_box(&mut iov));
            pool.iov_done(0);
            n
        })
    });
}

criterion_group!(benches, append, region_churn, iov_assembly);
criterion_main!(benches);
