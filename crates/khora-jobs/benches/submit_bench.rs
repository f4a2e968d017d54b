use criterion::{criterion_group, criterion_main, Criterion};
use khora_jobs::{JobDescriptor, JobType, Scheduler, SchedulerConfig};
use std::hint::black_box;
use std::sync::atomic::{AtomicU64, Ordering};

fn accumulate(data: *mut ()) {
    let total = unsafe { &*(data as *const AtomicU64) };
    let mut value = 0u64;
    for i in 0..256u64 {
        value = value.wrapping_add(black_box(i));
    }
    total.fetch_add(value, Ordering::Relaxed);
}

fn bench_submit(c: &mut Criterion) {
    let scheduler = Scheduler::init(SchedulerConfig::default().with_capacities(4096, 256, 64))
        .expect("benchmark scheduler should start");
    let total = AtomicU64::new(0);

    let mut group = c.benchmark_group("Job Submission");

    for batch_size in [1usize, 64, 1024] {
        let jobs = vec![JobDescriptor::from_ref(accumulate, &total, JobType::Worker); batch_size];
        group.bench_function(format!("submit + wait_spin ({batch_size} jobs)"), |b| {
            b.iter(|| {
                let handle = scheduler.submit(&jobs).expect("batch should fit");
                scheduler.wait_spin(handle, 0);
                scheduler.release(handle);
            });
        });
    }

    group.finish();
    black_box(total.load(Ordering::Relaxed));
}

criterion_group!(benches, bench_submit);
criterion_main!(benches);
