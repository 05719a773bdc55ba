//! Microbenchmarks for the phaser primitives backing the recording path.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use hindsight::RecordingPhaser;

fn bench_writer_section(c: &mut Criterion) {
    let mut group = c.benchmark_group("phaser");
    group.throughput(Throughput::Elements(1));

    group.bench_function("writer_enter_exit", |b| {
        let phaser = RecordingPhaser::new();
        b.iter(|| {
            let section = phaser.writer_critical_section();
            black_box(&section);
        });
    });

    group.bench_function("flip_phase_uncontended", |b| {
        let phaser = RecordingPhaser::new();
        b.iter(|| {
            let reader = phaser.reader_lock();
            reader.flip_phase();
        });
    });

    group.finish();
}

criterion_group!(benches, bench_writer_section);
criterion_main!(benches);
