use criterion::{Criterion, black_box, criterion_group, criterion_main};

use strata_cell::CellCoord;
use strata_store::{ShapeHandle, TerrainCellStore};

fn bench_claim_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("claim_cycle");
    let store = TerrainCellStore::new();
    let k = CellCoord::new(0, 0, 0).key();
    let i = store.add_cell(k).unwrap();
    group.bench_function("schedule_begin_finish", |b| {
        b.iter(|| {
            let v = store.schedule_for_generation(black_box(i)).unwrap();
            store.begin_generation(i, v);
            black_box(store.finish_generation(i, k, v, ShapeHandle::new(1), false).ok());
        });
    });
    group.bench_function("rejected_claim", |b| {
        let v = store.schedule_for_generation(i).unwrap();
        b.iter(|| black_box(store.schedule_for_generation(black_box(i))));
        store.abandon_generation(i, v);
    });
    group.finish();
}

fn bench_add_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("add_cell");
    let store = TerrainCellStore::new();
    for n in 0..4096 {
        store.add_cell(CellCoord::new(n % 64, 0, n / 64).key()).unwrap();
    }
    group.bench_function("existing_key_fast_path", |b| {
        let k = CellCoord::new(17, 0, 33).key();
        b.iter(|| black_box(store.add_cell(black_box(k)).unwrap()));
    });
    group.finish();
}

criterion_group!(benches, bench_claim_cycle, bench_add_lookup);
criterion_main!(benches);
