use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use std::sync::Arc;

use chrono::Utc;
use loopforge_core::TenantId;
use loopforge_infra::audit::{compute_hash, truncate_to_millis, verify_chain};
use loopforge_infra::store::{InMemoryAuditStore, NewAuditEntry};
use loopforge_infra::AuditChain;

fn bench_compute_hash(c: &mut Criterion) {
    let tenant = TenantId::new();
    let ts = truncate_to_millis(Utc::now());
    let prev = "a".repeat(64);

    c.bench_function("audit/compute_hash", |b| {
        b.iter(|| {
            compute_hash(
                black_box(tenant),
                black_box(42),
                black_box("card.transition"),
                black_box("kanban_card"),
                black_box(Some("0190c0de-0000-7000-8000-000000000000")),
                black_box(ts),
                black_box(Some(prev.as_str())),
            )
        })
    });
}

fn bench_write_and_verify(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    let mut group = c.benchmark_group("audit/chain");
    for size in [100usize, 1_000] {
        group.throughput(Throughput::Elements(size as u64));

        group.bench_with_input(BenchmarkId::new("write_entries", size), &size, |b, &size| {
            b.iter(|| {
                let chain = AuditChain::new(Arc::new(InMemoryAuditStore::new()));
                let tenant = TenantId::new();
                let entries = (0..size)
                    .map(|i| NewAuditEntry::new(tenant, "card.transition", "kanban_card").entity_id(format!("c-{i}")))
                    .collect();
                runtime.block_on(chain.write_entries(tenant, entries)).unwrap()
            })
        });

        let chain = AuditChain::new(Arc::new(InMemoryAuditStore::new()));
        let tenant = TenantId::new();
        let entries = (0..size)
            .map(|i| NewAuditEntry::new(tenant, "card.transition", "kanban_card").entity_id(format!("c-{i}")))
            .collect();
        let written = runtime.block_on(chain.write_entries(tenant, entries)).unwrap();

        group.bench_with_input(BenchmarkId::new("verify_chain", size), &written, |b, written| {
            b.iter(|| verify_chain(black_box(written)))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_compute_hash, bench_write_and_verify);
criterion_main!(benches);
