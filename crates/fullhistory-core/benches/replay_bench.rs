use criterion::{black_box, criterion_group, criterion_main, Criterion};
use fullhistory_core::{
    fold_entries, full_snapshot_as_delta, summarize, update_delta, Action, EntityRef, EntityType,
    EntryId, FullHistoryEntry, Snapshot, SYSTEM_ACTOR_NAME,
};
use serde_json::Value;
use time::OffsetDateTime;

fn ledger(entity: &EntityRef, length: u32) -> Vec<FullHistoryEntry> {
    let mut entries = Vec::new();
    let mut prior: Option<Snapshot> = None;
    for revision in 0..length {
        let current = (0..16)
            .map(|field| {
                let value = if field % 4 == 0 { Value::from(revision) } else { Value::from(field) };
                (format!("field_{field}"), value)
            })
            .collect::<Snapshot>();
        let (action, data) = match &prior {
            None => (Action::Create, full_snapshot_as_delta(&current)),
            Some(prior) => (Action::Update, update_delta(Some(prior), &current)),
        };
        entries.push(FullHistoryEntry {
            entry_id: EntryId::new(),
            entity: entity.clone(),
            revision,
            action,
            info: summarize(action, SYSTEM_ACTOR_NAME, Some(&data)),
            data: Some(data),
            request_id: None,
            timestamp: OffsetDateTime::UNIX_EPOCH,
        });
        prior = Some(current);
    }
    entries
}

fn replay_benchmark(c: &mut Criterion) {
    let Ok(entity_type) = EntityType::parse("bench.record") else {
        return;
    };
    let Ok(entity) = EntityRef::new(entity_type, 1) else {
        return;
    };
    let entries = ledger(&entity, 1_000);

    c.bench_function("fold_1000_entries_trusting", |b| {
        b.iter(|| fold_entries(black_box(&entity), black_box(&entries), false));
    });
    c.bench_function("fold_1000_entries_audited", |b| {
        b.iter(|| fold_entries(black_box(&entity), black_box(&entries), true));
    });
}

criterion_group!(benches, replay_benchmark);
criterion_main!(benches);
