use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use chrono::{DateTime, TimeDelta, Utc};
use dcbkit_core::{DomainResult, SortableUniqueId, Tag};
use dcbkit_events::{Event, GenericTagMultiProjector, TagProjector};
use serde_json::json;
use uuid::Uuid;

struct Balance;

impl TagProjector for Balance {
    const NAME: &'static str = "Balance";
    const VERSION: &'static str = "1";
    type State = i64;

    fn project(state: i64, event: &Event) -> DomainResult<i64> {
        Ok(state + event.payload["amount"].as_i64().unwrap_or(0))
    }
}

fn now() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

/// `count` deposits spread over `accounts` tags, one millisecond apart, ending at `end`.
fn deposits(count: usize, accounts: usize, end: DateTime<Utc>) -> Vec<Event> {
    (0..count)
        .map(|i| {
            let at = end - TimeDelta::milliseconds((count - i) as i64);
            Event::new(
                SortableUniqueId::generate(at, Uuid::new_v4()),
                "Deposited",
                vec![Tag::consistency("Account", format!("acc-{}", i % accounts)).unwrap()],
                json!({ "amount": 1 }),
            )
        })
        .collect()
}

fn bench_process_event(c: &mut Criterion) {
    let mut group = c.benchmark_group("process_event");

    for &count in &[1_000usize, 10_000] {
        group.throughput(Throughput::Elements(count as u64));

        // Everything older than the threshold: fast path, no buffering.
        let safe = deposits(count, 100, now() - TimeDelta::seconds(60));
        group.bench_with_input(BenchmarkId::new("safe", count), &safe, |b, events| {
            let threshold = SortableUniqueId::threshold(now() - TimeDelta::seconds(20));
            b.iter(|| {
                let mut projector = GenericTagMultiProjector::<Balance>::new("Account");
                for e in events {
                    projector.process_event(black_box(e), &threshold).unwrap();
                }
                projector
            })
        });

        // Everything inside the safe window: every event is buffered.
        let fresh = deposits(count, 100, now());
        group.bench_with_input(BenchmarkId::new("unsafe", count), &fresh, |b, events| {
            let threshold = SortableUniqueId::threshold(now() - TimeDelta::seconds(20));
            b.iter(|| {
                let mut projector = GenericTagMultiProjector::<Balance>::new("Account");
                for e in events {
                    projector.process_event(black_box(e), &threshold).unwrap();
                }
                projector
            })
        });
    }

    group.finish();
}

fn bench_safe_view(c: &mut Criterion) {
    let events = deposits(10_000, 100, now());
    let buffered_at = SortableUniqueId::threshold(now() - TimeDelta::seconds(20));
    let mut projector = GenericTagMultiProjector::<Balance>::new("Account");
    for e in &events {
        projector.process_event(e, &buffered_at).unwrap();
    }
    let half = SortableUniqueId::threshold(now() - TimeDelta::milliseconds(5_000));

    c.bench_function("safe_tag_states_10k_buffered", |b| {
        b.iter(|| projector.safe_tag_states(black_box(&half)).unwrap())
    });
    c.bench_function("serialize_10k_buffered", |b| {
        b.iter(|| projector.serialize(black_box(&half)).unwrap())
    });
}

criterion_group!(benches, bench_process_event, bench_safe_view);
criterion_main!(benches);
