use std::time::Duration;

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde_json::json;
use tokio::time::Instant;

use herald_core::{CorrelationId, DeliveryId};
use herald_events::{Category, Event, EventName, Lane, Priority};
use herald_infra::config::RetryBudgetsConfig;
use herald_infra::pipeline::{BatchBuffer, ProcessedEvent};
use herald_infra::staging::{Claim, ClaimToken};
use herald_infra::retry::{Backoff, BackoffConfig, BackoffStrategy, BudgetRule, RetryBudget, RetryBudgetTable};

fn bench_backoff(c: &mut Criterion) {
    let mut group = c.benchmark_group("backoff");
    let backoff = Backoff::new(BackoffConfig::default());
    let mut rng = StdRng::seed_from_u64(7);

    for strategy in [
        BackoffStrategy::Exponential,
        BackoffStrategy::Linear { step_ms: 5_000 },
        BackoffStrategy::None,
    ] {
        group.bench_with_input(BenchmarkId::new("delay", format!("{strategy:?}")), &strategy, |b, s| {
            b.iter(|| {
                for attempt in 1..=10 {
                    black_box(backoff.delay_with_rng(attempt, *s, &mut rng).unwrap());
                }
            });
        });
    }
    group.finish();
}

fn bench_budget_resolution(c: &mut Criterion) {
    let mut group = c.benchmark_group("budget_resolution");
    let defaults = RetryBudgetsConfig::default();
    let small = RetryBudgetTable::new(defaults.rules.clone(), defaults.default).unwrap();

    let many_rules = (0..200).map(|i| {
        BudgetRule::new(
            format!("domain{i}.events"),
            RetryBudget::new(3, BackoffStrategy::Exponential),
        )
    });
    let large = RetryBudgetTable::new(many_rules.chain(defaults.rules), defaults.default).unwrap();

    let names: Vec<EventName> = [
        "ml.training.run.started",
        "ui.command.clicked",
        "integration.crm.sync",
        "domain150.events.created",
        "chat.message.sent",
    ]
    .into_iter()
    .map(|n| EventName::new(n).unwrap())
    .collect();

    for (label, table) in [("default_rules", &small), ("200_rules", &large)] {
        group.throughput(Throughput::Elements(names.len() as u64));
        group.bench_function(label, |b| {
            b.iter(|| {
                for name in &names {
                    black_box(table.resolve(name));
                }
            });
        });
    }
    group.finish();
}

fn processed(source: &str) -> ProcessedEvent {
    let event = Event::new(
        EventName::new("chat.message.sent").unwrap(),
        source,
        Category::User,
        Priority::Normal,
        CorrelationId::new("corr").unwrap(),
        json!({"text": "hello"}),
    );
    ProcessedEvent::new(Claim::new(DeliveryId::new(), ClaimToken::new()), event)
}

fn bench_batch_buffer(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch_buffer");

    for sources in [1usize, 16, 256] {
        let events: Vec<ProcessedEvent> = (0..1_000)
            .map(|i| processed(&format!("source-{}", i % sources)))
            .collect();
        group.throughput(Throughput::Elements(events.len() as u64));
        group.bench_with_input(BenchmarkId::new("push_and_drain", sources), &events, |b, events| {
            b.iter(|| {
                let mut buffer = BatchBuffer::new(Lane::Standard, 25, Duration::from_secs(2));
                let now = Instant::now();
                let mut flushed = 0;
                for event in events.iter().cloned() {
                    if let Some(batch) = buffer.push(event, now) {
                        flushed += batch.events.len();
                    }
                }
                for batch in buffer.drain() {
                    flushed += batch.events.len();
                }
                black_box(flushed)
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_backoff, bench_budget_resolution, bench_batch_buffer);
criterion_main!(benches);
