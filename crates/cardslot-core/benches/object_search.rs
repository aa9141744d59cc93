use std::sync::Arc;

use cardslot_core::{
    AttributeSet, AttributeTemplate, AttributeValue, Context, ModuleConfig, SessionMode,
    SoftCard, SoftMedium, UserType,
    attributes::{class, ids},
};
use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};

fn labelled(index: usize, private: bool) -> AttributeSet {
    AttributeSet::new()
        .with(ids::CLASS, AttributeValue::Uint(class::DATA))
        .with(ids::PRIVATE, AttributeValue::Bool(private))
        .with(
            ids::LABEL,
            AttributeValue::Bytes(format!("bench-object-{index:05}").into_bytes()),
        )
}

fn populated_context(count: usize) -> Context {
    let medium = Arc::new(SoftMedium::new());
    medium.add_reader("bench");
    let mut card = SoftCard::new("bench", b"1234", b"87654321");
    for index in 0..count {
        card = card.with_object(labelled(index, index % 2 == 0));
    }
    medium.insert_card("bench", card).unwrap();
    Context::initialize(ModuleConfig::default(), medium).unwrap()
}

fn bench_object_search(c: &mut Criterion) {
    let count = 1_000;
    let context = populated_context(count);
    let session = context.open_session(0, SessionMode::ReadOnly).unwrap();

    let target = AttributeTemplate::new().with(
        ids::LABEL,
        AttributeValue::Bytes(format!("bench-object-{:05}", count / 2 + 1).into_bytes()),
    );
    let all = AttributeTemplate::new();

    let mut group = c.benchmark_group("object_search");
    group.bench_function(BenchmarkId::new("public_label", count), |b| {
        b.iter(|| {
            let results = context.find(session, &target).unwrap();
            black_box(results.len());
        });
    });

    context.login(session, UserType::User, b"1234").unwrap();
    group.bench_function(BenchmarkId::new("authenticated_all", count), |b| {
        b.iter(|| {
            let results = context.find(session, &all).unwrap();
            black_box(results.len());
        });
    });
    group.finish();
}

criterion_group!(benches, bench_object_search);
criterion_main!(benches);
