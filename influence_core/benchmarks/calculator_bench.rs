use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use influence_core::{CharacterSheet, InfluenceCalculator, TagState};

fn sheet(items: usize) -> CharacterSheet {
    let mut sheet = CharacterSheet::npc("bench", "Bench").with_collective_size(2);
    for index in 0..items {
        let state = match index % 3 {
            0 => TagState::Positive,
            1 => TagState::Negative,
            _ => TagState::Neutral,
        };
        let id = format!("item-{index}");
        sheet = sheet
            .with_tag(&id, &id, state)
            .with_status(&id, &id, state, (index % 4) as u32);
    }
    sheet
}

fn bench_compute(c: &mut Criterion) {
    let mut group = c.benchmark_group("influence_compute");
    let calculator = InfluenceCalculator::new();

    for items in [4usize, 16, 64, 256] {
        let sheet = sheet(items);
        group.bench_with_input(BenchmarkId::new("items", items), &items, |b, _| {
            b.iter(|| calculator.compute(&sheet));
        });
    }

    group.finish();
}

criterion_group!(calculator_benches, bench_compute);
criterion_main!(calculator_benches);
