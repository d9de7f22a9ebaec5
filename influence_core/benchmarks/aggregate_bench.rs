use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use influence_core::{
    IdentityKey, InfluenceAggregator, InfluenceCache, InfluenceRecord, TokenRef,
};

fn scene(npcs: usize) -> (InfluenceCache, Vec<TokenRef>) {
    let mut cache = InfluenceCache::new();
    let mut tokens = Vec::with_capacity(npcs * 2);
    for index in 0..npcs {
        let character = format!("npc-{index}");
        let linked = index % 2 == 0;
        for copy in 0..2 {
            let token_id = format!("tok-{index}-{copy}");
            let key = if linked { character.clone() } else { token_id.clone() };
            let total = (index % 5) as i64 - 2;
            cache.upsert(InfluenceRecord {
                identity_key: IdentityKey::new(key),
                npc_id: character.clone(),
                npc_name: character.clone(),
                token_id: Some(token_id.clone()),
                token_name: Some(token_id.clone()),
                actor_link: linked,
                tag_influence: total,
                status_influence: 0,
                total_influence: total,
                timestamp: 0,
            });
            tokens.push(TokenRef {
                id: token_id.clone(),
                name: token_id,
                character_id: character.clone(),
                actor_linked: linked,
            });
        }
    }
    (cache, tokens)
}

fn bench_scene_total(c: &mut Criterion) {
    let mut group = c.benchmark_group("scene_total");
    let aggregator = InfluenceAggregator::default();

    for npcs in [8usize, 32, 128, 512] {
        let (cache, tokens) = scene(npcs);
        group.bench_with_input(BenchmarkId::new("npcs", npcs), &npcs, |b, _| {
            b.iter(|| aggregator.total_for_scene(&cache, &tokens));
        });
    }

    group.finish();
}

criterion_group!(aggregate_benches, bench_scene_total);
criterion_main!(aggregate_benches);
