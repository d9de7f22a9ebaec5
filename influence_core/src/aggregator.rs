use std::collections::{HashMap, HashSet};

use influence_proto::IdentityKey;
use serde::Serialize;

use crate::cache::InfluenceCache;
use crate::identity::IdentityResolver;
use crate::world::TokenRef;

/// One identity's share of a scene total.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SceneContribution {
    pub identity_key: IdentityKey,
    pub npc_name: Option<String>,
    pub total_influence: i64,
    /// Tokens in the scene resolving to this identity.
    pub token_count: usize,
}

/// Read-side scene totals for roll resolution. Never writes to the cache.
#[derive(Debug, Clone, Copy, Default)]
pub struct InfluenceAggregator {
    resolver: IdentityResolver,
}

impl InfluenceAggregator {
    pub fn new(resolver: IdentityResolver) -> Self {
        Self { resolver }
    }

    /// Sum of cached influence over the distinct identities present in the
    /// scene. Linked tokens of one character count once; uncached keys add 0.
    pub fn total_for_scene<'a, I>(&self, cache: &InfluenceCache, scene_tokens: I) -> i64
    where
        I: IntoIterator<Item = &'a TokenRef>,
    {
        let mut processed: HashSet<IdentityKey> = HashSet::new();
        let mut total = 0;
        for token in scene_tokens {
            let key = self.resolver.resolve(Some(token), &token.character_id);
            if !processed.insert(key.clone()) {
                continue;
            }
            total += cache
                .get(key.as_str())
                .map(|record| record.total_influence)
                .unwrap_or(0);
        }
        total
    }

    /// Per-identity breakdown in first-seen order.
    pub fn contributions<'a, I>(&self, cache: &InfluenceCache, scene_tokens: I) -> Vec<SceneContribution>
    where
        I: IntoIterator<Item = &'a TokenRef>,
    {
        let mut order: Vec<SceneContribution> = Vec::new();
        let mut index: HashMap<IdentityKey, usize> = HashMap::new();
        for token in scene_tokens {
            let key = self.resolver.resolve(Some(token), &token.character_id);
            if let Some(&position) = index.get(&key) {
                order[position].token_count += 1;
                continue;
            }
            let record = cache.get(key.as_str());
            index.insert(key.clone(), order.len());
            order.push(SceneContribution {
                identity_key: key,
                npc_name: record.map(|record| record.npc_name.clone()),
                total_influence: record.map(|record| record.total_influence).unwrap_or(0),
                token_count: 1,
            });
        }
        order
    }
}
