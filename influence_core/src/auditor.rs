//! Authority-side repair of the influence cache.
//!
//! Three idempotent passes: duplicate keys, stale referents, drifted values.

use std::collections::HashSet;

use influence_proto::{IdentityKey, InfluenceRecord};

use crate::cache::InfluenceCache;
use crate::calculator::{InfluenceCalculator, InfluenceScore};
use crate::identity::{IdentityResolver, KeyShape};
use crate::world::WorldView;

/// Cached value that no longer matches a fresh computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriftEntry {
    pub identity_key: IdentityKey,
    pub cached: InfluenceScore,
    pub computed: InfluenceScore,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DuplicateRepair {
    /// The canonical key already holds a record; the misshapen one goes.
    Drop(IdentityKey),
    /// Nothing sits at the canonical key yet; move the record there.
    Rekey { from: IdentityKey, to: IdentityKey },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditReport {
    pub duplicates_dropped: Vec<IdentityKey>,
    pub rekeyed: Vec<(IdentityKey, IdentityKey)>,
    pub stale: Vec<IdentityKey>,
    pub drifted: Vec<DriftEntry>,
    pub digest_before: u64,
    pub digest_after: u64,
}

impl AuditReport {
    /// Keys no longer present in the cache after the audit.
    pub fn removed_keys(&self) -> Vec<IdentityKey> {
        self.duplicates_dropped
            .iter()
            .chain(self.rekeyed.iter().map(|(from, _)| from))
            .chain(self.stale.iter())
            .cloned()
            .collect()
    }

    pub fn drifted_keys(&self) -> HashSet<IdentityKey> {
        self.drifted
            .iter()
            .map(|entry| entry.identity_key.clone())
            .collect()
    }

    pub fn is_clean(&self) -> bool {
        self.duplicates_dropped.is_empty()
            && self.rekeyed.is_empty()
            && self.stale.is_empty()
            && self.drifted.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConsistencyAuditor {
    resolver: IdentityResolver,
    calculator: InfluenceCalculator,
}

impl ConsistencyAuditor {
    pub fn new(resolver: IdentityResolver, calculator: InfluenceCalculator) -> Self {
        Self {
            resolver,
            calculator,
        }
    }

    /// Runs all three passes. Duplicates and stale entries are removed from
    /// `cache`; drift is only reported so the caller can force a resync.
    pub fn audit(&self, cache: &mut InfluenceCache, world: &dyn WorldView) -> AuditReport {
        let mut report = AuditReport {
            digest_before: cache.digest(),
            ..AuditReport::default()
        };

        for repair in self.repair_duplicates(cache) {
            match repair {
                DuplicateRepair::Drop(key) => report.duplicates_dropped.push(key),
                DuplicateRepair::Rekey { from, to } => report.rekeyed.push((from, to)),
            }
        }

        report.stale = self.find_stale(cache, world);
        for key in &report.stale {
            cache.remove(key.as_str());
            tracing::info!(target: "influence_sync::auditor", key = %key, "audit.stale_removed");
        }

        report.drifted = self.find_drift(cache, world);
        for entry in &report.drifted {
            tracing::warn!(
                target: "influence_sync::auditor",
                key = %entry.identity_key,
                cached_tag = entry.cached.tag_influence,
                cached_status = entry.cached.status_influence,
                cached_total = entry.cached.total_influence,
                computed_tag = entry.computed.tag_influence,
                computed_status = entry.computed.status_influence,
                computed_total = entry.computed.total_influence,
                "audit.drift_detected"
            );
        }

        report.digest_after = cache.digest();
        tracing::info!(
            target: "influence_sync::auditor",
            duplicates = report.duplicates_dropped.len(),
            rekeyed = report.rekeyed.len(),
            stale = report.stale.len(),
            drifted = report.drifted.len(),
            "audit.completed"
        );
        report
    }

    /// Plans repairs for records stored under a key the resolution rule would
    /// not produce for them.
    pub fn detect_duplicates(&self, cache: &InfluenceCache) -> Vec<DuplicateRepair> {
        let mut claimed: HashSet<IdentityKey> = cache
            .iter()
            .filter(|(_, record)| self.resolver.key_shape(record) != KeyShape::Mismatched)
            .map(|(key, _)| key.clone())
            .collect();

        let mut repairs = Vec::new();
        for record in cache.records_sorted() {
            if self.resolver.key_shape(&record) != KeyShape::Mismatched {
                continue;
            }
            let canonical = self.resolver.canonical_key(&record);
            if claimed.contains(&canonical) {
                repairs.push(DuplicateRepair::Drop(record.identity_key));
            } else {
                claimed.insert(canonical.clone());
                repairs.push(DuplicateRepair::Rekey {
                    from: record.identity_key,
                    to: canonical,
                });
            }
        }
        repairs
    }

    pub fn repair_duplicates(&self, cache: &mut InfluenceCache) -> Vec<DuplicateRepair> {
        let repairs = self.detect_duplicates(cache);
        for repair in &repairs {
            match repair {
                DuplicateRepair::Drop(key) => {
                    cache.remove(key.as_str());
                    tracing::info!(
                        target: "influence_sync::auditor",
                        key = %key,
                        "audit.duplicate_dropped"
                    );
                }
                DuplicateRepair::Rekey { from, to } => {
                    if let Some(mut record) = cache.remove(from.as_str()) {
                        record.identity_key = to.clone();
                        cache.upsert(record);
                    }
                    tracing::info!(
                        target: "influence_sync::auditor",
                        from = %from,
                        to = %to,
                        "audit.duplicate_rekeyed"
                    );
                }
            }
        }
        repairs
    }

    /// Keys whose token or character no longer exists anywhere in the world.
    /// Off-scene referents are not stale.
    pub fn find_stale(&self, cache: &InfluenceCache, world: &dyn WorldView) -> Vec<IdentityKey> {
        cache
            .records_sorted()
            .into_iter()
            .filter(|record| !self.referent_exists(record, world))
            .map(|record| record.identity_key)
            .collect()
    }

    /// Records whose referent is observable and whose cached numbers differ
    /// from a fresh computation.
    pub fn find_drift(&self, cache: &InfluenceCache, world: &dyn WorldView) -> Vec<DriftEntry> {
        cache
            .records_sorted()
            .into_iter()
            .filter_map(|record| {
                let computed = self.observed_score(&record, world)?;
                let cached = InfluenceScore {
                    tag_influence: record.tag_influence,
                    status_influence: record.status_influence,
                    total_influence: record.total_influence,
                };
                (cached != computed).then_some(DriftEntry {
                    identity_key: record.identity_key,
                    cached,
                    computed,
                })
            })
            .collect()
    }

    fn referent_exists(&self, record: &InfluenceRecord, world: &dyn WorldView) -> bool {
        match (self.resolver.key_shape(record), record.token_id.as_deref()) {
            (KeyShape::Token, Some(token_id)) => world.token_exists(token_id),
            _ => world.character_exists(&record.npc_id),
        }
    }

    fn observed_score(&self, record: &InfluenceRecord, world: &dyn WorldView) -> Option<InfluenceScore> {
        match (self.resolver.key_shape(record), record.token_id.as_deref()) {
            (KeyShape::Token, Some(token_id)) => world
                .scene_token(token_id)
                .map(|scene_token| self.calculator.compute(&scene_token.sheet)),
            (KeyShape::Character, _) => world
                .character(&record.npc_id)
                .map(|sheet| self.calculator.compute(&sheet)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::{CharacterSheet, InMemoryWorld, TagState};

    fn record(key: &str, npc: &str, token: Option<&str>, linked: bool, tag: i64) -> InfluenceRecord {
        InfluenceRecord {
            identity_key: IdentityKey::from(key),
            npc_id: npc.to_string(),
            npc_name: npc.to_string(),
            token_id: token.map(str::to_string),
            token_name: token.map(str::to_string),
            actor_link: linked,
            tag_influence: tag,
            status_influence: 0,
            total_influence: tag,
            timestamp: 0,
        }
    }

    fn world() -> InMemoryWorld {
        let mut world = InMemoryWorld::new();
        world.insert_character(
            CharacterSheet::npc("boss", "Boss").with_tag("t", "Feared", TagState::Positive),
        );
        world.insert_character(
            CharacterSheet::npc("thug", "Thug").with_tag("t", "Armed", TagState::Negative),
        );
        world.place_token("lair", "tok-boss", "Boss", "boss", true);
        world.place_token("lair", "tok-thug", "Thug", "thug", false);
        world.activate_scene("lair");
        world
    }

    #[test]
    fn linked_record_under_token_key_is_dropped_when_canonical_exists() {
        let mut cache = InfluenceCache::new();
        cache.upsert(record("boss", "boss", Some("tok-boss"), true, 1));
        cache.upsert(record("tok-boss", "boss", Some("tok-boss"), true, 1));

        let repairs = ConsistencyAuditor::default().repair_duplicates(&mut cache);
        assert_eq!(repairs, vec![DuplicateRepair::Drop(IdentityKey::from("tok-boss"))]);
        assert_eq!(cache.keys(), vec![IdentityKey::from("boss")]);
    }

    #[test]
    fn lone_misshapen_record_is_rekeyed() {
        let mut cache = InfluenceCache::new();
        cache.upsert(record("thug", "thug", Some("tok-thug"), false, -1));

        ConsistencyAuditor::default().repair_duplicates(&mut cache);
        let moved = cache.get("tok-thug").expect("rekeyed");
        assert_eq!(moved.identity_key.as_str(), "tok-thug");
        assert!(!cache.contains("thug"));
    }

    #[test]
    fn off_scene_character_is_not_stale() {
        let mut world = world();
        world.insert_character(CharacterSheet::npc("elsewhere", "Elsewhere"));
        let mut cache = InfluenceCache::new();
        cache.upsert(record("elsewhere", "elsewhere", None, true, 2));
        cache.upsert(record("ghost", "ghost", None, true, 2));
        cache.upsert(record("tok-gone", "thug", Some("tok-gone"), false, 2));

        let stale = ConsistencyAuditor::default().find_stale(&cache, &world);
        assert_eq!(stale, vec![IdentityKey::from("ghost"), IdentityKey::from("tok-gone")]);
    }

    #[test]
    fn drift_compares_every_field() {
        let world = world();
        let mut cache = InfluenceCache::new();
        cache.upsert(record("boss", "boss", Some("tok-boss"), true, 1));
        cache.upsert(record("tok-thug", "thug", Some("tok-thug"), false, 3));

        let drift = ConsistencyAuditor::default().find_drift(&cache, &world);
        assert_eq!(drift.len(), 1);
        assert_eq!(drift[0].identity_key.as_str(), "tok-thug");
        assert_eq!(drift[0].computed, InfluenceScore::new(-1, 0));
    }

    #[test]
    fn audit_is_idempotent() {
        let world = world();
        let mut cache = InfluenceCache::new();
        cache.upsert(record("boss", "boss", Some("tok-boss"), true, 1));
        cache.upsert(record("tok-boss", "boss", Some("tok-boss"), true, 1));
        cache.upsert(record("ghost", "ghost", None, true, 4));

        let auditor = ConsistencyAuditor::default();
        let first = auditor.audit(&mut cache, &world);
        assert_eq!(first.removed_keys().len(), 2);
        let second = auditor.audit(&mut cache, &world);
        assert!(second.is_clean());
        assert_eq!(second.digest_before, second.digest_after);
        assert_eq!(first.digest_after, second.digest_before);
    }
}
