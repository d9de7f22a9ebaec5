use std::collections::HashMap;

use influence_proto::{hash_records, IdentityKey, InfluenceRecord};

/// Outcome of writing one record into the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheChange {
    Inserted,
    Updated,
    Unchanged,
    Removed,
    /// Components overflow; the record was discarded.
    Rejected,
}

/// Process-local replica of influence keyed by identity.
///
/// Zero-total records are never stored; writing one removes the key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InfluenceCache {
    records: HashMap<IdentityKey, InfluenceRecord>,
}

impl InfluenceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&InfluenceRecord> {
        self.records.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.records.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&IdentityKey, &InfluenceRecord)> {
        self.records.iter()
    }

    pub fn keys(&self) -> Vec<IdentityKey> {
        let mut keys: Vec<IdentityKey> = self.records.keys().cloned().collect();
        keys.sort_unstable();
        keys
    }

    /// Writes `record` under its own identity key. Totals are normalized from
    /// their components first.
    pub fn upsert(&mut self, record: InfluenceRecord) -> CacheChange {
        let Some(record) = normalize_or_log(record) else {
            return CacheChange::Rejected;
        };
        if !record.has_influence() {
            return match self.records.remove(&record.identity_key) {
                Some(_) => CacheChange::Removed,
                None => CacheChange::Unchanged,
            };
        }
        match self.records.get(&record.identity_key) {
            Some(existing) if *existing == record => CacheChange::Unchanged,
            Some(_) => {
                self.records.insert(record.identity_key.clone(), record);
                CacheChange::Updated
            }
            None => {
                self.records.insert(record.identity_key.clone(), record);
                CacheChange::Inserted
            }
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<InfluenceRecord> {
        self.records.remove(key)
    }

    /// Replaces the whole cache. Repeated keys keep their last occurrence.
    /// Returns the number of records kept.
    pub fn replace_all<I>(&mut self, records: I) -> usize
    where
        I: IntoIterator<Item = InfluenceRecord>,
    {
        self.records.clear();
        for record in records {
            let Some(record) = normalize_or_log(record) else {
                continue;
            };
            if record.has_influence() {
                self.records.insert(record.identity_key.clone(), record);
            } else {
                self.records.remove(&record.identity_key);
            }
        }
        self.records.len()
    }

    /// Keys of every record belonging to a character, whatever their shape.
    pub fn keys_for_npc(&self, npc_id: &str) -> Vec<IdentityKey> {
        let mut keys: Vec<IdentityKey> = self
            .records
            .values()
            .filter(|record| record.npc_id == npc_id)
            .map(|record| record.identity_key.clone())
            .collect();
        keys.sort_unstable();
        keys
    }

    /// Records ordered by key, as sent in bulk snapshots.
    pub fn records_sorted(&self) -> Vec<InfluenceRecord> {
        let mut records: Vec<InfluenceRecord> = self.records.values().cloned().collect();
        records.sort_unstable_by(|a, b| a.identity_key.cmp(&b.identity_key));
        records
    }

    pub fn digest(&self) -> u64 {
        hash_records(self.records.values())
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

fn normalize_or_log(record: InfluenceRecord) -> Option<InfluenceRecord> {
    let key = record.identity_key.clone();
    let normalized = record.normalized();
    if normalized.is_none() {
        tracing::debug!(
            target: "influence_sync::cache",
            key = %key,
            "record.rejected=total_overflow"
        );
    }
    normalized
}
