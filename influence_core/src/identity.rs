use influence_proto::{IdentityKey, InfluenceRecord};

use crate::world::TokenRef;

/// Shape of a cached key relative to the record it holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyShape {
    /// Keyed by an unlinked token's id.
    Token,
    /// Keyed by the character id.
    Character,
    /// Key disagrees with what the record's own fields resolve to.
    Mismatched,
}

/// Maps a (token, character) pair to the single cache key every client uses.
///
/// Unlinked tokens each get their own key; linked tokens collapse onto the
/// character; character-only lookups use the character id.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityResolver;

impl IdentityResolver {
    pub fn new() -> Self {
        Self
    }

    pub fn resolve(&self, token: Option<&TokenRef>, character_id: &str) -> IdentityKey {
        match token {
            Some(token) if !token.actor_linked => IdentityKey::new(token.id.as_str()),
            _ => IdentityKey::new(character_id),
        }
    }

    /// Key the resolution rule yields for a record's own identity fields.
    pub fn canonical_key(&self, record: &InfluenceRecord) -> IdentityKey {
        match record.token_id.as_deref() {
            Some(token_id) if !record.actor_link => IdentityKey::new(token_id),
            _ => IdentityKey::new(record.npc_id.as_str()),
        }
    }

    pub fn key_shape(&self, record: &InfluenceRecord) -> KeyShape {
        if record.identity_key != self.canonical_key(record) {
            KeyShape::Mismatched
        } else if record.token_id.is_some() && !record.actor_link {
            KeyShape::Token
        } else {
            KeyShape::Character
        }
    }
}
