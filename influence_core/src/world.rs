//! Contract with the host's document model, plus an in-memory host.
//!
//! The host owns characters, tokens and scenes. Synchronization only reads
//! them through [`WorldView`].

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Three-state influence flag carried by tags and statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagState {
    #[default]
    Neutral,
    Positive,
    Negative,
}

impl TagState {
    pub fn sign(self) -> i64 {
        match self {
            TagState::Neutral => 0,
            TagState::Positive => 1,
            TagState::Negative => -1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TagState::Neutral => "neutral",
            TagState::Positive => "positive",
            TagState::Negative => "negative",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        TagState::from_str(value).ok()
    }
}

impl FromStr for TagState {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "neutral" | "" => Ok(TagState::Neutral),
            "positive" => Ok(TagState::Positive),
            "negative" => Ok(TagState::Negative),
            _ => Err(()),
        }
    }
}

impl fmt::Display for TagState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagItem {
    pub id: String,
    pub name: String,
    /// Absent flags read as neutral.
    #[serde(default)]
    pub state: Option<TagState>,
    #[serde(default)]
    pub burned: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusItem {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub state: Option<TagState>,
    /// Legacy field consulted when `state` was never written.
    #[serde(default)]
    pub special_type: Option<String>,
    #[serde(default)]
    pub tier: Option<u32>,
}

impl StatusItem {
    pub fn effective_state(&self) -> TagState {
        self.state
            .or_else(|| self.special_type.as_deref().and_then(TagState::parse))
            .unwrap_or_default()
    }

    /// Tier with the default of 1 applied; a stored zero also reads as 1.
    pub fn effective_tier(&self) -> i64 {
        match self.tier {
            Some(tier) if tier > 0 => i64::from(tier),
            _ => 1,
        }
    }
}

/// Sheet type as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SheetKind {
    Npc,
    Threat,
    Character,
}

impl SheetKind {
    pub fn is_npc_like(self) -> bool {
        matches!(self, SheetKind::Npc | SheetKind::Threat)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacterSheet {
    pub id: String,
    pub name: String,
    pub kind: SheetKind,
    #[serde(default)]
    pub tags: Vec<TagItem>,
    #[serde(default)]
    pub statuses: Vec<StatusItem>,
    /// Scale of a collective (a gang, a swarm). Absent reads as 0.
    #[serde(default)]
    pub collective_size: Option<i64>,
}

impl CharacterSheet {
    pub fn npc(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: SheetKind::Npc,
            tags: Vec::new(),
            statuses: Vec::new(),
            collective_size: None,
        }
    }

    pub fn with_kind(mut self, kind: SheetKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_tag(mut self, id: &str, name: &str, state: TagState) -> Self {
        self.tags.push(TagItem {
            id: id.to_string(),
            name: name.to_string(),
            state: Some(state),
            burned: false,
        });
        self
    }

    pub fn with_status(mut self, id: &str, name: &str, state: TagState, tier: u32) -> Self {
        self.statuses.push(StatusItem {
            id: id.to_string(),
            name: name.to_string(),
            state: Some(state),
            special_type: None,
            tier: Some(tier),
        });
        self
    }

    pub fn with_collective_size(mut self, size: i64) -> Self {
        self.collective_size = Some(size);
        self
    }

    pub fn tag_mut(&mut self, tag_id: &str) -> Option<&mut TagItem> {
        self.tags.iter_mut().find(|tag| tag.id == tag_id)
    }

    pub fn status_mut(&mut self, status_id: &str) -> Option<&mut StatusItem> {
        self.statuses.iter_mut().find(|status| status.id == status_id)
    }
}

/// An on-map token as the host exposes it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenRef {
    pub id: String,
    pub name: String,
    pub character_id: String,
    /// Linked tokens share the character sheet; unlinked tokens carry a copy.
    pub actor_linked: bool,
}

/// Token in the active scene together with the sheet it reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SceneToken {
    pub token: TokenRef,
    pub sheet: CharacterSheet,
}

/// Read-only view of the host's world.
pub trait WorldView {
    /// NPC-like tokens placed in the active scene.
    fn scene_tokens(&self) -> Vec<SceneToken>;

    /// Look up a token of the active scene.
    fn scene_token(&self, token_id: &str) -> Option<SceneToken>;

    fn character(&self, character_id: &str) -> Option<CharacterSheet>;

    /// Whether the token exists in any scene of the world.
    fn token_exists(&self, token_id: &str) -> bool;

    fn character_exists(&self, character_id: &str) -> bool {
        self.character(character_id).is_some()
    }
}

#[derive(Debug, Clone)]
struct PlacedToken {
    token: TokenRef,
    own_sheet: Option<CharacterSheet>,
}

/// Host double backed by plain maps.
#[derive(Debug, Clone, Default)]
pub struct InMemoryWorld {
    characters: HashMap<String, CharacterSheet>,
    scenes: HashMap<String, Vec<PlacedToken>>,
    active_scene: Option<String>,
}

impl InMemoryWorld {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_character(&mut self, sheet: CharacterSheet) {
        self.characters.insert(sheet.id.clone(), sheet);
    }

    /// Places a token of an existing character. Unlinked tokens snapshot the
    /// character's sheet at placement time.
    pub fn place_token(
        &mut self,
        scene_id: &str,
        token_id: &str,
        token_name: &str,
        character_id: &str,
        actor_linked: bool,
    ) -> Option<TokenRef> {
        let base = self.characters.get(character_id)?;
        let token = TokenRef {
            id: token_id.to_string(),
            name: token_name.to_string(),
            character_id: character_id.to_string(),
            actor_linked,
        };
        let own_sheet = (!actor_linked).then(|| base.clone());
        self.scenes
            .entry(scene_id.to_string())
            .or_default()
            .push(PlacedToken {
                token: token.clone(),
                own_sheet,
            });
        Some(token)
    }

    pub fn activate_scene(&mut self, scene_id: &str) {
        self.scenes.entry(scene_id.to_string()).or_default();
        self.active_scene = Some(scene_id.to_string());
    }

    pub fn active_scene(&self) -> Option<&str> {
        self.active_scene.as_deref()
    }

    pub fn remove_token(&mut self, token_id: &str) -> Option<TokenRef> {
        for tokens in self.scenes.values_mut() {
            if let Some(index) = tokens.iter().position(|placed| placed.token.id == token_id) {
                return Some(tokens.remove(index).token);
            }
        }
        None
    }

    /// Deletes a character and every token placed from it.
    pub fn remove_character(&mut self, character_id: &str) -> Option<CharacterSheet> {
        let removed = self.characters.remove(character_id)?;
        for tokens in self.scenes.values_mut() {
            tokens.retain(|placed| placed.token.character_id != character_id);
        }
        Some(removed)
    }

    pub fn character_mut(&mut self, character_id: &str) -> Option<&mut CharacterSheet> {
        self.characters.get_mut(character_id)
    }

    /// The sheet a token reads from: its own copy when unlinked, the shared
    /// character when linked.
    pub fn token_sheet_mut(&mut self, token_id: &str) -> Option<&mut CharacterSheet> {
        let placed = self
            .scenes
            .values_mut()
            .flat_map(|tokens| tokens.iter_mut())
            .find(|placed| placed.token.id == token_id)?;
        match placed.own_sheet.as_mut() {
            Some(sheet) => Some(sheet),
            None => {
                let character_id = placed.token.character_id.clone();
                self.characters.get_mut(&character_id)
            }
        }
    }

    pub fn tokens_of(&self, character_id: &str) -> Vec<TokenRef> {
        self.scenes
            .values()
            .flat_map(|tokens| tokens.iter())
            .filter(|placed| placed.token.character_id == character_id)
            .map(|placed| placed.token.clone())
            .collect()
    }

    fn resolve_placed(&self, placed: &PlacedToken) -> Option<SceneToken> {
        let sheet = match &placed.own_sheet {
            Some(sheet) => sheet.clone(),
            None => self.characters.get(&placed.token.character_id)?.clone(),
        };
        Some(SceneToken {
            token: placed.token.clone(),
            sheet,
        })
    }

    fn active_tokens(&self) -> impl Iterator<Item = &PlacedToken> {
        self.active_scene
            .as_ref()
            .and_then(|scene| self.scenes.get(scene))
            .into_iter()
            .flat_map(|tokens| tokens.iter())
    }
}

impl WorldView for InMemoryWorld {
    fn scene_tokens(&self) -> Vec<SceneToken> {
        self.active_tokens()
            .filter_map(|placed| self.resolve_placed(placed))
            .filter(|scene_token| scene_token.sheet.kind.is_npc_like())
            .collect()
    }

    fn scene_token(&self, token_id: &str) -> Option<SceneToken> {
        self.active_tokens()
            .find(|placed| placed.token.id == token_id)
            .and_then(|placed| self.resolve_placed(placed))
    }

    fn character(&self, character_id: &str) -> Option<CharacterSheet> {
        self.characters.get(character_id).cloned()
    }

    fn token_exists(&self, token_id: &str) -> bool {
        self.scenes
            .values()
            .any(|tokens| tokens.iter().any(|placed| placed.token.id == token_id))
    }

    fn character_exists(&self, character_id: &str) -> bool {
        self.characters.contains_key(character_id)
    }
}
