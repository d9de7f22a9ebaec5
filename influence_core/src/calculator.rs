//! Derives influence numbers from a character's tag and status state.

use serde::Serialize;

use crate::world::{CharacterSheet, TagState};

/// Influence computed for one sheet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InfluenceScore {
    pub tag_influence: i64,
    pub status_influence: i64,
    pub total_influence: i64,
}

impl InfluenceScore {
    pub fn new(tag_influence: i64, status_influence: i64) -> Self {
        Self {
            tag_influence,
            status_influence,
            total_influence: tag_influence + status_influence,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.total_influence == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContributionSource {
    Tag,
    Status,
}

/// Signed contribution of a single tag or status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Contribution {
    pub item_id: String,
    pub item_name: String,
    pub source: ContributionSource,
    pub state: TagState,
    pub value: i64,
}

/// Pure influence computation. Safe to call redundantly.
#[derive(Debug, Clone, Copy, Default)]
pub struct InfluenceCalculator;

impl InfluenceCalculator {
    pub fn new() -> Self {
        Self
    }

    pub fn compute(&self, sheet: &CharacterSheet) -> InfluenceScore {
        let tag_influence: i64 = sheet
            .tags
            .iter()
            .map(|tag| tag.state.unwrap_or_default().sign())
            .sum();

        let modifier = collective_size_modifier(sheet);
        let status_influence: i64 = sheet
            .statuses
            .iter()
            .map(|status| {
                let state = status.effective_state();
                if state == TagState::Neutral {
                    0
                } else {
                    state.sign() * (status.effective_tier() + modifier)
                }
            })
            .sum();

        InfluenceScore::new(tag_influence, status_influence)
    }

    /// Non-zero per-item contributions in sheet order.
    pub fn breakdown(&self, sheet: &CharacterSheet) -> Vec<Contribution> {
        let modifier = collective_size_modifier(sheet);
        let tags = sheet.tags.iter().filter_map(|tag| {
            let state = tag.state.unwrap_or_default();
            (state != TagState::Neutral).then(|| Contribution {
                item_id: tag.id.clone(),
                item_name: tag.name.clone(),
                source: ContributionSource::Tag,
                state,
                value: state.sign(),
            })
        });
        let statuses = sheet.statuses.iter().filter_map(|status| {
            let state = status.effective_state();
            (state != TagState::Neutral).then(|| Contribution {
                item_id: status.id.clone(),
                item_name: status.name.clone(),
                source: ContributionSource::Status,
                state,
                value: state.sign() * (status.effective_tier() + modifier),
            })
        });
        tags.chain(statuses).collect()
    }
}

fn collective_size_modifier(sheet: &CharacterSheet) -> i64 {
    sheet.collective_size.unwrap_or(0).max(0)
}
