//! Card metadata lookups and deck utilities for Duels runs.

pub mod deckstring;

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

pub use deckstring::{decode, encode, CardCount, DeckDefinition, DeckError, GameFormat};

pub const CRATE_NAME: &str = "duels-cards";

/// Mechanic tag marking a treasure as a passive buff rather than a playable card.
pub const PASSIVE_BUFF_MECHANIC: &str = "DUNGEON_PASSIVE_BUFF";

/// Hero dbf id used when a hero card id cannot be resolved.
pub const FALLBACK_HERO_DBF_ID: u32 = 7;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Card {
    pub id: String,
    pub dbf_id: u32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "type")]
    pub card_type: Option<String>,
    #[serde(default)]
    pub collectible: bool,
    #[serde(default)]
    pub mechanics: Vec<String>,
}

impl Card {
    pub fn has_mechanic(&self, mechanic: &str) -> bool {
        self.mechanics.iter().any(|m| m == mechanic)
    }
}

#[derive(Debug, Error)]
pub enum CardsError {
    #[error("reading cards file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing cards json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("parsing hero rules: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// In-memory card reference, indexed by string id and numeric dbf id.
#[derive(Debug, Clone, Default)]
pub struct CardsDb {
    cards: Vec<Card>,
    by_id: HashMap<String, usize>,
    by_dbf_id: HashMap<u32, usize>,
}

impl CardsDb {
    pub fn from_cards(cards: Vec<Card>) -> Self {
        let mut by_id = HashMap::with_capacity(cards.len());
        let mut by_dbf_id = HashMap::with_capacity(cards.len());
        for (idx, card) in cards.iter().enumerate() {
            by_id.insert(card.id.clone(), idx);
            by_dbf_id.insert(card.dbf_id, idx);
        }
        Self {
            cards,
            by_id,
            by_dbf_id,
        }
    }

    pub fn from_json_slice(bytes: &[u8]) -> Result<Self, CardsError> {
        let cards: Vec<Card> = serde_json::from_slice(bytes)?;
        Ok(Self::from_cards(cards))
    }

    pub fn load_path(path: impl AsRef<Path>) -> Result<Self, CardsError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| CardsError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let db = Self::from_json_slice(&bytes)?;
        tracing::info!(cards = db.len(), path = %path.display(), "loaded card metadata");
        Ok(db)
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    pub fn card(&self, card_id: &str) -> Option<&Card> {
        self.by_id.get(card_id).map(|idx| &self.cards[*idx])
    }

    pub fn card_by_dbf_id(&self, dbf_id: u32) -> Option<&Card> {
        self.by_dbf_id.get(&dbf_id).map(|idx| &self.cards[*idx])
    }

    /// Unknown dbf ids are never collectible.
    pub fn is_collectible(&self, dbf_id: u32) -> bool {
        self.card_by_dbf_id(dbf_id).is_some_and(|card| card.collectible)
    }

    pub fn is_passive_buff(&self, card_id: &str) -> bool {
        self.card(card_id)
            .is_some_and(|card| card.has_mechanic(PASSIVE_BUFF_MECHANIC))
    }
}

#[derive(Debug, Clone, Deserialize)]
struct HeroRulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    heroes: Vec<HeroRule>,
}

#[derive(Debug, Clone, Deserialize)]
struct HeroRule {
    canonical: String,
    #[serde(default)]
    aliases: Vec<String>,
}

/// Maps Duels hero skins and mode-specific variants onto one canonical hero card id.
#[derive(Debug, Clone, Default)]
pub struct HeroNormalizer {
    aliases: HashMap<String, String>,
}

impl HeroNormalizer {
    pub fn new(aliases: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            aliases: aliases.into_iter().collect(),
        }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, CardsError> {
        let file: HeroRulesFile = serde_yaml::from_str(text)?;
        Ok(Self::new(file.heroes.into_iter().flat_map(|rule| {
            let canonical = rule.canonical;
            rule.aliases
                .into_iter()
                .map(move |alias| (alias, canonical.clone()))
        })))
    }

    pub fn from_workspace_root(root: &Path) -> Result<Self, CardsError> {
        let path = root.join("rules").join("heroes.yaml");
        let text = std::fs::read_to_string(&path).map_err(|source| CardsError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    /// Explicit aliases win; otherwise skin suffixes are dropped (`HERO_08b` -> `HERO_08`).
    pub fn normalize(&self, hero_card_id: &str) -> String {
        if let Some(canonical) = self.aliases.get(hero_card_id) {
            return canonical.clone();
        }
        strip_skin_suffix(hero_card_id).to_string()
    }

    /// Dbf id of the canonical hero, or [`FALLBACK_HERO_DBF_ID`] when unknown.
    pub fn resolve_dbf_id(&self, hero_card_id: &str, cards: &CardsDb) -> u32 {
        let normalized = self.normalize(hero_card_id);
        cards
            .card(&normalized)
            .map(|card| card.dbf_id)
            .unwrap_or(FALLBACK_HERO_DBF_ID)
    }
}

fn strip_skin_suffix(card_id: &str) -> &str {
    let Some(rest) = card_id.strip_prefix("HERO_") else {
        return card_id;
    };
    let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
    let suffix = &rest[digits..];
    if digits > 0 && !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_lowercase()) {
        &card_id[.."HERO_".len() + digits]
    } else {
        card_id
    }
}
