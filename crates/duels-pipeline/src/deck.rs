//! Rebuilds the starting deck of a run as a canonical 15-card wild deckstring.

use duels_cards::{decode, encode, CardsDb, DeckDefinition, DeckError, GameFormat, HeroNormalizer};
use thiserror::Error;

/// Number of distinct collectible entries in a Duels starting deck.
pub const DUELS_DECK_SIZE: usize = 15;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("undecodable deckstring: {0}")]
    Decode(DeckError),
    #[error("expected 15 collectible cards, found {found}")]
    WrongSize { found: usize },
    #[error("cannot re-encode deck: {0}")]
    Encode(DeckError),
}

pub struct DeckNormalizer<'a> {
    cards: &'a CardsDb,
    heroes: &'a HeroNormalizer,
}

impl<'a> DeckNormalizer<'a> {
    pub fn new(cards: &'a CardsDb, heroes: &'a HeroNormalizer) -> Self {
        Self { cards, heroes }
    }

    /// Drops non-collectible entries, swaps in the canonical hero and forces the wild format.
    pub fn normalize(
        &self,
        deckstring: &str,
        hero_card_id: Option<&str>,
    ) -> Result<String, NormalizeError> {
        let decoded = decode(deckstring).map_err(NormalizeError::Decode)?;
        let cards = decoded
            .cards
            .iter()
            .copied()
            .filter(|(dbf_id, _)| self.cards.is_collectible(*dbf_id))
            .collect::<Vec<_>>();
        if cards.len() != DUELS_DECK_SIZE {
            return Err(NormalizeError::WrongSize { found: cards.len() });
        }

        let heroes = match hero_card_id.filter(|id| !id.is_empty()) {
            Some(hero) => vec![self.heroes.resolve_dbf_id(hero, self.cards)],
            None => decoded.heroes,
        };

        encode(&DeckDefinition {
            cards,
            heroes,
            format: GameFormat::Wild,
        })
        .map_err(NormalizeError::Encode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duels_cards::{Card, FALLBACK_HERO_DBF_ID};

    const RECORDED: &str = "AAECAf0EEOkH6gfrB+wH7QfuB+8H8AfxB/IH8wf0B/UH9gf3B9EPAAA=";
    const SHORT: &str = "AAECAf0ED+kH6gfrB+wH7QfuB+8H8AfxB/IH8wf0B/UH9gfRDwAA";

    fn cards() -> CardsDb {
        let mut cards = (1001..=1015)
            .map(|dbf_id| Card {
                id: format!("DUELS_CARD_{dbf_id}"),
                dbf_id,
                name: None,
                card_type: Some("Spell".into()),
                collectible: true,
                mechanics: vec![],
            })
            .collect::<Vec<_>>();
        cards.push(Card {
            id: "HERO_08".into(),
            dbf_id: 637,
            name: None,
            card_type: Some("Hero".into()),
            collectible: true,
            mechanics: vec![],
        });
        CardsDb::from_cards(cards)
    }

    #[test]
    fn strips_filler_and_rewrites_format_and_hero() {
        let db = cards();
        let heroes = HeroNormalizer::default();
        let out = DeckNormalizer::new(&db, &heroes)
            .normalize(RECORDED, Some("HERO_08a"))
            .unwrap();
        assert_eq!(out, "AAEBAf0ED+kH6gfrB+wH7QfuB+8H8AfxB/IH8wf0B/UH9gf3BwAA");

        let deck = decode(&out).unwrap();
        assert_eq!(deck.format, GameFormat::Wild);
        assert_eq!(deck.heroes, vec![637]);
        assert_eq!(deck.cards.len(), DUELS_DECK_SIZE);
        assert!(deck.cards.iter().all(|(dbf_id, _)| *dbf_id != 2001));
    }

    #[test]
    fn unknown_hero_uses_fallback_and_missing_hero_keeps_decoded() {
        let db = cards();
        let heroes = HeroNormalizer::default();
        let normalizer = DeckNormalizer::new(&db, &heroes);

        let fallback = normalizer.normalize(RECORDED, Some("MYSTERY_HERO")).unwrap();
        assert_eq!(decode(&fallback).unwrap().heroes, vec![FALLBACK_HERO_DBF_ID]);

        let kept = normalizer.normalize(RECORDED, None).unwrap();
        let kept = decode(&kept).unwrap();
        assert_eq!(kept.heroes, vec![637]);
        assert_eq!(kept.format, GameFormat::Wild);
    }

    #[test]
    fn rejects_decks_without_exactly_fifteen_collectibles() {
        let db = cards();
        let heroes = HeroNormalizer::default();
        let normalizer = DeckNormalizer::new(&db, &heroes);
        assert_eq!(
            normalizer.normalize(SHORT, Some("HERO_08")),
            Err(NormalizeError::WrongSize { found: 14 })
        );
        assert!(matches!(
            normalizer.normalize("garbage", Some("HERO_08")),
            Err(NormalizeError::Decode(_))
        ));
    }
}
