//! Loot aggregation helpers.

use duels_cards::CardsDb;
use duels_core::{LootCategory, LootRecord};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreasureSplit {
    pub treasures: String,
    pub passives: String,
}

/// Splits treasure picks on the passive-buff mechanic; each side comma-joined in pick order.
pub fn split_treasures(loot: &[LootRecord], cards: &CardsDb) -> TreasureSplit {
    let (passives, treasures): (Vec<&str>, Vec<&str>) = picks(loot, LootCategory::Treasure)
        .partition(|card_id| cards.is_passive_buff(card_id));
    TreasureSplit {
        treasures: treasures.join(","),
        passives: passives.join(","),
    }
}

/// Pick of the first record in `category`; a null pick there is not skipped over.
pub fn first_pick(loot: &[LootRecord], category: LootCategory) -> Option<String> {
    loot.iter()
        .find(|r| r.category == category)
        .and_then(|r| r.picked_card_id.clone())
}

pub fn count_category(loot: &[LootRecord], category: LootCategory) -> usize {
    loot.iter().filter(|r| r.category == category).count()
}

fn picks(loot: &[LootRecord], category: LootCategory) -> impl Iterator<Item = &str> {
    loot.iter()
        .filter(move |r| r.category == category)
        .filter_map(|r| r.picked_card_id.as_deref())
}
