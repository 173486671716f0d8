//! Core domain model for the Duels run summary pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

pub const CRATE_NAME: &str = "duels-core";

/// Game mode tag carried by paid (heroic) Duels runs; the only mode summarized.
pub const PAID_DUELS_MODE: &str = "paid-duels";

/// Tally string recorded on the first match of a run.
pub const FIRST_MATCH_TALLY: &str = "0-0";

/// Loot bundle categories read from the loot table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LootCategory {
    Treasure,
    HeroPower,
    SignatureTreasure,
}

impl LootCategory {
    pub const ALL: [LootCategory; 3] = [
        LootCategory::Treasure,
        LootCategory::HeroPower,
        LootCategory::SignatureTreasure,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LootCategory::Treasure => "treasure",
            LootCategory::HeroPower => "hero-power",
            LootCategory::SignatureTreasure => "signature-treasure",
        }
    }
}

impl fmt::Display for LootCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownLootCategory(pub String);

impl fmt::Display for UnknownLootCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown loot category `{}`", self.0)
    }
}

impl std::error::Error for UnknownLootCategory {}

impl FromStr for LootCategory {
    type Err = UnknownLootCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "treasure" => Ok(LootCategory::Treasure),
            "hero-power" => Ok(LootCategory::HeroPower),
            "signature-treasure" => Ok(LootCategory::SignatureTreasure),
            other => Err(UnknownLootCategory(other.to_string())),
        }
    }
}

/// Terminal notification emitted when a Duels run ends.
///
/// Every field is optional on the wire; validation happens in the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEndEvent {
    #[serde(default)]
    pub game_mode: Option<String>,
    #[serde(default)]
    pub current_duels_run_id: Option<String>,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub player_card_id: Option<String>,
    #[serde(default)]
    pub player_decklist: Option<String>,
    #[serde(default)]
    pub additional_result: Option<String>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub build_number: Option<i64>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub creation_date: Option<String>,
}

impl RunEndEvent {
    /// Run identifier, preferring `currentDuelsRunId` over `runId`. Blank ids count as absent.
    pub fn effective_run_id(&self) -> Option<&str> {
        [&self.current_duels_run_id, &self.run_id]
            .into_iter()
            .filter_map(|v| v.as_deref())
            .map(str::trim)
            .find(|v| !v.is_empty())
    }

    pub fn is_paid_duels(&self) -> bool {
        self.game_mode.as_deref() == Some(PAID_DUELS_MODE)
    }

    pub fn outcome(&self) -> RunOutcomeKind {
        RunOutcomeKind::from_result(self.result.as_deref())
    }

    pub fn creation_date_utc(&self) -> Option<DateTime<Utc>> {
        self.creation_date.as_deref().and_then(parse_timestamp)
    }
}

fn lenient_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Number(n)) => n.as_i64(),
        Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

/// Accepts RFC 3339 plus the naive layouts the upstream producers emit (treated as UTC).
pub fn parse_timestamp(input: &str) -> Option<DateTime<Utc>> {
    let input = input.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(input) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(input, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// How the final match of a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcomeKind {
    Won,
    Lost,
    Undetermined,
}

impl RunOutcomeKind {
    pub fn from_result(result: Option<&str>) -> Self {
        match result {
            Some("won") => RunOutcomeKind::Won,
            Some("lost") => RunOutcomeKind::Lost,
            _ => RunOutcomeKind::Undetermined,
        }
    }
}

/// Win/loss counts parsed from a "W-L" tally string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunTally {
    pub wins: i32,
    pub losses: i32,
}

impl RunTally {
    pub fn parse(input: &str) -> Option<Self> {
        let (wins, losses) = input.trim().split_once('-')?;
        Some(Self {
            wins: wins.trim().parse().ok()?,
            losses: losses.trim().parse().ok()?,
        })
    }

    /// Counts the terminal match on top of the tally recorded before it.
    pub fn with_outcome(self, outcome: RunOutcomeKind) -> Self {
        match outcome {
            RunOutcomeKind::Won => Self {
                wins: self.wins.saturating_add(1),
                ..self
            },
            RunOutcomeKind::Lost => Self {
                losses: self.losses.saturating_add(1),
                ..self
            },
            RunOutcomeKind::Undetermined => self,
        }
    }
}

/// One loot pick for a run, with the chosen option already resolved by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LootRecord {
    pub category: LootCategory,
    pub picked_card_id: Option<String>,
}

/// One recorded match inside a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchSummaryRecord {
    pub creation_date: DateTime<Utc>,
    pub player_class: Option<String>,
    pub player_card_id: Option<String>,
    pub player_rank: Option<String>,
    pub player_decklist: String,
    pub additional_result: Option<String>,
}

impl MatchSummaryRecord {
    pub fn is_first_match(&self) -> bool {
        self.additional_result.as_deref() == Some(FIRST_MATCH_TALLY)
    }

    /// Numeric Duels rating, when the recorded rank is a plain number.
    pub fn rating(&self) -> Option<i32> {
        self.player_rank
            .as_deref()
            .and_then(|rank| rank.trim().parse().ok())
    }
}

/// Aggregated row persisted once per completed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DuelsRunSummaryRow {
    pub game_mode: String,
    pub run_start_date: DateTime<Utc>,
    pub run_end_date: DateTime<Utc>,
    pub build_number: Option<i64>,
    pub rating: Option<i32>,
    pub run_id: String,
    pub player_class: Option<String>,
    pub decklist: String,
    pub final_decklist: Option<String>,
    pub hero: Option<String>,
    pub hero_power: Option<String>,
    pub signature_treasure: Option<String>,
    pub treasures: String,
    pub passives: String,
    pub wins: i32,
    pub losses: i32,
}
