//! Deckstring codec: a base64-wrapped sequence of unsigned LEB128 varints.
//!
//! Layout: reserved `0`, version `1`, format, hero count + hero dbf ids, then
//! three card groups (single copies, double copies, `n` copies as id/count pairs).

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use thiserror::Error;

pub const DECKSTRING_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GameFormat {
    Wild,
    Standard,
    Classic,
    Twist,
}

impl GameFormat {
    pub fn code(&self) -> u32 {
        match self {
            GameFormat::Wild => 1,
            GameFormat::Standard => 2,
            GameFormat::Classic => 3,
            GameFormat::Twist => 4,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(GameFormat::Wild),
            2 => Some(GameFormat::Standard),
            3 => Some(GameFormat::Classic),
            4 => Some(GameFormat::Twist),
            _ => None,
        }
    }
}

/// A card entry: dbf id and copy count.
pub type CardCount = (u32, u32);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeckDefinition {
    pub cards: Vec<CardCount>,
    pub heroes: Vec<u32>,
    pub format: GameFormat,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeckError {
    #[error("deckstring is not valid base64: {0}")]
    Base64(String),
    #[error("deckstring ended unexpectedly")]
    UnexpectedEnd,
    #[error("varint exceeds 32 bits")]
    Overflow,
    #[error("invalid deckstring header byte {0}")]
    InvalidHeader(u32),
    #[error("unsupported deckstring version {0}")]
    UnsupportedVersion(u32),
    #[error("unknown game format {0}")]
    UnknownFormat(u32),
    #[error("card {0} has a zero copy count")]
    ZeroCount(u32),
}

pub fn decode(deckstring: &str) -> Result<DeckDefinition, DeckError> {
    let bytes = STANDARD
        .decode(deckstring.trim())
        .map_err(|err| DeckError::Base64(err.to_string()))?;
    let mut reader = VarintReader::new(&bytes);

    let header = reader.next()?;
    if header != 0 {
        return Err(DeckError::InvalidHeader(header));
    }
    let version = reader.next()?;
    if version != DECKSTRING_VERSION {
        return Err(DeckError::UnsupportedVersion(version));
    }
    let format_code = reader.next()?;
    let format = GameFormat::from_code(format_code).ok_or(DeckError::UnknownFormat(format_code))?;

    let hero_count = reader.next()?;
    // Counts come from untrusted input; each entry needs at least one byte.
    let mut heroes = Vec::with_capacity((hero_count as usize).min(reader.remaining()));
    for _ in 0..hero_count {
        heroes.push(reader.next()?);
    }
    heroes.sort_unstable();

    let mut cards = Vec::new();
    for copies in [1, 2] {
        let group = reader.next()?;
        for _ in 0..group {
            cards.push((reader.next()?, copies));
        }
    }
    let multi = reader.next()?;
    for _ in 0..multi {
        let dbf_id = reader.next()?;
        let count = reader.next()?;
        cards.push((dbf_id, count));
    }
    cards.sort_unstable_by_key(|(dbf_id, _)| *dbf_id);

    Ok(DeckDefinition {
        cards,
        heroes,
        format,
    })
}

/// Encodes in canonical order: heroes and each card group sorted by dbf id.
pub fn encode(deck: &DeckDefinition) -> Result<String, DeckError> {
    if let Some((dbf_id, _)) = deck.cards.iter().find(|(_, count)| *count == 0) {
        return Err(DeckError::ZeroCount(*dbf_id));
    }

    let mut out = Vec::new();
    write_varint(&mut out, 0);
    write_varint(&mut out, DECKSTRING_VERSION);
    write_varint(&mut out, deck.format.code());

    let mut heroes = deck.heroes.clone();
    heroes.sort_unstable();
    write_varint(&mut out, heroes.len() as u32);
    for hero in heroes {
        write_varint(&mut out, hero);
    }

    let mut cards = deck.cards.clone();
    cards.sort_unstable_by_key(|(dbf_id, _)| *dbf_id);
    for copies in [1, 2] {
        let group = cards.iter().filter(|(_, count)| *count == copies).collect::<Vec<_>>();
        write_varint(&mut out, group.len() as u32);
        for (dbf_id, _) in group {
            write_varint(&mut out, *dbf_id);
        }
    }
    let multi = cards.iter().filter(|(_, count)| *count > 2).collect::<Vec<_>>();
    write_varint(&mut out, multi.len() as u32);
    for (dbf_id, count) in multi {
        write_varint(&mut out, *dbf_id);
        write_varint(&mut out, *count);
    }

    Ok(STANDARD.encode(out))
}

fn write_varint(out: &mut Vec<u8>, mut value: u32) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

struct VarintReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> VarintReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.pos)
    }

    fn next(&mut self) -> Result<u32, DeckError> {
        let mut value: u64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = *self.bytes.get(self.pos).ok_or(DeckError::UnexpectedEnd)?;
            self.pos += 1;
            value |= u64::from(byte & 0x7f) << shift;
            if value > u64::from(u32::MAX) {
                return Err(DeckError::Overflow);
            }
            if byte & 0x80 == 0 {
                return Ok(value as u32);
            }
            shift += 7;
            if shift > 28 {
                return Err(DeckError::Overflow);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_minimal_wild_deck() {
        let deck = DeckDefinition {
            cards: vec![(2, 1), (1, 1)],
            heroes: vec![7],
            format: GameFormat::Wild,
        };
        assert_eq!(encode(&deck).unwrap(), "AAEBAQcCAQIAAA==");
    }

    #[test]
    fn decodes_multi_byte_varints_and_all_groups() {
        let deck = decode("AAECAawCAawCAYEBAQUD").unwrap();
        assert_eq!(deck.format, GameFormat::Standard);
        assert_eq!(deck.heroes, vec![300]);
        assert_eq!(deck.cards, vec![(5, 3), (129, 2), (300, 1)]);
        assert_eq!(encode(&deck).unwrap(), "AAECAawCAawCAYEBAQUD");
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(matches!(decode("not base64!"), Err(DeckError::Base64(_))));
        // header ok, version ok, then nothing
        assert_eq!(decode("AAE="), Err(DeckError::UnexpectedEnd));
        // version 2
        assert_eq!(decode("AAI="), Err(DeckError::UnsupportedVersion(2)));
        // format 9
        assert_eq!(decode("AAEJ"), Err(DeckError::UnknownFormat(9)));
    }

    #[test]
    fn oversized_counts_fail_without_allocating() {
        // hero count u32::MAX followed by nothing
        assert_eq!(decode("AAEB/////w8="), Err(DeckError::UnexpectedEnd));
        // one hero, then a single-copy group claiming u32::MAX cards
        assert_eq!(decode("AAEBAQf/////Dw=="), Err(DeckError::UnexpectedEnd));
    }

    #[test]
    fn refuses_zero_copy_entries() {
        let deck = DeckDefinition {
            cards: vec![(10, 0)],
            heroes: vec![7],
            format: GameFormat::Wild,
        };
        assert_eq!(encode(&deck), Err(DeckError::ZeroCount(10)));
    }
}
