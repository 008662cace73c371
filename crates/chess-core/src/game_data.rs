use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    White,
    Black,
}

impl Side {
    /// Side that plays ply `index` (1-based) of a game from the standard start.
    pub fn of_ply(index: u32) -> Self {
        if index % 2 == 1 {
            Side::White
        } else {
            Side::Black
        }
    }

    pub fn opponent(self) -> Self {
        match self {
            Side::White => Side::Black,
            Side::Black => Side::White,
        }
    }

    pub fn as_char(self) -> char {
        match self {
            Side::White => 'w',
            Side::Black => 'b',
        }
    }
}

/// One half-move as stored by the import layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ply {
    /// 1-based ply number
    pub index: u32,
    /// UCI (`e2e4`) or SAN (`Nf3`) notation
    pub notation: String,
    pub side: Side,
}

impl Ply {
    pub fn new(index: u32, notation: impl Into<String>) -> Self {
        Self {
            index,
            notation: notation.into(),
            side: Side::of_ply(index),
        }
    }
}

/// Ordered move list of an imported game.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveSequence {
    pub game_id: i64,
    pub plies: Vec<Ply>,
    pub result: Option<String>, // "1-0", "0-1", "1/2-1/2"
}

impl MoveSequence {
    /// Build a sequence from bare notations, numbering plies from 1.
    pub fn from_notations<I, S>(game_id: i64, moves: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let plies = moves
            .into_iter()
            .enumerate()
            .map(|(i, m)| Ply::new(i as u32 + 1, m))
            .collect();
        Self {
            game_id,
            plies,
            result: None,
        }
    }

    pub fn len(&self) -> usize {
        self.plies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plies.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_of_ply() {
        assert_eq!(Side::of_ply(1), Side::White);
        assert_eq!(Side::of_ply(2), Side::Black);
        assert_eq!(Side::of_ply(2).opponent(), Side::White);
    }

    #[test]
    fn test_from_notations_numbers_plies() {
        let seq = MoveSequence::from_notations(7, ["e2e4", "e7e5", "Nf3"]);
        assert_eq!(seq.len(), 3);
        assert_eq!(seq.plies[2].index, 3);
        assert_eq!(seq.plies[2].side, Side::White);
        assert_eq!(seq.plies[1].notation, "e7e5");
    }
}
