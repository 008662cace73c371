//! Deterministic position replay from a stored move list.
//!
//! Positions are never persisted: index `k` is the board after ply `k`,
//! index `0` is the standard starting position.

use shakmaty::fen::Fen;
use shakmaty::san::SanPlus;
use shakmaty::uci::UciMove;
use shakmaty::{CastlingMode, Chess, Color, EnPassantMode, Move, Position as _};
use thiserror::Error;

use crate::game_data::{Ply, Side};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplayError {
    #[error("ply {ply}: cannot parse move '{notation}'")]
    Unparseable { ply: u32, notation: String },

    #[error("ply {ply}: illegal move '{notation}'")]
    Illegal { ply: u32, notation: String },

    #[error("ply {ply}: recorded side {recorded:?} but {expected:?} is to move")]
    SideMismatch {
        ply: u32,
        recorded: Side,
        expected: Side,
    },

    #[error("ply {ply}: expected ply number {expected}")]
    OutOfOrder { ply: u32, expected: u32 },

    #[error("invalid FEN '{0}'")]
    InvalidFen(String),
}

/// Board state reachable at a given ply index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Position {
    /// 0 = initial position, k = after ply k
    pub index: u32,
    pub fen: String,
    pub side_to_move: Side,
    /// The move that produced this position, in UCI
    pub last_move: Option<String>,
}

/// Replay a move list, returning `plies.len() + 1` positions.
pub fn replay(plies: &[Ply]) -> Result<Vec<Position>, ReplayError> {
    let mut pos = Chess::default();
    let mut positions = Vec::with_capacity(plies.len() + 1);
    positions.push(snapshot(&pos, 0, None));

    for (i, ply) in plies.iter().enumerate() {
        let expected_index = i as u32 + 1;
        if ply.index != expected_index {
            return Err(ReplayError::OutOfOrder {
                ply: ply.index,
                expected: expected_index,
            });
        }

        let to_move = side_of(pos.turn());
        if ply.side != to_move {
            return Err(ReplayError::SideMismatch {
                ply: ply.index,
                recorded: ply.side,
                expected: to_move,
            });
        }

        let mv = parse_move(&pos, ply.index, &ply.notation)?;
        let uci = mv.to_uci(CastlingMode::Standard).to_string();
        pos.play_unchecked(mv);
        positions.push(snapshot(&pos, ply.index, Some(uci)));
    }

    Ok(positions)
}

/// Play a UCI move on a FEN position and return the resulting FEN.
pub fn apply_uci(fen: &str, uci: &str) -> Result<String, ReplayError> {
    let mut pos = parse_fen(fen)?;
    let mv = parse_move(&pos, 0, uci)?;
    pos.play_unchecked(mv);
    Ok(to_fen(&pos))
}

fn parse_fen(fen: &str) -> Result<Chess, ReplayError> {
    let parsed: Fen = fen
        .parse()
        .map_err(|_| ReplayError::InvalidFen(fen.to_string()))?;
    parsed
        .into_position(CastlingMode::Standard)
        .map_err(|_| ReplayError::InvalidFen(fen.to_string()))
}

/// Accepts UCI first, then SAN (with optional check/mate suffix).
fn parse_move(pos: &Chess, ply: u32, notation: &str) -> Result<Move, ReplayError> {
    let notation = notation.trim();
    let illegal = || ReplayError::Illegal {
        ply,
        notation: notation.to_string(),
    };

    if let Ok(uci) = notation.parse::<UciMove>() {
        return uci.to_move(pos).map_err(|_| illegal());
    }

    let san: SanPlus = notation.parse().map_err(|_| ReplayError::Unparseable {
        ply,
        notation: notation.to_string(),
    })?;
    san.san.to_move(pos).map_err(|_| illegal())
}

fn snapshot(pos: &Chess, index: u32, last_move: Option<String>) -> Position {
    Position {
        index,
        fen: to_fen(pos),
        side_to_move: side_of(pos.turn()),
        last_move,
    }
}

fn to_fen(pos: &Chess) -> String {
    Fen::from_position(pos, EnPassantMode::Legal).to_string()
}

fn side_of(color: Color) -> Side {
    match color {
        Color::White => Side::White,
        Color::Black => Side::Black,
    }
}
