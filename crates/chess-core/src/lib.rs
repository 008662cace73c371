pub mod game_data;
pub mod position;

pub use game_data::{MoveSequence, Ply, Side};
pub use position::{apply_uci, replay, Position, ReplayError};
