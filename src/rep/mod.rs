pub mod ttt;

pub use ttt::{TttBoardRep, TttMoveRep};

use anyhow::Result;

/// Maps domain objects (board states, moves) to integer token ids.
///
/// Ids run from 0 to `width() - 1`; the padding sentinel (-1) is reserved and
/// never a valid id. The policy model's embedding tables are sized from
/// `width()`, so a representation and a checkpoint must agree exactly.
pub trait Representation {
    /// Vocabulary size.
    fn width(&self) -> usize;

    /// Encode whitespace-separated symbols into token ids.
    fn encode(&self, text: &str) -> Result<Vec<i64>>;

    /// Decode token ids back into a symbol string. Sentinel ids are skipped.
    fn decode(&self, ids: &[i64]) -> Result<String>;
}
