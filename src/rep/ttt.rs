use anyhow::{bail, Result};

use super::Representation;
use crate::model::SENTINEL;

/// Tic-tac-toe board cells: "." empty, "x", "o". Nine symbols per state.
pub struct TttBoardRep;

const BOARD_SYMBOLS: [&str; 3] = [".", "x", "o"];

impl Representation for TttBoardRep {
    fn width(&self) -> usize {
        BOARD_SYMBOLS.len()
    }

    fn encode(&self, text: &str) -> Result<Vec<i64>> {
        text.split_whitespace()
            .map(|sym| {
                BOARD_SYMBOLS
                    .iter()
                    .position(|s| *s == sym)
                    .map(|id| id as i64)
                    .ok_or_else(|| anyhow::anyhow!("unknown board symbol {sym:?}"))
            })
            .collect()
    }

    fn decode(&self, ids: &[i64]) -> Result<String> {
        let mut out = Vec::with_capacity(ids.len());
        for &id in ids {
            if id == SENTINEL {
                continue;
            }
            match BOARD_SYMBOLS.get(id as usize) {
                Some(sym) => out.push(*sym),
                None => bail!("board id {id} out of range"),
            }
        }
        Ok(out.join(" "))
    }
}

/// Tic-tac-toe moves: id 0 is the shared start token, ids 1..=9 are the nine
/// cells. `encode` prepends the start token so every action sequence begins
/// with the decoder's seed.
pub struct TttMoveRep;

pub const TTT_START_ID: i64 = 0;

impl Representation for TttMoveRep {
    fn width(&self) -> usize {
        10
    }

    fn encode(&self, text: &str) -> Result<Vec<i64>> {
        let mut ids = vec![TTT_START_ID];
        for sym in text.split_whitespace() {
            let cell: i64 = sym
                .parse()
                .map_err(|_| anyhow::anyhow!("unknown move symbol {sym:?}"))?;
            if !(0..9).contains(&cell) {
                bail!("move cell {cell} out of range 0..9");
            }
            ids.push(cell + 1);
        }
        Ok(ids)
    }

    fn decode(&self, ids: &[i64]) -> Result<String> {
        let mut out = Vec::new();
        for &id in ids {
            if id == SENTINEL || id == TTT_START_ID {
                continue;
            }
            if !(1..10).contains(&id) {
                bail!("move id {id} out of range");
            }
            out.push((id - 1).to_string());
        }
        Ok(out.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn board_roundtrip() -> Result<()> {
        let rep = TttBoardRep;
        let ids = rep.encode("x o . . x . . . o")?;
        assert_eq!(ids.len(), 9);
        assert_eq!(rep.decode(&ids)?, "x o . . x . . . o");
        assert_eq!(rep.width(), 3);
        Ok(())
    }

    #[test]
    fn moves_carry_the_start_token() -> Result<()> {
        let rep = TttMoveRep;
        let ids = rep.encode("4")?;
        assert_eq!(ids, vec![TTT_START_ID, 5]);
        assert_eq!(rep.decode(&ids)?, "4");
        Ok(())
    }

    #[test]
    fn unknown_symbols_are_rejected() {
        assert!(TttBoardRep.encode("x q").is_err());
        assert!(TttMoveRep.encode("9").is_err());
    }
}
