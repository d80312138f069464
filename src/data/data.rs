use anyhow::{bail, Result};
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::fs;
use std::path::Path;

use crate::model::SENTINEL;
use crate::rep::Representation;

/// One training sample: a board state and the move sequence that answers it
/// (start token included).
#[derive(Clone)]
pub struct Pair {
    pub state: Vec<i64>,
    pub action: Vec<i64>,
}

/// Rectangular batch of token ids on the training device. Rows shorter than
/// the batch maximum are right-padded with the sentinel.
pub struct Batch {
    pub state: Tensor,
    pub action: Tensor,
}

/// Lines are `state<TAB>action` (or `state ||| action`), each side
/// whitespace-separated symbols understood by its representation.
pub fn split_line(line: &str) -> Option<(&str, &str)> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if let Some((left, right)) = line.split_once('\t') {
        return Some((left, right));
    }
    line.split_once("|||")
}

/// In-memory data source producing shuffled, rectangular, sentinel-padded
/// batches. Only full batches are yielded (drop-last semantics).
pub struct SampleSource {
    pairs: Vec<Pair>,
    batch_size: usize,
    device: Device,
}

impl SampleSource {
    pub fn load(
        path: &Path,
        board_rep: &dyn Representation,
        move_rep: &dyn Representation,
        batch_size: usize,
        device: &Device,
    ) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let mut pairs = Vec::new();
        for line in text.lines() {
            let Some((state_text, action_text)) = split_line(line) else {
                continue;
            };
            let state = board_rep.encode(state_text)?;
            let action = move_rep.encode(action_text)?;
            if state.is_empty() || action.is_empty() {
                continue;
            }
            pairs.push(Pair { state, action });
        }
        if pairs.is_empty() {
            bail!("no usable lines found in {:?}", path);
        }
        Ok(Self {
            pairs,
            batch_size,
            device: device.clone(),
        })
    }

    pub fn from_pairs(pairs: Vec<Pair>, batch_size: usize, device: &Device) -> Result<Self> {
        if pairs.is_empty() {
            bail!("sample source needs at least one pair");
        }
        Ok(Self {
            pairs,
            batch_size,
            device: device.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// One epoch's worth of batches in a fresh shuffled order.
    pub fn shuffled_batches(&self, rng: &mut StdRng) -> BatchIter<'_> {
        let mut order: Vec<usize> = (0..self.pairs.len()).collect();
        order.shuffle(rng);
        BatchIter {
            source: self,
            order,
            pos: 0,
        }
    }

    /// Batches in stored order, for held-out evaluation.
    pub fn ordered_batches(&self) -> BatchIter<'_> {
        BatchIter {
            source: self,
            order: (0..self.pairs.len()).collect(),
            pos: 0,
        }
    }

    fn make_batch(&self, indices: &[usize]) -> Result<Batch> {
        let max_state = indices
            .iter()
            .map(|&i| self.pairs[i].state.len())
            .max()
            .unwrap_or(0);
        let max_action = indices
            .iter()
            .map(|&i| self.pairs[i].action.len())
            .max()
            .unwrap_or(0);

        let mut state_buf = Vec::with_capacity(indices.len() * max_state);
        let mut action_buf = Vec::with_capacity(indices.len() * max_action);
        for &i in indices {
            let pair = &self.pairs[i];
            state_buf.extend_from_slice(&pair.state);
            state_buf.extend(std::iter::repeat(SENTINEL).take(max_state - pair.state.len()));
            action_buf.extend_from_slice(&pair.action);
            action_buf.extend(std::iter::repeat(SENTINEL).take(max_action - pair.action.len()));
        }
        let state = Tensor::from_vec(state_buf, (indices.len(), max_state), &self.device)?;
        let action = Tensor::from_vec(action_buf, (indices.len(), max_action), &self.device)?;
        Ok(Batch { state, action })
    }
}

pub struct BatchIter<'a> {
    source: &'a SampleSource,
    order: Vec<usize>,
    pos: usize,
}

impl Iterator for BatchIter<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        let end = self.pos + self.source.batch_size;
        if end > self.order.len() {
            return None;
        }
        let indices = &self.order[self.pos..end];
        self.pos = end;
        Some(self.source.make_batch(indices))
    }
}
