use anyhow::{bail, Result};
use candle_core::{DType, Tensor, D};
use rand::rngs::StdRng;
use rand::Rng;

/// Capability interface shared by every policy model variant (board-game
/// encoder-decoder, causal LM wrapper). One explicit method per capability
/// instead of structural duck-typing.
pub trait PolicyModel {
    /// Teacher-forced log-probabilities for predicting `action` from `state`.
    fn forward(&self, state: &Tensor, action: &Tensor) -> Result<Tensor>;

    /// Deterministic (arg-max) autoregressive decode.
    fn infer(&self, state: &Tensor, max_len: usize) -> Result<Tensor>;

    /// Stochastic autoregressive decode via categorical sampling.
    fn sample(&self, state: &Tensor, max_len: usize, rng: &mut StdRng) -> Result<Tensor>;
}

/// Picks the next token from a [B, V] log-probability distribution.
pub trait TokenSelector {
    /// Returns an i64 tensor of shape [B, 1].
    fn select(&mut self, log_probs: &Tensor) -> Result<Tensor>;
}

/// Arg-max selection. Ties resolve to the lowest index.
pub struct Greedy;

impl TokenSelector for Greedy {
    fn select(&mut self, log_probs: &Tensor) -> Result<Tensor> {
        let picked = log_probs.argmax(D::Minus1)?;
        Ok(picked.to_dtype(DType::I64)?.unsqueeze(D::Minus1)?)
    }
}

/// Categorical sampling: one cumulative-sum draw per batch row over the
/// exponentiated log-probabilities.
pub struct CategoricalSampler<'a> {
    rng: &'a mut StdRng,
}

impl<'a> CategoricalSampler<'a> {
    pub fn new(rng: &'a mut StdRng) -> Self {
        Self { rng }
    }
}

impl TokenSelector for CategoricalSampler<'_> {
    fn select(&mut self, log_probs: &Tensor) -> Result<Tensor> {
        let probs = log_probs.exp()?.to_vec2::<f32>()?;
        let mut picked = Vec::with_capacity(probs.len());
        for row in &probs {
            if row.is_empty() {
                bail!("cannot sample from an empty distribution");
            }
            let draw: f32 = self.rng.gen();
            let mut cumsum = 0f32;
            let mut choice = row.len() - 1;
            for (idx, p) in row.iter().enumerate() {
                cumsum += p;
                if draw <= cumsum {
                    choice = idx;
                    break;
                }
            }
            picked.push(choice as i64);
        }
        let b = picked.len();
        Ok(Tensor::from_vec(picked, (b, 1), log_probs.device())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use rand::SeedableRng;

    #[test]
    fn greedy_takes_lowest_index_on_clear_max() -> Result<()> {
        let device = Device::Cpu;
        let log_probs = Tensor::from_vec(
            vec![-3f32, -0.1, -5.0, -0.1, -5.0, -3.0],
            (2, 3),
            &device,
        )?;
        let picked = Greedy.select(&log_probs)?;
        assert_eq!(picked.to_vec2::<i64>()?, vec![vec![1], vec![0]]);
        Ok(())
    }

    #[test]
    fn sampler_tracks_a_skewed_distribution() -> Result<()> {
        let device = Device::Cpu;
        // p = [0.8, 0.2]
        let log_probs = Tensor::from_vec(vec![0.8f32.ln(), 0.2f32.ln()], (1, 2), &device)?;
        let mut rng = StdRng::seed_from_u64(7);
        let mut sampler = CategoricalSampler::new(&mut rng);
        let mut counts = [0usize; 2];
        let trials = 5000;
        for _ in 0..trials {
            let picked = sampler.select(&log_probs)?;
            counts[picked.to_vec2::<i64>()?[0][0] as usize] += 1;
        }
        let freq0 = counts[0] as f64 / trials as f64;
        assert!(
            (freq0 - 0.8).abs() < 0.03,
            "empirical frequency {freq0} too far from 0.8"
        );
        Ok(())
    }
}
