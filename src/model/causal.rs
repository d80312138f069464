use anyhow::{bail, Result};
use candle_core::{Device, Tensor, D};
use candle_nn::ops::log_softmax;
use rand::rngs::StdRng;

use super::encoding::{padding_mask, zero_sentinel};
use super::policy::{CategoricalSampler, Greedy, PolicyModel, TokenSelector};

/// External pretrained causal language model behind a narrow seam. The
/// backbone owns its own parameters and tokenizer; this crate only asks it
/// for next-token logits over a prefix.
pub trait CausalBackbone {
    /// Raw (unnormalized) logits, shape [B, T, vocab].
    fn logits(&self, tokens: &Tensor) -> Result<Tensor>;

    /// End-of-sequence id used by `generate` for early stopping.
    fn eos_id(&self) -> i64;

    fn device(&self) -> &Device;
}

/// Constrained-generation wrapper around a pretrained causal LM.
///
/// Unlike the board-game decoder, `generate` stops early once the backbone's
/// end-of-sequence token is produced; the fixed-step `infer`/`sample` paths
/// keep the common length contract.
pub struct CausalPolicy<B: CausalBackbone> {
    backbone: B,
    temperature: f64,
}

impl<B: CausalBackbone> CausalPolicy<B> {
    pub fn new(backbone: B, temperature: f64) -> Result<Self> {
        if temperature <= 0.0 {
            bail!("temperature must be positive (got {temperature})");
        }
        Ok(Self {
            backbone,
            temperature,
        })
    }

    /// Shifted log-probabilities over a token prefix: T-1 distributions for
    /// a prefix of length T, sentinel positions zeroed before the backbone
    /// sees them.
    pub fn prefix_log_probs(&self, tokens: &Tensor) -> Result<Tensor> {
        let tokens = tokens.to_device(self.backbone.device())?;
        let mask = padding_mask(&tokens)?;
        let logits = self.backbone.logits(&zero_sentinel(&tokens, &mask)?)?;
        let log_probs = log_softmax(&(logits / self.temperature)?, D::Minus1)?;
        let t = log_probs.dim(1)?;
        Ok(log_probs.narrow(1, 0, t - 1)?)
    }

    fn extend(
        &self,
        prefix: &Tensor,
        max_new: usize,
        selector: &mut dyn TokenSelector,
        stop_at_eos: bool,
    ) -> Result<Tensor> {
        let mut tokens = prefix.to_device(self.backbone.device())?;
        for _ in 0..max_new {
            let logits = self.backbone.logits(&tokens)?;
            let last = logits.dim(1)? - 1;
            let step = (logits.narrow(1, last, 1)?.squeeze(1)? / self.temperature)?;
            let next = selector.select(&log_softmax(&step, D::Minus1)?)?;
            let done = stop_at_eos
                && tokens.dim(0)? == 1
                && next.to_vec2::<i64>()?[0][0] == self.backbone.eos_id();
            tokens = Tensor::cat(&[&tokens, &next], 1)?;
            if done {
                break;
            }
        }
        Ok(tokens)
    }

    /// Open-ended generation with end-of-sequence early stopping.
    pub fn generate(&self, prefix: &Tensor, max_new: usize, rng: &mut StdRng) -> Result<Tensor> {
        self.extend(prefix, max_new, &mut CategoricalSampler::new(rng), true)
    }
}

impl<B: CausalBackbone> PolicyModel for CausalPolicy<B> {
    /// The causal variant conditions on the concatenation of state and
    /// action along the time axis.
    fn forward(&self, state: &Tensor, action: &Tensor) -> Result<Tensor> {
        if state.dim(0)? != action.dim(0)? {
            bail!(
                "state batch {} does not match action batch {}",
                state.dim(0)?,
                action.dim(0)?
            );
        }
        let joined = Tensor::cat(&[state, action], 1)?;
        self.prefix_log_probs(&joined)
    }

    fn infer(&self, state: &Tensor, max_len: usize) -> Result<Tensor> {
        self.extend(state, max_len, &mut Greedy, false)
    }

    fn sample(&self, state: &Tensor, max_len: usize, rng: &mut StdRng) -> Result<Tensor> {
        self.extend(state, max_len, &mut CategoricalSampler::new(rng), false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use rand::SeedableRng;

    /// Stand-in backbone: strongly prefers the token after the current one,
    /// modulo the vocabulary, and uses the last id as end-of-sequence.
    struct CyclicBackbone {
        vocab: usize,
        device: Device,
    }

    impl CausalBackbone for CyclicBackbone {
        fn logits(&self, tokens: &Tensor) -> Result<Tensor> {
            let rows = tokens.to_vec2::<i64>()?;
            let (b, t) = tokens.dims2()?;
            let mut data = vec![0f32; b * t * self.vocab];
            for (bi, row) in rows.iter().enumerate() {
                for (ti, &tok) in row.iter().enumerate() {
                    let favored = ((tok + 1) as usize) % self.vocab;
                    data[(bi * t + ti) * self.vocab + favored] = 10.0;
                }
            }
            Ok(Tensor::from_vec(data, (b, t, self.vocab), &self.device)?)
        }

        fn eos_id(&self) -> i64 {
            (self.vocab - 1) as i64
        }

        fn device(&self) -> &Device {
            &self.device
        }
    }

    #[test]
    fn prefix_log_probs_are_shifted_and_normalized() -> Result<()> {
        let device = Device::Cpu;
        let policy = CausalPolicy::new(
            CyclicBackbone {
                vocab: 5,
                device: device.clone(),
            },
            1.0,
        )?;
        let tokens = Tensor::from_vec(vec![0i64, 1, 2, 3], (1, 4), &device)?;
        let log_probs = policy.prefix_log_probs(&tokens)?;
        assert_eq!(log_probs.dims(), &[1, 3, 5]);
        let sums = log_probs.exp()?.sum(D::Minus1)?.to_vec2::<f32>()?;
        for s in &sums[0] {
            assert!((s - 1.0).abs() < 1e-4);
        }
        Ok(())
    }

    #[test]
    fn generate_stops_on_end_of_sequence() -> Result<()> {
        let device = Device::Cpu;
        // vocab 3, eos id 2: from token 1 the backbone pushes hard to eos.
        let policy = CausalPolicy::new(
            CyclicBackbone {
                vocab: 3,
                device: device.clone(),
            },
            0.25,
        )?;
        let prefix = Tensor::from_vec(vec![0i64], (1, 1), &device)?;
        let mut rng = StdRng::seed_from_u64(3);
        let out = policy.generate(&prefix, 10, &mut rng)?;
        let row = &out.to_vec2::<i64>()?[0];
        assert!(row.len() <= 11);
        assert_eq!(*row.last().unwrap(), 2, "generation should end at eos");
        Ok(())
    }

    #[test]
    fn fixed_step_infer_ignores_eos() -> Result<()> {
        let device = Device::Cpu;
        let policy = CausalPolicy::new(
            CyclicBackbone {
                vocab: 3,
                device: device.clone(),
            },
            1.0,
        )?;
        let prefix = Tensor::from_vec(vec![0i64, 1], (1, 2), &device)?;
        let out = policy.infer(&prefix, 4)?;
        assert_eq!(out.dims(), &[1, 6]);
        Ok(())
    }
}
