use anyhow::{bail, Result};
use candle_core::{Device, Module, Tensor, D};
use candle_nn::{self as nn, ops::log_softmax, VarBuilder};
use rand::rngs::StdRng;

use super::encoding::{causal_bias, key_padding_bias, padding_mask, zero_sentinel, PositionalEncoding};
use super::policy::{CategoricalSampler, Greedy, PolicyModel, TokenSelector};
use super::transformer::{DecoderStack, EncoderStack};

/// Width of the raw token embedding tables. Tokens are looked up in a narrow
/// table and then projected into the model's working dimension.
const TOKEN_EMBED_WIDTH: usize = 8;

#[derive(Debug, Clone)]
pub struct PolicyConfig {
    pub emb_dim: usize,
    pub num_encoder_layers: usize,
    pub num_decoder_layers: usize,
    pub num_heads: usize,
    pub start_id: i64,
    pub max_positions: usize,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            emb_dim: 256,
            num_encoder_layers: 6,
            num_decoder_layers: 6,
            num_heads: 8,
            start_id: 0,
            max_positions: 1024,
        }
    }
}

/// Autoregressive encoder-decoder policy over board states and moves.
///
/// Given a source of N state tokens and a target of M move tokens, `forward`
/// returns M-1 log-probability distributions, aligned to predicting move
/// tokens 2..M from their prefixes (the shifted-logits convention).
pub struct Seq2SeqPolicy {
    device: Device,
    board_embed: nn::Embedding,
    move_embed: nn::Embedding,
    to_emb_board: nn::Linear,
    to_emb_move: nn::Linear,
    pe: PositionalEncoding,
    encoder: EncoderStack,
    decoder: DecoderStack,
    to_dist: nn::Linear,
    start_id: i64,
    move_width: usize,
}

impl Seq2SeqPolicy {
    pub fn new(
        vb: VarBuilder<'_>,
        device: &Device,
        board_width: usize,
        move_width: usize,
        cfg: &PolicyConfig,
    ) -> Result<Self> {
        if cfg.emb_dim % cfg.num_heads != 0 {
            bail!(
                "emb_dim {} is not divisible by num_heads {}",
                cfg.emb_dim,
                cfg.num_heads
            );
        }
        let board_embed = nn::embedding(board_width, TOKEN_EMBED_WIDTH, vb.pp("board_embed"))?;
        let move_embed = nn::embedding(move_width, TOKEN_EMBED_WIDTH, vb.pp("move_embed"))?;
        let to_emb_board = nn::linear(TOKEN_EMBED_WIDTH, cfg.emb_dim, vb.pp("to_emb_board"))?;
        let to_emb_move = nn::linear(TOKEN_EMBED_WIDTH, cfg.emb_dim, vb.pp("to_emb_move"))?;
        let pe = PositionalEncoding::new(cfg.emb_dim, cfg.max_positions, device)?;
        let encoder = EncoderStack::new(
            vb.pp("encoder"),
            cfg.emb_dim,
            cfg.num_encoder_layers,
            cfg.num_heads,
        )?;
        let decoder = DecoderStack::new(
            vb.pp("decoder"),
            cfg.emb_dim,
            cfg.num_decoder_layers,
            cfg.num_heads,
        )?;
        let to_dist = nn::linear(cfg.emb_dim, move_width, vb.pp("to_dist"))?;

        Ok(Self {
            device: device.clone(),
            board_embed,
            move_embed,
            to_emb_board,
            to_emb_move,
            pe,
            encoder,
            decoder,
            to_dist,
            start_id: cfg.start_id,
            move_width,
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn move_width(&self) -> usize {
        self.move_width
    }

    /// Table lookup, projection into the working dimension, then position.
    fn embed_state(&self, state: &Tensor) -> Result<Tensor> {
        let dense = self.to_emb_board.forward(&self.board_embed.forward(state)?)?;
        self.pe.apply(&dense)
    }

    fn embed_action(&self, action: &Tensor) -> Result<Tensor> {
        let dense = self.to_emb_move.forward(&self.move_embed.forward(action)?)?;
        self.pe.apply(&dense)
    }

    fn to_log_probs(&self, hidden: &Tensor) -> Result<Tensor> {
        Ok(log_softmax(&self.to_dist.forward(hidden)?, D::Minus1)?)
    }

    /// Encode the state once; the memory is reused unchanged across all
    /// decode steps.
    fn encode_state(&self, state: &Tensor) -> Result<(Tensor, Tensor)> {
        let src_mask = padding_mask(state)?;
        let src = self.embed_state(&zero_sentinel(state, &src_mask)?)?;
        let src_bias = key_padding_bias(&src_mask)?;
        let memory = self.encoder.forward(&src, Some(&src_bias))?;
        Ok((memory, src_bias))
    }

    /// Grow an output sequence one token at a time from the start token.
    /// After `max_len` steps the result is exactly max_len + 1 tokens long,
    /// start token included. No early stopping.
    pub fn decode(
        &self,
        state: &Tensor,
        max_len: usize,
        selector: &mut dyn TokenSelector,
    ) -> Result<Tensor> {
        let state = state.to_device(&self.device)?;
        let (memory, src_bias) = self.encode_state(&state)?;

        let batch = state.dim(0)?;
        let mut tokens = Tensor::full(self.start_id, (batch, 1), &self.device)?;
        for _ in 0..max_len {
            // Generated prefixes contain no padding, so only the causal
            // restriction applies on the target side.
            let tgt = self.embed_action(&tokens)?;
            let bias = causal_bias(tokens.dim(1)?, &self.device)?;
            let out = self
                .decoder
                .forward(&tgt, &memory, Some(&bias), Some(&src_bias))?;
            let log_probs = self.to_log_probs(&out)?;
            let last = log_probs.dim(1)? - 1;
            let next = selector.select(&log_probs.narrow(1, last, 1)?.squeeze(1)?)?;
            tokens = Tensor::cat(&[&tokens, &next], 1)?;
        }
        Ok(tokens)
    }
}

impl PolicyModel for Seq2SeqPolicy {
    fn forward(&self, state: &Tensor, action: &Tensor) -> Result<Tensor> {
        let state = state.to_device(&self.device)?;
        let action = action.to_device(&self.device)?;
        if state.dim(0)? != action.dim(0)? {
            bail!(
                "state batch {} does not match action batch {}",
                state.dim(0)?,
                action.dim(0)?
            );
        }

        let (memory, src_bias) = self.encode_state(&state)?;

        let tgt_mask = padding_mask(&action)?;
        let tgt = self.embed_action(&zero_sentinel(&action, &tgt_mask)?)?;
        let tgt_bias = causal_bias(action.dim(1)?, &self.device)?
            .broadcast_add(&key_padding_bias(&tgt_mask)?)?;

        let out = self
            .decoder
            .forward(&tgt, &memory, Some(&tgt_bias), Some(&src_bias))?;
        let log_probs = self.to_log_probs(&out)?;

        // Position t predicts token t+1; the final position has no label.
        let m = log_probs.dim(1)?;
        Ok(log_probs.narrow(1, 0, m - 1)?)
    }

    fn infer(&self, state: &Tensor, max_len: usize) -> Result<Tensor> {
        self.decode(state, max_len, &mut Greedy)
    }

    fn sample(&self, state: &Tensor, max_len: usize, rng: &mut StdRng) -> Result<Tensor> {
        self.decode(state, max_len, &mut CategoricalSampler::new(rng))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::encoding::SENTINEL;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;
    use rand::SeedableRng;

    fn tiny_policy(varmap: &VarMap, board_width: usize, move_width: usize) -> Result<Seq2SeqPolicy> {
        let device = Device::Cpu;
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &device);
        let cfg = PolicyConfig {
            emb_dim: 16,
            num_encoder_layers: 1,
            num_decoder_layers: 1,
            num_heads: 2,
            start_id: 0,
            max_positions: 32,
        };
        Seq2SeqPolicy::new(vb, &device, board_width, move_width, &cfg)
    }

    #[test]
    fn forward_returns_shifted_normalized_distributions() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let policy = tiny_policy(&varmap, 4, 6)?;

        let state = Tensor::from_vec(vec![1i64, 2, 3, SENTINEL], (1, 4), &device)?;
        let action = Tensor::from_vec(vec![0i64, 4, 2], (1, 3), &device)?;
        let log_probs = policy.forward(&state, &action)?;
        assert_eq!(log_probs.dims(), &[1, 2, 6]);

        let sums = log_probs.exp()?.sum(D::Minus1)?.to_vec2::<f32>()?;
        for row in &sums[0] {
            assert!((row - 1.0).abs() < 1e-4, "distribution sums to {row}");
        }
        Ok(())
    }

    #[test]
    fn forward_accepts_sentinel_in_a_two_token_vocabulary() -> Result<()> {
        // Board vocabulary of width 2, batch size 1, one padding slot.
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let policy = tiny_policy(&varmap, 2, 3)?;

        let state = Tensor::from_vec(vec![1i64, 0, SENTINEL], (1, 3), &device)?;
        let action = Tensor::from_vec(vec![0i64, 1], (1, 2), &device)?;
        let log_probs = policy.forward(&state, &action)?;
        assert_eq!(log_probs.dims(), &[1, 1, 3]);
        Ok(())
    }

    #[test]
    fn batch_mismatch_is_rejected() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let policy = tiny_policy(&varmap, 4, 6)?;

        let state = Tensor::zeros((2, 4), DType::I64, &device)?;
        let action = Tensor::zeros((3, 2), DType::I64, &device)?;
        assert!(policy.forward(&state, &action).is_err());
        Ok(())
    }

    #[test]
    fn greedy_decode_is_deterministic_and_sized_max_len_plus_one() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let policy = tiny_policy(&varmap, 4, 6)?;

        let state = Tensor::from_vec(vec![1i64, 2, 3], (1, 3), &device)?;
        let first = policy.infer(&state, 3)?;
        let second = policy.infer(&state, 3)?;
        assert_eq!(first.dims(), &[1, 4]);
        assert_eq!(first.to_vec2::<i64>()?, second.to_vec2::<i64>()?);
        assert_eq!(first.to_vec2::<i64>()?[0][0], 0, "start token must lead");
        Ok(())
    }

    #[test]
    fn sampled_decode_has_the_same_length_contract() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let policy = tiny_policy(&varmap, 4, 6)?;

        let state = Tensor::from_vec(vec![1i64, 2, 3, 0, 1, 2], (2, 3), &device)?;
        let mut rng = StdRng::seed_from_u64(11);
        let out = policy.sample(&state, 5, &mut rng)?;
        assert_eq!(out.dims(), &[2, 6]);
        for row in out.to_vec2::<i64>()? {
            assert_eq!(row[0], 0);
            for tok in row {
                assert!(tok >= 0 && tok < 6, "sampled token {tok} out of vocabulary");
            }
        }
        Ok(())
    }
}
