use anyhow::Result;
use candle_core::{Module, Tensor, D};
use candle_nn::{self as nn, VarBuilder};

/// Multi-Head Attention built from Candle's primitives: nn::Linear for the
/// projections, Tensor::matmul for the scores, nn::ops::softmax.
///
/// An optional additive bias is applied to the scores before the softmax;
/// key-padding and causal restrictions are both expressed this way (0 at
/// allowed pairs, -inf at blocked pairs).
pub struct MultiHeadAttention {
    num_heads: usize,
    head_dim: usize,
    scale: f64,
    q_proj: nn::Linear,
    k_proj: nn::Linear,
    v_proj: nn::Linear,
    out_proj: nn::Linear,
}

impl MultiHeadAttention {
    pub fn new(vb: VarBuilder<'_>, dim: usize, num_heads: usize) -> Result<Self> {
        assert!(dim % num_heads == 0, "dim must be divisible by num_heads");
        let head_dim = dim / num_heads;
        let scale = (head_dim as f64).sqrt();

        let q_proj = nn::linear(dim, dim, vb.pp("q_proj"))?;
        let k_proj = nn::linear(dim, dim, vb.pp("k_proj"))?;
        let v_proj = nn::linear(dim, dim, vb.pp("v_proj"))?;
        let out_proj = nn::linear(dim, dim, vb.pp("out_proj"))?;

        Ok(Self {
            num_heads,
            head_dim,
            scale,
            q_proj,
            k_proj,
            v_proj,
            out_proj,
        })
    }

    /// Self-attention: query, key, value all come from the same source.
    pub fn forward(&self, x: &Tensor, bias: Option<&Tensor>) -> Result<Tensor> {
        self.forward_cross(x, x, bias)
    }

    /// Cross-attention: query from one source, key/value from another.
    pub fn forward_cross(
        &self,
        query: &Tensor,
        key_value: &Tensor,
        bias: Option<&Tensor>,
    ) -> Result<Tensor> {
        let (b, t_q, _) = query.dims3()?;
        let (_, t_kv, _) = key_value.dims3()?;

        let q = self.q_proj.forward(query)?;
        let k = self.k_proj.forward(key_value)?;
        let v = self.v_proj.forward(key_value)?;

        // [B, T, D] -> [B, num_heads, T, head_dim]
        let q = q
            .reshape((b, t_q, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = k
            .reshape((b, t_kv, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = v
            .reshape((b, t_kv, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        // Q @ K^T / sqrt(d_k): [B, num_heads, T_q, T_kv]
        let k_t = k.transpose(D::Minus2, D::Minus1)?;
        let scores = q.matmul(&k_t)?;
        let mut scores = (scores / self.scale)?;
        if let Some(bias) = bias {
            scores = scores.broadcast_add(bias)?;
        }

        // Softmax over key positions, then apply to values.
        let attn_weights = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let attn_output = attn_weights.matmul(&v)?;

        // [B, num_heads, T_q, head_dim] -> [B, T_q, D]
        let attn_output = attn_output.transpose(1, 2)?.contiguous()?.reshape((
            b,
            t_q,
            self.num_heads * self.head_dim,
        ))?;

        Ok(self.out_proj.forward(&attn_output)?)
    }
}

/// Encoder block: masked self-attention + feed-forward, pre-norm, residuals.
/// No dropout anywhere in the model (fixed at zero).
pub struct EncoderBlock {
    attn: MultiHeadAttention,
    ln1: nn::LayerNorm,
    ln2: nn::LayerNorm,
    ff1: nn::Linear,
    ff2: nn::Linear,
}

impl EncoderBlock {
    pub fn new(vb: VarBuilder<'_>, dim: usize, num_heads: usize, ff_dim: usize) -> Result<Self> {
        let attn = MultiHeadAttention::new(vb.pp("attn"), dim, num_heads)?;
        let ln1 = nn::layer_norm(dim, 1e-5, vb.pp("ln1"))?;
        let ln2 = nn::layer_norm(dim, 1e-5, vb.pp("ln2"))?;
        let ff1 = nn::linear(dim, ff_dim, vb.pp("ff1"))?;
        let ff2 = nn::linear(ff_dim, dim, vb.pp("ff2"))?;

        Ok(Self {
            attn,
            ln1,
            ln2,
            ff1,
            ff2,
        })
    }

    pub fn forward(&self, x: &Tensor, self_bias: Option<&Tensor>) -> Result<Tensor> {
        // Pre-norm: self-attention with residual
        let normed = self.ln1.forward(x)?;
        let attn_out = self.attn.forward(&normed, self_bias)?;
        let x = (x + attn_out)?;

        // Feed-forward with residual
        let normed = self.ln2.forward(&x)?;
        let ff_out = self.ff1.forward(&normed)?.gelu()?;
        let ff_out = self.ff2.forward(&ff_out)?;
        Ok((x + ff_out)?)
    }
}

/// Decoder block: causal self-attention, cross-attention over the encoder
/// memory, then feed-forward. Same pre-norm/residual discipline as the
/// encoder block.
pub struct DecoderBlock {
    self_attn: MultiHeadAttention,
    cross_attn: MultiHeadAttention,
    ln1: nn::LayerNorm,
    ln2: nn::LayerNorm,
    ln3: nn::LayerNorm,
    ff1: nn::Linear,
    ff2: nn::Linear,
}

impl DecoderBlock {
    pub fn new(vb: VarBuilder<'_>, dim: usize, num_heads: usize, ff_dim: usize) -> Result<Self> {
        let self_attn = MultiHeadAttention::new(vb.pp("self_attn"), dim, num_heads)?;
        let cross_attn = MultiHeadAttention::new(vb.pp("cross_attn"), dim, num_heads)?;
        let ln1 = nn::layer_norm(dim, 1e-5, vb.pp("ln1"))?;
        let ln2 = nn::layer_norm(dim, 1e-5, vb.pp("ln2"))?;
        let ln3 = nn::layer_norm(dim, 1e-5, vb.pp("ln3"))?;
        let ff1 = nn::linear(dim, ff_dim, vb.pp("ff1"))?;
        let ff2 = nn::linear(ff_dim, dim, vb.pp("ff2"))?;

        Ok(Self {
            self_attn,
            cross_attn,
            ln1,
            ln2,
            ln3,
            ff1,
            ff2,
        })
    }

    /// `self_bias` carries the causal + target-padding restriction,
    /// `cross_bias` the source key-padding restriction.
    pub fn forward(
        &self,
        x: &Tensor,
        memory: &Tensor,
        self_bias: Option<&Tensor>,
        cross_bias: Option<&Tensor>,
    ) -> Result<Tensor> {
        let normed = self.ln1.forward(x)?;
        let attn_out = self.self_attn.forward(&normed, self_bias)?;
        let x = (x + attn_out)?;

        let normed = self.ln2.forward(&x)?;
        let cross_out = self.cross_attn.forward_cross(&normed, memory, cross_bias)?;
        let x = (x + cross_out)?;

        let normed = self.ln3.forward(&x)?;
        let ff_out = self.ff1.forward(&normed)?.gelu()?;
        let ff_out = self.ff2.forward(&ff_out)?;
        Ok((x + ff_out)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn cpu_vb(varmap: &VarMap) -> VarBuilder<'_> {
        VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu)
    }

    #[test]
    fn masked_keys_do_not_change_unmasked_queries() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let attn = MultiHeadAttention::new(cpu_vb(&varmap), 8, 2)?;

        let x = Tensor::rand(-1f32, 1f32, (1, 3, 8), &device)?;
        // Block the last key for every query.
        let bias = Tensor::from_vec(vec![0f32, 0.0, f32::NEG_INFINITY], (1, 1, 1, 3), &device)?;
        let masked = attn.forward(&x, Some(&bias))?;

        // Same computation with the blocked key's value perturbed: a properly
        // masked key must not influence the output.
        let noise = Tensor::from_vec(vec![5f32; 8], (1, 1, 8), &device)?;
        let x2 = Tensor::cat(&[x.narrow(1, 0, 2)?, (x.narrow(1, 2, 1)? + noise)?], 1)?;
        let masked2 = attn.forward_cross(&x, &x2, Some(&bias))?;

        let a = masked.flatten_all()?.to_vec1::<f32>()?;
        let b = masked2.flatten_all()?.to_vec1::<f32>()?;
        for (va, vb) in a.iter().zip(b.iter()) {
            assert!((va - vb).abs() < 1e-5, "masked key leaked into output");
        }
        Ok(())
    }

    #[test]
    fn decoder_block_preserves_shape() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let block = DecoderBlock::new(cpu_vb(&varmap), 8, 2, 32)?;
        let tgt = Tensor::rand(-1f32, 1f32, (2, 4, 8), &device)?;
        let memory = Tensor::rand(-1f32, 1f32, (2, 6, 8), &device)?;
        let out = block.forward(&tgt, &memory, None, None)?;
        assert_eq!(out.dims(), &[2, 4, 8]);
        Ok(())
    }
}
