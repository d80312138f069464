use anyhow::Result;
use candle_core::{Module, Tensor};
use candle_nn::{self as nn, VarBuilder};

use super::attention::{DecoderBlock, EncoderBlock};

/// Stack of encoder blocks with a final layer norm. Token embedding and
/// positional encoding happen upstream in the policy wrapper; this stack
/// only sees dense [B, T, D] inputs plus the source key-padding bias.
pub struct EncoderStack {
    blocks: Vec<EncoderBlock>,
    ln_final: nn::LayerNorm,
}

impl EncoderStack {
    pub fn new(
        vb: VarBuilder<'_>,
        dim: usize,
        num_layers: usize,
        num_heads: usize,
    ) -> Result<Self> {
        let mut blocks = Vec::with_capacity(num_layers);
        for i in 0..num_layers {
            let block = EncoderBlock::new(vb.pp(format!("block_{}", i)), dim, num_heads, dim * 4)?;
            blocks.push(block);
        }
        let ln_final = nn::layer_norm(dim, 1e-5, vb.pp("ln_final"))?;
        Ok(Self { blocks, ln_final })
    }

    pub fn forward(&self, x: &Tensor, self_bias: Option<&Tensor>) -> Result<Tensor> {
        let mut h = x.clone();
        for block in &self.blocks {
            h = block.forward(&h, self_bias)?;
        }
        Ok(self.ln_final.forward(&h)?)
    }
}

/// Stack of decoder blocks (causal self-attention + cross-attention over the
/// encoder memory) with a final layer norm.
pub struct DecoderStack {
    blocks: Vec<DecoderBlock>,
    ln_final: nn::LayerNorm,
}

impl DecoderStack {
    pub fn new(
        vb: VarBuilder<'_>,
        dim: usize,
        num_layers: usize,
        num_heads: usize,
    ) -> Result<Self> {
        let mut blocks = Vec::with_capacity(num_layers);
        for i in 0..num_layers {
            let block = DecoderBlock::new(vb.pp(format!("block_{}", i)), dim, num_heads, dim * 4)?;
            blocks.push(block);
        }
        let ln_final = nn::layer_norm(dim, 1e-5, vb.pp("ln_final"))?;
        Ok(Self { blocks, ln_final })
    }

    pub fn forward(
        &self,
        x: &Tensor,
        memory: &Tensor,
        self_bias: Option<&Tensor>,
        cross_bias: Option<&Tensor>,
    ) -> Result<Tensor> {
        let mut h = x.clone();
        for block in &self.blocks {
            h = block.forward(&h, memory, self_bias, cross_bias)?;
        }
        Ok(self.ln_final.forward(&h)?)
    }
}
