use anyhow::{bail, Result};
use candle_core::{DType, Device, Tensor};

/// Reserved padding id. Never a valid vocabulary index.
pub const SENTINEL: i64 = -1;

/// Boolean mask over a token batch: 1 where the sentinel occurs, 0 elsewhere.
/// Recomputed from raw input on every forward pass, never stored.
pub fn padding_mask(tokens: &Tensor) -> Result<Tensor> {
    Ok(tokens.eq(SENTINEL)?)
}

/// Replace sentinel positions with 0 so embedding lookups stay in-vocabulary.
/// The mask (not the token value) carries the "ignore" signal to attention.
pub fn zero_sentinel(tokens: &Tensor, mask: &Tensor) -> Result<Tensor> {
    Ok(mask.where_cond(&tokens.zeros_like()?, tokens)?)
}

/// Additive attention bias from a key-padding mask.
/// Input: u8 mask [B, T]. Output: f32 [B, 1, 1, T] with 0 at kept keys and
/// -inf at padded keys, broadcastable onto [B, H, T_q, T_kv] scores.
pub fn key_padding_bias(mask: &Tensor) -> Result<Tensor> {
    let (b, t) = mask.dims2()?;
    let zeros = Tensor::zeros((b, t), DType::F32, mask.device())?;
    let blocked = Tensor::full(f32::NEG_INFINITY, (b, t), mask.device())?;
    let bias = mask.where_cond(&blocked, &zeros)?;
    Ok(bias.reshape((b, 1, 1, t))?)
}

/// Causal bias [1, 1, T, T]: position i may attend only to positions <= i.
pub fn causal_bias(seq_len: usize, device: &Device) -> Result<Tensor> {
    let mut data = vec![0f32; seq_len * seq_len];
    for i in 0..seq_len {
        for j in 0..seq_len {
            if j > i {
                data[i * seq_len + j] = f32::NEG_INFINITY;
            }
        }
    }
    Ok(Tensor::from_vec(data, (1, 1, seq_len, seq_len), device)?)
}

/// Fixed sinusoidal positional encoding, precomputed once for the maximum
/// supported length. Inputs longer than `max_len` are rejected rather than
/// the table being extended; device placement is explicit via `to_device`.
pub struct PositionalEncoding {
    table: Tensor,
    max_len: usize,
}

impl PositionalEncoding {
    pub fn new(dim: usize, max_len: usize, device: &Device) -> Result<Self> {
        if dim % 2 != 0 {
            bail!("cannot use sin/cos positional encoding with odd dim (got dim={dim})");
        }
        let mut pe = vec![0f32; max_len * dim];
        for pos in 0..max_len {
            for i in 0..dim / 2 {
                let angle = (pos as f64) / (10000f64).powf((2 * i) as f64 / dim as f64);
                pe[pos * dim + 2 * i] = angle.sin() as f32;
                pe[pos * dim + 2 * i + 1] = angle.cos() as f32;
            }
        }
        let table = Tensor::from_vec(pe, (1, max_len, dim), device)?;
        Ok(Self { table, max_len })
    }

    /// Add the `[0..len]` slice of the table to an embedded batch [B, T, D].
    pub fn apply(&self, x: &Tensor) -> Result<Tensor> {
        let (_b, t, _d) = x.dims3()?;
        if t > self.max_len {
            bail!(
                "sequence length {t} exceeds the precomputed positional table ({})",
                self.max_len
            );
        }
        Ok(x.broadcast_add(&self.table.narrow(1, 0, t)?)?)
    }

    /// Explicit re-placement. The table never migrates implicitly.
    pub fn to_device(&mut self, device: &Device) -> Result<()> {
        self.table = self.table.to_device(device)?;
        Ok(())
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub fn table(&self) -> &Tensor {
        &self.table
    }
}
