use std::path::PathBuf;

use crate::model::PolicyConfig;
use crate::train::TrainOptions;

/// Full run configuration assembled from the CLI. Model-shape fields feed
/// `PolicyConfig`; schedule fields feed `TrainOptions`.
#[derive(Clone, Debug)]
pub struct Config {
    pub train_path: PathBuf,
    pub test_path: PathBuf,
    pub batch_size: usize,
    pub epochs: usize,
    pub eval_freq: usize,
    pub lr: f64,
    pub emb_dim: usize,
    pub num_layers: usize,
    pub num_heads: usize,
    pub checkpoint_dir: PathBuf,
    pub seed: u64,
}

impl Config {
    pub fn policy_config(&self) -> PolicyConfig {
        PolicyConfig {
            emb_dim: self.emb_dim,
            num_encoder_layers: self.num_layers,
            num_decoder_layers: self.num_layers,
            num_heads: self.num_heads,
            ..PolicyConfig::default()
        }
    }

    pub fn train_options(&self) -> TrainOptions {
        TrainOptions {
            epochs: self.epochs,
            eval_freq: self.eval_freq,
            checkpoint_dir: self.checkpoint_dir.clone(),
            seed: self.seed,
        }
    }
}
