//! Encoder-decoder policy transformer for board-game move prediction.
//!
//! The model wraps a vanilla transformer: two narrow token embedding tables
//! (board and move) projected into the working dimension, a fixed sinusoidal
//! positional encoding, sentinel-based padding masks, and an autoregressive
//! decode loop with greedy or categorical token selection. Training runs a
//! resumable epoch/batch schedule with periodic evaluation, metric logging,
//! and safetensors checkpoints for both model and optimizer state.

pub mod config;
pub mod data;
pub mod model;
pub mod rep;
pub mod train;
