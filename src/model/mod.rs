pub mod attention;
pub mod causal;
pub mod encoding;
pub mod policy;
pub mod seq2seq;
pub mod transformer;

pub use causal::{CausalBackbone, CausalPolicy};
pub use encoding::{padding_mask, zero_sentinel, PositionalEncoding, SENTINEL};
pub use policy::{CategoricalSampler, Greedy, PolicyModel, TokenSelector};
pub use seq2seq::{PolicyConfig, Seq2SeqPolicy};
