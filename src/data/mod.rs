pub mod data;

pub use data::{split_line, Batch, Pair, SampleSource};
