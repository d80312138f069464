pub mod checkpoint;
pub mod eval;
pub mod logger;
pub mod optim;
pub mod trainer;

pub use checkpoint::{resume, save_model, save_optimizer};
pub use eval::{eval_policy, masked_nll, policy_loss, EvalFn, LossFn};
pub use logger::TrainLogger;
pub use optim::{Adam, ParamsAdam};
pub use trainer::{TrainOptions, Trainer};
