use std::collections::VecDeque;
use std::path::PathBuf;

use anyhow::Result;
use candle_nn::{Optimizer, VarMap};
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::checkpoint;
use super::eval::{EvalFn, LossFn};
use super::logger::TrainLogger;
use super::optim::Adam;
use crate::data::{Batch, SampleSource};
use crate::model::PolicyModel;

/// Controller knobs. Hyperparameters of the model itself live in
/// `PolicyConfig`; these only shape the epoch/batch schedule.
#[derive(Clone, Debug)]
pub struct TrainOptions {
    pub epochs: usize,
    /// Extra evaluation + checkpoint every this many batches within an
    /// epoch. 0 disables in-epoch evaluation.
    pub eval_freq: usize,
    pub checkpoint_dir: PathBuf,
    pub seed: u64,
}

/// Drives the epoch/batch schedule over an injected model, loss, and
/// evaluation function.
///
/// Each epoch runs the same explicit phase sequence:
/// Evaluating -> Training (one step per batch, with periodic Evaluating +
/// Checkpointing every `eval_freq` batches) -> Checkpointing. Phases never
/// overlap; the model and optimizer are exclusively owned by this controller
/// for the duration of the run. A malformed batch aborts the run.
pub struct Trainer<'a, M: PolicyModel> {
    model: &'a M,
    varmap: &'a VarMap,
    opt: Adam,
    logger: TrainLogger,
    opts: TrainOptions,
    rng: StdRng,
    recent_losses: VecDeque<f32>,
}

impl<'a, M: PolicyModel> Trainer<'a, M> {
    pub fn new(
        model: &'a M,
        varmap: &'a VarMap,
        opt: Adam,
        logger: TrainLogger,
        opts: TrainOptions,
    ) -> Self {
        let rng = StdRng::seed_from_u64(opts.seed);
        Self {
            model,
            varmap,
            opt,
            logger,
            opts,
            rng,
            recent_losses: VecDeque::with_capacity(1000),
        }
    }

    pub fn run(
        &mut self,
        train_source: &SampleSource,
        test_source: &SampleSource,
        loss_fn: &LossFn<M>,
        eval_fn: &EvalFn<M>,
    ) -> Result<()> {
        for epoch in 0..self.opts.epochs {
            self.evaluate(epoch, test_source, loss_fn, eval_fn)?;

            for (batch_idx, batch) in train_source.shuffled_batches(&mut self.rng).enumerate() {
                let batch = batch?;
                let loss = self.train_step(&batch, loss_fn)?;
                self.logger.log_train(epoch, batch_idx, loss)?;

                if batch_idx > 0 && batch_idx % 100 == 0 {
                    let avg: f32 =
                        self.recent_losses.iter().sum::<f32>() / self.recent_losses.len() as f32;
                    println!("({epoch}/{batch_idx}) Loss (Avg): {avg}");
                }

                if self.opts.eval_freq > 0
                    && batch_idx > 0
                    && batch_idx % self.opts.eval_freq == 0
                {
                    self.evaluate(epoch, test_source, loss_fn, eval_fn)?;
                    self.checkpoint(epoch)?;
                }
            }

            self.checkpoint(epoch)?;
        }
        Ok(())
    }

    /// One gradient update: forward, loss, backward, optimizer step.
    /// Gradients are freshly computed per step; nothing accumulates across
    /// batches.
    fn train_step(&mut self, batch: &Batch, loss_fn: &LossFn<M>) -> Result<f32> {
        let loss = loss_fn(self.model, batch)?;
        self.opt.backward_step(&loss)?;
        let loss = loss.to_scalar::<f32>()?;
        if self.recent_losses.len() == 1000 {
            self.recent_losses.pop_front();
        }
        self.recent_losses.push_back(loss);
        Ok(loss)
    }

    /// Held-out evaluation. Reads parameters, never writes them.
    fn evaluate(
        &mut self,
        epoch: usize,
        test_source: &SampleSource,
        loss_fn: &LossFn<M>,
        eval_fn: &EvalFn<M>,
    ) -> Result<()> {
        let (accuracy, test_loss) = eval_fn(self.model, test_source, loss_fn)?;
        println!("({epoch}) Acc: {accuracy:.2} Test Loss: {test_loss}");
        self.logger.log_test(epoch, accuracy)?;
        Ok(())
    }

    fn checkpoint(&mut self, epoch: usize) -> Result<()> {
        let model_file = checkpoint::save_model(self.varmap, &self.opts.checkpoint_dir, epoch)?;
        let opt_file = checkpoint::save_optimizer(&self.opt, &self.opts.checkpoint_dir)?;
        tracing::info!(?model_file, ?opt_file, epoch, "checkpoint written");
        Ok(())
    }

    /// Flush and hand the metric log back at the end of a run.
    pub fn finish(self) -> Result<()> {
        self.logger.close()
    }
}
