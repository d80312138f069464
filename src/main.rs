use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::Result;
use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use centaur::config::Config;
use centaur::data::SampleSource;
use centaur::model::{PolicyConfig, Seq2SeqPolicy};
use centaur::rep::{Representation, TttBoardRep, TttMoveRep};
use centaur::train::{self, Adam, ParamsAdam, TrainLogger, Trainer};

#[derive(Parser, Debug)]
#[command(name = "centaur", about = "Train a board-game move-prediction transformer")]
struct Args {
    /// Metric log file (TEST/TRAIN lines, append-only)
    log_file: PathBuf,

    /// Resume model parameters from a checkpoint
    #[arg(long = "load_model")]
    load_model: Option<PathBuf>,

    /// Resume optimizer state from a checkpoint
    #[arg(long = "load_opt")]
    load_opt: Option<PathBuf>,

    /// Overwrite an existing log file without prompting
    #[arg(short = 'o', long)]
    overwrite: bool,

    #[arg(long, default_value = "data/ttt_train.tsv")]
    train_data: PathBuf,

    #[arg(long, default_value = "data/ttt_test.tsv")]
    test_data: PathBuf,

    #[arg(long, default_value_t = 1000)]
    epochs: usize,

    #[arg(long, default_value_t = 128)]
    batch_size: usize,

    /// Extra in-epoch evaluation + checkpoint every N batches (0 = off)
    #[arg(long, default_value_t = 0)]
    eval_freq: usize,

    #[arg(long, default_value_t = 1e-4)]
    lr: f64,

    #[arg(long, default_value_t = 256)]
    emb_dim: usize,

    #[arg(long, default_value_t = 6)]
    num_layers: usize,

    #[arg(long, default_value_t = 8)]
    num_heads: usize,

    #[arg(long, default_value = ".")]
    checkpoint_dir: PathBuf,

    #[arg(long, default_value_t = 0)]
    seed: u64,
}

impl Args {
    fn to_config(&self) -> Config {
        Config {
            train_path: self.train_data.clone(),
            test_path: self.test_data.clone(),
            batch_size: self.batch_size,
            epochs: self.epochs,
            eval_freq: self.eval_freq,
            lr: self.lr,
            emb_dim: self.emb_dim,
            num_layers: self.num_layers,
            num_heads: self.num_heads,
            checkpoint_dir: self.checkpoint_dir.clone(),
            seed: self.seed,
        }
    }
}

/// Empty input means yes, matching the prompt's default.
fn confirm_overwrite(path: &PathBuf) -> Result<bool> {
    print!("File {path:?} exists. Overwrite? (Y/n) ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    let answer = line.trim();
    Ok(answer.is_empty() || answer.eq_ignore_ascii_case("y"))
}

fn pick_device() -> Device {
    match Device::new_cuda(0) {
        Ok(d) => {
            tracing::info!("using device: CUDA(0)");
            d
        }
        Err(e) => {
            tracing::info!("CUDA not available ({e}), using CPU");
            Device::Cpu
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    // Declining the overwrite prompt is a clean exit, not an error.
    if args.log_file.exists() && !args.overwrite && !confirm_overwrite(&args.log_file)? {
        return Ok(());
    }

    let config = args.to_config();
    let device = pick_device();

    let board_rep = TttBoardRep;
    let move_rep = TttMoveRep;

    let train_source = SampleSource::load(
        &config.train_path,
        &board_rep,
        &move_rep,
        config.batch_size,
        &device,
    )?;
    let test_source = SampleSource::load(
        &config.test_path,
        &board_rep,
        &move_rep,
        config.batch_size,
        &device,
    )?;
    tracing::info!(
        train = train_source.len(),
        test = test_source.len(),
        "loaded samples"
    );

    let mut varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let policy_cfg: PolicyConfig = config.policy_config();
    let policy = Seq2SeqPolicy::new(
        vb,
        &device,
        board_rep.width(),
        move_rep.width(),
        &policy_cfg,
    )?;

    let mut opt = Adam::from_varmap(
        &varmap,
        ParamsAdam {
            lr: config.lr,
            ..ParamsAdam::default()
        },
    )?;

    // Resume fully replaces freshly initialized state and must precede the
    // first evaluation phase.
    train::resume(
        &mut varmap,
        &mut opt,
        args.load_model.as_deref(),
        args.load_opt.as_deref(),
    )?;

    let logger = TrainLogger::create(&args.log_file)?;
    let mut trainer = Trainer::new(&policy, &varmap, opt, logger, config.train_options());
    trainer.run(
        &train_source,
        &test_source,
        &train::policy_loss,
        &train::eval_policy,
    )?;
    trainer.finish()
}
