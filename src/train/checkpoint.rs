use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_nn::VarMap;

use super::optim::Adam;

/// Checkpoint artifacts: one model snapshot per epoch plus a single rolling
/// optimizer snapshot, both safetensors. Writes go to a temp path first and
/// are renamed into place, so a crash mid-write leaves the previous
/// checkpoint intact.

pub fn model_path(dir: &Path, epoch: usize) -> PathBuf {
    dir.join(format!("model_{epoch}.safetensors"))
}

pub fn optimizer_path(dir: &Path) -> PathBuf {
    dir.join("opt.safetensors")
}

pub fn save_model(varmap: &VarMap, dir: &Path, epoch: usize) -> Result<PathBuf> {
    let path = model_path(dir, epoch);
    let tmp = path.with_extension("safetensors.tmp");
    varmap
        .save(&tmp)
        .with_context(|| format!("cannot write model checkpoint {tmp:?}"))?;
    fs::rename(&tmp, &path)?;
    Ok(path)
}

pub fn save_optimizer(opt: &Adam, dir: &Path) -> Result<PathBuf> {
    let path = optimizer_path(dir);
    let tmp = path.with_extension("safetensors.tmp");
    opt.save(&tmp)
        .with_context(|| format!("cannot write optimizer checkpoint {tmp:?}"))?;
    fs::rename(&tmp, &path)?;
    Ok(path)
}

/// Resume artifacts fully replace freshly initialized state. Must happen
/// before the first evaluation phase; any failure here is fatal at startup.
pub fn resume(
    varmap: &mut VarMap,
    opt: &mut Adam,
    load_model: Option<&Path>,
    load_opt: Option<&Path>,
) -> Result<()> {
    if let Some(path) = load_model {
        varmap
            .load(path)
            .with_context(|| format!("cannot resume model from {path:?}"))?;
        tracing::info!(?path, "resumed model parameters");
    }
    if let Some(path) = load_opt {
        opt.load(path)
            .with_context(|| format!("cannot resume optimizer from {path:?}"))?;
        tracing::info!(?path, "resumed optimizer state");
    }
    Ok(())
}
