use std::collections::HashMap;
use std::path::Path;

use candle_core::backprop::GradStore;
use candle_core::{safetensors, DType, Tensor, Var};
use candle_nn::{Optimizer, VarMap};

/// Adam with the betas the policy model trains under.
#[derive(Clone, Debug)]
pub struct ParamsAdam {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
}

impl Default for ParamsAdam {
    fn default() -> Self {
        Self {
            lr: 1e-4,
            beta1: 0.9,
            beta2: 0.98,
            eps: 1e-9,
        }
    }
}

struct VarAdam {
    name: String,
    var: Var,
    first_moment: Var,
    second_moment: Var,
}

/// Adam whose moment estimates are addressable by parameter name, so the
/// optimizer state can be persisted and restored alongside model checkpoints
/// as its own safetensors artifact.
///
/// candle's built-in AdamW keeps its moments private; resumable training
/// needs them on disk, which is the one reason this exists.
pub struct Adam {
    vars: Vec<VarAdam>,
    params: ParamsAdam,
    step_t: usize,
}

impl Adam {
    /// Build from a VarMap, keying each moment pair by the parameter's
    /// registered name. Names are sorted so iteration order is stable
    /// across runs.
    pub fn from_varmap(varmap: &VarMap, params: ParamsAdam) -> anyhow::Result<Self> {
        let data = varmap.data().lock().unwrap();
        let mut named: Vec<(String, Var)> =
            data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        drop(data);
        named.sort_by(|a, b| a.0.cmp(&b.0));

        let mut vars = Vec::with_capacity(named.len());
        for (name, var) in named {
            if !var.dtype().is_float() {
                continue;
            }
            let first_moment = Var::zeros(var.shape(), var.dtype(), var.device())?;
            let second_moment = Var::zeros(var.shape(), var.dtype(), var.device())?;
            vars.push(VarAdam {
                name,
                var,
                first_moment,
                second_moment,
            });
        }
        Ok(Self {
            vars,
            params,
            step_t: 0,
        })
    }

    pub fn step_count(&self) -> usize {
        self.step_t
    }

    /// Persist moments and step count to a safetensors file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let mut tensors = HashMap::new();
        for v in &self.vars {
            tensors.insert(format!("m.{}", v.name), v.first_moment.as_tensor().clone());
            tensors.insert(format!("v.{}", v.name), v.second_moment.as_tensor().clone());
        }
        let step = Tensor::from_vec(
            vec![self.step_t as i64],
            (1,),
            &candle_core::Device::Cpu,
        )?;
        tensors.insert("step".to_string(), step);
        safetensors::save(&tensors, path)?;
        Ok(())
    }

    /// Restore moments and step count. Every parameter known to this
    /// optimizer must be present in the artifact; anything else is a corrupt
    /// or mismatched checkpoint and fails the load.
    pub fn load<P: AsRef<Path>>(&mut self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        let tensors = safetensors::load(path, &candle_core::Device::Cpu)?;
        for v in &self.vars {
            let m = tensors
                .get(&format!("m.{}", v.name))
                .ok_or_else(|| anyhow::anyhow!("{path:?} is missing moment m.{}", v.name))?;
            let s = tensors
                .get(&format!("v.{}", v.name))
                .ok_or_else(|| anyhow::anyhow!("{path:?} is missing moment v.{}", v.name))?;
            v.first_moment.set(&m.to_device(v.var.device())?)?;
            v.second_moment.set(&s.to_device(v.var.device())?)?;
        }
        let step = tensors
            .get("step")
            .ok_or_else(|| anyhow::anyhow!("{path:?} is missing the step counter"))?;
        self.step_t = step.to_dtype(DType::I64)?.to_vec1::<i64>()?[0] as usize;
        Ok(())
    }
}

impl Optimizer for Adam {
    type Config = ParamsAdam;

    fn new(vars: Vec<Var>, params: ParamsAdam) -> candle_core::Result<Self> {
        // Anonymous construction keeps the candle Optimizer contract; names
        // fall back to the parameter's position.
        let vars = vars
            .into_iter()
            .filter(|v| v.dtype().is_float())
            .enumerate()
            .map(|(i, var)| {
                let first_moment = Var::zeros(var.shape(), var.dtype(), var.device())?;
                let second_moment = Var::zeros(var.shape(), var.dtype(), var.device())?;
                Ok(VarAdam {
                    name: format!("param_{i}"),
                    var,
                    first_moment,
                    second_moment,
                })
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self {
            vars,
            params,
            step_t: 0,
        })
    }

    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        self.step_t += 1;
        let b1 = self.params.beta1;
        let b2 = self.params.beta2;
        let scale_m = 1.0 / (1.0 - b1.powi(self.step_t as i32));
        let scale_v = 1.0 / (1.0 - b2.powi(self.step_t as i32));
        for var in self.vars.iter() {
            let theta = &var.var;
            if let Some(g) = grads.get(theta) {
                let next_m = ((var.first_moment.as_tensor() * b1)? + (g * (1.0 - b1))?)?;
                let next_v = ((var.second_moment.as_tensor() * b2)? + (g.sqr()? * (1.0 - b2))?)?;
                let m_hat = (&next_m * scale_m)?;
                let v_hat = (&next_v * scale_v)?;
                let delta = ((m_hat * self.params.lr)? / (v_hat.sqrt()? + self.params.eps)?)?;
                theta.set(&theta.sub(&delta)?)?;
                var.first_moment.set(&next_m)?;
                var.second_moment.set(&next_v)?;
            }
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};

    #[test]
    fn a_step_reduces_a_quadratic_loss() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let w = vb.get_with_hints((1,), "w", candle_nn::init::Init::Const(2.0))?;

        let mut opt = Adam::from_varmap(
            &varmap,
            ParamsAdam {
                lr: 0.1,
                ..Default::default()
            },
        )?;
        let before = w.to_vec1::<f32>()?[0];
        for _ in 0..20 {
            let loss = w.sqr()?.sum_all()?;
            opt.backward_step(&loss)?;
        }
        let after = varmap.all_vars()[0].to_vec1::<f32>()?[0];
        assert!(after.abs() < before.abs(), "w moved away from the minimum");
        assert_eq!(opt.step_count(), 20);
        Ok(())
    }

    #[test]
    fn state_roundtrips_through_a_checkpoint() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let w = vb.get_with_hints((2,), "w", candle_nn::init::Init::Const(1.0))?;

        let mut opt = Adam::from_varmap(&varmap, ParamsAdam::default())?;
        let loss = (w.sqr()?.sum_all()? * 3.0)?;
        opt.backward_step(&loss)?;

        let path = std::env::temp_dir().join(format!("centaur-opt-{}.safetensors", std::process::id()));
        opt.save(&path)?;

        let mut restored = Adam::from_varmap(&varmap, ParamsAdam::default())?;
        restored.load(&path)?;
        std::fs::remove_file(&path)?;

        assert_eq!(restored.step_count(), 1);
        let m0 = opt.vars[0].first_moment.to_vec1::<f32>()?;
        let m1 = restored.vars[0].first_moment.to_vec1::<f32>()?;
        assert_eq!(m0, m1);
        Ok(())
    }

    #[test]
    fn loading_a_missing_artifact_fails() -> anyhow::Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let _w = vb.get_with_hints((1,), "w", candle_nn::init::Init::Const(0.0))?;
        let mut opt = Adam::from_varmap(&varmap, ParamsAdam::default())?;
        assert!(opt.load("/nonexistent/opt.safetensors").is_err());
        Ok(())
    }
}
