use candle_core::{backprop::GradStore, Tensor, Var};
use candle_nn::{
    optim::{AdamW, Optimizer, ParamsAdamW},
    VarMap,
};

use crate::{config, TrainingError};

const EPS: f64 = 1e-12;

/// AdamW over every trainable variable of a model, with optional global-norm
/// gradient clipping ahead of the update.
pub struct TrainerOptimizer {
    inner: AdamW,
    vars: Vec<Var>,
    clip_global_norm: Option<f64>,
    step: usize,
}

impl std::fmt::Debug for TrainerOptimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrainerOptimizer")
            .field("learning_rate", &self.learning_rate())
            .field("num_vars", &self.vars.len())
            .field("clip_global_norm", &self.clip_global_norm)
            .field("step", &self.step)
            .finish()
    }
}

impl TrainerOptimizer {
    pub fn new(vars: Vec<Var>, cfg: &config::OptimizerConfig) -> Result<Self, TrainingError> {
        if vars.is_empty() {
            return Err(TrainingError::initialization(
                "optimizer requires at least one parameter",
            ));
        }
        if let Some(var) = vars.iter().find(|var| !var.dtype().is_float()) {
            return Err(TrainingError::initialization(format!(
                "optimizer received non-floating parameter of dtype {:?}",
                var.dtype()
            )));
        }

        let params = ParamsAdamW {
            lr: cfg.learning_rate,
            beta1: cfg.beta1,
            beta2: cfg.beta2,
            eps: cfg.epsilon,
            weight_decay: cfg.weight_decay,
        };
        let inner = AdamW::new(vars.clone(), params).map_err(to_runtime_error)?;

        Ok(Self {
            inner,
            vars,
            clip_global_norm: cfg.clip_grad_norm,
            step: 0,
        })
    }

    pub fn from_varmap(varmap: &VarMap, cfg: &config::OptimizerConfig) -> Result<Self, TrainingError> {
        Self::new(varmap.all_vars(), cfg)
    }

    pub fn learning_rate(&self) -> f64 {
        self.inner.learning_rate()
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.inner.set_learning_rate(lr);
    }

    pub fn steps(&self) -> usize {
        self.step
    }

    /// Backpropagates `loss` and applies one update. Returns the global
    /// gradient norm measured before clipping.
    pub fn step(&mut self, loss: &Tensor) -> Result<f64, TrainingError> {
        let mut grads = loss.backward().map_err(to_runtime_error)?;
        let norm = self.global_norm(&grads)?;

        if let Some(max_norm) = self.clip_global_norm {
            if norm > max_norm {
                self.scale_grads(&mut grads, max_norm / (norm + EPS))?;
            }
        }

        self.inner.step(&grads).map_err(to_runtime_error)?;
        self.step += 1;
        Ok(norm)
    }

    fn global_norm(&self, grads: &GradStore) -> Result<f64, TrainingError> {
        let mut total = 0.0f64;
        for var in &self.vars {
            if let Some(grad) = grads.get(var.as_tensor()) {
                let squared = grad
                    .sqr()
                    .map_err(to_runtime_error)?
                    .sum_all()
                    .map_err(to_runtime_error)?
                    .to_dtype(candle_core::DType::F64)
                    .map_err(to_runtime_error)?
                    .to_scalar::<f64>()
                    .map_err(to_runtime_error)?;
                total += squared;
            }
        }
        Ok(total.sqrt())
    }

    fn scale_grads(&self, grads: &mut GradStore, scale: f64) -> Result<(), TrainingError> {
        for var in &self.vars {
            let tensor = var.as_tensor();
            let scaled = match grads.get(tensor) {
                Some(grad) => grad.affine(scale, 0.0).map_err(to_runtime_error)?,
                None => continue,
            };
            grads.insert(tensor, scaled);
        }
        Ok(())
    }
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
