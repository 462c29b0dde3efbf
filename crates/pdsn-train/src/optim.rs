//! Stochastic gradient descent with momentum and weight decay.
//!
//! Gradients come from outside, keyed by parameter name. Only trainable
//! parameters can be stepped; frozen tensors and buffers are rejected.

use ndarray::ArrayD;
use pdsn_core::params::{named_parameters, named_parameters_mut};
use pdsn_core::Module;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum OptimError {
    #[error("gradient for unknown parameter {0}")]
    UnknownParameter(String),
    #[error("parameter {0} is frozen")]
    Frozen(String),
    #[error("gradient shape mismatch for {name}: parameter {expected:?}, gradient {actual:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SgdConfig {
    pub lr: f32,
    pub momentum: f32,
    pub weight_decay: f32,
}

impl Default for SgdConfig {
    fn default() -> Self {
        Self {
            lr: 0.02,
            momentum: 0.0,
            weight_decay: 0.0,
        }
    }
}

pub struct Sgd {
    config: SgdConfig,
    velocity: BTreeMap<String, ArrayD<f32>>,
}

impl Sgd {
    pub fn new(config: SgdConfig) -> Self {
        Self {
            config,
            velocity: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &SgdConfig {
        &self.config
    }

    pub fn set_lr(&mut self, lr: f32) {
        self.config.lr = lr;
    }

    /// Names the optimizer would update on `module`.
    pub fn param_names<M: Module + ?Sized>(module: &M) -> Vec<String> {
        pdsn_core::params::trainable_names(module)
    }

    /// Apply one update.
    ///
    /// `g' = g + wd·p`, `v = momentum·v + g'`, `p -= lr·v`. Parameters with no
    /// gradient are left untouched. The gradient map is validated as a whole
    /// before any tensor changes. Returns the number of tensors updated.
    pub fn step<M: Module + ?Sized>(
        &mut self,
        module: &mut M,
        grads: &BTreeMap<String, ArrayD<f32>>,
    ) -> Result<usize, OptimError> {
        let params: BTreeMap<String, _> = named_parameters(module).into_iter().collect();
        for (name, grad) in grads {
            let param = params
                .get(name)
                .ok_or_else(|| OptimError::UnknownParameter(name.clone()))?;
            if !param.is_trainable() {
                return Err(OptimError::Frozen(name.clone()));
            }
            if param.value.shape() != grad.shape() {
                return Err(OptimError::ShapeMismatch {
                    name: name.clone(),
                    expected: param.value.shape().to_vec(),
                    actual: grad.shape().to_vec(),
                });
            }
        }

        let SgdConfig { lr, momentum, weight_decay } = self.config;
        let mut updated = 0;
        for (name, param) in named_parameters_mut(module) {
            let Some(grad) = grads.get(&name) else {
                continue;
            };

            let mut step = grad.clone();
            if weight_decay != 0.0 {
                step.scaled_add(weight_decay, &param.value);
            }
            if momentum != 0.0 {
                let v = self
                    .velocity
                    .entry(name)
                    .or_insert_with(|| ArrayD::zeros(step.raw_dim()));
                v.mapv_inplace(|x| x * momentum);
                *v += &step;
                step.assign(&*v);
            }
            param.value.scaled_add(-lr, &step);
            updated += 1;
        }

        tracing::debug!(updated, lr, "sgd step");
        Ok(updated)
    }

    pub fn zero_state(&mut self) {
        self.velocity.clear();
    }
}
