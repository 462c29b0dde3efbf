//! Named parameters, state dicts and layer freezing.
//!
//! Every Rust-side weight lives in a [`Parameter`] and is reached through the
//! [`Module`] visitor, which yields dotted names such as `sia.0.weight`.

use ndarray::ArrayD;
use std::collections::BTreeMap;
use thiserror::Error;

/// Name → tensor map, ordered by name.
pub type StateDict = BTreeMap<String, ArrayD<f32>>;

#[derive(Error, Debug)]
pub enum ParamError {
    #[error("shape mismatch for {name}: model has {expected:?}, state dict has {actual:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("missing keys in state dict: {0:?}")]
    MissingKeys(Vec<String>),
    #[error("unexpected keys in state dict: {0:?}")]
    UnexpectedKeys(Vec<String>),
}

/// A tensor owned by a layer.
///
/// Buffers (batch-norm running statistics) are part of the state dict but are
/// never handed to an optimizer.
#[derive(Debug, Clone)]
pub struct Parameter {
    pub value: ArrayD<f32>,
    pub requires_grad: bool,
    buffer: bool,
}

impl Parameter {
    pub fn new(value: ArrayD<f32>) -> Self {
        Self {
            value,
            requires_grad: true,
            buffer: false,
        }
    }

    pub fn buffer(value: ArrayD<f32>) -> Self {
        Self {
            value,
            requires_grad: false,
            buffer: true,
        }
    }

    pub fn is_buffer(&self) -> bool {
        self.buffer
    }

    /// True when an optimizer may update this tensor.
    pub fn is_trainable(&self) -> bool {
        !self.buffer && self.requires_grad
    }
}

/// Anything that owns named parameters.
pub trait Module {
    fn visit<'a>(&'a self, prefix: &str, f: &mut dyn FnMut(String, &'a Parameter));
    fn visit_mut<'a>(&'a mut self, prefix: &str, f: &mut dyn FnMut(String, &'a mut Parameter));
}

/// Join a dotted prefix and a leaf name.
pub fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

pub fn named_parameters<M: Module + ?Sized>(module: &M) -> Vec<(String, &Parameter)> {
    let mut out = Vec::new();
    module.visit("", &mut |name, p| out.push((name, p)));
    out
}

pub fn named_parameters_mut<M: Module + ?Sized>(module: &mut M) -> Vec<(String, &mut Parameter)> {
    let mut out = Vec::new();
    module.visit_mut("", &mut |name, p| out.push((name, p)));
    out
}

/// Snapshot every parameter and buffer.
pub fn state_dict<M: Module + ?Sized>(module: &M) -> StateDict {
    named_parameters(module)
        .into_iter()
        .map(|(name, p)| (name, p.value.clone()))
        .collect()
}

/// Keys of a state dict that the module did not consume.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub loaded: usize,
    pub unexpected: Vec<String>,
}

/// Copy tensors from `dict` into the module.
///
/// Every module parameter must be present with a matching shape. Extra keys
/// are returned in the report so the caller can decide what to do with them.
pub fn load_state_dict<M: Module + ?Sized>(
    module: &mut M,
    dict: &StateDict,
) -> Result<LoadReport, ParamError> {
    let mut params = named_parameters_mut(module);

    let missing: Vec<String> = params
        .iter()
        .filter(|(name, _)| !dict.contains_key(name))
        .map(|(name, _)| name.clone())
        .collect();
    if !missing.is_empty() {
        return Err(ParamError::MissingKeys(missing));
    }

    for (name, param) in params.iter() {
        let incoming = &dict[name];
        if incoming.shape() != param.value.shape() {
            return Err(ParamError::ShapeMismatch {
                name: name.clone(),
                expected: param.value.shape().to_vec(),
                actual: incoming.shape().to_vec(),
            });
        }
    }

    for (name, param) in params.iter_mut() {
        param.value.assign(&dict[name.as_str()]);
    }

    let known: std::collections::HashSet<&str> = params.iter().map(|(n, _)| n.as_str()).collect();
    let unexpected = dict
        .keys()
        .filter(|k| !known.contains(k.as_str()))
        .cloned()
        .collect();

    Ok(LoadReport {
        loaded: params.len(),
        unexpected,
    })
}

/// Disable gradients for every parameter whose name contains `namespace`.
///
/// Returns the number of tensors frozen.
pub fn freeze_matching<M: Module + ?Sized>(module: &mut M, namespace: &str) -> usize {
    let mut frozen = 0;
    module.visit_mut("", &mut |name, p| {
        if name.contains(namespace) && p.requires_grad {
            p.requires_grad = false;
            frozen += 1;
        }
    });
    frozen
}

/// Names of the tensors an optimizer may update.
pub fn trainable_names<M: Module + ?Sized>(module: &M) -> Vec<String> {
    named_parameters(module)
        .into_iter()
        .filter(|(_, p)| p.is_trainable())
        .map(|(name, _)| name)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;

    struct Toy {
        weight: Parameter,
        running: Parameter,
        detector: Parameter,
    }

    impl Module for Toy {
        fn visit<'a>(&'a self, prefix: &str, f: &mut dyn FnMut(String, &'a Parameter)) {
            f(join(prefix, "layer.weight"), &self.weight);
            f(join(prefix, "layer.running_mean"), &self.running);
            f(join(prefix, "mtcnn.pnet.weight"), &self.detector);
        }

        fn visit_mut<'a>(
            &'a mut self,
            prefix: &str,
            f: &mut dyn FnMut(String, &'a mut Parameter),
        ) {
            f(join(prefix, "layer.weight"), &mut self.weight);
            f(join(prefix, "layer.running_mean"), &mut self.running);
            f(join(prefix, "mtcnn.pnet.weight"), &mut self.detector);
        }
    }

    fn toy() -> Toy {
        Toy {
            weight: Parameter::new(ArrayD::zeros(IxDyn(&[2, 3]))),
            running: Parameter::buffer(ArrayD::zeros(IxDyn(&[3]))),
            detector: Parameter::new(ArrayD::zeros(IxDyn(&[4]))),
        }
    }

    #[test]
    fn test_join() {
        assert_eq!(join("", "weight"), "weight");
        assert_eq!(join("sia.0", "weight"), "sia.0.weight");
    }

    #[test]
    fn test_freeze_matching_namespace() {
        let mut m = toy();
        let frozen = freeze_matching(&mut m, "mtcnn");
        assert_eq!(frozen, 1);
        assert!(!m.detector.is_trainable());
        assert!(m.weight.is_trainable());
        assert_eq!(trainable_names(&m), vec!["layer.weight".to_string()]);
    }

    #[test]
    fn test_buffers_are_not_trainable() {
        let m = toy();
        assert!(m.running.is_buffer());
        assert!(!m.running.is_trainable());
    }

    #[test]
    fn test_load_state_dict_roundtrip_values() {
        let mut src = toy();
        src.weight.value.fill(1.5);
        let dict = state_dict(&src);

        let mut dst = toy();
        let report = load_state_dict(&mut dst, &dict).unwrap();
        assert_eq!(report.loaded, 3);
        assert!(report.unexpected.is_empty());
        assert!(dst.weight.value.iter().all(|&v| v == 1.5));
    }

    #[test]
    fn test_load_state_dict_missing_key() {
        let mut dict = state_dict(&toy());
        dict.remove("layer.weight");
        let err = load_state_dict(&mut toy(), &dict).unwrap_err();
        assert!(matches!(err, ParamError::MissingKeys(keys) if keys == vec!["layer.weight".to_string()]));
    }

    #[test]
    fn test_load_state_dict_shape_mismatch() {
        let mut dict = state_dict(&toy());
        dict.insert("layer.weight".into(), ArrayD::zeros(IxDyn(&[3, 2])));
        let err = load_state_dict(&mut toy(), &dict).unwrap_err();
        assert!(matches!(err, ParamError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_load_state_dict_reports_unexpected() {
        let mut dict = state_dict(&toy());
        dict.insert("resnet.body.0.weight".into(), ArrayD::zeros(IxDyn(&[1])));
        let report = load_state_dict(&mut toy(), &dict).unwrap();
        assert_eq!(report.unexpected, vec!["resnet.body.0.weight".to_string()]);
    }
}
