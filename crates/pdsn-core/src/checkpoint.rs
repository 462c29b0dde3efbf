//! Checkpoint files: a safetensors state dict with a SHA-256 payload digest.
//!
//! Every tensor is stored as little-endian `F32`. The header metadata carries
//! `format_version`, `saved_at` (RFC 3339) and `digest`, the hex SHA-256 of
//! names, shapes and values in key order. The digest is checked on load.
//!
//! Tensors are always materialized on the host.

use crate::params::StateDict;
use chrono::{DateTime, Utc};
use ndarray::{ArrayD, IxDyn};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensorError, SafeTensors};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

pub const FORMAT_VERSION: u32 = 1;

const KEY_FORMAT_VERSION: &str = "format_version";
const KEY_SAVED_AT: &str = "saved_at";
const KEY_DIGEST: &str = "digest";

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("checkpoint io: {0}")]
    Io(#[from] std::io::Error),
    #[error("checkpoint safetensors: {0}")]
    SafeTensors(#[from] SafeTensorError),
    #[error("checkpoint metadata is missing '{0}'")]
    MissingMetadata(&'static str),
    #[error("checkpoint metadata '{key}' is invalid: {value}")]
    InvalidMetadata { key: &'static str, value: String },
    #[error("unsupported checkpoint format version {0}")]
    UnsupportedVersion(u32),
    #[error("checkpoint digest mismatch: file says {expected}, payload hashes to {actual}")]
    DigestMismatch { expected: String, actual: String },
    #[error("tensor {name} has dtype {dtype}, expected F32")]
    Dtype { name: String, dtype: String },
    #[error("tensor {name}: {source}")]
    Tensor {
        name: String,
        source: ndarray::ShapeError,
    },
}

/// A loaded checkpoint.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub saved_at: DateTime<Utc>,
    pub digest: String,
    pub state: StateDict,
}

/// SHA-256 over names, shapes and little-endian values in key order.
pub fn payload_digest(state: &StateDict) -> String {
    let mut hasher = Sha256::new();
    for (name, tensor) in state {
        hasher.update((name.len() as u64).to_le_bytes());
        hasher.update(name.as_bytes());
        hasher.update((tensor.ndim() as u64).to_le_bytes());
        for &d in tensor.shape() {
            hasher.update((d as u64).to_le_bytes());
        }
        for v in tensor.iter() {
            hasher.update(v.to_le_bytes());
        }
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Write `state` to `path`.
pub fn save(path: &Path, state: &StateDict) -> Result<String, CheckpointError> {
    let digest = payload_digest(state);
    let metadata = HashMap::from([
        (KEY_FORMAT_VERSION.to_string(), FORMAT_VERSION.to_string()),
        (KEY_SAVED_AT.to_string(), Utc::now().to_rfc3339()),
        (KEY_DIGEST.to_string(), digest.clone()),
    ]);
    write_tensors(path, state, metadata)?;

    tracing::info!(path = %path.display(), tensors = state.len(), %digest, "checkpoint saved");
    Ok(digest)
}

fn write_tensors(path: &Path, state: &StateDict, metadata: HashMap<String, String>) -> Result<(), CheckpointError> {
    // Standard-layout copies so the byte views below are contiguous.
    let values: Vec<(&String, &[usize], Vec<f32>)> = state
        .iter()
        .map(|(name, t)| (name, t.shape(), t.iter().copied().collect()))
        .collect();

    let mut views = Vec::with_capacity(values.len());
    for (name, shape, data) in &values {
        let view = TensorView::new(Dtype::F32, shape.to_vec(), bytemuck::cast_slice::<f32, u8>(data))?;
        views.push(((*name).clone(), view));
    }

    safetensors::serialize_to_file(views, &Some(metadata), path)?;
    Ok(())
}

/// Read and verify a checkpoint.
pub fn load(path: &Path) -> Result<Checkpoint, CheckpointError> {
    let bytes = std::fs::read(path)?;
    let checkpoint = from_bytes(&bytes)?;
    tracing::info!(
        path = %path.display(),
        tensors = checkpoint.state.len(),
        saved_at = %checkpoint.saved_at,
        "checkpoint loaded"
    );
    Ok(checkpoint)
}

fn from_bytes(bytes: &[u8]) -> Result<Checkpoint, CheckpointError> {
    let (_, header) = SafeTensors::read_metadata(bytes)?;
    let metadata = header.metadata().clone().unwrap_or_default();
    let field = |key: &'static str| metadata.get(key).ok_or(CheckpointError::MissingMetadata(key));

    let version = field(KEY_FORMAT_VERSION)?;
    let version: u32 = version.parse().map_err(|_| CheckpointError::InvalidMetadata {
        key: KEY_FORMAT_VERSION,
        value: version.clone(),
    })?;
    if version != FORMAT_VERSION {
        return Err(CheckpointError::UnsupportedVersion(version));
    }

    let saved_at = field(KEY_SAVED_AT)?;
    let saved_at = DateTime::parse_from_rfc3339(saved_at)
        .map_err(|_| CheckpointError::InvalidMetadata {
            key: KEY_SAVED_AT,
            value: saved_at.clone(),
        })?
        .with_timezone(&Utc);
    let expected = field(KEY_DIGEST)?.clone();

    let tensors = SafeTensors::deserialize(bytes)?;
    let mut state = StateDict::new();
    for (name, view) in tensors.tensors() {
        if view.dtype() != Dtype::F32 {
            return Err(CheckpointError::Dtype {
                name,
                dtype: format!("{:?}", view.dtype()),
            });
        }
        let data: Vec<f32> = bytemuck::pod_collect_to_vec(view.data());
        let tensor = ArrayD::from_shape_vec(IxDyn(view.shape()), data)
            .map_err(|source| CheckpointError::Tensor { name: name.clone(), source })?;
        state.insert(name, tensor);
    }

    let actual = payload_digest(&state);
    if actual != expected {
        return Err(CheckpointError::DigestMismatch { expected, actual });
    }

    Ok(Checkpoint {
        saved_at,
        digest: actual,
        state,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn sample_state() -> StateDict {
        let mut state = StateDict::new();
        state.insert("fc.1.bias".into(), array![0.0f32, 1.0].into_dyn());
        state.insert("sia.1.weight".into(), array![[0.25f32, 0.5], [1.0, -2.0]].into_dyn());
        state
    }

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("pdsn-{}-{name}.safetensors", std::process::id()))
    }

    fn metadata(version: &str, digest: &str) -> HashMap<String, String> {
        HashMap::from([
            (KEY_FORMAT_VERSION.to_string(), version.to_string()),
            (KEY_SAVED_AT.to_string(), "2026-10-19T12:00:00+00:00".to_string()),
            (KEY_DIGEST.to_string(), digest.to_string()),
        ])
    }

    #[test]
    fn test_save_then_load() {
        let path = temp_path("roundtrip");
        let state = sample_state();
        let digest = save(&path, &state).unwrap();

        let loaded = load(&path).unwrap();
        assert_eq!(loaded.state, state);
        assert_eq!(loaded.digest, digest);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_file_is_raw_f32() {
        let path = temp_path("size");
        let mut state = StateDict::new();
        state.insert("fc.1.weight".into(), ArrayD::zeros(IxDyn(&[64, 32])));
        save(&path, &state).unwrap();

        let len = std::fs::metadata(&path).unwrap().len();
        let payload = 64 * 32 * 4;
        assert!(len >= payload && len < payload + 1024, "file is {len} bytes");
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_digest_detects_tampering() {
        let path = temp_path("tamper");
        save(&path, &sample_state()).unwrap();

        // tensor data sits at the end of the file
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        std::fs::write(&path, &bytes).unwrap();

        assert!(matches!(load(&path), Err(CheckpointError::DigestMismatch { .. })));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_digest_depends_on_shape() {
        let mut a = StateDict::new();
        a.insert("w".into(), ArrayD::zeros(IxDyn(&[2, 3])));
        let mut b = StateDict::new();
        b.insert("w".into(), ArrayD::zeros(IxDyn(&[3, 2])));
        assert_ne!(payload_digest(&a), payload_digest(&b));
    }

    #[test]
    fn test_rejects_unknown_version() {
        let path = temp_path("version");
        let state = sample_state();
        write_tensors(&path, &state, metadata("99", &payload_digest(&state))).unwrap();
        assert!(matches!(load(&path), Err(CheckpointError::UnsupportedVersion(99))));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_rejects_missing_digest() {
        let path = temp_path("nodigest");
        let mut meta = metadata("1", "");
        meta.remove(KEY_DIGEST);
        write_tensors(&path, &sample_state(), meta).unwrap();
        assert!(matches!(load(&path), Err(CheckpointError::MissingMetadata(KEY_DIGEST))));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_rejects_non_f32_tensor() {
        let path = temp_path("dtype");
        let data = [0u8; 16];
        let view = TensorView::new(Dtype::F64, vec![2], &data).unwrap();
        safetensors::serialize_to_file(vec![("w".to_string(), view)], &Some(metadata("1", "")), &path).unwrap();
        assert!(matches!(load(&path), Err(CheckpointError::Dtype { name, .. }) if name == "w"));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_rejects_non_safetensors_file() {
        let path = temp_path("json");
        std::fs::write(&path, b"{\"tensors\": {}}").unwrap();
        assert!(matches!(load(&path), Err(CheckpointError::SafeTensors(_))));
        std::fs::remove_file(&path).ok();
    }
}
