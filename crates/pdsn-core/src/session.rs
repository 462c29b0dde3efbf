//! ONNX Runtime session construction with explicit device placement.

use ort::execution_providers::{CPUExecutionProvider, CUDAExecutionProvider};
use ort::session::Session;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Compute device for the pretrained ONNX graphs.
///
/// Passed to every loader; nothing reads a device from ambient state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Device {
    #[default]
    Cpu,
    Cuda { device_id: i32 },
}

impl FromStr for Device {
    type Err = String;

    /// Accepts `cpu`, `gpu`, `cuda` and `cuda:<id>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        match lower.as_str() {
            "cpu" => Ok(Device::Cpu),
            "gpu" | "cuda" => Ok(Device::Cuda { device_id: 0 }),
            other => match other.strip_prefix("cuda:") {
                Some(id) => id
                    .parse()
                    .map(|device_id| Device::Cuda { device_id })
                    .map_err(|_| format!("invalid CUDA device id: {id}")),
                None => Err(format!("unknown device '{s}', expected cpu, gpu or cuda:<id>")),
            },
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda { device_id } => write!(f, "cuda:{device_id}"),
        }
    }
}

/// Build a session for `model_path` on `device`.
///
/// CUDA sessions register the CPU provider as a fallback, so a build without
/// GPU support still loads the model.
pub fn build_session(model_path: &Path, device: Device, intra_threads: usize) -> ort::Result<Session> {
    let builder = Session::builder()?.with_intra_threads(intra_threads)?;

    let builder = match device {
        Device::Cpu => builder.with_execution_providers([CPUExecutionProvider::default().build()])?,
        Device::Cuda { device_id } => {
            tracing::info!(device_id, "requesting CUDA execution provider");
            builder.with_execution_providers([
                CUDAExecutionProvider::default().with_device_id(device_id).build(),
                CPUExecutionProvider::default().build(),
            ])?
        }
    };

    builder.commit_from_file(model_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_devices() {
        assert_eq!("cpu".parse::<Device>().unwrap(), Device::Cpu);
        assert_eq!("GPU".parse::<Device>().unwrap(), Device::Cuda { device_id: 0 });
        assert_eq!("cuda:2".parse::<Device>().unwrap(), Device::Cuda { device_id: 2 });
        assert!("cuda:x".parse::<Device>().is_err());
        assert!("tpu".parse::<Device>().is_err());
    }

    #[test]
    fn test_display_roundtrip() {
        for d in [Device::Cpu, Device::Cuda { device_id: 1 }] {
            assert_eq!(d.to_string().parse::<Device>().unwrap(), d);
        }
    }
}
