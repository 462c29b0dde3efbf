use std::path::PathBuf;

/// Runtime configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Detector graph; defaults to `det_10g.onnx` in the model directory.
    pub detector_model: PathBuf,
    /// Backbone graph; when unset the name follows the net mode and depth.
    pub backbone_model: Option<PathBuf>,
    /// ONNX Runtime intra-op threads per session.
    pub intra_threads: usize,
    /// Faces with a shorter side below this many pixels are discarded.
    pub min_face_size: f32,
    /// Detector confidence cut-off.
    pub detection_threshold: f32,
}

impl Config {
    /// Load configuration from `PDSN_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let model_dir = std::env::var("PDSN_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_model_dir());

        let detector_model = std::env::var("PDSN_DETECTOR_MODEL")
            .map(PathBuf::from)
            .unwrap_or_else(|_| model_dir.join("det_10g.onnx"));

        Self {
            backbone_model: std::env::var("PDSN_BACKBONE_MODEL").ok().map(PathBuf::from),
            detector_model,
            model_dir,
            intra_threads: env_usize("PDSN_INTRA_THREADS", 4),
            min_face_size: env_f32("PDSN_MIN_FACE_SIZE", 80.0),
            detection_threshold: env_f32("PDSN_DETECTION_THRESHOLD", 0.5),
        }
    }

    /// Backbone graph path, falling back to `file_name` in the model directory.
    pub fn backbone_model_path(&self, file_name: &str) -> PathBuf {
        self.backbone_model
            .clone()
            .unwrap_or_else(|| self.model_dir.join(file_name))
    }
}

/// `$XDG_DATA_HOME/pdsn/models`, or `~/.local/share/pdsn/models`.
fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("pdsn/models")
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backbone_path_fallback() {
        let config = Config {
            model_dir: PathBuf::from("/models"),
            detector_model: PathBuf::from("/models/det_10g.onnx"),
            backbone_model: None,
            intra_threads: 1,
            min_face_size: 80.0,
            detection_threshold: 0.5,
        };
        assert_eq!(
            config.backbone_model_path("model_ir_se50.onnx"),
            PathBuf::from("/models/model_ir_se50.onnx")
        );

        let pinned = Config {
            backbone_model: Some(PathBuf::from("/elsewhere/arc.onnx")),
            ..config
        };
        assert_eq!(pinned.backbone_model_path("ignored.onnx"), PathBuf::from("/elsewhere/arc.onnx"));
    }

    #[test]
    fn test_env_parse_fallback() {
        assert_eq!(env_usize("PDSN_TEST_UNSET_VARIABLE", 7), 7);
        assert_eq!(env_f32("PDSN_TEST_UNSET_VARIABLE", 0.25), 0.25);
    }
}
