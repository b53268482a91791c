use rollcall_models::ModelPaths;
use std::path::PathBuf;
use std::str::FromStr;

/// How the liveness gate scores faces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessKind {
    /// MiniFASNet classifier; its model file must be present.
    Model,
    /// Edge/contrast heuristic, no model file.
    Heuristic,
}

impl FromStr for LivenessKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "model" => Ok(LivenessKind::Model),
            "heuristic" => Ok(LivenessKind::Heuristic),
            other => Err(format!("unknown liveness strategy {other:?} (expected model|heuristic)")),
        }
    }
}

/// Host configuration, loaded from environment variables. Pipeline
/// thresholds are loaded separately by `PipelineConfig::load`.
pub struct HostConfig {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    pub liveness: LivenessKind,
}

impl HostConfig {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let data_dir = lookup("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = lookup("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let model_dir = lookup("ROLLCALL_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("models"));
        let db_path = lookup("ROLLCALL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("rollcall.db"));
        let liveness = match lookup("ROLLCALL_LIVENESS_STRATEGY") {
            Some(v) => v.parse()?,
            None => LivenessKind::Model,
        };

        Ok(Self {
            model_dir,
            db_path,
            liveness,
        })
    }

    pub fn model_paths(&self) -> ModelPaths {
        ModelPaths {
            detector: self.model_dir.join("det_10g.onnx"),
            embedder: self.model_dir.join("w600k_r50.onnx"),
            liveness: (self.liveness == LivenessKind::Model)
                .then(|| self.model_dir.join("2.7_80x80_MiniFASNetV2.onnx")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<HostConfig, String> {
        let map: HashMap<_, _> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        HostConfig::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn test_defaults_under_xdg_data_home() {
        let c = config(&[("XDG_DATA_HOME", "/data")]).unwrap();
        assert_eq!(c.db_path, PathBuf::from("/data/rollcall/rollcall.db"));
        assert_eq!(c.model_dir, PathBuf::from("/data/rollcall/models"));
        assert_eq!(c.liveness, LivenessKind::Model);
    }

    #[test]
    fn test_heuristic_skips_liveness_model() {
        let c = config(&[
            ("ROLLCALL_MODEL_DIR", "/m"),
            ("ROLLCALL_LIVENESS_STRATEGY", "Heuristic"),
        ])
        .unwrap();
        let paths = c.model_paths();
        assert_eq!(paths.detector, PathBuf::from("/m/det_10g.onnx"));
        assert!(paths.liveness.is_none());
    }

    #[test]
    fn test_unknown_strategy_rejected() {
        assert!(config(&[("ROLLCALL_LIVENESS_STRATEGY", "vibes")]).is_err());
    }
}
