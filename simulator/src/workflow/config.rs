use crate::generator::profile::GeneratorConfig;
use anyhow::Context;
use basinmet::PipelineConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// A capture description plus the pipeline settings it runs under.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub capture: GeneratorConfig,
    pub pipeline: PipelineConfig,
}

impl WorkflowConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path_ref = path.as_ref();
        let contents = fs::read_to_string(path_ref)
            .with_context(|| format!("reading workflow config {}", path_ref.display()))?;
        let config: WorkflowConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("parsing workflow config {}", path_ref.display()))?;
        config
            .pipeline
            .validate()
            .with_context(|| format!("validating workflow config {}", path_ref.display()))?;
        Ok(config)
    }

    pub fn from_args(aircraft: usize, duration_s: f64, seed: u64) -> Self {
        Self {
            capture: GeneratorConfig {
                aircraft,
                duration_s,
                seed,
                ..Default::default()
            },
            pipeline: PipelineConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn config_from_args_keeps_default_pipeline() {
        let cfg = WorkflowConfig::from_args(4, 1_800.0, 9);
        assert_eq!(cfg.capture.aircraft, 4);
        assert_eq!(cfg.capture.seed, 9);
        assert_eq!(cfg.pipeline, PipelineConfig::default());
    }

    #[test]
    fn config_load_reads_yaml() {
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(
            b"capture:\n  aircraft: 3\n  wind_speed_kt: 35.0\npipeline:\n  window:\n    window_s: 120.0\n  scheduler:\n    aircraft_shards: 2\n",
        )
        .unwrap();
        let path = temp.into_temp_path();
        let cfg = WorkflowConfig::load(&path).unwrap();
        assert_eq!(cfg.capture.aircraft, 3);
        assert_eq!(cfg.capture.wind_speed_kt, 35.0);
        assert_eq!(cfg.capture.interval_s, 5.0);
        assert_eq!(cfg.pipeline.window.window_s, 120.0);
        assert_eq!(cfg.pipeline.scheduler.aircraft_shards, 2);
        assert_eq!(cfg.pipeline.basin, PipelineConfig::default().basin);
    }

    #[test]
    fn config_load_rejects_invalid_pipeline() {
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(b"pipeline:\n  window:\n    window_s: 0.0\n").unwrap();
        let path = temp.into_temp_path();
        let err = WorkflowConfig::load(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("window_s"));
    }
}
