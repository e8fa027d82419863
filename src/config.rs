use std::{env, fs};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, span, trace, Level};

pub const CONFIG_ENV_VAR: &str = "FIREDETECT_CONFIG";

pub mod default {
    pub const MODEL_PATH: &str = "yolov8n.onnx";
    pub const TRIGGER_CLASSES: [&str; 2] = ["fire", "smoke"];
    pub const CONF_THRESH: f32 = 0.25;
    pub const NMS_THRESH: f32 = 0.7;
    pub const MAX_DETECTIONS: usize = 300;
    pub const INPUT_SIZE: u32 = 640;
    pub const EXECUTION: &str = "cpu";
    pub const MAX_INPUT_BYTES: usize = 64 * 1024 * 1024;
    pub const CONSOLE_FILTER: &str = "off";
    pub const FILE_FILTER: &str = "trace";
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub detect: DetectorConfig,
    pub input: InputConfig,
    pub log: LogConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub model_path: String,
    /// Overrides the class names embedded in the model when non-empty.
    pub class_names: Vec<String>,
    pub trigger_classes: Vec<String>,
    pub conf_thresh: f32,
    pub nms_thresh: f32,
    pub max_detections: usize,
    pub input_size: u32,
    pub execution: String,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            model_path: default::MODEL_PATH.to_string(),
            class_names: Vec::new(),
            trigger_classes: default::TRIGGER_CLASSES
                .iter()
                .map(|class| class.to_string())
                .collect(),
            conf_thresh: default::CONF_THRESH,
            nms_thresh: default::NMS_THRESH,
            max_detections: default::MAX_DETECTIONS,
            input_size: default::INPUT_SIZE,
            execution: default::EXECUTION.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    /// Zero disables the limit.
    pub max_bytes: usize,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            max_bytes: default::MAX_INPUT_BYTES,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub dir: Option<String>,
    pub console_filter: String,
    pub file_filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: None,
            console_filter: default::CONSOLE_FILTER.to_string(),
            file_filter: default::FILE_FILTER.to_string(),
        }
    }
}

impl Config {
    pub fn from_file<P>(file_path: P) -> Result<Self>
    where
        P: AsRef<std::path::Path> + std::fmt::Debug,
    {
        let span = span!(Level::TRACE, "Config::from_file");
        let _enter = span.enter();

        trace!("Reading content from file {:?}...", file_path);
        let config_content = fs::read_to_string(&file_path)
            .with_context(|| format!("Failed to read config from file {:?}", file_path))?;

        trace!("Deserializing content to Config...");
        let config: Self =
            toml::from_str(&config_content).context("Failed to deserialize content to Config")?;

        debug!("Configurations: {:#?}", config);
        Ok(config)
    }

    /// Loads the file named by `FIREDETECT_CONFIG`, or the defaults when it is unset.
    pub fn from_env() -> Result<Self> {
        match env::var_os(CONFIG_ENV_VAR) {
            Some(path) if !path.is_empty() => Self::from_file(path),
            _ => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use assert_approx_eq::assert_approx_eq;
    use tempfile::NamedTempFile;

    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.detect.model_path, "yolov8n.onnx");
        assert_eq!(config.detect.trigger_classes, vec!["fire", "smoke"]);
        assert!(config.detect.class_names.is_empty());
        assert_approx_eq!(config.detect.conf_thresh, 0.25);
        assert_eq!(config.input.max_bytes, 64 * 1024 * 1024);
        assert!(config.log.dir.is_none());
        assert_eq!(config.log.console_filter, "off");
    }

    #[test]
    fn test_partial_config_keeps_defaults() -> Result<()> {
        let config: Config = toml::from_str(
            r#"
            [detect]
            model_path = "models/fire_smoke.onnx"
            trigger_classes = ["Fire"]

            [input]
            max_bytes = 0
            "#,
        )?;

        assert_eq!(config.detect.model_path, "models/fire_smoke.onnx");
        assert_eq!(config.detect.trigger_classes, vec!["Fire"]);
        assert_eq!(config.detect.input_size, 640);
        assert_eq!(config.detect.execution, "cpu");
        assert_eq!(config.input.max_bytes, 0);
        assert_eq!(config.log.file_filter, "trace");

        Ok(())
    }

    #[test]
    fn test_from_file() -> Result<()> {
        let mut file = NamedTempFile::new()?;
        writeln!(
            file,
            r#"
            [detect]
            conf_thresh = 0.4
            class_names = ["fire", "smoke", "other"]

            [log]
            dir = "/tmp/firedetect"
            "#
        )?;

        let config = Config::from_file(file.path())?;
        assert_approx_eq!(config.detect.conf_thresh, 0.4);
        assert_eq!(config.detect.class_names.len(), 3);
        assert_eq!(config.log.dir.as_deref(), Some("/tmp/firedetect"));

        Ok(())
    }

    #[test]
    fn test_bundled_config_file() -> Result<()> {
        let config = Config::from_file("config/firedetect.toml")?;

        assert_eq!(config.detect.model_path, "assets/model/yolov8n.onnx");
        assert_eq!(config.detect.max_detections, 300);
        assert_eq!(config.log.dir.as_deref(), Some("log"));

        Ok(())
    }

    #[test]
    fn test_from_file_nonexistent_path() {
        let result = Config::from_file("nonexistent_config.toml");
        assert!(result.is_err());
    }

    #[test]
    fn test_from_file_invalid_content() -> Result<()> {
        let mut file = NamedTempFile::new()?;
        writeln!(file, "[detect]\nconf_thresh = \"high\"")?;

        assert!(Config::from_file(file.path()).is_err());
        Ok(())
    }
}
