pub mod labels;
mod yolo;

use std::panic::{self, AssertUnwindSafe};

use anyhow::{anyhow, Context, Result};
use image::DynamicImage;
use serde::Serialize;
use tracing::{debug, error, info, span, trace, Level};

use crate::{
    config::DetectorConfig,
    error::{panic_message, PipelineError},
    report::InferenceResult,
};
pub use yolo::{BBox, Execution, Yolo};

/// One localized object: label, score and `[x1, y1, x2, y2]` pixel rectangle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    #[serde(rename = "class")]
    pub class_label: String,
    pub confidence: f32,
    pub bbox: [f32; 4],
}

/// A loaded detection model.
pub trait DetectionModel {
    fn infer(&self, image: &DynamicImage) -> Result<Vec<Detection>>;
}

/// Produces a ready-to-run model from configuration.
pub trait ModelLoader {
    type Model: DetectionModel;

    fn load(&self, config: &DetectorConfig) -> Result<Self::Model>;
}

impl DetectionModel for Yolo {
    fn infer(&self, image: &DynamicImage) -> Result<Vec<Detection>> {
        Yolo::infer(self, image)
    }
}

/// Loads a YOLOv8 ONNX export through ONNX Runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct OnnxModelLoader;

impl ModelLoader for OnnxModelLoader {
    type Model = Yolo;

    fn load(&self, config: &DetectorConfig) -> Result<Yolo> {
        let span = span!(Level::TRACE, "OnnxModelLoader::load");
        let _enter = span.enter();

        let execution = Execution::try_from(config.execution.as_str())?;

        info!("Building YOLO model from {}...", config.model_path);
        let mut yolo = Yolo::from_config(config);
        yolo.build(execution)
            .with_context(|| format!("Failed to build model {}", config.model_path))?;

        Ok(yolo)
    }
}

pub struct Detector<M> {
    model: M,
    trigger_classes: Vec<String>,
}

impl<M: DetectionModel> Detector<M> {
    pub fn new(model: M, trigger_classes: &[String]) -> Self {
        Self {
            model,
            trigger_classes: trigger_classes
                .iter()
                .map(|class| class.to_lowercase())
                .collect(),
        }
    }

    pub fn detect(&self, image: &DynamicImage) -> Result<InferenceResult, PipelineError> {
        let span = span!(Level::TRACE, "Detector::detect");
        let _enter = span.enter();

        trace!("Running model inference...");
        // A panicking backend is an inference failure, not a crash.
        let detections = panic::catch_unwind(AssertUnwindSafe(|| self.model.infer(image)))
            .unwrap_or_else(|payload| {
                Err(anyhow!("model panicked: {}", panic_message(&*payload)))
            })
            .map_err(|e| {
                error!("Inference failed: {e:#}");
                PipelineError::Inference(e)
            })?;

        let fire_detected = self.is_triggered(&detections);
        debug!(
            "Detected {} objects, fire_detected={}.",
            detections.len(),
            fire_detected
        );

        Ok(InferenceResult::new(fire_detected, detections))
    }

    /// True when any label matches a trigger class, ignoring case.
    pub fn is_triggered(&self, detections: &[Detection]) -> bool {
        detections.iter().any(|detection| {
            let label = detection.class_label.to_lowercase();
            self.trigger_classes.iter().any(|class| *class == label)
        })
    }
}
