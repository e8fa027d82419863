use std::{fmt::Debug, path::Path};

use anyhow::{anyhow, bail, Result};
use image::{imageops::FilterType, DynamicImage, GenericImageView};
use ndarray::{s, Array2, Array4, ArrayViewD, Axis, Ix3};
use ort::{
    inputs, CUDAExecutionProvider, GraphOptimizationLevel, OpenVINOExecutionProvider, Session,
    TensorRTExecutionProvider,
};
use tracing::{debug, error, span, trace, warn, Level};

use super::{
    labels::{coco_class_names, parse_names_metadata},
    Detection,
};
use crate::config::DetectorConfig;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BBox {
    pub x_center: f32,
    pub y_center: f32,
    pub width: f32,
    pub height: f32,
}

impl BBox {
    /// Converts to `[x1, y1, x2, y2]` clamped to the image, or `None` if nothing is left.
    pub fn to_corners(&self, image_size: (u32, u32)) -> Option<[f32; 4]> {
        let (image_width, image_height) = (image_size.0 as f32, image_size.1 as f32);

        let x1 = (self.x_center - self.width / 2.0).clamp(0.0, image_width);
        let y1 = (self.y_center - self.height / 2.0).clamp(0.0, image_height);
        let x2 = (self.x_center + self.width / 2.0).clamp(0.0, image_width);
        let y2 = (self.y_center + self.height / 2.0).clamp(0.0, image_height);

        if x1 < x2 && y1 < y2 {
            Some([x1, y1, x2, y2])
        } else {
            None
        }
    }
}

const OUTPUT_NAME: &str = "output0";
const LETTERBOX_FILL: u8 = 114;

/// Aspect-preserving fit of an image into the model input, centered with padding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub resized: (u32, u32),
    pub pad_x: u32,
    pub pad_y: u32,
}

impl Letterbox {
    pub fn new(image_size: (u32, u32), input_size: (u32, u32)) -> Self {
        let (image_width, image_height) = image_size;
        let (input_width, input_height) = input_size;

        let scale = (input_width as f32 / image_width as f32)
            .min(input_height as f32 / image_height as f32);
        let resized = (
            ((image_width as f32 * scale).round() as u32).min(input_width),
            ((image_height as f32 * scale).round() as u32).min(input_height),
        );

        Self {
            scale,
            resized,
            pad_x: (input_width - resized.0) / 2,
            pad_y: (input_height - resized.1) / 2,
        }
    }

    /// Maps a box from model input space back to the original image.
    pub fn unmap(&self, bbox: &BBox) -> BBox {
        BBox {
            x_center: (bbox.x_center - self.pad_x as f32) / self.scale,
            y_center: (bbox.y_center - self.pad_y as f32) / self.scale,
            width: bbox.width / self.scale,
            height: bbox.height / self.scale,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub bbox: BBox,
    pub confidence: f32,
    pub class_id: u32,
}

#[derive(Debug, Clone, Copy)]
pub enum Execution {
    TensorRT,
    CUDA,
    OpenVINO,
    CPU,
    Default,
}

impl TryFrom<&str> for Execution {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> std::result::Result<Self, Self::Error> {
        match value.to_lowercase().as_str() {
            "tensorrt" => Ok(Execution::TensorRT),
            "cuda" => Ok(Execution::CUDA),
            "openvino" => Ok(Execution::OpenVINO),
            "cpu" => Ok(Execution::CPU),
            "default" => Ok(Execution::Default),
            _ => Err(anyhow!("Failed to convert {value} to execution")),
        }
    }
}

pub struct Yolo {
    conf_threshold: f32,
    nms_threshold: f32,
    max_detections: usize,
    input_size: (u32, u32),
    onnx_path: String,
    class_names: Vec<String>,
    model: Option<Session>,
}

impl Debug for Yolo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Yolo")
            .field("conf_threshold", &self.conf_threshold)
            .field("nms_threshold", &self.nms_threshold)
            .field("max_detections", &self.max_detections)
            .field("input_size", &self.input_size)
            .field("onnx_path", &self.onnx_path)
            .field("class_names", &self.class_names.len())
            .field(
                "model",
                &if self.model.is_some() {
                    "Initialized"
                } else {
                    "Unset"
                },
            )
            .finish()
    }
}

impl Yolo {
    pub fn new(
        onnx_path: &str,
        conf_threshold: f32,
        nms_threshold: f32,
        max_detections: usize,
        input_size: (u32, u32),
    ) -> Self {
        let span = span!(Level::TRACE, "Yolo::new");
        let _enter = span.enter();

        debug!("Initializing YOLO with config: conf_threshold={}, nms_threshold={}, max_detections={}, input_size={:?}, onnx_path={}",
              conf_threshold, nms_threshold, max_detections, input_size, onnx_path);

        Self {
            conf_threshold,
            nms_threshold,
            max_detections,
            input_size,
            onnx_path: onnx_path.to_string(),
            class_names: Vec::new(),
            model: None,
        }
    }

    pub fn from_config(config: &DetectorConfig) -> Self {
        Self::new(
            &config.model_path,
            config.conf_thresh,
            config.nms_thresh,
            config.max_detections,
            (config.input_size, config.input_size),
        )
        .with_class_names(config.class_names.clone())
    }

    /// Class names that take precedence over the ones embedded in the model.
    pub fn with_class_names(mut self, class_names: Vec<String>) -> Self {
        self.class_names = class_names;
        self
    }

    #[inline]
    pub fn is_model_built(&self) -> bool {
        self.model.is_some()
    }

    pub fn build(&mut self, execution: Execution) -> Result<()> {
        if self.model.is_some() {
            warn!("Yolo {:#?} has already been built.", self);
            return Ok(());
        }

        let span = span!(Level::TRACE, "Yolo::build");
        let _enter = span.enter();

        if !Path::new(&self.onnx_path).is_file() {
            error!("ONNX model {} does not exist.", self.onnx_path);
            bail!("model file {} not found", self.onnx_path);
        }

        debug!(
            "Building the ONNX model from onnx: {} and execution: {:?}",
            self.onnx_path, execution
        );
        let providers = match execution {
            Execution::TensorRT => vec![TensorRTExecutionProvider::default().build()],
            Execution::CUDA => vec![CUDAExecutionProvider::default().build()],
            Execution::OpenVINO => vec![OpenVINOExecutionProvider::default().build()],
            Execution::CPU => vec![],
            Execution::Default => vec![
                CUDAExecutionProvider::default().build(),
                OpenVINOExecutionProvider::default().build(),
                TensorRTExecutionProvider::default().build(),
            ],
        };

        let session = Session::builder()
            .map_err(|e| {
                error!("Failed to build session builder: {e}");
                e
            })?
            .with_execution_providers(providers)
            .map_err(|e| {
                error!("Failed to registers execution providers: {e}");
                e
            })?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| {
                error!("Failed to set optimization level: {e}");
                e
            })?
            .commit_from_file(&self.onnx_path)
            .map_err(|e| {
                error!("Failed to commit from file: {e}");
                e
            })?;

        if self.class_names.is_empty() {
            self.class_names = Self::read_class_names(&session).unwrap_or_else(|| {
                debug!("No class names in model metadata, falling back to COCO.");
                coco_class_names()
            });
        }
        debug!("Model predicts {} classes.", self.class_names.len());

        self.model = Some(session);

        trace!("ONNX model successfully built.");
        Ok(())
    }

    fn read_class_names(session: &Session) -> Option<Vec<String>> {
        let names = session
            .metadata()
            .and_then(|metadata| metadata.custom("names"))
            .map_err(|e| {
                warn!("Failed to read model metadata: {e}");
                e
            })
            .ok()??;

        trace!("Model metadata names: {names}");
        parse_names_metadata(&names)
    }

    pub fn class_name(&self, class_id: u32) -> String {
        self.class_names
            .get(class_id as usize)
            .cloned()
            .unwrap_or_else(|| format!("class_{class_id}"))
    }

    pub fn infer(&self, image: &DynamicImage) -> Result<Vec<Detection>> {
        let span = span!(Level::TRACE, "Yolo::infer");
        let _enter = span.enter();

        trace!("Starting inference.");

        let original_dims = image.dimensions();
        let (input_tensor, letterbox) = self.preprocess_image(image).map_err(|e| {
            error!("Failed to preprocess image: {e}");
            e
        })?;
        trace!(
            "Image preprocessed with original dimensions = {:?}, letterbox = {:?}",
            original_dims,
            letterbox
        );

        let model_output = self.run_inference(input_tensor).map_err(|e| {
            error!("Failed to run inference: {e}");
            e
        })?;
        trace!("Inference completed, raw model output received.");

        let predictions = self.process_yolov8_output(model_output, &letterbox);
        trace!(
            "Processed YOLOv8 output, number of predictions: {}",
            predictions.len()
        );

        Ok(self.label_predictions(predictions, original_dims))
    }

    fn label_predictions(
        &self,
        predictions: Vec<Prediction>,
        image_size: (u32, u32),
    ) -> Vec<Detection> {
        predictions
            .into_iter()
            .filter_map(|prediction| {
                let Some(bbox) = prediction.bbox.to_corners(image_size) else {
                    trace!("Dropping empty box {:?}", prediction.bbox);
                    return None;
                };

                Some(Detection {
                    class_label: self.class_name(prediction.class_id),
                    confidence: prediction.confidence,
                    bbox,
                })
            })
            .collect()
    }

    fn preprocess_image(&self, image: &DynamicImage) -> Result<(Array4<f32>, Letterbox)> {
        let span = span!(Level::TRACE, "Yolo::preprocess_image");
        let _enter = span.enter();

        let (width, height) = self.input_size;
        let letterbox = Letterbox::new(image.dimensions(), self.input_size);
        if letterbox.resized.0 == 0 || letterbox.resized.1 == 0 {
            bail!(
                "image {:?} cannot be fitted into {:?}",
                image.dimensions(),
                self.input_size
            );
        }

        trace!(
            "Resizing image to {:?} and padding to {}x{}",
            letterbox.resized,
            width,
            height
        );
        let resized_img = image
            .resize_exact(letterbox.resized.0, letterbox.resized.1, FilterType::Triangle)
            .to_rgb8();

        let mut input = Array4::<f32>::from_elem(
            (1, 3, height as usize, width as usize),
            LETTERBOX_FILL as f32 / 255.0,
        );
        let (pad_x, pad_y) = (letterbox.pad_x as usize, letterbox.pad_y as usize);
        for (x, y, pixel) in resized_img.enumerate_pixels() {
            let (x, y) = (x as usize + pad_x, y as usize + pad_y);
            input[[0, 0, y, x]] = pixel[0] as f32 / 255.0;
            input[[0, 1, y, x]] = pixel[1] as f32 / 255.0;
            input[[0, 2, y, x]] = pixel[2] as f32 / 255.0;
        }

        Ok((input, letterbox))
    }

    fn run_inference(&self, input_tensor: Array4<f32>) -> Result<Array2<f32>> {
        let span = span!(Level::TRACE, "Yolo::run_inference");
        let _enter = span.enter();

        let Some(model) = &self.model else {
            error!("The ONNX model has not been initialized.");
            return Err(anyhow!("The ONNX model has not been initialized."));
        };

        let outputs = model
            .run(inputs!["images" => input_tensor.view()]?)
            .map_err(|e| {
                error!("Failed to run session: {e}");
                e
            })?;

        let output = outputs.get(OUTPUT_NAME).ok_or_else(|| {
            error!("Model has no output named {OUTPUT_NAME}.");
            anyhow!("model has no output named {OUTPUT_NAME}")
        })?;
        let tensor = output.try_extract_tensor::<f32>().map_err(|e| {
            error!("Failed to extract tensor: {e}");
            e
        })?;

        let rows = Self::output_rows(tensor)?;
        trace!("Inference completed successfully.");
        Ok(rows)
    }

    /// `[1, 4 + classes, anchors]` -> `[anchors, 4 + classes]`
    fn output_rows(tensor: ArrayViewD<'_, f32>) -> Result<Array2<f32>> {
        let tensor = tensor.into_dimensionality::<Ix3>().map_err(|e| {
            error!("Unexpected output shape: {e}");
            e
        })?;

        let shape = tensor.shape();
        if shape[0] == 0 || shape[1] <= 4 {
            error!("Unexpected output shape: {:?}", shape);
            bail!("unexpected output shape {:?}, expected [1, 4 + classes, anchors]", shape);
        }

        Ok(tensor.t().slice(s![.., .., 0]).into_owned())
    }

    fn process_yolov8_output(&self, output: Array2<f32>, letterbox: &Letterbox) -> Vec<Prediction> {
        let span = span!(Level::TRACE, "Yolo::process_yolov8_output");
        let _enter = span.enter();

        let mut predictions = Vec::new();

        for row in output.axis_iter(Axis(0)) {
            if row.len() <= 4 {
                continue;
            }

            // Highest class score after the four box coordinates
            let Some((class_id, confidence)) = row
                .iter()
                .skip(4)
                .copied()
                .enumerate()
                .reduce(|accum, class_confidence_pair| {
                    if class_confidence_pair.1 > accum.1 {
                        class_confidence_pair
                    } else {
                        accum
                    }
                })
            else {
                continue;
            };

            if !confidence.is_finite() || confidence < self.conf_threshold {
                continue;
            }

            predictions.push(Prediction {
                bbox: letterbox.unmap(&BBox {
                    x_center: row[0],
                    y_center: row[1],
                    width: row[2],
                    height: row[3],
                }),
                confidence,
                class_id: class_id as u32,
            });
        }

        trace!("YOLOv8 output processed.");

        let final_predictions = self.non_max_suppression(predictions);
        trace!("Non-Max Suppression completed.");

        final_predictions
    }

    /// Per-class suppression, keeping at most `max_detections` boxes by descending confidence.
    fn non_max_suppression(&self, mut predictions: Vec<Prediction>) -> Vec<Prediction> {
        let span = span!(Level::TRACE, "Yolo::non_max_suppression");
        let _enter = span.enter();

        let mut final_predictions = Vec::new();

        predictions.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

        while !predictions.is_empty() && final_predictions.len() < self.max_detections {
            let best_prediction = predictions.remove(0);

            predictions.retain(|prediction| {
                prediction.class_id != best_prediction.class_id
                    || Self::compute_iou(&best_prediction.bbox, &prediction.bbox)
                        < self.nms_threshold
            });

            final_predictions.push(best_prediction);
        }

        debug!("Predictions: {:#?}.", final_predictions);
        final_predictions
    }

    fn compute_iou(bbox1: &BBox, bbox2: &BBox) -> f32 {
        let x1_min = bbox1.x_center - bbox1.width / 2.0;
        let y1_min = bbox1.y_center - bbox1.height / 2.0;
        let x1_max = bbox1.x_center + bbox1.width / 2.0;
        let y1_max = bbox1.y_center + bbox1.height / 2.0;

        let x2_min = bbox2.x_center - bbox2.width / 2.0;
        let y2_min = bbox2.y_center - bbox2.height / 2.0;
        let x2_max = bbox2.x_center + bbox2.width / 2.0;
        let y2_max = bbox2.y_center + bbox2.height / 2.0;

        let inter_x_min = x1_min.max(x2_min);
        let inter_y_min = y1_min.max(y2_min);
        let inter_x_max = x1_max.min(x2_max);
        let inter_y_max = y1_max.min(y2_max);

        let inter_area =
            (inter_x_max - inter_x_min).max(0.0) * (inter_y_max - inter_y_min).max(0.0);
        let bbox1_area = (x1_max - x1_min) * (y1_max - y1_min);
        let bbox2_area = (x2_max - x2_min) * (y2_max - y2_min);

        let union_area = bbox1_area + bbox2_area - inter_area;
        if union_area <= 0.0 {
            return 0.0;
        }
        inter_area / union_area
    }
}
