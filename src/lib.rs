use std::io::Read;

use tracing::{error, info, span, trace, Level};

use config::Config;
use detect::{Detector, ModelLoader};
use error::PipelineError;
use io::{decode_image, read_payload};
use report::{InferenceResult, Report};

pub mod config;
pub mod detect;
pub mod error;
pub mod io;
pub mod report;

/// Loads configuration from `FIREDETECT_CONFIG`, falling back to the defaults.
pub fn load_config() -> Result<Config, PipelineError> {
    Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {e:#}");
        PipelineError::Config(e)
    })
}

/// Runs the whole pipeline over `input` and returns the report to emit.
pub fn run_pipeline<R, L>(input: R, config: &Config, loader: &L) -> Report
where
    R: Read,
    L: ModelLoader,
{
    Report::from(detect_from_reader(input, config, loader))
}

/// Reads a base64 image from `input`, decodes it and runs the detector over it.
pub fn detect_from_reader<R, L>(
    input: R,
    config: &Config,
    loader: &L,
) -> Result<InferenceResult, PipelineError>
where
    R: Read,
    L: ModelLoader,
{
    let span = span!(Level::TRACE, "detect_from_reader");
    let _enter = span.enter();

    trace!("Reading image payload...");
    let payload = read_payload(input, config.input.max_bytes)?;

    trace!("Decoding image...");
    let image = decode_image(&payload)?;

    trace!("Loading detection model...");
    let model = loader.load(&config.detect).map_err(|e| {
        error!("Failed to load model: {e:#}");
        PipelineError::ModelLoad(e)
    })?;

    let detector = Detector::new(model, &config.detect.trigger_classes);
    let result = detector.detect(&image)?;

    info!(
        "Found {} objects, fire_detected={}.",
        result.num_detections, result.fire_detected
    );
    Ok(result)
}
