use base64::{
    alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
    Engine as _,
};
use image::{DynamicImage, GenericImageView};
use tracing::{debug, error, span, trace, Level};

use crate::error::PipelineError;

/// Standard alphabet, accepting payloads with or without trailing padding.
const BASE64_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Returns the part after the first comma, dropping a `data:<mime>;base64,` preamble.
pub fn strip_data_url_prefix(input: &str) -> &str {
    match input.split_once(',') {
        Some((_, payload)) => payload,
        None => input,
    }
}

pub fn decode_base64(payload: &str) -> Result<Vec<u8>, PipelineError> {
    let span = span!(Level::TRACE, "decode_base64");
    let _enter = span.enter();

    // Line-wrapped encoders insert newlines every 76 characters.
    let compact: String = payload
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();

    trace!("Decoding {} base64 characters...", compact.len());
    BASE64_ENGINE.decode(compact.as_bytes()).map_err(|e| {
        error!("Failed to decode base64 payload: {e}");
        PipelineError::Decode(e.to_string())
    })
}

/// Decodes a (possibly data-URL prefixed) base64 string into a bitmap.
pub fn decode_image(input: &str) -> Result<DynamicImage, PipelineError> {
    let span = span!(Level::TRACE, "decode_image");
    let _enter = span.enter();

    let bytes = decode_base64(strip_data_url_prefix(input))?;

    trace!("Decoding {} image bytes...", bytes.len());
    let image = image::load_from_memory(&bytes).map_err(|e| {
        error!("Failed to decode image bytes: {e}");
        PipelineError::Decode(e.to_string())
    })?;

    debug!(
        "Decoded image with dimensions {:?} and color type {:?}.",
        image.dimensions(),
        image.color()
    );
    Ok(image)
}
