use std::io::{self, Read};

use tracing::{debug, error, span, trace, Level};

use crate::error::PipelineError;

/// Reads the whole stream and returns the trimmed text.
///
/// `max_bytes` of zero disables the size limit.
pub fn read_payload<R: Read>(mut reader: R, max_bytes: usize) -> Result<String, PipelineError> {
    let span = span!(Level::TRACE, "read_payload");
    let _enter = span.enter();

    let mut buffer = Vec::new();
    if max_bytes > 0 {
        trace!("Reading at most {max_bytes} bytes from input...");
        (&mut reader)
            .take(max_bytes as u64 + 1)
            .read_to_end(&mut buffer)
            .map_err(|e| {
                error!("Failed to read input: {e}");
                e
            })?;

        if buffer.len() > max_bytes {
            error!("Input exceeds the {max_bytes} byte limit.");
            return Err(PipelineError::InputTooLarge { limit: max_bytes });
        }
    } else {
        trace!("Reading input until end of stream...");
        reader.read_to_end(&mut buffer).map_err(|e| {
            error!("Failed to read input: {e}");
            e
        })?;
    }
    debug!("Read {} bytes from input.", buffer.len());

    // Undecodable stdin is a read failure, not a bad image.
    let text = String::from_utf8(buffer).map_err(|e| {
        error!("Input is not valid UTF-8: {e}");
        PipelineError::Read(io::Error::new(io::ErrorKind::InvalidData, e))
    })?;

    let payload = text.trim();
    if payload.is_empty() {
        error!("No image data provided.");
        return Err(PipelineError::EmptyInput);
    }

    Ok(payload.to_string())
}
