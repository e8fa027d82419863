use std::{
    io::{self, Write},
    panic::{self, AssertUnwindSafe},
};

use serde::Serialize;
use tracing::{debug, error, span, trace, Level};

use crate::{
    detect::Detection,
    error::{panic_message, PipelineError},
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InferenceResult {
    pub success: bool,
    pub fire_detected: bool,
    pub detections: Vec<Detection>,
    pub num_detections: usize,
}

impl InferenceResult {
    pub fn new(fire_detected: bool, detections: Vec<Detection>) -> Self {
        Self {
            success: true,
            fire_detected,
            num_detections: detections.len(),
            detections,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorResult {
    pub success: bool,
    pub error: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<&'static str>,
}

impl From<&PipelineError> for ErrorResult {
    fn from(error: &PipelineError) -> Self {
        Self {
            success: false,
            error: error.to_string(),
            kind: error.is_unexpected().then(|| error.kind().as_str()),
        }
    }
}

#[derive(Debug)]
pub enum Report {
    Success(InferenceResult),
    Failure(PipelineError),
}

impl From<Result<InferenceResult, PipelineError>> for Report {
    fn from(result: Result<InferenceResult, PipelineError>) -> Self {
        match result {
            Ok(result) => Report::Success(result),
            Err(error) => Report::Failure(error),
        }
    }
}

impl Report {
    #[inline]
    pub fn exit_code(&self) -> u8 {
        match self {
            Report::Failure(error) if error.is_fatal() => 1,
            _ => 0,
        }
    }

    /// Writes the report as one JSON line and returns the process exit code.
    ///
    /// Fatal failures go to `stderr`. Successes and inference failures go to `stdout`.
    pub fn emit<O, E>(&self, stdout: &mut O, stderr: &mut E) -> io::Result<u8>
    where
        O: Write,
        E: Write,
    {
        let span = span!(Level::TRACE, "Report::emit");
        let _enter = span.enter();

        match self {
            Report::Success(result) => {
                trace!("Writing inference result to stdout...");
                write_json_line(stdout, result)?;
            }
            Report::Failure(error) if error.is_fatal() => {
                trace!("Writing fatal {} to stderr...", error.kind());
                write_json_line(stderr, &ErrorResult::from(error))?;
            }
            Report::Failure(error) => {
                trace!("Writing non-fatal {} to stdout...", error.kind());
                write_json_line(stdout, &ErrorResult::from(error))?;
            }
        }

        let exit_code = self.exit_code();
        debug!("Report emitted with exit code {exit_code}.");
        Ok(exit_code)
    }
}

/// Runs `f`, turning a panic that escapes it into an unexpected failure report.
pub fn catch_unexpected<F>(f: F) -> Report
where
    F: FnOnce() -> Report,
{
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        let message = panic_message(&*payload);
        error!("Unexpected panic: {message}");
        Report::Failure(PipelineError::Panic(message))
    })
}

fn write_json_line<W: Write, T: Serialize>(writer: &mut W, value: &T) -> io::Result<()> {
    serde_json::to_writer(&mut *writer, value)?;
    writeln!(writer)?;
    writer.flush()
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;
    use serde_json::{json, Value};

    use super::*;

    fn emit(report: &Report) -> (u8, String, String) {
        let (mut stdout, mut stderr) = (Vec::new(), Vec::new());
        let exit_code = report.emit(&mut stdout, &mut stderr).unwrap();
        (
            exit_code,
            String::from_utf8(stdout).unwrap(),
            String::from_utf8(stderr).unwrap(),
        )
    }

    #[test]
    fn test_success_to_stdout() {
        let report = Report::Success(InferenceResult::new(
            true,
            vec![Detection {
                class_label: "fire".to_string(),
                confidence: 0.75,
                bbox: [1.0, 2.5, 30.0, 40.0],
            }],
        ));

        let (exit_code, stdout, stderr) = emit(&report);
        assert_eq!(exit_code, 0);
        assert!(stderr.is_empty());
        assert!(stdout.ends_with('\n'));

        let value: Value = serde_json::from_str(&stdout).unwrap();
        assert_eq!(
            value,
            json!({
                "success": true,
                "fire_detected": true,
                "detections": [{"class": "fire", "confidence": 0.75, "bbox": [1.0, 2.5, 30.0, 40.0]}],
                "num_detections": 1
            })
        );
    }

    #[test]
    fn test_empty_success() {
        let report = Report::Success(InferenceResult::new(false, vec![]));

        let (exit_code, stdout, _) = emit(&report);
        assert_eq!(exit_code, 0);
        assert_eq!(
            stdout,
            "{\"success\":true,\"fire_detected\":false,\"detections\":[],\"num_detections\":0}\n"
        );
    }

    #[test]
    fn test_fatal_failure_to_stderr() {
        let report = Report::Failure(PipelineError::EmptyInput);

        let (exit_code, stdout, stderr) = emit(&report);
        assert_eq!(exit_code, 1);
        assert!(stdout.is_empty());
        assert_eq!(
            stderr,
            "{\"success\":false,\"error\":\"No image data provided\"}\n"
        );
    }

    #[test]
    fn test_inference_failure_to_stdout() {
        let report = Report::Failure(PipelineError::Inference(anyhow!("out of memory")));

        let (exit_code, stdout, stderr) = emit(&report);
        assert_eq!(exit_code, 0);
        assert!(stderr.is_empty());

        let value: Value = serde_json::from_str(&stdout).unwrap();
        assert_eq!(
            value,
            json!({"success": false, "error": "Inference failed: out of memory"})
        );
    }

    #[test]
    fn test_unexpected_failure_has_type() {
        let report = Report::Failure(PipelineError::Panic("attempt to divide by zero".to_string()));

        let (exit_code, _, stderr) = emit(&report);
        assert_eq!(exit_code, 1);

        let value: Value = serde_json::from_str(&stderr).unwrap();
        assert_eq!(
            value,
            json!({
                "success": false,
                "error": "Unexpected error: attempt to divide by zero",
                "type": "Panic"
            })
        );
    }

    #[test]
    fn test_report_from_result() {
        let report = Report::from(Err::<InferenceResult, _>(PipelineError::Decode(
            "bad".to_string(),
        )));
        assert_eq!(report.exit_code(), 1);

        let report = Report::from(Ok::<_, PipelineError>(InferenceResult::new(false, vec![])));
        assert_eq!(report.exit_code(), 0);
    }

    #[test]
    fn test_catch_unexpected_str_panic() {
        let report = catch_unexpected(|| panic!("index out of bounds"));

        let (exit_code, stdout, stderr) = emit(&report);
        assert_eq!(exit_code, 1);
        assert!(stdout.is_empty());

        let value: Value = serde_json::from_str(&stderr).unwrap();
        assert_eq!(
            value,
            json!({"success": false, "error": "Unexpected error: index out of bounds", "type": "Panic"})
        );
    }

    #[test]
    fn test_catch_unexpected_string_panic() {
        let axis = 2;
        let report = catch_unexpected(|| panic!("axis {axis} out of range"));

        assert!(matches!(
            &report,
            Report::Failure(PipelineError::Panic(message)) if message == "axis 2 out of range"
        ));
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn test_catch_unexpected_passes_report_through() {
        let report = catch_unexpected(|| Report::Success(InferenceResult::new(false, vec![])));
        assert!(matches!(report, Report::Success(ref result) if !result.fire_detected));
    }
}
