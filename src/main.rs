use std::{
    fs::{self, File},
    io, panic,
    process::ExitCode,
};

use anyhow::{Context, Result};
use chrono::Local;
use tracing::{error, span, trace, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use firedetect::{
    config::LogConfig,
    detect::OnnxModelLoader,
    error::PipelineError,
    load_config,
    report::{catch_unexpected, Report},
    run_pipeline,
};

const LOG_ENV_VAR: &str = "FIREDETECT_LOG";

fn main() -> ExitCode {
    // Panics are reported as JSON below; keep the default hook off stderr.
    panic::set_hook(Box::new(|info| error!("{info}")));

    let report = catch_unexpected(run);

    let exit_code = report
        .emit(&mut io::stdout().lock(), &mut io::stderr().lock())
        .unwrap_or(1);
    ExitCode::from(exit_code)
}

fn run() -> Report {
    let config = match load_config() {
        Ok(config) => config,
        Err(e) => return Report::Failure(e),
    };

    if let Err(e) = init_logging(&config.log) {
        return Report::Failure(PipelineError::Logging(e));
    }

    let span = span!(Level::TRACE, "main");
    let _enter = span.enter();

    trace!("Running detection pipeline...");
    run_pipeline(io::stdin().lock(), &config, &OnnxModelLoader)
}

fn init_logging(config: &LogConfig) -> Result<()> {
    let console_filter = EnvFilter::try_from_env(LOG_ENV_VAR)
        .or_else(|_| EnvFilter::try_new(&config.console_filter))
        .context("Failed to parse console log filter")?;
    let console_appender = fmt::layer().with_writer(io::stderr).with_ansi(false);

    let file_appender = match &config.dir {
        Some(log_dir) => {
            if !fs::exists(log_dir)? {
                fs::create_dir_all(log_dir).context("Failed to create directory")?;
            }

            let file_name = format!(
                "{}/firedetect_{}.log",
                log_dir,
                Local::now().format("%Y-%m-%d_%H-%M-%S")
            );

            let file = File::create(&file_name).context("Failed to create file")?;
            let file_filter = EnvFilter::try_new(&config.file_filter)
                .context("Failed to parse file log filter")?;

            Some(
                fmt::layer()
                    .with_writer(file)
                    .with_ansi(false)
                    .with_filter(file_filter),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(console_appender.with_filter(console_filter))
        .with(file_appender)
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs, io::Read};
    use tempfile::tempdir;
    use tracing::trace;

    #[test]
    fn test_init_logging_creates_log_file() -> Result<()> {
        let tmp_dir = tempdir()?;
        let log_dir = tmp_dir.path().to_str().unwrap();

        init_logging(&LogConfig {
            dir: Some(log_dir.to_string()),
            ..LogConfig::default()
        })?;

        let entries: Vec<_> = fs::read_dir(log_dir)?
            .map(|res| res.map(|e| e.path()))
            .collect::<Result<Vec<_>, std::io::Error>>()?;

        assert_eq!(entries.len(), 1);
        assert!(entries[0].to_str().unwrap().ends_with(".log"));

        trace!("This is a trace log.");

        let mut log_file = File::open(&entries[0])?;
        let mut contents = String::new();
        log_file.read_to_string(&mut contents)?;

        assert!(!contents.is_empty() && contents.contains("This is a trace log."));

        Ok(())
    }
}
