//! Shared logging configuration, initialization and pipeline lifecycle events.

use std::env;

use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            include_target: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoggingInitError {
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Reads `SCADA_LOG_LEVEL`, `SCADA_LOG_FORMAT` and `SCADA_LOG_TARGET`.
pub fn logging_config_from_env() -> LoggingConfig {
    logging_config_from_lookup(|key| env::var(key).ok())
}

/// Builds a config from any variable source; unparseable values keep the
/// default for that field.
pub fn logging_config_from_lookup<F>(lookup: F) -> LoggingConfig
where
    F: Fn(&str) -> Option<String>,
{
    let defaults = LoggingConfig::default();
    LoggingConfig {
        level: lookup("SCADA_LOG_LEVEL")
            .map(|raw| raw.trim().to_string())
            .filter(|level| !level.is_empty())
            .unwrap_or(defaults.level),
        format: lookup("SCADA_LOG_FORMAT")
            .and_then(|raw| parse_log_format(&raw))
            .unwrap_or(defaults.format),
        include_target: lookup("SCADA_LOG_TARGET")
            .and_then(|raw| parse_bool(&raw))
            .unwrap_or(defaults.include_target),
    }
}

/// Installs the global subscriber. Events go to stderr so stdout stays free
/// for the run summary.
pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingInitError> {
    let env_filter =
        EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(config.include_target);

    match config.format {
        LogFormat::Json => {
            tracing::subscriber::set_global_default(builder.with_ansi(false).json().finish())?
        }
        LogFormat::Pretty => tracing::subscriber::set_global_default(builder.pretty().finish())?,
    }

    Ok(())
}

pub fn log_app_start(config: &LoggingConfig) {
    info!(
        component = "scada_preprocess",
        event = "app.start",
        log_level = %config.level,
        log_format = ?config.format,
        include_target = config.include_target
    );
}

pub fn log_pipeline_start(rows: usize, turbines: usize, enabled_stages: usize, dt_ms: i64) {
    info!(
        component = "pipeline",
        event = "pipeline.start",
        rows,
        turbines,
        enabled_stages,
        dt_ms
    );
}

pub fn log_pipeline_finish(rows_out: usize, stages_run: usize, stages_cached: usize) {
    info!(
        component = "pipeline",
        event = "pipeline.finish",
        rows_out,
        stages_run,
        stages_cached
    );
}

pub fn log_stage_start(stage: &str, rows_in: usize) {
    info!(
        component = "pipeline",
        event = "stage.start",
        stage,
        rows_in
    );
}

pub fn log_stage_skipped(stage: &str) {
    info!(
        component = "pipeline",
        event = "stage.skipped",
        stage,
        reason = "disabled"
    );
}

pub fn log_stage_cached(stage: &str, fingerprint: &str) {
    info!(
        component = "pipeline",
        event = "stage.cached",
        stage,
        fingerprint
    );
}

pub fn log_stage_finish(
    stage: &str,
    rows_in: usize,
    rows_out: usize,
    nullified: usize,
    repaired: usize,
) {
    info!(
        component = "pipeline",
        event = "stage.finish",
        stage,
        rows_in,
        rows_out,
        cells_nullified = nullified,
        cells_repaired = repaired
    );
}

pub fn log_detect_finish(detector: &str, masks: usize, flagged: usize) {
    info!(
        component = "detectors",
        event = "detect.finish",
        detector,
        masks,
        flagged
    );
}

fn parse_log_format(raw: &str) -> Option<LogFormat> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "json" => Some(LogFormat::Json),
        "pretty" => Some(LogFormat::Pretty),
        _ => None,
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_vars(vars: &[(&str, &str)]) -> LoggingConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        logging_config_from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        assert_eq!(from_vars(&[]), LoggingConfig::default());
    }

    #[test]
    fn parses_directive_format_and_target() {
        let cfg = from_vars(&[
            ("SCADA_LOG_LEVEL", "scada_prep=debug"),
            ("SCADA_LOG_FORMAT", " JSON "),
            ("SCADA_LOG_TARGET", "off"),
        ]);

        assert_eq!(cfg.level, "scada_prep=debug");
        assert_eq!(cfg.format, LogFormat::Json);
        assert!(!cfg.include_target);
    }

    #[test]
    fn blank_or_unknown_values_keep_defaults() {
        let cfg = from_vars(&[
            ("SCADA_LOG_LEVEL", "   "),
            ("SCADA_LOG_FORMAT", "yaml"),
            ("SCADA_LOG_TARGET", "maybe"),
        ]);

        assert_eq!(cfg, LoggingConfig::default());
    }

    #[test]
    fn format_and_bool_parsing_ignore_case() {
        assert_eq!(parse_bool("YES"), Some(true));
        assert_eq!(parse_log_format("pretty"), Some(LogFormat::Pretty));
    }
}
