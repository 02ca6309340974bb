//! Logging setup.
//!
//! The crate logs through `tracing` everywhere. Nothing is printed
//! until a subscriber is installed, either by the application or with
//! [`setup_tracing`], which logs `jetflow` events to stdout at the
//! given level.
//!
//! The level can be overridden with an env var: "JETFLOW_LOG".
//!
//! See tracing-subscriber's documentation:
//! https://docs.rs/tracing-subscriber/latest/tracing_subscriber/filter/struct.EnvFilter.html
//!
//! eg: to set jetflow's logs to the "debug" level, and all other
//! crates to the "error" level, run:
//!     $ JETFLOW_LOG="jetflow=debug,error" cargo test
use tracing::{level_filters::LevelFilter, Subscriber};
use tracing_subscriber::{filter::Targets, layer::SubscriberExt, EnvFilter, Layer, Registry};

use crate::errors::ConfigurationError;

const LOG_ENV: &str = "JETFLOW_LOG";

/// Parse a level name. `None` means "error".
pub fn parse_log_level(level: Option<&str>) -> Result<LevelFilter, ConfigurationError> {
    let Some(level) = level else {
        return Ok(LevelFilter::ERROR);
    };
    match level.to_lowercase().as_str() {
        "trace" => Ok(LevelFilter::TRACE),
        "debug" => Ok(LevelFilter::DEBUG),
        "info" => Ok(LevelFilter::INFO),
        "warn" => Ok(LevelFilter::WARN),
        "error" => Ok(LevelFilter::ERROR),
        _ => Err(ConfigurationError::InvalidLogLevel(level.to_string())),
    }
}

fn log_layer<S>() -> impl Layer<S>
where
    S: Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    tracing_subscriber::fmt::Layer::default()
        .compact()
        // Show source file
        .with_file(true)
        // Display source code line numbers
        .with_line_number(true)
        // Display the thread ID an event was recorded on
        .with_thread_ids(true)
        .with_thread_names(true)
}

/// Install a global subscriber logging to stdout.
///
/// If `JETFLOW_LOG` is set it is used as the filter and `log_level`
/// is ignored.
pub fn setup_tracing(log_level: Option<&str>) -> Result<(), ConfigurationError> {
    let log_level = parse_log_level(log_level)?;
    match EnvFilter::try_from_env(LOG_ENV) {
        Ok(filter) => {
            let logs = log_layer::<Registry>().with_filter(filter);
            set_global_subscriber(Registry::default().with(logs));
        }
        Err(_) => {
            let targets = Targets::new().with_target("jetflow", log_level);
            let logs = log_layer::<Registry>().with_filter(targets);
            set_global_subscriber(Registry::default().with(logs));
        }
    }
    Ok(())
}

// Try to set a global default subscriber, logging the error without
// failing if one was already set
fn set_global_subscriber<S>(subscriber: S)
where
    S: Subscriber + Send + Sync + 'static,
{
    // This fails if tracing was already initialized, which happens in
    // tests and when an application sets up its own subscriber.
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        tracing::warn!("{err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_parse_case_insensitively() {
        assert_eq!(parse_log_level(None).unwrap(), LevelFilter::ERROR);
        assert_eq!(parse_log_level(Some("DEBUG")).unwrap(), LevelFilter::DEBUG);
        assert_eq!(parse_log_level(Some("warn")).unwrap(), LevelFilter::WARN);
    }

    #[test]
    fn unknown_level_is_an_error() {
        assert_eq!(
            parse_log_level(Some("loud")),
            Err(ConfigurationError::InvalidLogLevel("loud".to_string()))
        );
    }

    #[test]
    fn second_setup_does_not_fail() {
        setup_tracing(Some("info")).unwrap();
        setup_tracing(Some("debug")).unwrap();
    }
}
