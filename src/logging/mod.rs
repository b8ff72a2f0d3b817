//! Logging subsystem
//!
//! Structured logging via tracing with support for JSON (production) and
//! plaintext (development) output formats. Every sink goes through the
//! redacting writer in [`redact`].
//!
//! # Log Targets
//!
//! - `session` - gateway connection, handshake, pairing
//! - `tls` - TLS setup and certificate pinning
//! - `exec` - command authorization and execution
//! - `approvals` - approvals file and approval prompts
//! - `skills` - skill bins lookups
//! - `config` - configuration loading
//!
//! # Environment Variables
//!
//! - `CARAPACE_NODE_LOG` - Primary log level/filter (takes precedence)
//! - `RUST_LOG` - Fallback log level/filter
//! - `CARAPACE_NODE_DEV` - Selects the development profile

pub mod redact;

use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use crate::logging::redact::RedactingMakeWriter;
use tracing::Level;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

pub const LOG_ENV: &str = "CARAPACE_NODE_LOG";
pub const DEV_ENV: &str = "CARAPACE_NODE_DEV";

/// Guard to track if logging has been initialized
static INIT_GUARD: OnceLock<()> = OnceLock::new();

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// JSON format for production (structured logs)
    Json,
    /// Human-readable plaintext for development
    #[default]
    Plaintext,
}

/// Log output destination
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LogOutput {
    #[default]
    Stdout,
    Stderr,
    /// Append to a file at the given path
    File(PathBuf),
}

/// Configuration for the logging subsystem
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub format: LogFormat,
    pub output: LogOutput,
    /// Default log level when no env filter is set
    pub default_level: Level,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Plaintext,
            output: LogOutput::Stdout,
            default_level: Level::INFO,
        }
    }
}

impl LogConfig {
    /// Plaintext to stdout, debug level
    pub fn development() -> Self {
        Self {
            format: LogFormat::Plaintext,
            output: LogOutput::Stdout,
            default_level: Level::DEBUG,
        }
    }

    /// JSON to stdout, info level
    pub fn production() -> Self {
        Self {
            format: LogFormat::Json,
            output: LogOutput::Stdout,
            default_level: Level::INFO,
        }
    }

    /// Pick the profile from `CARAPACE_NODE_DEV`.
    pub fn from_env() -> Self {
        if is_dev_mode(std::env::var(DEV_ENV).ok().as_deref()) {
            Self::development()
        } else {
            Self::production()
        }
    }
}

fn is_dev_mode(value: Option<&str>) -> bool {
    match value.map(str::trim) {
        None | Some("") => false,
        Some(v) => !(v == "0" || v.eq_ignore_ascii_case("false")),
    }
}

/// Error type for logging initialization
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to create log file: {0}")]
    FileCreation(#[from] io::Error),
    #[error("failed to parse log filter: {0}")]
    FilterParse(#[from] tracing_subscriber::filter::ParseError),
    #[error("logging already initialized")]
    AlreadyInitialized,
    #[error("failed to initialize subscriber: {0}")]
    TryInit(#[from] tracing_subscriber::util::TryInitError),
}

/// Build an EnvFilter from environment variables or default level.
///
/// Checks CARAPACE_NODE_LOG first, then RUST_LOG, falling back to the default level.
fn build_env_filter(default_level: Level) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = std::env::var(LOG_ENV) {
        return Ok(EnvFilter::try_new(filter)?);
    }
    if let Ok(filter) = std::env::var("RUST_LOG") {
        return Ok(EnvFilter::try_new(filter)?);
    }
    Ok(EnvFilter::try_new(default_filter(default_level))?)
}

fn default_filter(level: Level) -> String {
    let level = level.as_str().to_lowercase();
    let mut directives = vec![level.clone()];
    for target in targets::ALL {
        directives.push(format!("{target}={level}"));
    }
    directives.join(",")
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

fn build_layer(config: &LogConfig) -> Result<BoxedLayer, LoggingError> {
    let filter = build_env_filter(config.default_level)?;
    let layer = match &config.output {
        LogOutput::Stdout => {
            format_layer(config.format, RedactingMakeWriter::new(io::stdout), filter)
        }
        LogOutput::Stderr => {
            format_layer(config.format, RedactingMakeWriter::new(io::stderr), filter)
        }
        LogOutput::File(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            format_layer(
                config.format,
                RedactingMakeWriter::new(Arc::new(file)),
                filter,
            )
        }
    };
    Ok(layer)
}

fn format_layer<W>(format: LogFormat, writer: W, filter: EnvFilter) -> BoxedLayer
where
    W: for<'w> tracing_subscriber::fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    // RFC 3339 timestamp format
    let timer = UtcTime::rfc_3339();
    match format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_timer(timer)
            .with_target(true)
            .with_current_span(true)
            .with_span_list(true)
            .with_writer(writer)
            .with_filter(filter)
            .boxed(),
        LogFormat::Plaintext => tracing_subscriber::fmt::layer()
            .with_timer(timer)
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_file(false)
            .with_line_number(false)
            .with_writer(writer)
            .with_filter(filter)
            .boxed(),
    }
}

/// Initialize the logging subsystem with the given configuration.
///
/// Call once at startup; later calls return [`LoggingError::AlreadyInitialized`].
pub fn init_logging(config: LogConfig) -> Result<(), LoggingError> {
    if INIT_GUARD.set(()).is_err() {
        return Err(LoggingError::AlreadyInitialized);
    }
    let layer = build_layer(&config)?;
    tracing_subscriber::registry().with(layer).try_init()?;
    Ok(())
}

/// Log target constants for consistent naming across the codebase
pub mod targets {
    pub const SESSION: &str = "session";
    pub const TLS: &str = "tls";
    pub const EXEC: &str = "exec";
    pub const APPROVALS: &str = "approvals";
    pub const SKILLS: &str = "skills";
    pub const CONFIG: &str = "config";

    pub const ALL: &[&str] = &[SESSION, TLS, EXEC, APPROVALS, SKILLS, CONFIG];
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    /// Mutex to serialize tests that modify global state (env vars).
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_log_config_profiles() {
        let dev = LogConfig::development();
        assert_eq!(dev.format, LogFormat::Plaintext);
        assert_eq!(dev.default_level, Level::DEBUG);

        let prod = LogConfig::production();
        assert_eq!(prod.format, LogFormat::Json);
        assert_eq!(prod.output, LogOutput::Stdout);
        assert_eq!(prod.default_level, Level::INFO);
    }

    #[test]
    fn test_dev_mode_values() {
        assert!(!is_dev_mode(None));
        assert!(!is_dev_mode(Some("")));
        assert!(!is_dev_mode(Some("0")));
        assert!(!is_dev_mode(Some("FALSE")));
        assert!(is_dev_mode(Some("1")));
        assert!(is_dev_mode(Some("yes")));
    }

    #[test]
    fn test_default_filter_lists_targets() {
        let filter = default_filter(Level::WARN);
        assert!(filter.starts_with("warn,"));
        for target in targets::ALL {
            assert!(filter.contains(&format!("{target}=warn")));
        }
        assert!(filter.contains(&format!("{}=warn", targets::APPROVALS)));
        assert!(EnvFilter::try_new(filter).is_ok());
    }

    #[test]
    fn test_env_filter_precedence() {
        let _lock = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        std::env::remove_var(LOG_ENV);
        std::env::remove_var("RUST_LOG");
        assert!(build_env_filter(Level::INFO).is_ok());

        std::env::set_var(LOG_ENV, "session=debug,exec=trace");
        std::env::set_var("RUST_LOG", "warn");
        assert!(build_env_filter(Level::INFO).is_ok());
        std::env::remove_var(LOG_ENV);
        std::env::remove_var("RUST_LOG");
    }

    #[test]
    fn test_file_layer_builds() {
        let _lock = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        std::env::remove_var(LOG_ENV);
        std::env::remove_var("RUST_LOG");
        let temp_file = NamedTempFile::new().unwrap();
        let config = LogConfig {
            format: LogFormat::Json,
            output: LogOutput::File(temp_file.path().to_path_buf()),
            default_level: Level::INFO,
        };
        assert!(build_layer(&config).is_ok());
    }

    #[test]
    fn test_logging_error_display() {
        assert_eq!(
            LoggingError::AlreadyInitialized.to_string(),
            "logging already initialized"
        );
    }
}
