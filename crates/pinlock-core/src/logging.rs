//! Logging bootstrap for pinlock binaries.
//!
//! Interactive tools want short plain lines on stderr next to their prompts;
//! services want JSON they can ship. Callers pick the default and the
//! environment can override either knob.

use env_logger::{Env, Target};
use serde_json::json;
use std::env;
use std::io::Write;
use std::sync::OnceLock;

static INIT: OnceLock<()> = OnceLock::new();

const FORMAT_ENV: &str = "PINLOCK_LOG_FORMAT";
const LEVEL_ENV: &str = "PINLOCK_LOG_LEVEL";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// `level: message`, no timestamp.
    Plain,
    /// One JSON object per line.
    Json,
}

impl LogFormat {
    /// Parse a `PINLOCK_LOG_FORMAT` value; unknown values yield `None`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "plain" | "text" => Some(LogFormat::Plain),
            "json" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

/// Initialize the global logger. The first caller wins.
///
/// `RUST_LOG` takes precedence, then `PINLOCK_LOG_LEVEL`, then
/// `default_level`. `PINLOCK_LOG_FORMAT` overrides `default_format`.
pub fn init(default_level: &str, default_format: LogFormat) {
    let _ = INIT.get_or_init(|| configure(default_level, default_format));
}

fn configure(default_level: &str, default_format: LogFormat) {
    let level = env::var(LEVEL_ENV).unwrap_or_else(|_| default_level.to_string());
    let format = env::var(FORMAT_ENV)
        .ok()
        .and_then(|value| LogFormat::parse(&value))
        .unwrap_or(default_format);

    let mut builder = env_logger::Builder::from_env(Env::default().default_filter_or(level));
    builder.target(Target::Stderr);
    match format {
        LogFormat::Json => {
            builder.format(|buf, record| {
                let payload = json!({
                    "timestamp": buf.timestamp().to_string(),
                    "level": record.level().to_string().to_lowercase(),
                    "target": record.target(),
                    "message": record.args().to_string(),
                });
                writeln!(buf, "{}", payload)
            });
        }
        LogFormat::Plain => {
            builder.format(|buf, record| {
                writeln!(
                    buf,
                    "{}: {}",
                    record.level().to_string().to_lowercase(),
                    record.args()
                )
            });
        }
    }

    if let Err(err) = builder.try_init() {
        eprintln!("failed to initialize logger: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_names_parse_case_insensitively() {
        assert_eq!(LogFormat::parse("JSON"), Some(LogFormat::Json));
        assert_eq!(LogFormat::parse(" plain "), Some(LogFormat::Plain));
        assert_eq!(LogFormat::parse("text"), Some(LogFormat::Plain));
        assert_eq!(LogFormat::parse("xml"), None);
    }
}
