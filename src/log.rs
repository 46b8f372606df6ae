//! Minimal leveled logging to stderr.
//!
//! The level is read once from the `HEAPSTALK_LOG` environment variable
//! (`error`, `warn`, `info` or `debug`); anything at or above the selected
//! level is printed. Diagnostics never go to stdout because stdout belongs
//! to whoever consumes the enumeration stream.

use lazy_static::lazy_static;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    LogError,
    LogWarn,
    LogInfo,
    LogDebug,
}

use LogLevel::*;

impl LogLevel {
    pub fn name(self) -> &'static str {
        match self {
            LogError => "ERROR",
            LogWarn => "WARN",
            LogInfo => "INFO",
            LogDebug => "DEBUG",
        }
    }
}

fn level_from_env() -> LogLevel {
    match std::env::var("HEAPSTALK_LOG").as_deref() {
        Ok("error") => LogError,
        Ok("info") => LogInfo,
        Ok("debug") => LogDebug,
        // `warn` and anything unrecognized
        _ => LogWarn,
    }
}

lazy_static! {
    static ref MAX_LEVEL: LogLevel = level_from_env();
}

pub fn is_logging(level: LogLevel) -> bool {
    level <= *MAX_LEVEL
}

macro_rules! log {
    ($level:expr, $($args:tt)+) => {{
        let level: $crate::log::LogLevel = $level;
        if $crate::log::is_logging(level) {
            eprintln!(
                "[{} {}:{}] {}",
                level.name(),
                module_path!(),
                line!(),
                format_args!($($args)+)
            );
        }
    }};
}
