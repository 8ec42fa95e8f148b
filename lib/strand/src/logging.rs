//! Facade over the structured logging stack. Components receive a `Logger`
//! and derive children with `log.new(o!(...))`; only the process entry point
//! builds a root logger.

pub use slog::{b, crit, debug, error, info, kv, o, trace, warn};
pub use slog::{Discard, Drain, Logger};

use sloggers::file::FileLoggerBuilder;
use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;
use std::path::Path;

pub use sloggers::types::Severity as Level;
pub use sloggers::{Config, LoggerConfig};

/// Build a root logger from a `sloggers` configuration fragment, typically
/// deserialized from the `[logging]` section of the boot config.
pub fn from_config(config: &LoggerConfig) -> Result<Logger, sloggers::Error> {
    config.build_logger()
}

/// Terminal root logger writing to stderr.
pub fn terminal(level: Severity) -> Logger {
    TerminalLoggerBuilder::new()
        .level(level)
        .destination(Destination::Stderr)
        .build()
        .expect("terminal logger construction cannot fail")
}

/// File-backed root logger.
pub fn file<P: AsRef<Path>>(path: P, level: Severity) -> Result<Logger, sloggers::Error> {
    FileLoggerBuilder::new(path).level(level).build()
}

/// Logger that swallows everything. Used by tests and detached components.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discard_accepts_records() {
        let log = discard();
        info!(log, "nothing to see"; "key" => 1);
    }

    #[test]
    fn test_from_config_terminal() {
        let config: LoggerConfig = serdeconv::from_toml_str(
            r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#,
        )
        .unwrap();

        let log = from_config(&config).unwrap();
        debug!(log, "configured"; "sink" => "terminal");
    }
}
