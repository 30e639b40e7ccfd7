pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Drain, Logger};

use serdeconv;
use sloggers::{Config, LoggerConfig};

/// Builds the default terminal logger writing to stderr.
///
/// Components take their logger as an optional constructor argument, so a
/// process entry point typically calls this once and hands the result down.
pub fn init() -> Logger {
    let config: LoggerConfig = serdeconv::from_toml_str(
        r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#,
    )
    .expect("Error parsing the default logger configuration");

    config.build_logger().expect("Error building the logger")
}

/// Builds a logger from a TOML configuration string.
pub fn from_toml(toml: &str) -> Logger {
    let config: LoggerConfig = serdeconv::from_toml_str(toml).expect("Error parsing logger configuration");

    config.build_logger().expect("Error building the logger")
}
