pub use slog::{debug, error, info, o, trace, warn, Discard, Logger};

use sloggers::{Config, LoggerConfig};

/// Builds the terminal logger shared by the server and client executables.
pub fn init() -> Logger {
    let config: LoggerConfig = serdeconv::from_toml_str(
        r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#,
    )
    .expect("Logging config must parse");

    config.build_logger().expect("Logging initialization failed")
}

/// Root logger that swallows all records. Used by tests and by embedders
/// that install their own logging.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}
