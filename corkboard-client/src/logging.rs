/// Process logger: `env_logger` with `RUST_LOG` filtering.
use env_logger::Env;
use log::SetLoggerError;

/// Install the logger. `verbose` lowers the default filter from info to debug;
/// an explicit `RUST_LOG` always wins.
pub fn init(verbose: bool) -> Result<(), SetLoggerError> {
    let default_filter = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(default_filter))
        .format_timestamp_millis()
        .try_init()
}
