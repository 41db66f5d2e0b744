use crate::environment::Environment;

use once_cell::sync::OnceCell;

pub struct LogGuard;

pub(crate) static LOGGER: OnceCell<LogGuard> = OnceCell::new();

/// Initialize logger with custom format and verbosity.
pub fn initialize_logger(environment: &Environment) {
    LOGGER.get_or_init(|| {
        use tracing_subscriber::{fmt::format::Format, FmtSubscriber};

        let verbosity = environment.verbosity();

        let subscriber = FmtSubscriber::builder()
            // All spans/events with a level higher than TRACE (e.g, debug, info, warn, etc.)
            // will be written to stdout.
            .with_max_level(verbosity)
            .with_target(false)
            .event_format(Format::default())
            .finish();

        tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

        LogGuard {}
    });
}
