use evlog::Logger;
use once_cell::sync::OnceCell;

static LOGGER: OnceCell<Logger> = OnceCell::new();

/// Installs the process-wide logger. Returns `false` if one was already installed.
pub fn set_logger(logger: Logger) -> bool {
    LOGGER.set(logger).is_ok()
}

/// Falls back to a logger with no handlers when nothing was installed, so library
/// callers and tests can log without setup.
pub fn get_logger() -> &'static Logger {
    LOGGER.get_or_init(Logger::default)
}
