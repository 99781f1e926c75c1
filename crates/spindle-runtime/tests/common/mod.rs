use flexi_logger::Logger;
use std::sync::Once;

static INIT_LOG: Once = Once::new();

/// Route runtime logs to stderr, filtered by `RUST_LOG` (default `warn`).
pub fn initialize_logger() {
    INIT_LOG.call_once(|| {
        if let Ok(logger) = Logger::try_with_env_or_str("warn") {
            let _ = logger.start();
        }
    });
}
