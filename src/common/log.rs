//! Logging helpers
//!
//! This module wires the `log` facade to `env_logger`.

/// Initialize the logging system
///
/// `RUST_LOG` takes precedence over `level`. Calling this more than once is
/// harmless, later calls are ignored.
///
/// # Parameters
///
/// * `level` - Log level used when `RUST_LOG` is not set
pub fn init_logger(level: &str) {
    let env = env_logger::Env::default()
        .filter_or("RUST_LOG", level);

    let _ = env_logger::try_init_from_env(env);
}
