//! Log subscriber setup
//!
//! The bridge logs through `tracing`. Inside a host that installs its own
//! subscriber nothing here runs; otherwise [`init`] writes to stderr, filtered
//! by `MEGATRACE_LOG` (or `RUST_LOG`), defaulting to `warn`.

use tracing_subscriber::EnvFilter;

/// Environment variable holding the bridge's log filter
pub const LOG_ENV: &str = "MEGATRACE_LOG";

/// Build the filter from the environment
///
/// `debug` raises the default to `debug` for this crate.
pub fn filter(debug: bool) -> EnvFilter {
    let default = if debug { "warn,megatrace=debug" } else { "warn" };
    std::env::var(LOG_ENV)
        .or_else(|_| std::env::var(EnvFilter::DEFAULT_ENV))
        .ok()
        .and_then(|spec| EnvFilter::try_new(spec).ok())
        .unwrap_or_else(|| EnvFilter::new(default))
}

/// Install the stderr subscriber; a no-op if one is already set
pub fn init(debug: bool) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter(debug))
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init(false);
        init(true);
        tracing::warn!("still logging after repeated init");
    }
}
