//! Logging bootstrap for the PKCS#11 wrapper.
//!
//! Library code only emits `tracing` events through the macros re-exported
//! here. Binaries and test suites install a subscriber once with [`log_init`].

use std::sync::Once;

pub use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

static LOG_INIT: Once = Once::new();

/// Default filter when neither `RUST_LOG` nor an explicit directive is given.
const DEFAULT_FILTER: &str = "info,cosmian_pkcs11_wrapper=debug";

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over `default_value` when set. Subsequent calls are no-ops,
/// which lets every test call this first.
pub fn log_init(default_value: Option<&str>) {
    LOG_INIT.call_once(|| {
        let directives = std::env::var("RUST_LOG")
            .ok()
            .or_else(|| default_value.map(str::to_owned))
            .unwrap_or_else(|| DEFAULT_FILTER.to_owned());
        tracing_setup(&directives);
    });
}

fn tracing_setup(directives: &str) {
    let format = tracing_subscriber::fmt::layer()
        .with_level(true)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(true)
        .compact();

    let filter = EnvFilter::try_new(directives).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    // a subscriber may already have been installed by the host application
    drop(
        tracing_subscriber::registry()
            .with(filter)
            .with(format)
            .try_init(),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_init_is_idempotent() {
        log_init(Some("debug"));
        log_init(None);
        debug!("logger initialized twice without panicking");
    }
}
