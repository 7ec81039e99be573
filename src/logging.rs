//! Tracing subscriber setup for the binaries.
//!
//! `RUST_LOG` overrides the default level:
//! ```bash
//! RUST_LOG=docvoice=debug,reqwest=info voice_server
//! ```

use std::sync::Once;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

static INIT: Once = Once::new();

/// Level used when `RUST_LOG` is unset.
pub const DEFAULT_LEVEL: &str = "info";

/// Installs the global subscriber. Only the first call has an effect.
pub fn init() {
    init_with_default(DEFAULT_LEVEL);
}

/// Installs the global subscriber with `default` as the fallback filter.
pub fn init_with_default(default: &str) {
    INIT.call_once(|| {
        let filter = filter_from(std::env::var("RUST_LOG").ok().as_deref(), default);
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_level(true)
            .with_filter(filter);
        tracing_subscriber::registry().with(fmt_layer).init();
    });
}

fn filter_from(env: Option<&str>, default: &str) -> EnvFilter {
    env.filter(|value| !value.trim().is_empty())
        .and_then(|value| EnvFilter::try_new(value).ok())
        .unwrap_or_else(|| EnvFilter::new(default))
}
