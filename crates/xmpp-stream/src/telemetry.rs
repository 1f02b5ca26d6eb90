//! Logging setup for binaries and tests built on this crate.
//!
//! The library itself only emits `tracing` events; nothing is printed until a
//! host installs a subscriber, for example with [`init`].

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install a console subscriber.
///
/// `RUST_LOG` wins over `default_directives` when set. Hosts loading a
/// [`crate::ClientConfig`] pass [`crate::ClientConfig::log_directives`].
/// Raw wire traffic is logged at `trace` under the `xmpp_stream::stream`
/// target.
///
/// ```no_run
/// xmpp_stream::telemetry::init("info,xmpp_stream=debug").unwrap();
/// ```
pub fn init(default_directives: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directives))?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()?;

    tracing::debug!(directives = %default_directives, "Telemetry initialized");
    Ok(())
}
