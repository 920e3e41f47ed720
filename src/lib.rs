//! # GrblBridge
//!
//! Local daemon bridging a client to a GRBL-class CNC controller over a
//! serial link.
//!
//! ## Architecture
//!
//! GrblBridge is organized as a workspace with multiple crates:
//!
//! 1. **grblbridge-core** - Data model, errors, machine events
//! 2. **grblbridge-settings** - Machine configuration and daemon settings
//! 3. **grblbridge-communication** - Serial transport, GRBL protocol, machine
//!    controller, firmware flashing
//! 4. **grblbridge** - Daemon loop and the line-delimited JSON client bridge

pub mod bridge;
pub mod daemon;

pub use bridge::{Bridge, BridgeEvent, ClientCommand, Effect, Outbound};
pub use daemon::{spawn_client_reader, Daemon, Inbound};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build date (set at compile time)
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Initialize logging with the default configuration
///
/// Logs go to stderr; stdout carries the client protocol. The level
/// defaults to INFO and can be changed with `RUST_LOG`.
pub fn init_logging() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true)
        .with_thread_names(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;

    Ok(())
}
