pub mod hal;
pub mod loom;

/// Installs a global subscriber forwarding the spans of queue runs to a Tracy client.
#[cfg(feature = "trace")]
pub fn init_trace() -> Result<(), tracing_subscriber::util::TryInitError> {
    use tracing_subscriber::prelude::*;

    tracing_subscriber::registry()
        .with(tracing_tracy::TracyLayer::default())
        .try_init()
}
