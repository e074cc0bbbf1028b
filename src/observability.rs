//! Shared tracing configuration for observability instrumentation.
//!
//! Centralises the log targets used by the crate so subscribers can filter
//! observability events without pulling in unrelated application logs.

/// Target used by supervisor spans and logs.
pub(crate) const SUPERVISOR_TARGET: &str = "pg_keeper::supervisor";

/// Target used by the node-active loop.
pub(crate) const NODE_ACTIVE_TARGET: &str = "pg_keeper::node_active";

/// Target used by the FSM engine.
pub(crate) const FSM_TARGET: &str = "pg_keeper::fsm";

/// Target used by the Local Postgres Controller.
pub(crate) const LPC_TARGET: &str = "pg_keeper::lpc";

/// Target used by the partition detector.
pub(crate) const PARTITION_TARGET: &str = "pg_keeper::partition";

/// Installs the `tracing-subscriber` `fmt` layer used by every entry point.
///
/// Mirrors the teacher crate's single shared subscriber setup so tests and
/// the CLI binary configure logging identically.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
