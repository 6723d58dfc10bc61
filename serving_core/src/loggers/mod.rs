/// Subscriber installation, rolling files and log pruning.
pub mod tracing_setup;

pub use tracing_setup::{init_logging, prune_old_logs, LoggingGuard};
