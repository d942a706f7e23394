pub mod cloud_logs;
pub mod console;
pub mod metrics_snapshot;
pub mod util;
