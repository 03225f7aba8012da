use std::time::Duration;

pub(crate) const LOG_TIMESTAMP_FORMAT: &str = "%m-%d %H:%M:%S";
pub(crate) const LOG_PARSE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub(crate) const LOG_SEPARATOR: &str = " | ";

pub(crate) const LOG_RETENTION_DAYS: i64 = 7;
pub(crate) const LOG_MAX_ENTRIES: usize = 10_000;

pub(crate) const TICK_RATE: Duration = Duration::from_millis(33);

pub(crate) const TRANSFER_LOG_THRESHOLD_BYTES: u64 = 1024 * 1024;
pub(crate) const MB_BYTES: f64 = 1024.0 * 1024.0;

pub(crate) const REASON_CANCELLED: &str = "Cancelled";
pub(crate) const REASON_WORKER_LOST: &str = "transfer worker stopped unexpectedly";
