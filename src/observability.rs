use std::net::SocketAddr;

use tracing_subscriber::EnvFilter;

use crate::ledger::LedgerError;

// ── Ledger metrics ──────────────────────────────────────────────

/// Counter: events committed. Labels: direction.
pub const EVENTS_APPLIED_TOTAL: &str = "headcount_events_applied_total";

/// Counter: apply_event calls that returned an error. Labels: kind.
pub const EVENTS_REJECTED_TOTAL: &str = "headcount_events_rejected_total";

/// Histogram: apply_event latency in seconds, including retries.
pub const APPLY_DURATION_SECONDS: &str = "headcount_apply_duration_seconds";

/// Counter: conditional commits retried after a conflict.
pub const CONFLICT_RETRIES_TOTAL: &str = "headcount_conflict_retries_total";

// ── Store metrics ───────────────────────────────────────────────

/// Gauge: buildings known to the store.
pub const BUILDINGS_REGISTERED: &str = "headcount_buildings_registered";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "headcount_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (records per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "headcount_wal_flush_batch_size";

/// Counter: completed WAL compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "headcount_wal_compactions_total";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Level used when `RUST_LOG` is unset, blank or unparsable.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Log filter from `RUST_LOG`-style directives.
pub fn log_filter(directives: Option<&str>) -> EnvFilter {
    directives
        .filter(|d| !d.trim().is_empty())
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER))
}

/// Short label for an error kind.
pub fn error_label(err: &LedgerError) -> &'static str {
    match err {
        LedgerError::InvalidArgument(_) => "invalid_argument",
        LedgerError::NotFound(_) => "not_found",
        LedgerError::Conflict(_) => "conflict",
        LedgerError::Unavailable(_) => "unavailable",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::filter::LevelFilter;

    #[test]
    fn unset_filter_still_shows_warnings() {
        assert_eq!(log_filter(None).max_level_hint(), Some(LevelFilter::INFO));
        assert_eq!(log_filter(Some("  ")).max_level_hint(), Some(LevelFilter::INFO));
    }

    #[test]
    fn explicit_filter_wins() {
        assert_eq!(log_filter(Some("debug")).max_level_hint(), Some(LevelFilter::DEBUG));
        assert_eq!(log_filter(Some("error")).max_level_hint(), Some(LevelFilter::ERROR));
    }
}
