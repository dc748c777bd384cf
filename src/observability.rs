use std::net::SocketAddr;

use crate::engine::EngineError;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: booking lifecycle operations. Labels: op, outcome.
pub const BOOKING_OPS_TOTAL: &str = "stayledger_booking_ops_total";

/// Histogram: operation latency in seconds, retries included. Labels: op.
pub const BOOKING_OP_DURATION_SECONDS: &str = "stayledger_booking_op_duration_seconds";

/// Counter: gateway refunds. Labels: outcome.
pub const REFUNDS_TOTAL: &str = "stayledger_refunds_total";

// ── Transaction layer ───────────────────────────────────────────

/// Counter: automatic retries after a transient failure. Labels: op.
pub const TXN_RETRIES_TOTAL: &str = "stayledger_txn_retries_total";

/// Counter: transactions rolled back after staging at least one change.
pub const TXN_ROLLBACKS_TOTAL: &str = "stayledger_txn_rollbacks_total";

/// Histogram: time spent waiting for a range lease, in seconds.
pub const LOCK_WAIT_SECONDS: &str = "stayledger_lock_wait_seconds";

/// Counter: range lease waits that hit the deadline.
pub const LOCK_TIMEOUTS_TOTAL: &str = "stayledger_lock_timeouts_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "stayledger_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (commits per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "stayledger_wal_flush_batch_size";

/// Gauge: bookings currently holding nights.
pub const ACTIVE_BOOKINGS: &str = "stayledger_active_bookings";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus exporter: {e}"),
    }
}

/// Short outcome label for an operation result.
pub fn outcome_label<T>(result: &Result<T, EngineError>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(e) => error_label(e),
    }
}

pub fn error_label(err: &EngineError) -> &'static str {
    match err {
        EngineError::InvalidRange(_) => "invalid_range",
        EngineError::DatesUnavailable(_) => "dates_unavailable",
        EngineError::RangeUnavailable(_) => "range_unavailable",
        EngineError::PromotionNotFound(_) => "promotion_not_found",
        EngineError::PromotionExpired(_) => "promotion_expired",
        EngineError::PromotionExhausted(_) => "promotion_exhausted",
        EngineError::PromotionAlreadyUsedByUser { .. } => "promotion_already_used",
        EngineError::BookingNotFound(_) => "booking_not_found",
        EngineError::PropertyNotFound(_) => "property_not_found",
        EngineError::PolicyNotFound(_) => "policy_not_found",
        EngineError::InvalidTransition { .. } => "invalid_transition",
        EngineError::PaymentReferenced(_) => "payment_referenced",
        EngineError::PaymentDeclined(_) => "payment_declined",
        EngineError::AlreadyExists(_) => "already_exists",
        EngineError::LimitExceeded(_) => "limit_exceeded",
        EngineError::StorageBusy => "storage_busy",
        EngineError::Wal(_) => "wal_error",
        EngineError::StorageFailure(_) => "storage_failure",
    }
}
