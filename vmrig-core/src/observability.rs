//! Logging setup and span helpers
//!
//! Every state-changing step emits an `info!` event inside a step span, so a
//! failed run can be read back step by step from the log.

use std::time::Instant;
use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::error::{VmrigError, VmrigResult};

/// Default directives when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "vmrig_core=info,vmrig_vm=info";

/// Initialize tracing with environment-based configuration
///
/// `RUST_LOG` wins; otherwise `level` (from `logging.level`) applies to both
/// crates, falling back to [`DEFAULT_FILTER`].
pub fn init_tracing(level: Option<&str>) -> VmrigResult<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| match level {
        Some(level) => EnvFilter::new(format!("vmrig_core={0},vmrig_vm={0}", level)),
        None => EnvFilter::new(DEFAULT_FILTER),
    });

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    Registry::default()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| VmrigError::internal(format!("failed to install tracing subscriber: {}", e)))
}

/// Span for one top-level operation on one machine
#[inline]
pub fn operation_span(operation: &str, machine: &str) -> Span {
    tracing::info_span!(
        "operation",
        operation = %operation,
        machine = %machine,
        duration_ms = tracing::field::Empty,
        status = tracing::field::Empty,
    )
}

/// Span for one pipeline step
#[inline]
pub fn step_span(step: &str) -> Span {
    tracing::info_span!("step", step = %step)
}

/// Record the duration of an operation in the current span
pub fn record_duration(start: Instant) {
    let duration = start.elapsed();
    Span::current().record("duration_ms", duration.as_millis() as u64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[traced_test]
    #[test]
    fn test_step_span_fields() {
        let _guard = step_span("create_domain").entered();
        tracing::info!("Creating domain");
        assert!(logs_contain("step=create_domain"));
        assert!(logs_contain("Creating domain"));
    }

    #[traced_test]
    #[test]
    fn test_operation_span_records_duration() {
        let span = operation_span("up", "default");
        let _guard = span.enter();
        record_duration(Instant::now());
        tracing::info!("done");
        assert!(logs_contain("operation=up"));
    }
}
