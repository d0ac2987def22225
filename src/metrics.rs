//! Update metrics.
//!
//! Failures and applied updates are emitted as structured events on the
//! `eos_updater::metrics` tracing target. With the `otel` feature they are
//! also counted by OpenTelemetry instruments.

use tracing::info;

use crate::config::{MetricsSettings, DISABLE_METRICS_ENV_VAR};
use crate::error::UpdaterError;

/// Tracing target for metric events.
pub const METRICS_TARGET: &str = "eos_updater::metrics";

#[cfg(feature = "otel")]
mod instruments {
    use std::sync::LazyLock;

    use opentelemetry::global;
    use opentelemetry::metrics::{Counter, Meter};

    static METER: LazyLock<Meter> = LazyLock::new(|| global::meter("eos-updater"));

    /// Failed updater operations, by error name.
    pub static FAILURE_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
        METER
            .u64_counter("eos_updater.failure.total")
            .with_description("Failed updater operations")
            .build()
    });

    /// Successfully applied updates.
    pub static APPLIED_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
        METER
            .u64_counter("eos_updater.applied.total")
            .with_description("Applied updates")
            .build()
    });
}

/// Reports updater events.
#[derive(Debug, Clone, Copy)]
pub struct Metrics {
    enabled: bool,
}

impl Metrics {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// Honours both the settings toggle and `EOS_DISABLE_METRICS=1`.
    pub fn from_settings(settings: &MetricsSettings) -> Self {
        let disabled_by_env = std::env::var(DISABLE_METRICS_ENV_VAR).as_deref() == Ok("1");
        Self::new(settings.enabled && !disabled_by_env)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether a failure of this kind is reported at all.
    pub fn is_reportable(error: &UpdaterError) -> bool {
        !matches!(
            error,
            UpdaterError::Cancelled(_) | UpdaterError::LiveBoot(_) | UpdaterError::NotOstreeSystem(_)
        )
    }

    /// Report a failed operation. Returns whether anything was emitted.
    pub fn report_failure(&self, error: &UpdaterError) -> bool {
        if !self.enabled || !Self::is_reportable(error) {
            return false;
        }
        info!(
            target: METRICS_TARGET,
            event = "failure",
            error_name = error.name(),
            error_code = error.code(),
            error_message = %error,
            "Updater failure"
        );
        #[cfg(feature = "otel")]
        instruments::FAILURE_TOTAL.add(1, &[opentelemetry::KeyValue::new("error", error.name())]);
        true
    }

    /// Report a successfully applied update. Returns whether anything was
    /// emitted.
    pub fn report_applied(&self, checksum: &str, version: &str) -> bool {
        if !self.enabled {
            return false;
        }
        info!(
            target: METRICS_TARGET,
            event = "applied",
            checksum = %checksum,
            version = %version,
            "Update applied"
        );
        #[cfg(feature = "otel")]
        instruments::APPLIED_TOTAL.add(1, &[]);
        true
    }
}
