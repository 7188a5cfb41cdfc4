//! Device health monitoring
//!
//! One background task walks the registry in sweeps. A device seen within
//! the freshness window is left alone; any other device is sent
//! `manager:ping`. A successful send counts as proof of life. A failed send
//! marks the device `Offline`, and a send on a closed connection also
//! closes the session so the supervisor redials it.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span};

use lz_core::config::HealthConfig;
use lz_core::time::current_time_millis;
use lz_protocol::{command, Envelope};

use crate::registry::{DeviceRegistry, PingCandidate};

/// Outcome of one pass over the registry
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Devices a keepalive was sent to
    pub pinged: usize,
    /// Devices skipped because they were seen recently
    pub skipped: usize,
    /// Devices whose keepalive could not be sent
    pub failed: usize,
}

/// Periodically pings registered devices
pub struct HealthMonitor {
    registry: Arc<DeviceRegistry>,
    config: HealthConfig,
    span: Span,
}

impl HealthMonitor {
    /// Create a new health monitor
    pub fn new(registry: Arc<DeviceRegistry>, config: HealthConfig, span: Span) -> Self {
        Self {
            registry,
            config,
            span,
        }
    }

    /// Start the sweep loop on the runtime
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        let span = self.span.clone();
        tokio::spawn(self.run(cancel).instrument(span))
    }

    /// Sweep until cancelled, sleeping `interval` between sweeps
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(
            "Health monitor running (interval {:?}, freshness {:?})",
            self.config.interval,
            self.config.freshness
        );

        loop {
            let report = tokio::select! {
                _ = cancel.cancelled() => break,
                report = self.sweep() => report,
            };

            tracing::debug!(
                "Sweep done: {} pinged, {} fresh, {} failed",
                report.pinged,
                report.skipped,
                report.failed
            );

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }

        tracing::info!("Health monitor stopped");
    }

    /// One pass over every registered device.
    ///
    /// Consecutive pings are spaced by the configured pacing.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        for addr in self.registry.addresses() {
            let now = current_time_millis();
            let session = match self
                .registry
                .ping_candidate(&addr, now, self.config.freshness)
            {
                PingCandidate::Due(session) => session,
                PingCandidate::Fresh => {
                    report.skipped += 1;
                    continue;
                }
                PingCandidate::Gone => continue,
            };

            if report.pinged + report.failed > 0 && !self.config.pacing.is_zero() {
                tokio::time::sleep(self.config.pacing).await;
            }

            let outcome = session.send(&Envelope::manager(command::PING)).await;
            match &outcome {
                Ok(()) => report.pinged += 1,
                Err(_) => report.failed += 1,
            }

            self.registry
                .record_ping(&addr, &session, outcome.as_ref().map(|_| ()), current_time_millis());
        }

        report
    }
}
