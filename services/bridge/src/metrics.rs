//! Process counters and the Prometheus text exposition.

use fb_historian::writer::WriterCounters;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

#[derive(Default)]
pub struct GatewayMetrics {
    pub connections_current: AtomicI64,
    pub connections_total: AtomicU64,
    pub sessions_evicted: AtomicU64,
    pub auth_failures: AtomicU64,
    pub frames_received: AtomicU64,
    pub frames_sent: AtomicU64,
    pub publishes: AtomicU64,
    pub publish_errors: AtomicU64,
    pub rate_limited: AtomicU64,
    pub not_authorized: AtomicU64,
    pub validation_failures: AtomicU64,
    pub subscriptions_active: AtomicI64,
    pub deliveries_enqueued: AtomicU64,
    pub deliveries_dropped: AtomicU64,
    pub pings_sent: AtomicU64,
    historian: StdMutex<Option<Arc<WriterCounters>>>,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        GatewayMetrics::default()
    }

    /// Attach the historian writer counters once the pipeline is up.
    pub fn set_historian(&self, counters: Arc<WriterCounters>) {
        *self.historian.lock().expect("metrics mutex poisoned") = Some(counters);
    }

    /// Render every counter in the Prometheus text format.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(2048);
        gauge(
            &mut out,
            "bridge_connections_current",
            "Currently connected sessions.",
            self.connections_current.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "bridge_connections_total",
            "Sessions accepted since start.",
            self.connections_total.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "bridge_sessions_evicted_total",
            "Sessions replaced by a newer connection for the same client.",
            self.sessions_evicted.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "bridge_auth_failures_total",
            "Rejected authentication attempts.",
            self.auth_failures.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "bridge_frames_received_total",
            "Frames read from client sockets.",
            self.frames_received.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "bridge_frames_sent_total",
            "Frames written to client sockets.",
            self.frames_sent.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "bridge_publishes_total",
            "Client publishes stored on the bus.",
            self.publishes.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "bridge_publish_errors_total",
            "Client publishes that failed after retries.",
            self.publish_errors.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "bridge_rate_limited_total",
            "Frames rejected by the per-client rate limiter.",
            self.rate_limited.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "bridge_not_authorized_total",
            "Frames rejected by subject authorization.",
            self.not_authorized.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "bridge_validation_failures_total",
            "Frames rejected by the validator.",
            self.validation_failures.load(Ordering::Relaxed),
        );
        gauge(
            &mut out,
            "bridge_subscriptions_active",
            "Active client subscriptions.",
            self.subscriptions_active.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "bridge_deliveries_enqueued_total",
            "Deliveries enqueued to outbound buffers.",
            self.deliveries_enqueued.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "bridge_deliveries_dropped_total",
            "Deliveries discarded by drop-oldest buffers.",
            self.deliveries_dropped.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "bridge_pings_sent_total",
            "Server liveness pings sent to idle sessions.",
            self.pings_sent.load(Ordering::Relaxed),
        );

        if let Some(historian) = self
            .historian
            .lock()
            .expect("metrics mutex poisoned")
            .as_ref()
        {
            counter(
                &mut out,
                "historian_batches_written_total",
                "Historian batches committed to the store.",
                historian.batches_written.load(Ordering::Relaxed),
            );
            counter(
                &mut out,
                "historian_records_written_total",
                "Historian records committed to the store.",
                historian.records_written.load(Ordering::Relaxed),
            );
            counter(
                &mut out,
                "historian_batches_dropped_total",
                "Historian batches dropped after a failed retry.",
                historian.batches_dropped.load(Ordering::Relaxed),
            );
            counter(
                &mut out,
                "historian_records_dropped_total",
                "Historian records lost with dropped batches.",
                historian.records_dropped.load(Ordering::Relaxed),
            );
        }
        out
    }
}

fn counter(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} counter");
    let _ = writeln!(out, "{name} {value}");
}

fn gauge(out: &mut String, name: &str, help: &str, value: i64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} gauge");
    let _ = writeln!(out, "{name} {value}");
}
