//! Prometheus metrics

#[cfg(feature = "metrics")]
mod inner {
    use once_cell::sync::Lazy;
    use prometheus::core::Collector;
    use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
    use tracing::warn;

    pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

    fn register<C: Collector + Clone + 'static>(collector: C) -> C {
        if let Err(e) = REGISTRY.register(Box::new(collector.clone())) {
            warn!("Failed to register metric: {}", e);
        }
        collector
    }

    fn counter(name: &str, help: &str) -> IntCounter {
        register(IntCounter::new(name, help).expect("static metric definition is valid"))
    }

    fn gauge(name: &str, help: &str) -> IntGauge {
        register(IntGauge::new(name, help).expect("static metric definition is valid"))
    }

    pub static REPORTS_ACCEPTED: Lazy<IntCounter> =
        Lazy::new(|| counter("coldgate_reports_accepted_total", "Reports handed to the ingestion engine"));

    pub static REPORTS_REJECTED: Lazy<IntCounterVec> = Lazy::new(|| {
        let opts = Opts::new("coldgate_reports_rejected_total", "Requests closed without a response, by reason");
        register(IntCounterVec::new(opts, &["reason"]).expect("static metric definition is valid"))
    });

    pub static HANDSHAKE_FAILURES: Lazy<IntCounter> =
        Lazy::new(|| counter("coldgate_handshake_failures_total", "Failed or timed out TLS handshakes"));

    pub static BLOCKED_CONNECTIONS: Lazy<IntCounter> =
        Lazy::new(|| counter("coldgate_blocked_connections_total", "Connections dropped by the blocklist"));

    pub static BANS_TOTAL: Lazy<IntCounter> =
        Lazy::new(|| counter("coldgate_bans_total", "Addresses added to the blocklist"));

    pub static NOTIFICATIONS_SENT: Lazy<IntCounter> =
        Lazy::new(|| counter("coldgate_notifications_sent_total", "Alarm notifications delivered"));

    pub static NOTIFICATIONS_FAILED: Lazy<IntCounter> =
        Lazy::new(|| counter("coldgate_notifications_failed_total", "Alarm notifications that failed"));

    pub static PERSISTENCE_FAILURES: Lazy<IntCounter> =
        Lazy::new(|| counter("coldgate_persistence_failures_total", "Reports that could not be stored"));

    pub static COMMANDS_DELIVERED: Lazy<IntCounter> =
        Lazy::new(|| counter("coldgate_commands_delivered_total", "Queued commands handed to devices"));

    pub static ACTIVE_SESSIONS: Lazy<IntGauge> =
        Lazy::new(|| gauge("coldgate_active_sessions", "Connections currently being served"));

    pub static START_TIME: Lazy<IntGauge> = Lazy::new(|| {
        let g = gauge("coldgate_start_time_seconds", "Unix timestamp when coldgate started");
        g.set(chrono::Utc::now().timestamp());
        g
    });

    /// Force registration so every series shows up from the first scrape.
    pub fn init() {
        let _ = &*START_TIME;
        let _ = &*ACTIVE_SESSIONS;
        let _ = &*REPORTS_ACCEPTED;
        let _ = &*REPORTS_REJECTED;
        let _ = &*HANDSHAKE_FAILURES;
        let _ = &*BLOCKED_CONNECTIONS;
        let _ = &*BANS_TOTAL;
        let _ = &*NOTIFICATIONS_SENT;
        let _ = &*NOTIFICATIONS_FAILED;
        let _ = &*PERSISTENCE_FAILURES;
        let _ = &*COMMANDS_DELIVERED;
    }

    /// Text exposition of every registered metric.
    pub fn render() -> String {
        let encoder = TextEncoder::new();
        encoder.encode_to_string(&REGISTRY.gather()).unwrap_or_default()
    }
}

#[cfg(feature = "metrics")]
pub use inner::*;

// Stub implementations when metrics feature is disabled
#[cfg(not(feature = "metrics"))]
pub mod stubs {
    pub struct NoOpCounter;
    impl NoOpCounter {
        pub fn inc(&self) {}
        pub fn with_label_values(&self, _: &[&str]) -> Self {
            Self
        }
    }

    pub struct NoOpGauge;
    impl NoOpGauge {
        pub fn inc(&self) {}
        pub fn dec(&self) {}
        pub fn set(&self, _: i64) {}
    }

    pub static REPORTS_ACCEPTED: NoOpCounter = NoOpCounter;
    pub static REPORTS_REJECTED: NoOpCounter = NoOpCounter;
    pub static HANDSHAKE_FAILURES: NoOpCounter = NoOpCounter;
    pub static BLOCKED_CONNECTIONS: NoOpCounter = NoOpCounter;
    pub static BANS_TOTAL: NoOpCounter = NoOpCounter;
    pub static NOTIFICATIONS_SENT: NoOpCounter = NoOpCounter;
    pub static NOTIFICATIONS_FAILED: NoOpCounter = NoOpCounter;
    pub static PERSISTENCE_FAILURES: NoOpCounter = NoOpCounter;
    pub static COMMANDS_DELIVERED: NoOpCounter = NoOpCounter;
    pub static ACTIVE_SESSIONS: NoOpGauge = NoOpGauge;

    pub fn init() {}

    pub fn render() -> String {
        String::new()
    }
}

#[cfg(not(feature = "metrics"))]
pub use stubs::*;
