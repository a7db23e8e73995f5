//! Prometheus instrumentation for the outbox publisher.

use prometheus::{IntCounter, IntGauge, Opts, Registry};

use crate::database::OutboxStats;

/// Counters and gauges describing one publisher's view of the outbox.
///
/// Registration is explicit: the caller owns the [`Registry`] and decides
/// what to do when a collector of the same name already exists there
/// (typically a second publisher in the same process). The `publisher`
/// label keeps concurrent publishers apart on a shared registry.
#[derive(Clone)]
pub struct OutboxMetrics {
    pending: IntGauge,
    oldest_pending_age_seconds: IntGauge,
    published: IntCounter,
    publish_failures: IntCounter,
}

impl OutboxMetrics {
    pub fn register(registry: &Registry, publisher: &str) -> prometheus::Result<Self> {
        let opts = |name: &str, help: &str| {
            Opts::new(name, help).const_label("publisher", publisher.to_string())
        };

        let metrics = Self {
            pending: IntGauge::with_opts(opts(
                "lightbus_outbox_pending",
                "Outbox rows awaiting publication",
            ))?,
            oldest_pending_age_seconds: IntGauge::with_opts(opts(
                "lightbus_outbox_oldest_pending_age_seconds",
                "Age in seconds of the oldest outbox row awaiting publication",
            ))?,
            published: IntCounter::with_opts(opts(
                "lightbus_outbox_published_total",
                "Outbox rows published through the child transport and removed",
            ))?,
            publish_failures: IntCounter::with_opts(opts(
                "lightbus_outbox_publish_failures_total",
                "Publish attempts rejected by the child transport",
            ))?,
        };

        registry.register(Box::new(metrics.pending.clone()))?;
        registry.register(Box::new(metrics.oldest_pending_age_seconds.clone()))?;
        registry.register(Box::new(metrics.published.clone()))?;
        registry.register(Box::new(metrics.publish_failures.clone()))?;
        Ok(metrics)
    }

    /// Refresh the backlog gauges from an outbox snapshot.
    pub fn observe_backlog(&self, stats: OutboxStats) {
        self.pending.set(stats.pending);
        self.oldest_pending_age_seconds.set(stats.oldest_age_seconds);
    }

    pub fn record_published(&self) {
        self.published.inc();
    }

    pub fn record_publish_failure(&self) {
        self.publish_failures.inc();
    }

    pub fn published_total(&self) -> u64 {
        self.published.get()
    }

    pub fn publish_failures_total(&self) -> u64 {
        self.publish_failures.get()
    }

    pub fn pending_rows(&self) -> i64 {
        self.pending.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_registration_is_an_error() {
        let registry = Registry::new();
        OutboxMetrics::register(&registry, "a").unwrap();
        assert!(OutboxMetrics::register(&registry, "a").is_err());
    }

    #[test]
    fn publishers_are_kept_apart_by_label() {
        let registry = Registry::new();
        OutboxMetrics::register(&registry, "a").unwrap();
        OutboxMetrics::register(&registry, "b").unwrap();

        let families = registry.gather();
        let published = families
            .iter()
            .find(|family| family.get_name() == "lightbus_outbox_published_total")
            .expect("counter family registered");
        assert_eq!(published.get_metric().len(), 2);
    }

    #[test]
    fn backlog_observation_sets_both_gauges() {
        let registry = Registry::new();
        let metrics = OutboxMetrics::register(&registry, "a").unwrap();

        metrics.observe_backlog(OutboxStats {
            pending: 7,
            oldest_age_seconds: 42,
        });
        assert_eq!(metrics.pending_rows(), 7);
        assert_eq!(metrics.oldest_pending_age_seconds.get(), 42);
    }
}
