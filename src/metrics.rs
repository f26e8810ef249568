use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum IntrospectionOutcome {
    Accepted,
    Rejected,
    Transport,
    Decode,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct IntrospectionLabels {
    pub outcome: IntrospectionOutcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum GateDecision {
    Allowed,
    Denied,
    WrongIdentity,
    Preflight,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct GateLabels {
    pub decision: GateDecision,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum DeliveryOutcome {
    Accepted,
    UnknownFeed,
    BadSignature,
    Unsigned,
    BackendError,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DeliveryLabels {
    pub outcome: DeliveryOutcome,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Every Prometheus metric exposed by the gate.
pub struct Metrics {
    // -- token cache --
    pub auth_cache_hits: Counter,
    pub auth_cache_misses: Counter,
    pub auth_cache_write_failures: Counter,

    // -- introspection --
    pub introspection_requests: Family<IntrospectionLabels, Counter>,

    // -- gate --
    pub auth_gate_decisions: Family<GateLabels, Counter>,

    // -- websub --
    pub webhook_deliveries: Family<DeliveryLabels, Counter>,
    pub webhook_verifications: Counter,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let auth_cache_hits = Counter::default();
        registry.register(
            "feedgate_auth_cache_hits",
            "Token cache hits",
            auth_cache_hits.clone(),
        );

        let auth_cache_misses = Counter::default();
        registry.register(
            "feedgate_auth_cache_misses",
            "Token cache misses (including unreadable entries)",
            auth_cache_misses.clone(),
        );

        let auth_cache_write_failures = Counter::default();
        registry.register(
            "feedgate_auth_cache_write_failures",
            "Token cache writes that failed after a successful introspection",
            auth_cache_write_failures.clone(),
        );

        let introspection_requests = Family::<IntrospectionLabels, Counter>::default();
        registry.register(
            "feedgate_introspection_requests",
            "Token endpoint calls by outcome",
            introspection_requests.clone(),
        );

        let auth_gate_decisions = Family::<GateLabels, Counter>::default();
        registry.register(
            "feedgate_auth_gate_decisions",
            "Protected API requests by gate decision",
            auth_gate_decisions.clone(),
        );

        let webhook_deliveries = Family::<DeliveryLabels, Counter>::default();
        registry.register(
            "feedgate_webhook_deliveries",
            "WebSub content deliveries by outcome",
            webhook_deliveries.clone(),
        );

        let webhook_verifications = Counter::default();
        registry.register(
            "feedgate_webhook_verifications",
            "WebSub verification requests answered",
            webhook_verifications.clone(),
        );

        Self {
            auth_cache_hits,
            auth_cache_misses,
            auth_cache_write_failures,
            introspection_requests,
            auth_gate_decisions,
            webhook_deliveries,
            webhook_verifications,
        }
    }

    pub fn introspection(&self, outcome: IntrospectionOutcome) {
        self.introspection_requests
            .get_or_create(&IntrospectionLabels { outcome })
            .inc();
    }

    pub fn gate(&self, decision: GateDecision) {
        self.auth_gate_decisions
            .get_or_create(&GateLabels { decision })
            .inc();
    }

    pub fn delivery(&self, outcome: DeliveryOutcome) {
        self.webhook_deliveries
            .get_or_create(&DeliveryLabels { outcome })
            .inc();
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in [`crate::AppState`].
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all gate metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the registry in OpenMetrics text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
