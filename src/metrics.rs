//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use lazy_static::lazy_static;
use prometheus::{Gauge, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::Once;

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // HTTP Metrics
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("rustpub_http_requests_total", "Total number of HTTP requests"),
        &["method", "endpoint", "status"]
    ).expect("metric can be created");
    pub static ref HTTP_REQUEST_DURATION_SECONDS: prometheus::HistogramVec = prometheus::HistogramVec::new(
        HistogramOpts::new(
            "rustpub_http_request_duration_seconds",
            "HTTP request duration in seconds"
        ).buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        &["method", "endpoint"]
    ).expect("metric can be created");

    // Inbox Metrics
    pub static ref ACTIVITIES_RECEIVED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("rustpub_activities_received_total", "Inbound activities persisted, by declared type"),
        &["activity_type"]
    ).expect("metric can be created");
    pub static ref SIGNATURE_FAILURES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("rustpub_signature_failures_total", "Inbound requests whose signature did not verify"),
        &["reason"]
    ).expect("metric can be created");

    // Federation Metrics
    pub static ref FEDERATION_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("rustpub_federation_requests_total", "Total number of outbound federation requests"),
        &["method", "status"]
    ).expect("metric can be created");
    pub static ref FEDERATION_REQUEST_DURATION_SECONDS: prometheus::HistogramVec = prometheus::HistogramVec::new(
        HistogramOpts::new(
            "rustpub_federation_request_duration_seconds",
            "Outbound federation request duration in seconds"
        ).buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["method"]
    ).expect("metric can be created");

    // Resolver Metrics
    pub static ref RESOLVER_HITS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("rustpub_resolver_hits_total", "find-or-create lookups answered from storage"),
        &["kind"]
    ).expect("metric can be created");
    pub static ref RESOLVER_MISSES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("rustpub_resolver_misses_total", "find-or-create lookups that fetched the remote object"),
        &["kind"]
    ).expect("metric can be created");

    // Delivery Metrics
    pub static ref ACTIVITIES_SENT_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("rustpub_activities_sent_total", "Outbound activities delivered, by type"),
        &["activity_type"]
    ).expect("metric can be created");
    pub static ref DELIVERY_RETRIES_TOTAL: IntCounter = IntCounter::new(
        "rustpub_delivery_retries_total",
        "Delivery attempts rescheduled after a transient failure"
    ).expect("metric can be created");
    pub static ref DELIVERY_DEAD_LETTERS_TOTAL: IntCounter = IntCounter::new(
        "rustpub_delivery_dead_letters_total",
        "Deliveries moved to the dead-letter table"
    ).expect("metric can be created");
    pub static ref DELIVERY_QUEUE_DEPTH: IntGauge = IntGauge::new(
        "rustpub_delivery_queue_depth",
        "Jobs waiting in the delivery queue"
    ).expect("metric can be created");

    // Application Metrics
    pub static ref APP_UPTIME_SECONDS: Gauge = Gauge::new(
        "rustpub_app_uptime_seconds",
        "Application uptime in seconds"
    ).expect("metric can be created");

    // Error Metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("rustpub_errors_total", "Total number of error responses"),
        &["error_type"]
    ).expect("metric can be created");
}

static INIT: Once = Once::new();

/// Initialize metrics registry.
///
/// Safe to call more than once; only the first call registers.
pub fn init_metrics() {
    INIT.call_once(|| {
        REGISTRY
            .register(Box::new(HTTP_REQUESTS_TOTAL.clone()))
            .expect("HTTP_REQUESTS_TOTAL can be registered");
        REGISTRY
            .register(Box::new(HTTP_REQUEST_DURATION_SECONDS.clone()))
            .expect("HTTP_REQUEST_DURATION_SECONDS can be registered");
        REGISTRY
            .register(Box::new(ACTIVITIES_RECEIVED_TOTAL.clone()))
            .expect("ACTIVITIES_RECEIVED_TOTAL can be registered");
        REGISTRY
            .register(Box::new(SIGNATURE_FAILURES_TOTAL.clone()))
            .expect("SIGNATURE_FAILURES_TOTAL can be registered");
        REGISTRY
            .register(Box::new(FEDERATION_REQUESTS_TOTAL.clone()))
            .expect("FEDERATION_REQUESTS_TOTAL can be registered");
        REGISTRY
            .register(Box::new(FEDERATION_REQUEST_DURATION_SECONDS.clone()))
            .expect("FEDERATION_REQUEST_DURATION_SECONDS can be registered");
        REGISTRY
            .register(Box::new(RESOLVER_HITS_TOTAL.clone()))
            .expect("RESOLVER_HITS_TOTAL can be registered");
        REGISTRY
            .register(Box::new(RESOLVER_MISSES_TOTAL.clone()))
            .expect("RESOLVER_MISSES_TOTAL can be registered");
        REGISTRY
            .register(Box::new(ACTIVITIES_SENT_TOTAL.clone()))
            .expect("ACTIVITIES_SENT_TOTAL can be registered");
        REGISTRY
            .register(Box::new(DELIVERY_RETRIES_TOTAL.clone()))
            .expect("DELIVERY_RETRIES_TOTAL can be registered");
        REGISTRY
            .register(Box::new(DELIVERY_DEAD_LETTERS_TOTAL.clone()))
            .expect("DELIVERY_DEAD_LETTERS_TOTAL can be registered");
        REGISTRY
            .register(Box::new(DELIVERY_QUEUE_DEPTH.clone()))
            .expect("DELIVERY_QUEUE_DEPTH can be registered");
        REGISTRY
            .register(Box::new(APP_UPTIME_SECONDS.clone()))
            .expect("APP_UPTIME_SECONDS can be registered");
        REGISTRY
            .register(Box::new(ERRORS_TOTAL.clone()))
            .expect("ERRORS_TOTAL can be registered");

        tracing::info!("Metrics registry initialized");
    });
}
