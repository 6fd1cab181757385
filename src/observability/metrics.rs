use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder};

const NAMESPACE: &str = "beacon";

/// Prometheus metrics for one presence session.
///
/// Each session owns its registry, so several sessions can live in one
/// process without name clashes.
pub struct MetricsRegistry {
	registry: Registry,

	// Reconciliation
	pub merges_applied_total: IntCounter,
	pub merges_stale_total: IntCounter,
	pub merges_duplicate_total: IntCounter,

	// Outbound delivery
	pub push_attempts_total: IntCounter,
	pub push_successes_total: IntCounter,
	pub push_failures_total: IntCounter,
	pub delivery_failures_total: IntCounter,
	pub queue_depth: IntGauge,
	pub push_latency_ms: Histogram,

	// Scheduling
	pub sync_runs_total: IntCounter,
	pub subscription_restarts_total: IntCounter,
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
	let counter = IntCounter::with_opts(Opts::new(name, help).namespace(NAMESPACE))?;
	registry.register(Box::new(counter.clone()))?;
	Ok(counter)
}

impl MetricsRegistry {
	pub fn new() -> prometheus::Result<Self> {
		let registry = Registry::new();

		let merges_applied_total = counter(
			&registry,
			"merges_applied_total",
			"Records that replaced the stored record for their owner",
		)?;
		let merges_stale_total = counter(
			&registry,
			"merges_stale_total",
			"Records rejected as older than the stored record",
		)?;
		let merges_duplicate_total = counter(
			&registry,
			"merges_duplicate_total",
			"Records rejected as redeliveries of the stored record",
		)?;

		let push_attempts_total = counter(
			&registry,
			"push_attempts_total",
			"Outbound pushes attempted",
		)?;
		let push_successes_total = counter(
			&registry,
			"push_successes_total",
			"Outbound pushes acknowledged by the remote store",
		)?;
		let push_failures_total = counter(
			&registry,
			"push_failures_total",
			"Outbound pushes that failed",
		)?;
		let delivery_failures_total = counter(
			&registry,
			"delivery_failures_total",
			"Updates dropped without delivery",
		)?;

		let queue_depth = IntGauge::with_opts(
			Opts::new("queue_depth", "Updates waiting in the outbound queue").namespace(NAMESPACE),
		)?;
		registry.register(Box::new(queue_depth.clone()))?;

		let push_latency_ms = Histogram::with_opts(
			HistogramOpts::new("push_latency_ms", "Push round trip latency in milliseconds")
				.namespace(NAMESPACE)
				.buckets(vec![1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0]),
		)?;
		registry.register(Box::new(push_latency_ms.clone()))?;

		let sync_runs_total = counter(&registry, "sync_runs_total", "Sync runs started")?;
		let subscription_restarts_total = counter(
			&registry,
			"subscription_restarts_total",
			"Times the inbound subscription was re-established",
		)?;

		Ok(Self {
			registry,
			merges_applied_total,
			merges_stale_total,
			merges_duplicate_total,
			push_attempts_total,
			push_successes_total,
			push_failures_total,
			delivery_failures_total,
			queue_depth,
			push_latency_ms,
			sync_runs_total,
			subscription_restarts_total,
		})
	}

	/// Encode metrics in Prometheus text format
	pub fn encode(&self) -> String {
		let encoder = TextEncoder::new();
		let metric_families = self.registry.gather();
		match encoder.encode_to_string(&metric_families) {
			Ok(s) => s,
			Err(e) => {
				log::error!("Failed to encode metrics: {}", e);
				String::new()
			}
		}
	}
}
