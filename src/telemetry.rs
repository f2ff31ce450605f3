use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. `RUST_LOG` wins over the CLI
/// default; safe to call once at startup only.
pub fn init(default_filter: &str) {
	let filter = EnvFilter::try_from_default_env()
		.unwrap_or_else(|_| EnvFilter::new(default_filter));
	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_target(false)
		.init();
}
