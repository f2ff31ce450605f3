use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

#[derive(Parser)]
#[command(name = "llmgateway", version, about = "LLM-interactive reverse proxy")]
struct Args {
	/// JSON config file, read once at startup.
	#[arg(long)]
	config: Option<PathBuf>,

	/// Listen host override.
	#[arg(long)]
	host: Option<String>,

	/// Listen port override.
	#[arg(long)]
	port: Option<u16>,

	/// Default log filter when RUST_LOG is unset.
	#[arg(long, default_value = "info")]
	log: String,
}

#[tokio::main]
async fn main() -> ExitCode {
	let args = Args::parse();
	llmgateway::telemetry::init(&args.log);

	let config = match llmgateway::config::load(args.config) {
		Ok(mut config) => {
			if let Some(host) = args.host {
				config.host = host;
			}
			if let Some(port) = args.port {
				config.port = port;
			}
			config
		},
		Err(err) => {
			tracing::error!(%err, "invalid configuration");
			return ExitCode::FAILURE;
		},
	};

	match llmgateway::app::run(config).await {
		Ok(()) => ExitCode::SUCCESS,
		Err(err) => {
			tracing::error!(%err, "startup failed");
			ExitCode::FAILURE
		},
	}
}
