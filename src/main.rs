use std::sync::Arc;

use clap::Parser;
use tokio::task::JoinSet;
use tracing::{Instrument, error, info, info_span};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use docker_xds::config::Config;
use docker_xds::reconcile::Reconciler;
use docker_xds::registry::docker::Session;
use docker_xds::signal::Shutdown;
use docker_xds::xds::cache::SnapshotCache;
use docker_xds::xds::server;

const EXIT_FAILURE: i32 = 3;

#[derive(Parser, Debug)]
#[command(version, about = "Publishes Envoy xDS configuration discovered from Docker container labels", long_about = None)]
struct Args {
	/// Domain name for routes
	#[arg(long, default_value = "*")]
	domain: String,

	/// Detailed log level
	#[arg(long)]
	verbose: bool,

	/// xDS management server port
	#[arg(long, default_value_t = 18000)]
	port: u16,

	/// Node ID
	#[arg(long = "nodeID", default_value = "test-id")]
	node_id: String,
}

fn init_log(verbose: bool) {
	let default_directive = if verbose { "debug" } else { "info" };
	// verbose mode also traces each operation's begin and end
	let span_events = if verbose {
		FmtSpan::NEW | FmtSpan::CLOSE
	} else {
		FmtSpan::NONE
	};
	tracing_subscriber::fmt()
		.with_env_filter(
			EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| EnvFilter::new(default_directive)),
		)
		.with_writer(std::io::stderr)
		.with_file(verbose)
		.with_line_number(verbose)
		.with_span_events(span_events)
		.init();
}

#[tokio::main]
async fn main() {
	let args = Args::parse();
	let config = Config {
		domain: args.domain,
		node_id: args.node_id,
		port: args.port,
		verbose: args.verbose,
	};
	init_log(config.verbose);

	if let Err(e) = run(config).await {
		error!("{e:#}");
		std::process::exit(EXIT_FAILURE);
	}
	info!("done");
}

async fn run(config: Config) -> anyhow::Result<()> {
	let shutdown = Shutdown::new();
	let token = shutdown.token();
	tokio::spawn(shutdown.clone().wait_for_interrupt());

	let cache = Arc::new(SnapshotCache::new(config.node_id.clone()));
	let session = Session::connect()?;
	let (updates, discovery) = session.run(token.clone());

	let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();
	{
		let cache = cache.clone();
		let token = token.clone();
		let port = config.port;
		tasks.spawn(
			async move { server::run(cache, port, token).await.map_err(Into::into) }
				.instrument(info_span!("xds")),
		);
	}
	tasks.spawn(
		async move { discovery.await.map_err(Into::into) }.instrument(info_span!("discovery")),
	);
	{
		let reconciler = Reconciler::new(cache, config.domain.clone());
		let token = token.clone();
		tasks.spawn(
			async move { reconciler.run(updates, token).await.map_err(Into::into) }
				.instrument(info_span!("reconcile")),
		);
	}

	let mut first_error = None;
	while let Some(joined) = tasks.join_next().await {
		// one task stopping stops them all
		shutdown.trigger();
		match joined {
			Ok(Ok(())) => {},
			Ok(Err(e)) => {
				if first_error.is_none() {
					first_error = Some(e);
				}
			},
			Err(e) => {
				if first_error.is_none() {
					first_error = Some(e.into());
				}
			},
		}
	}
	match first_error {
		Some(e) => Err(e),
		None => Ok(()),
	}
}
