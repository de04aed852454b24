use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bollard::Docker;
use bollard::container::ListContainersOptions;
use bollard::models::{ContainerSummary, EventMessage};
use bollard::system::EventsOptions;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Level, debug, info, instrument, warn};

use super::{EndpointUpdateRequest, catalog};

/// Delay between a runtime event and the next scan, giving the runtime time
/// to finish address assignment for the affected container.
const SETTLE_DELAY: Duration = Duration::from_secs(5);

/// Cumulative error budget over the loop's lifetime.
const MAX_ERRORS: u32 = 10;

const EVENT_START: &str = "start";
const EVENT_DIE: &str = "die";

pub type EventStream =
	Pin<Box<dyn Stream<Item = Result<EventMessage, bollard::errors::Error>> + Send>>;

#[derive(thiserror::Error, Debug)]
pub enum DiscoveryError {
	#[error("failed to connect to the docker daemon: {0}")]
	Connect(#[source] bollard::errors::Error),
	#[error("too many discovery errors ({0})")]
	TooManyErrors(u32),
}

/// Surface of the container runtime the discovery loop drives.
pub trait ContainerRuntime: Send + Sync + 'static {
	/// Container lifecycle events, filtered to starts and deaths.
	fn subscribe_events(&self) -> EventStream;

	/// The currently running containers.
	fn list_running(
		&self,
	) -> impl Future<Output = Result<Vec<ContainerSummary>, bollard::errors::Error>> + Send;
}

/// The real Docker engine, over bollard.
pub struct DockerRuntime {
	api: Docker,
}

impl ContainerRuntime for DockerRuntime {
	fn subscribe_events(&self) -> EventStream {
		let filters = HashMap::from([
			("type".to_string(), vec!["container".to_string()]),
			(
				"event".to_string(),
				vec![EVENT_START.to_string(), EVENT_DIE.to_string()],
			),
		]);
		Box::pin(self.api.events(Some(EventsOptions::<String> {
			filters,
			..Default::default()
		})))
	}

	async fn list_running(&self) -> Result<Vec<ContainerSummary>, bollard::errors::Error> {
		let filters = HashMap::from([("status".to_string(), vec!["running".to_string()])]);
		self.api
			.list_containers(Some(ListContainersOptions {
				filters,
				..Default::default()
			}))
			.await
	}
}

/// Owns the runtime session for the discovery loop.
pub struct Session<R = DockerRuntime> {
	runtime: R,
}

impl Session<DockerRuntime> {
	pub fn connect() -> Result<Self, DiscoveryError> {
		let api = Docker::connect_with_local_defaults().map_err(DiscoveryError::Connect)?;
		Ok(Session::new(DockerRuntime { api }))
	}
}

impl<R: ContainerRuntime> Session<R> {
	pub fn new(runtime: R) -> Self {
		Self { runtime }
	}

	/// Hands back the update channel and the scan loop driving it. The
	/// channel closes when the loop exits; the loop exits on cancellation or
	/// once the error budget is spent, whichever comes first.
	pub fn run(
		self,
		token: CancellationToken,
	) -> (
		mpsc::Receiver<EndpointUpdateRequest>,
		impl Future<Output = Result<(), DiscoveryError>>,
	) {
		let (tx, rx) = mpsc::channel(1);
		(rx, self.run_loop(tx, token))
	}

	async fn run_loop(
		self,
		tx: mpsc::Sender<EndpointUpdateRequest>,
		token: CancellationToken,
	) -> Result<(), DiscoveryError> {
		let mut events = self.runtime.subscribe_events();
		info!("subscribed to container events");

		let mut err_count: u32 = 0;
		loop {
			let scanned = tokio::select! {
				biased;
				_ = token.cancelled() => {
					info!("terminating scan loop");
					return Ok(());
				},
				scanned = self.scan() => scanned,
			};
			match scanned {
				Ok(update) => {
					tokio::select! {
						biased;
						_ = token.cancelled() => {
							info!("terminating scan loop");
							return Ok(());
						},
						permit = tx.reserve() => match permit {
							Ok(permit) => {
								debug!(endpoints = update.endpoints.len(), "sending update request");
								permit.send(update);
							},
							// consumer went away; nothing left to feed
							Err(_) => return Ok(()),
						},
					}
				},
				Err(e) => {
					warn!("error listing containers: {e}");
					err_count += 1;
				},
			}

			debug!("waiting for a container event");
			tokio::select! {
				biased;
				_ = token.cancelled() => {
					info!("exiting after receiving request to end event loop");
					return Ok(());
				},
				event = events.next() => match event {
					Some(Ok(message)) => {
						let action = message.action.as_deref().unwrap_or("");
						let source = message
							.actor
							.as_ref()
							.and_then(|actor| actor.attributes.as_ref())
							.and_then(|attributes| attributes.get("image").cloned())
							.unwrap_or_default();
						info!(action, %source, "received container event");
						// let the runtime settle before rescanning
						tokio::select! {
							biased;
							_ = token.cancelled() => {
								info!("terminating scan loop");
								return Ok(());
							},
							_ = tokio::time::sleep(SETTLE_DELAY) => {},
						}
					},
					Some(Err(e)) => {
						warn!("error from event stream: {e}");
						err_count += 1;
					},
					None => {
						warn!("event stream closed");
						err_count += 1;
					},
				},
			}

			if err_count > MAX_ERRORS {
				return Err(DiscoveryError::TooManyErrors(err_count));
			}
		}
	}

	/// One full reconciliation of the running container fleet.
	#[instrument(level = Level::DEBUG, name = "scan", skip_all)]
	async fn scan(&self) -> Result<EndpointUpdateRequest, bollard::errors::Error> {
		let containers = self.runtime.list_running().await?;
		let endpoints = catalog::build_endpoints(&containers);
		debug!(
			containers = containers.len(),
			endpoints = endpoints.len(),
			"scanned runtime"
		);
		Ok(EndpointUpdateRequest::new(endpoints))
	}
}
