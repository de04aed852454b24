use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use envoy_types::pb::envoy::service::cluster::v3::cluster_discovery_service_server::{
	ClusterDiscoveryService, ClusterDiscoveryServiceServer,
};
use envoy_types::pb::envoy::service::discovery::v3::aggregated_discovery_service_server::{
	AggregatedDiscoveryService, AggregatedDiscoveryServiceServer,
};
use envoy_types::pb::envoy::service::discovery::v3::{
	DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
};
use envoy_types::pb::envoy::service::endpoint::v3::endpoint_discovery_service_server::{
	EndpointDiscoveryService, EndpointDiscoveryServiceServer,
};
use envoy_types::pb::envoy::service::listener::v3::listener_discovery_service_server::{
	ListenerDiscoveryService, ListenerDiscoveryServiceServer,
};
use envoy_types::pb::envoy::service::route::v3::route_discovery_service_server::{
	RouteDiscoveryService, RouteDiscoveryServiceServer,
};
use envoy_types::pb::envoy::service::runtime::v3::runtime_discovery_service_server::{
	RuntimeDiscoveryService, RuntimeDiscoveryServiceServer,
};
use envoy_types::pb::envoy::service::secret::v3::secret_discovery_service_server::{
	SecretDiscoveryService, SecretDiscoveryServiceServer,
};
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};
use tracing::{Level, debug, info, instrument, warn};

use super::cache::SnapshotCache;
use super::snapshot::Snapshot;
use super::{
	CLUSTER_TYPE_URL, ENDPOINT_TYPE_URL, LISTENER_TYPE_URL, ROUTE_TYPE_URL, RUNTIME_TYPE_URL,
	SECRET_TYPE_URL,
};

const GRPC_MAX_CONCURRENT_STREAMS: u32 = 1_000_000;

type SotwStream = Pin<Box<dyn Stream<Item = Result<DiscoveryResponse, Status>> + Send>>;
type DeltaStream = Pin<Box<dyn Stream<Item = Result<DeltaDiscoveryResponse, Status>> + Send>>;

const UNIMPLEMENTED_DELTA: &str = "incremental xDS is not served";

#[derive(thiserror::Error, Debug)]
pub enum ServerError {
	#[error("invalid listen address: {0}")]
	Address(#[from] std::net::AddrParseError),
	#[error("transport error: {0}")]
	Transport(#[from] tonic::transport::Error),
}

/// Starts the xDS management server and serves until the token cancels.
/// Registers the seven discovery services against the shared cache.
#[instrument(level = Level::DEBUG, skip_all, fields(port = port))]
pub async fn run(
	cache: Arc<SnapshotCache>,
	port: u16,
	token: CancellationToken,
) -> Result<(), ServerError> {
	let addr = format!("0.0.0.0:{port}").parse()?;
	let service = DiscoveryService {
		cache,
		token: token.clone(),
	};
	info!(%addr, "management server listening");
	Server::builder()
		.max_concurrent_streams(GRPC_MAX_CONCURRENT_STREAMS)
		.add_service(AggregatedDiscoveryServiceServer::new(service.clone()))
		.add_service(EndpointDiscoveryServiceServer::new(service.clone()))
		.add_service(ClusterDiscoveryServiceServer::new(service.clone()))
		.add_service(RouteDiscoveryServiceServer::new(service.clone()))
		.add_service(ListenerDiscoveryServiceServer::new(service.clone()))
		.add_service(SecretDiscoveryServiceServer::new(service.clone()))
		.add_service(RuntimeDiscoveryServiceServer::new(service))
		.serve_with_shutdown(addr, token.cancelled_owned())
		.await?;
	info!("management server stopped");
	Ok(())
}

/// State-of-the-world discovery shared by all seven services. ADS streams
/// carry their resource type in each request; the single-type services pin
/// it at registration.
#[derive(Clone)]
struct DiscoveryService {
	cache: Arc<SnapshotCache>,
	token: CancellationToken,
}

/// Per-type bookkeeping within one stream.
#[derive(Default)]
struct Subscription {
	nonce_counter: u64,
	nonce: String,
	sent_version: String,
}

impl DiscoveryService {
	/// Spawns the response side of one stream. Every request either acks the
	/// previous push or (re)subscribes its type; snapshot publishes push the
	/// new version to all subscribed types. Generic over the request source;
	/// the transport hands in a `tonic::Streaming`.
	fn open_stream<S>(&self, mut requests: S, pinned_type_url: Option<&'static str>) -> SotwStream
	where
		S: Stream<Item = Result<DiscoveryRequest, Status>> + Send + Unpin + 'static,
	{
		let cache = self.cache.clone();
		let token = self.token.clone();
		let (tx, rx) = mpsc::channel::<Result<DiscoveryResponse, Status>>(16);
		tokio::spawn(async move {
			let mut changes = cache.subscribe();
			let mut subscriptions: HashMap<String, Subscription> = HashMap::new();
			loop {
				tokio::select! {
					biased;
					_ = token.cancelled() => return,
					request = requests.next() => {
						let request = match request {
							Some(Ok(request)) => request,
							Some(Err(status)) => {
								debug!("stream error: {status}");
								return;
							},
							None => {
								debug!("client closed the stream");
								return;
							},
						};
						// Envoy sends the node only on the first message
						let node_id = request.node.as_ref().map(|n| n.id.as_str()).unwrap_or("");
						if !node_id.is_empty() && !cache.covers(node_id) {
							warn!(node_id, "no snapshot indexed for node");
							continue;
						}
						let type_url = pinned_type_url
							.map(str::to_string)
							.unwrap_or_else(|| request.type_url.clone());
						if type_url.is_empty() {
							continue;
						}
						let subscription = subscriptions.entry(type_url.clone()).or_default();
						if !request.response_nonce.is_empty()
							&& request.response_nonce == subscription.nonce
						{
							match request.error_detail {
								Some(detail) => warn!(
									%type_url,
									code = detail.code,
									message = %detail.message,
									"client rejected configuration"
								),
								None => debug!(
									%type_url,
									version = %request.version_info,
									"client acknowledged configuration"
								),
							}
							continue;
						}
						if let Some(snapshot) = cache.snapshot() {
							if send_response(&tx, &snapshot, &type_url, subscription)
								.await
								.is_err()
							{
								return;
							}
						}
					},
					changed = changes.changed() => {
						if changed.is_err() {
							return;
						}
						let Some(snapshot) = cache.snapshot() else {
							continue;
						};
						for (type_url, subscription) in subscriptions.iter_mut() {
							if subscription.sent_version != snapshot.version
								&& send_response(&tx, &snapshot, type_url, subscription)
									.await
									.is_err()
							{
								return;
							}
						}
					},
				}
			}
		});
		Box::pin(ReceiverStream::new(rx))
	}

	/// Unary state-of-the-world fetch from the current snapshot.
	fn fetch(
		&self,
		request: DiscoveryRequest,
		type_url: &str,
	) -> Result<Response<DiscoveryResponse>, Status> {
		let node_id = request.node.as_ref().map(|n| n.id.as_str()).unwrap_or("");
		if !node_id.is_empty() && !self.cache.covers(node_id) {
			return Err(Status::not_found(format!(
				"no snapshot indexed for node {node_id:?}"
			)));
		}
		let Some(snapshot) = self.cache.snapshot() else {
			return Err(Status::unavailable("no snapshot published yet"));
		};
		Ok(Response::new(DiscoveryResponse {
			version_info: snapshot.version.clone(),
			resources: snapshot.resources(type_url),
			type_url: type_url.to_string(),
			..Default::default()
		}))
	}
}

async fn send_response(
	tx: &mpsc::Sender<Result<DiscoveryResponse, Status>>,
	snapshot: &Snapshot,
	type_url: &str,
	subscription: &mut Subscription,
) -> Result<(), ()> {
	subscription.nonce_counter += 1;
	subscription.nonce = subscription.nonce_counter.to_string();
	subscription.sent_version = snapshot.version.clone();
	let resources = snapshot.resources(type_url);
	debug!(
		type_url,
		version = %snapshot.version,
		resources = resources.len(),
		"sending discovery response"
	);
	tx.send(Ok(DiscoveryResponse {
		version_info: snapshot.version.clone(),
		resources,
		type_url: type_url.to_string(),
		nonce: subscription.nonce.clone(),
		..Default::default()
	}))
	.await
	.map_err(|_| ())
}

#[tonic::async_trait]
impl AggregatedDiscoveryService for DiscoveryService {
	type StreamAggregatedResourcesStream = SotwStream;

	async fn stream_aggregated_resources(
		&self,
		request: Request<Streaming<DiscoveryRequest>>,
	) -> Result<Response<Self::StreamAggregatedResourcesStream>, Status> {
		info!("aggregated stream opened");
		Ok(Response::new(self.open_stream(request.into_inner(), None)))
	}

	type DeltaAggregatedResourcesStream = DeltaStream;

	async fn delta_aggregated_resources(
		&self,
		_request: Request<Streaming<DeltaDiscoveryRequest>>,
	) -> Result<Response<Self::DeltaAggregatedResourcesStream>, Status> {
		Err(Status::unimplemented(UNIMPLEMENTED_DELTA))
	}
}

#[tonic::async_trait]
impl EndpointDiscoveryService for DiscoveryService {
	type StreamEndpointsStream = SotwStream;

	async fn stream_endpoints(
		&self,
		request: Request<Streaming<DiscoveryRequest>>,
	) -> Result<Response<Self::StreamEndpointsStream>, Status> {
		Ok(Response::new(
			self.open_stream(request.into_inner(), Some(ENDPOINT_TYPE_URL)),
		))
	}

	type DeltaEndpointsStream = DeltaStream;

	async fn delta_endpoints(
		&self,
		_request: Request<Streaming<DeltaDiscoveryRequest>>,
	) -> Result<Response<Self::DeltaEndpointsStream>, Status> {
		Err(Status::unimplemented(UNIMPLEMENTED_DELTA))
	}

	async fn fetch_endpoints(
		&self,
		request: Request<DiscoveryRequest>,
	) -> Result<Response<DiscoveryResponse>, Status> {
		self.fetch(request.into_inner(), ENDPOINT_TYPE_URL)
	}
}

#[tonic::async_trait]
impl ClusterDiscoveryService for DiscoveryService {
	type StreamClustersStream = SotwStream;

	async fn stream_clusters(
		&self,
		request: Request<Streaming<DiscoveryRequest>>,
	) -> Result<Response<Self::StreamClustersStream>, Status> {
		Ok(Response::new(
			self.open_stream(request.into_inner(), Some(CLUSTER_TYPE_URL)),
		))
	}

	type DeltaClustersStream = DeltaStream;

	async fn delta_clusters(
		&self,
		_request: Request<Streaming<DeltaDiscoveryRequest>>,
	) -> Result<Response<Self::DeltaClustersStream>, Status> {
		Err(Status::unimplemented(UNIMPLEMENTED_DELTA))
	}

	async fn fetch_clusters(
		&self,
		request: Request<DiscoveryRequest>,
	) -> Result<Response<DiscoveryResponse>, Status> {
		self.fetch(request.into_inner(), CLUSTER_TYPE_URL)
	}
}

#[tonic::async_trait]
impl RouteDiscoveryService for DiscoveryService {
	type StreamRoutesStream = SotwStream;

	async fn stream_routes(
		&self,
		request: Request<Streaming<DiscoveryRequest>>,
	) -> Result<Response<Self::StreamRoutesStream>, Status> {
		Ok(Response::new(
			self.open_stream(request.into_inner(), Some(ROUTE_TYPE_URL)),
		))
	}

	type DeltaRoutesStream = DeltaStream;

	async fn delta_routes(
		&self,
		_request: Request<Streaming<DeltaDiscoveryRequest>>,
	) -> Result<Response<Self::DeltaRoutesStream>, Status> {
		Err(Status::unimplemented(UNIMPLEMENTED_DELTA))
	}

	async fn fetch_routes(
		&self,
		request: Request<DiscoveryRequest>,
	) -> Result<Response<DiscoveryResponse>, Status> {
		self.fetch(request.into_inner(), ROUTE_TYPE_URL)
	}
}

#[tonic::async_trait]
impl ListenerDiscoveryService for DiscoveryService {
	type StreamListenersStream = SotwStream;

	async fn stream_listeners(
		&self,
		request: Request<Streaming<DiscoveryRequest>>,
	) -> Result<Response<Self::StreamListenersStream>, Status> {
		Ok(Response::new(
			self.open_stream(request.into_inner(), Some(LISTENER_TYPE_URL)),
		))
	}

	type DeltaListenersStream = DeltaStream;

	async fn delta_listeners(
		&self,
		_request: Request<Streaming<DeltaDiscoveryRequest>>,
	) -> Result<Response<Self::DeltaListenersStream>, Status> {
		Err(Status::unimplemented(UNIMPLEMENTED_DELTA))
	}

	async fn fetch_listeners(
		&self,
		request: Request<DiscoveryRequest>,
	) -> Result<Response<DiscoveryResponse>, Status> {
		self.fetch(request.into_inner(), LISTENER_TYPE_URL)
	}
}

#[tonic::async_trait]
impl SecretDiscoveryService for DiscoveryService {
	type StreamSecretsStream = SotwStream;

	async fn stream_secrets(
		&self,
		request: Request<Streaming<DiscoveryRequest>>,
	) -> Result<Response<Self::StreamSecretsStream>, Status> {
		Ok(Response::new(
			self.open_stream(request.into_inner(), Some(SECRET_TYPE_URL)),
		))
	}

	type DeltaSecretsStream = DeltaStream;

	async fn delta_secrets(
		&self,
		_request: Request<Streaming<DeltaDiscoveryRequest>>,
	) -> Result<Response<Self::DeltaSecretsStream>, Status> {
		Err(Status::unimplemented(UNIMPLEMENTED_DELTA))
	}

	async fn fetch_secrets(
		&self,
		request: Request<DiscoveryRequest>,
	) -> Result<Response<DiscoveryResponse>, Status> {
		self.fetch(request.into_inner(), SECRET_TYPE_URL)
	}
}

#[tonic::async_trait]
impl RuntimeDiscoveryService for DiscoveryService {
	type StreamRuntimeStream = SotwStream;

	async fn stream_runtime(
		&self,
		request: Request<Streaming<DiscoveryRequest>>,
	) -> Result<Response<Self::StreamRuntimeStream>, Status> {
		Ok(Response::new(
			self.open_stream(request.into_inner(), Some(RUNTIME_TYPE_URL)),
		))
	}

	type DeltaRuntimeStream = DeltaStream;

	async fn delta_runtime(
		&self,
		_request: Request<Streaming<DeltaDiscoveryRequest>>,
	) -> Result<Response<Self::DeltaRuntimeStream>, Status> {
		Err(Status::unimplemented(UNIMPLEMENTED_DELTA))
	}

	async fn fetch_runtime(
		&self,
		request: Request<DiscoveryRequest>,
	) -> Result<Response<DiscoveryResponse>, Status> {
		self.fetch(request.into_inner(), RUNTIME_TYPE_URL)
	}
}

#[cfg(test)]
mod tests {
	use std::collections::BTreeMap;
	use std::time::Duration;

	use envoy_types::pb::envoy::config::core::v3::Node;
	use tokio::time::timeout;

	use super::*;
	use crate::registry::Endpoint;
	use crate::xds::snapshot::build_snapshot;

	fn sample_clusters() -> BTreeMap<String, Vec<Endpoint>> {
		BTreeMap::from([(
			"api".to_string(),
			vec![Endpoint {
				unique_id: "c1".to_string(),
				cluster_name: "api".to_string(),
				host: "172.17.0.2".to_string(),
				port: 80,
				front_proxy_path: "/public/api".to_string(),
				version: "v1.0-abc".to_string(),
			}],
		)])
	}

	fn publish(cache: &SnapshotCache, version: &str) {
		cache
			.set_snapshot(build_snapshot(&sample_clusters(), version, "*").expect("consistent"))
			.expect("publish");
	}

	fn service(cache: Arc<SnapshotCache>) -> DiscoveryService {
		DiscoveryService {
			cache,
			token: CancellationToken::new(),
		}
	}

	fn service_with_snapshot() -> DiscoveryService {
		let cache = SnapshotCache::new("test-id");
		publish(&cache, "2");
		service(Arc::new(cache))
	}

	fn request_for(node_id: &str) -> DiscoveryRequest {
		DiscoveryRequest {
			node: Some(Node {
				id: node_id.to_string(),
				..Default::default()
			}),
			..Default::default()
		}
	}

	fn subscribe(type_url: &str) -> DiscoveryRequest {
		DiscoveryRequest {
			type_url: type_url.to_string(),
			..Default::default()
		}
	}

	fn subscribe_as(node_id: &str, type_url: &str) -> DiscoveryRequest {
		DiscoveryRequest {
			node: Some(Node {
				id: node_id.to_string(),
				..Default::default()
			}),
			..subscribe(type_url)
		}
	}

	fn ack(type_url: &str, version: &str, nonce: &str) -> DiscoveryRequest {
		DiscoveryRequest {
			version_info: version.to_string(),
			response_nonce: nonce.to_string(),
			..subscribe(type_url)
		}
	}

	#[test]
	fn fetch_serves_the_current_snapshot() {
		let service = service_with_snapshot();
		let response = service
			.fetch(request_for("test-id"), CLUSTER_TYPE_URL)
			.expect("fetch")
			.into_inner();
		assert_eq!(response.version_info, "2");
		assert_eq!(response.type_url, CLUSTER_TYPE_URL);
		assert_eq!(response.resources.len(), 1);
	}

	#[test]
	fn fetch_rejects_unknown_nodes() {
		let service = service_with_snapshot();
		let status = service
			.fetch(request_for("someone-else"), CLUSTER_TYPE_URL)
			.expect_err("unknown node");
		assert_eq!(status.code(), tonic::Code::NotFound);
	}

	#[test]
	fn fetch_before_first_publish_is_unavailable() {
		let service = service(Arc::new(SnapshotCache::new("test-id")));
		let status = service
			.fetch(request_for("test-id"), CLUSTER_TYPE_URL)
			.expect_err("no snapshot yet");
		assert_eq!(status.code(), tonic::Code::Unavailable);
	}

	#[tokio::test(start_paused = true)]
	async fn stream_pushes_the_current_snapshot_on_subscribe() {
		let service = service_with_snapshot();
		let (req_tx, req_rx) = mpsc::channel(8);
		let mut responses = service.open_stream(ReceiverStream::new(req_rx), None);

		req_tx
			.send(Ok(subscribe_as("test-id", CLUSTER_TYPE_URL)))
			.await
			.expect("send request");
		let pushed = responses
			.next()
			.await
			.expect("stream alive")
			.expect("response");
		assert_eq!(pushed.type_url, CLUSTER_TYPE_URL);
		assert_eq!(pushed.version_info, "2");
		assert_eq!(pushed.resources.len(), 1);
		assert_eq!(pushed.nonce, "1");
	}

	#[tokio::test(start_paused = true)]
	async fn publish_pushes_to_every_subscribed_type() {
		let cache = Arc::new(SnapshotCache::new("test-id"));
		publish(&cache, "2");
		let service = service(cache.clone());
		let (req_tx, req_rx) = mpsc::channel(8);
		let mut responses = service.open_stream(ReceiverStream::new(req_rx), None);

		req_tx
			.send(Ok(subscribe_as("test-id", CLUSTER_TYPE_URL)))
			.await
			.expect("send request");
		req_tx
			.send(Ok(subscribe(ENDPOINT_TYPE_URL)))
			.await
			.expect("send request");
		responses.next().await.expect("stream alive").expect("push");
		responses.next().await.expect("stream alive").expect("push");

		publish(&cache, "3");
		let mut pushed = vec![
			responses.next().await.expect("stream alive").expect("push"),
			responses.next().await.expect("stream alive").expect("push"),
		];
		pushed.sort_by(|a, b| a.type_url.cmp(&b.type_url));
		assert_eq!(pushed[0].type_url, CLUSTER_TYPE_URL);
		assert_eq!(pushed[1].type_url, ENDPOINT_TYPE_URL);
		assert!(pushed.iter().all(|r| r.version_info == "3"));
	}

	#[tokio::test(start_paused = true)]
	async fn matching_nonce_acks_without_a_resend() {
		let service = service_with_snapshot();
		let (req_tx, req_rx) = mpsc::channel(8);
		let mut responses = service.open_stream(ReceiverStream::new(req_rx), None);

		req_tx
			.send(Ok(subscribe_as("test-id", CLUSTER_TYPE_URL)))
			.await
			.expect("send request");
		let pushed = responses
			.next()
			.await
			.expect("stream alive")
			.expect("response");

		req_tx
			.send(Ok(ack(CLUSTER_TYPE_URL, &pushed.version_info, &pushed.nonce)))
			.await
			.expect("send ack");
		assert!(
			timeout(Duration::from_secs(1), responses.next()).await.is_err(),
			"an ack must not trigger a resend"
		);

		// a fresh request for the same type is answered again
		req_tx
			.send(Ok(subscribe(CLUSTER_TYPE_URL)))
			.await
			.expect("send request");
		let resent = responses
			.next()
			.await
			.expect("stream alive")
			.expect("response");
		assert_eq!(resent.version_info, "2");
		assert_eq!(resent.nonce, "2");
	}

	#[tokio::test(start_paused = true)]
	async fn unknown_nodes_are_starved() {
		let service = service_with_snapshot();
		let (req_tx, req_rx) = mpsc::channel(8);
		let mut responses = service.open_stream(ReceiverStream::new(req_rx), None);

		req_tx
			.send(Ok(subscribe_as("someone-else", CLUSTER_TYPE_URL)))
			.await
			.expect("send request");
		assert!(timeout(Duration::from_secs(1), responses.next()).await.is_err());
	}
}
