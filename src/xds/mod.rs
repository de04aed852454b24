//! Envoy xDS surface: snapshot construction, the single-node snapshot cache,
//! and the gRPC management server.

use envoy_types::pb::google::protobuf::Any;
use prost::Message;

pub mod cache;
pub mod server;
pub mod snapshot;

pub const CLUSTER_TYPE_URL: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";
pub const ENDPOINT_TYPE_URL: &str =
	"type.googleapis.com/envoy.config.endpoint.v3.ClusterLoadAssignment";
pub const ROUTE_TYPE_URL: &str = "type.googleapis.com/envoy.config.route.v3.RouteConfiguration";
pub const LISTENER_TYPE_URL: &str = "type.googleapis.com/envoy.config.listener.v3.Listener";
pub const SECRET_TYPE_URL: &str =
	"type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.Secret";
pub const RUNTIME_TYPE_URL: &str = "type.googleapis.com/envoy.service.runtime.v3.Runtime";

/// Wire-encodes a resource into the `Any` envelope xDS responses carry.
pub(crate) fn encode_any<M: Message>(message: &M, type_url: &str) -> Any {
	Any {
		type_url: type_url.to_string(),
		value: message.encode_to_vec(),
	}
}
