use std::collections::BTreeMap;
use std::time::SystemTime;

use serde::Serialize;

pub mod catalog;
pub mod docker;

pub const PLUGIN_DOCKER: &str = "Docker";

/// A single routable service instance discovered on a container.
///
/// `(unique_id, port)` identifies an endpoint within one update; a container
/// exposing several service ports contributes one endpoint per port.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Endpoint {
	/// Stable container identifier.
	pub unique_id: String,
	/// Logical service name the endpoint belongs to.
	pub cluster_name: String,
	/// IP address reachable by the proxy.
	pub host: String,
	pub port: u32,
	/// URL path prefix the front proxy routes to this service.
	pub front_proxy_path: String,
	/// Build tag composed from the container's VERSION and COMMIT_ID labels.
	pub version: String,
}

/// One full view of the discoverable container fleet, as produced by a single
/// scan of the runtime.
#[derive(Clone, Debug)]
pub struct EndpointUpdateRequest {
	pub plugin_name: String,
	pub timestamp: SystemTime,
	pub endpoints: Vec<Endpoint>,
}

impl EndpointUpdateRequest {
	pub fn new(endpoints: Vec<Endpoint>) -> Self {
		Self {
			plugin_name: PLUGIN_DOCKER.to_string(),
			timestamp: SystemTime::now(),
			endpoints,
		}
	}

	/// Fingerprint of the container set: FNV-1a over the sorted concatenation
	/// of unique ids. Order-independent. Two requests with equal fingerprints
	/// describe the same set of containers; host, port, or path changes on an
	/// unchanged container set are invisible to it.
	pub fn fingerprint(&self) -> u32 {
		let mut ids: Vec<&str> = self
			.endpoints
			.iter()
			.map(|endpoint| endpoint.unique_id.as_str())
			.collect();
		ids.sort_unstable();
		fnv1a32(ids.concat().as_bytes())
	}

	/// Buckets the endpoints by cluster name. Bucket iteration is
	/// name-ordered; order within a bucket follows the request.
	pub fn group_by_cluster(&self) -> BTreeMap<String, Vec<Endpoint>> {
		let mut clusters: BTreeMap<String, Vec<Endpoint>> = BTreeMap::new();
		for endpoint in &self.endpoints {
			clusters
				.entry(endpoint.cluster_name.clone())
				.or_default()
				.push(endpoint.clone());
		}
		clusters
	}
}

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

fn fnv1a32(bytes: &[u8]) -> u32 {
	bytes.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
		(hash ^ u32::from(*byte)).wrapping_mul(FNV_PRIME)
	})
}
