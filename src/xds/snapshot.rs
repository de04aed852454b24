use std::collections::{BTreeMap, BTreeSet};

use envoy_types::pb::envoy::config::cluster::v3::Cluster;
use envoy_types::pb::envoy::config::cluster::v3::cluster::{
	ClusterDiscoveryType, DiscoveryType, EdsClusterConfig, LbPolicy,
};
use envoy_types::pb::envoy::config::core::v3::api_config_source::ApiType;
use envoy_types::pb::envoy::config::core::v3::config_source::ConfigSourceSpecifier;
use envoy_types::pb::envoy::config::core::v3::grpc_service::{EnvoyGrpc, TargetSpecifier};
use envoy_types::pb::envoy::config::core::v3::socket_address::{PortSpecifier, Protocol};
use envoy_types::pb::envoy::config::core::v3::{
	Address, ApiConfigSource, ApiVersion, ConfigSource, GrpcService, SocketAddress, address,
};
use envoy_types::pb::envoy::config::endpoint::v3::endpoint::HealthCheckConfig;
use envoy_types::pb::envoy::config::endpoint::v3::lb_endpoint::HostIdentifier;
use envoy_types::pb::envoy::config::endpoint::v3::{
	ClusterLoadAssignment, Endpoint as LbHost, LbEndpoint, LocalityLbEndpoints,
};
use envoy_types::pb::envoy::config::listener::v3::Listener;
use envoy_types::pb::envoy::config::route::v3::route::Action;
use envoy_types::pb::envoy::config::route::v3::route_action::ClusterSpecifier;
use envoy_types::pb::envoy::config::route::v3::route_match::PathSpecifier;
use envoy_types::pb::envoy::config::route::v3::{
	Route, RouteAction, RouteConfiguration, RouteMatch, VirtualHost,
};
use envoy_types::pb::envoy::service::runtime::v3::Runtime;
use envoy_types::pb::google::protobuf::{Any, Duration};
use tracing::{Level, debug, instrument};

use super::{
	CLUSTER_TYPE_URL, ENDPOINT_TYPE_URL, LISTENER_TYPE_URL, ROUTE_TYPE_URL, RUNTIME_TYPE_URL,
	encode_any,
};
use crate::registry::Endpoint;

const ROUTE_NAME: &str = "discovered_container_services";
const VIRTUAL_HOST_NAME: &str = "backend";
/// Management cluster alias Envoy's bootstrap must declare for EDS fetches.
const XDS_CLUSTER_NAME: &str = "xds_cluster";
const CONNECT_TIMEOUT: Duration = Duration {
	seconds: 5,
	nanos: 0,
};

#[derive(thiserror::Error, Debug)]
pub enum SnapshotError {
	#[error("inconsistent snapshot: {0}")]
	Inconsistent(String),
}

/// A referentially consistent bundle of xDS resources sharing one version.
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
	pub version: String,
	pub clusters: Vec<Cluster>,
	pub endpoints: Vec<ClusterLoadAssignment>,
	pub routes: Vec<RouteConfiguration>,
	pub listeners: Vec<Listener>,
	pub runtimes: Vec<Runtime>,
}

impl Snapshot {
	/// Resources of one type, `Any`-encoded for the wire. Types this control
	/// plane never publishes (secrets among them) have no resources.
	pub fn resources(&self, type_url: &str) -> Vec<Any> {
		fn encode<M: prost::Message>(resources: &[M], type_url: &str) -> Vec<Any> {
			resources.iter().map(|r| encode_any(r, type_url)).collect()
		}
		match type_url {
			CLUSTER_TYPE_URL => encode(&self.clusters, CLUSTER_TYPE_URL),
			ENDPOINT_TYPE_URL => encode(&self.endpoints, ENDPOINT_TYPE_URL),
			ROUTE_TYPE_URL => encode(&self.routes, ROUTE_TYPE_URL),
			LISTENER_TYPE_URL => encode(&self.listeners, LISTENER_TYPE_URL),
			RUNTIME_TYPE_URL => encode(&self.runtimes, RUNTIME_TYPE_URL),
			_ => Vec::new(),
		}
	}

	/// Verifies referential closure: the set of load assignments referenced
	/// by the clusters must equal the set of published load assignments, in
	/// cardinality and membership.
	pub fn consistent(&self) -> Result<(), SnapshotError> {
		let referenced: BTreeSet<&str> = self
			.clusters
			.iter()
			.map(|cluster| {
				cluster
					.eds_cluster_config
					.as_ref()
					.filter(|eds| !eds.service_name.is_empty())
					.map(|eds| eds.service_name.as_str())
					.unwrap_or(cluster.name.as_str())
			})
			.collect();
		if referenced.len() != self.endpoints.len() {
			return Err(SnapshotError::Inconsistent(format!(
				"mismatched endpoint reference and resource lengths: {} != {}",
				referenced.len(),
				self.endpoints.len()
			)));
		}
		for assignment in &self.endpoints {
			if !referenced.contains(assignment.cluster_name.as_str()) {
				return Err(SnapshotError::Inconsistent(format!(
					"{:?} not listed",
					assignment.cluster_name
				)));
			}
		}
		Ok(())
	}
}

/// Builds a consistency-checked snapshot for one version of the grouped
/// endpoint map.
#[instrument(level = Level::DEBUG, skip_all, fields(version = version, clusters = clusters.len()))]
pub fn build_snapshot(
	clusters: &BTreeMap<String, Vec<Endpoint>>,
	version: &str,
	domain: &str,
) -> Result<Snapshot, SnapshotError> {
	let snapshot = Snapshot {
		version: version.to_string(),
		clusters: clusters.keys().map(|name| make_cluster(name)).collect(),
		endpoints: clusters
			.iter()
			.map(|(name, endpoints)| make_load_assignment(name, endpoints))
			.collect(),
		routes: vec![make_route_configuration(clusters, domain)],
		listeners: Vec::new(),
		runtimes: Vec::new(),
	};
	snapshot.consistent()?;
	Ok(snapshot)
}

fn make_cluster(cluster_name: &str) -> Cluster {
	Cluster {
		name: cluster_name.to_string(),
		connect_timeout: Some(CONNECT_TIMEOUT),
		cluster_discovery_type: Some(ClusterDiscoveryType::Type(DiscoveryType::Eds as i32)),
		lb_policy: LbPolicy::RoundRobin as i32,
		ignore_health_on_host_removal: true,
		eds_cluster_config: Some(EdsClusterConfig {
			service_name: cluster_name.to_string(),
			eds_config: Some(make_config_source()),
		}),
		..Default::default()
	}
}

fn make_config_source() -> ConfigSource {
	ConfigSource {
		resource_api_version: ApiVersion::V3 as i32,
		config_source_specifier: Some(ConfigSourceSpecifier::ApiConfigSource(ApiConfigSource {
			api_type: ApiType::Grpc as i32,
			transport_api_version: ApiVersion::V3 as i32,
			set_node_on_first_message_only: true,
			grpc_services: vec![GrpcService {
				target_specifier: Some(TargetSpecifier::EnvoyGrpc(EnvoyGrpc {
					cluster_name: XDS_CLUSTER_NAME.to_string(),
					..Default::default()
				})),
				..Default::default()
			}],
			..Default::default()
		})),
		..Default::default()
	}
}

/// An empty bucket still produces its assignment, just with no localities.
fn make_load_assignment(cluster_name: &str, endpoints: &[Endpoint]) -> ClusterLoadAssignment {
	if endpoints.is_empty() {
		return ClusterLoadAssignment {
			cluster_name: cluster_name.to_string(),
			..Default::default()
		};
	}
	debug!(
		cluster = cluster_name,
		endpoints = endpoints.len(),
		"mapped cluster endpoints"
	);
	ClusterLoadAssignment {
		cluster_name: cluster_name.to_string(),
		endpoints: vec![LocalityLbEndpoints {
			lb_endpoints: endpoints.iter().map(make_lb_endpoint).collect(),
			..Default::default()
		}],
		..Default::default()
	}
}

fn make_lb_endpoint(endpoint: &Endpoint) -> LbEndpoint {
	LbEndpoint {
		host_identifier: Some(HostIdentifier::Endpoint(LbHost {
			health_check_config: Some(HealthCheckConfig {
				hostname: endpoint.host.clone(),
				port_value: endpoint.port,
				..Default::default()
			}),
			address: Some(Address {
				address: Some(address::Address::SocketAddress(SocketAddress {
					protocol: Protocol::Tcp as i32,
					address: endpoint.host.clone(),
					port_specifier: Some(PortSpecifier::PortValue(endpoint.port)),
					..Default::default()
				})),
			}),
			..Default::default()
		})),
		..Default::default()
	}
}

fn make_route_configuration(
	clusters: &BTreeMap<String, Vec<Endpoint>>,
	domain: &str,
) -> RouteConfiguration {
	let mut routes = Vec::new();
	for (cluster_name, endpoints) in clusters {
		// all endpoints of a cluster share one front-proxy path; the first
		// one speaks for the bucket
		let Some(first) = endpoints.first() else {
			continue;
		};
		debug!(
			prefix = %first.front_proxy_path,
			cluster = %cluster_name,
			endpoints = endpoints.len(),
			"adding cluster routes"
		);
		routes.extend(make_cluster_routes(&first.front_proxy_path, cluster_name));
	}
	RouteConfiguration {
		name: ROUTE_NAME.to_string(),
		virtual_hosts: vec![VirtualHost {
			name: VIRTUAL_HOST_NAME.to_string(),
			domains: vec![domain.to_string()],
			routes,
			..Default::default()
		}],
		..Default::default()
	}
}

/// Two prefix routes per cluster: the `/`-suffixed subtree match first, then
/// the bare prefix for exact hits.
fn make_cluster_routes(prefix: &str, cluster_name: &str) -> [Route; 2] {
	let route_to_cluster = |path: String| Route {
		r#match: Some(RouteMatch {
			path_specifier: Some(PathSpecifier::Prefix(path)),
			..Default::default()
		}),
		action: Some(Action::Route(RouteAction {
			cluster_specifier: Some(ClusterSpecifier::Cluster(cluster_name.to_string())),
			..Default::default()
		})),
		..Default::default()
	};
	[
		route_to_cluster(format!("{prefix}/")),
		route_to_cluster(prefix.to_string()),
	]
}

#[cfg(test)]
mod tests {
	use super::*;

	fn endpoint(id: &str, cluster: &str, host: &str, port: u32, path: &str) -> Endpoint {
		Endpoint {
			unique_id: id.to_string(),
			cluster_name: cluster.to_string(),
			host: host.to_string(),
			port,
			front_proxy_path: path.to_string(),
			version: "v1.0-abc".to_string(),
		}
	}

	fn route_prefixes(snapshot: &Snapshot) -> Vec<String> {
		snapshot.routes[0].virtual_hosts[0]
			.routes
			.iter()
			.map(|route| {
				match route
					.r#match
					.as_ref()
					.and_then(|m| m.path_specifier.as_ref())
				{
					Some(PathSpecifier::Prefix(prefix)) => prefix.clone(),
					other => panic!("unexpected path specifier {other:?}"),
				}
			})
			.collect()
	}

	#[test]
	fn single_cluster_snapshot() {
		let clusters = BTreeMap::from([(
			"api".to_string(),
			vec![endpoint("c1", "api", "172.17.0.2", 80, "/public/api")],
		)]);
		let snapshot = build_snapshot(&clusters, "2", "*").expect("consistent");

		assert_eq!(snapshot.version, "2");
		assert_eq!(snapshot.clusters.len(), 1);
		assert_eq!(snapshot.endpoints.len(), 1);
		assert_eq!(snapshot.routes.len(), 1);
		assert!(snapshot.listeners.is_empty());
		assert!(snapshot.runtimes.is_empty());

		let cluster = &snapshot.clusters[0];
		assert_eq!(cluster.name, "api");
		assert_eq!(
			cluster.cluster_discovery_type,
			Some(ClusterDiscoveryType::Type(DiscoveryType::Eds as i32))
		);
		assert_eq!(cluster.lb_policy, LbPolicy::RoundRobin as i32);
		assert!(cluster.ignore_health_on_host_removal);
		assert_eq!(cluster.connect_timeout, Some(CONNECT_TIMEOUT));
		let eds = cluster.eds_cluster_config.as_ref().expect("eds config");
		assert_eq!(eds.service_name, "api");
		assert!(eds.eds_config.is_some());

		let assignment = &snapshot.endpoints[0];
		assert_eq!(assignment.cluster_name, "api");
		assert_eq!(assignment.endpoints.len(), 1);
		let lb = &assignment.endpoints[0].lb_endpoints[0];
		let Some(HostIdentifier::Endpoint(host)) = lb.host_identifier.as_ref() else {
			panic!("missing endpoint host");
		};
		let health = host.health_check_config.as_ref().expect("health check");
		assert_eq!(health.hostname, "172.17.0.2");
		assert_eq!(health.port_value, 80);
		let Some(address::Address::SocketAddress(socket)) =
			host.address.as_ref().and_then(|a| a.address.as_ref())
		else {
			panic!("missing socket address");
		};
		assert_eq!(socket.address, "172.17.0.2");
		assert_eq!(socket.port_specifier, Some(PortSpecifier::PortValue(80)));

		assert_eq!(route_prefixes(&snapshot), vec!["/public/api/", "/public/api"]);
		assert_eq!(snapshot.routes[0].name, ROUTE_NAME);
		assert_eq!(snapshot.routes[0].virtual_hosts[0].name, VIRTUAL_HOST_NAME);
		assert_eq!(snapshot.routes[0].virtual_hosts[0].domains, vec!["*"]);
	}

	#[test]
	fn multi_cluster_snapshot_counts() {
		let clusters = BTreeMap::from([
			(
				"admin".to_string(),
				vec![endpoint("c1", "admin", "172.17.0.2", 443, "/internal/admin")],
			),
			(
				"api".to_string(),
				vec![endpoint("c1", "api", "172.17.0.2", 80, "/public/api")],
			),
		]);
		let snapshot = build_snapshot(&clusters, "2", "*").expect("consistent");
		assert_eq!(snapshot.clusters.len(), 2);
		assert_eq!(snapshot.endpoints.len(), 2);
		assert_eq!(
			route_prefixes(&snapshot),
			vec![
				"/internal/admin/",
				"/internal/admin",
				"/public/api/",
				"/public/api"
			]
		);
	}

	#[test]
	fn empty_bucket_gets_an_assignment_but_no_routes() {
		let clusters = BTreeMap::from([
			("ghost".to_string(), Vec::new()),
			(
				"api".to_string(),
				vec![endpoint("c1", "api", "172.17.0.2", 80, "/public/api")],
			),
		]);
		let snapshot = build_snapshot(&clusters, "2", "*").expect("consistent");
		assert_eq!(snapshot.clusters.len(), 2);
		assert_eq!(snapshot.endpoints.len(), 2);
		let ghost = snapshot
			.endpoints
			.iter()
			.find(|a| a.cluster_name == "ghost")
			.expect("ghost assignment");
		assert!(ghost.endpoints.is_empty());
		assert_eq!(route_prefixes(&snapshot), vec!["/public/api/", "/public/api"]);
	}

	#[test]
	fn corrupted_snapshot_fails_the_consistency_check() {
		let clusters = BTreeMap::from([(
			"api".to_string(),
			vec![endpoint("c1", "api", "172.17.0.2", 80, "/public/api")],
		)]);
		let mut snapshot = build_snapshot(&clusters, "2", "*").expect("consistent");
		snapshot.endpoints.push(ClusterLoadAssignment {
			cluster_name: "orphan".to_string(),
			..Default::default()
		});
		assert!(snapshot.consistent().is_err());

		// a cluster without its assignment fails too
		snapshot.endpoints.clear();
		assert!(snapshot.consistent().is_err());
	}

	#[test]
	fn resources_encode_with_their_type_url() {
		let clusters = BTreeMap::from([(
			"api".to_string(),
			vec![endpoint("c1", "api", "172.17.0.2", 80, "/public/api")],
		)]);
		let snapshot = build_snapshot(&clusters, "7", "*").expect("consistent");
		let encoded = snapshot.resources(CLUSTER_TYPE_URL);
		assert_eq!(encoded.len(), 1);
		assert_eq!(encoded[0].type_url, CLUSTER_TYPE_URL);
		assert!(!encoded[0].value.is_empty());
		assert_eq!(snapshot.resources(ENDPOINT_TYPE_URL).len(), 1);
		assert_eq!(snapshot.resources(ROUTE_TYPE_URL).len(), 1);
		assert!(snapshot.resources(LISTENER_TYPE_URL).is_empty());
		assert!(snapshot.resources(RUNTIME_TYPE_URL).is_empty());
		assert!(snapshot.resources(super::super::SECRET_TYPE_URL).is_empty());
	}

	#[test]
	fn empty_grouping_builds_an_empty_snapshot() {
		let snapshot = build_snapshot(&BTreeMap::new(), "2", "*").expect("consistent");
		assert!(snapshot.clusters.is_empty());
		assert!(snapshot.endpoints.is_empty());
		assert!(snapshot.routes[0].virtual_hosts[0].routes.is_empty());
	}
}
