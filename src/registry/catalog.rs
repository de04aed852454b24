//! Label grammar. Containers opt into discovery by carrying, per service
//! port `P`, the labels `CLUSTER_<P>_NAME` (required), `CLUSTER_<P>_CATEGORY`
//! and optionally `CLUSTER_<P>_URLPREFIX`; the container-level `VERSION` and
//! `COMMIT_ID` labels tag every service on the container.

use std::collections::HashMap;

use bollard::models::ContainerSummary;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{Level, instrument};

use super::Endpoint;

const VERSION_LABEL: &str = "VERSION";
const COMMIT_ID_LABEL: &str = "COMMIT_ID";
const BRIDGE_NETWORK: &str = "bridge";

static SERVICE_NAME_PATTERN: Lazy<Regex> =
	Lazy::new(|| Regex::new(r"^CLUSTER_(?P<port>\d+)_NAME$").expect("static pattern"));

/// Turns a raw container listing into the logical endpoint catalog.
///
/// Containers without any `CLUSTER_<port>_NAME` label produce no endpoints.
/// A container lacking a bridge network still yields its endpoints, with an
/// empty host.
#[instrument(level = Level::DEBUG, skip_all, fields(containers = containers.len()))]
pub fn build_endpoints(containers: &[ContainerSummary]) -> Vec<Endpoint> {
	let mut endpoints = Vec::new();
	for container in containers {
		let Some(labels) = container.labels.as_ref() else {
			continue;
		};
		let ports = service_ports(labels);
		if ports.is_empty() {
			continue;
		}
		let unique_id = container.id.clone().unwrap_or_default();
		let host = bridge_ip(container);
		let version = format!(
			"v{}-{}",
			label_or_empty(labels, VERSION_LABEL),
			label_or_empty(labels, COMMIT_ID_LABEL),
		);
		for port in ports {
			let name = service_label(labels, port, "NAME");
			let category = service_label(labels, port, "CATEGORY");
			let url_prefix = service_label(labels, port, "URLPREFIX");
			let segment = if url_prefix.is_empty() { name } else { url_prefix };
			endpoints.push(Endpoint {
				unique_id: unique_id.clone(),
				cluster_name: name.to_string(),
				host: host.clone(),
				port,
				front_proxy_path: format!("/{category}/{segment}"),
				version: version.clone(),
			});
		}
	}
	endpoints
}

/// Ports marked discoverable by a `CLUSTER_<port>_NAME` label, sorted and
/// deduplicated. The pattern only admits digit tokens, so a failed
/// conversion means the label schema itself is broken.
fn service_ports(labels: &HashMap<String, String>) -> Vec<u32> {
	let mut ports: Vec<u32> = labels
		.keys()
		.filter_map(|key| SERVICE_NAME_PATTERN.captures(key))
		.map(|caps| {
			caps["port"]
				.parse()
				.expect("service label port token must fit a u32")
		})
		.collect();
	ports.sort_unstable();
	ports.dedup();
	ports
}

fn service_label<'a>(labels: &'a HashMap<String, String>, port: u32, suffix: &str) -> &'a str {
	labels
		.get(&format!("CLUSTER_{port}_{suffix}"))
		.map(String::as_str)
		.unwrap_or("")
}

fn label_or_empty<'a>(labels: &'a HashMap<String, String>, key: &str) -> &'a str {
	labels.get(key).map(String::as_str).unwrap_or("")
}

/// The container's bridge-network address is the canonical host the proxy
/// can reach.
fn bridge_ip(container: &ContainerSummary) -> String {
	container
		.network_settings
		.as_ref()
		.and_then(|settings| settings.networks.as_ref())
		.and_then(|networks| networks.get(BRIDGE_NETWORK))
		.and_then(|bridge| bridge.ip_address.clone())
		.unwrap_or_default()
}
