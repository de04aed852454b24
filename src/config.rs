/// Runtime configuration assembled from the command line in `main`.
#[derive(Clone, Debug)]
pub struct Config {
	/// Domain pattern matched by the published virtual host.
	pub domain: String,
	/// Node ID the snapshot cache is indexed under.
	pub node_id: String,
	/// TCP port of the xDS management server.
	pub port: u16,
	pub verbose: bool,
}
