use std::sync::{Arc, RwLock};

use tokio::sync::watch;
use tracing::debug;

use super::snapshot::{Snapshot, SnapshotError};

#[derive(thiserror::Error, Debug)]
pub enum CacheError {
	#[error(transparent)]
	Inconsistent(#[from] SnapshotError),
}

/// Holds the latest published snapshot for the single node this control
/// plane serves. Server streams subscribe to the watch side and re-read the
/// snapshot whenever the publish generation moves.
pub struct SnapshotCache {
	node_id: String,
	snapshot: RwLock<Option<Arc<Snapshot>>>,
	publishes: watch::Sender<u64>,
}

impl SnapshotCache {
	pub fn new(node_id: impl Into<String>) -> Self {
		let (publishes, _) = watch::channel(0);
		Self {
			node_id: node_id.into(),
			snapshot: RwLock::new(None),
			publishes,
		}
	}

	pub fn node_id(&self) -> &str {
		&self.node_id
	}

	/// Whether a snapshot is indexed for the given node.
	pub fn covers(&self, node_id: &str) -> bool {
		self.node_id == node_id
	}

	/// Publishes a snapshot. Bundles failing the consistency check are
	/// rejected; the builder validated already, so a rejection here means a
	/// programming error upstream.
	pub fn set_snapshot(&self, snapshot: Snapshot) -> Result<(), CacheError> {
		snapshot.consistent()?;
		let version = snapshot.version.clone();
		*self.snapshot.write().unwrap() = Some(Arc::new(snapshot));
		self.publishes.send_modify(|generation| *generation += 1);
		debug!(%version, "snapshot stored");
		Ok(())
	}

	pub fn snapshot(&self) -> Option<Arc<Snapshot>> {
		self.snapshot.read().unwrap().clone()
	}

	/// Change signal for server streams; the value is a publish generation,
	/// not a snapshot version.
	pub fn subscribe(&self) -> watch::Receiver<u64> {
		self.publishes.subscribe()
	}
}
