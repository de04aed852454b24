use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Level, debug, info, instrument, warn};

use crate::registry::EndpointUpdateRequest;
use crate::xds::cache::{CacheError, SnapshotCache};
use crate::xds::snapshot::{Snapshot, SnapshotError, build_snapshot};

/// Lower bound between reconcile iterations, keeping xDS churn bounded.
const PACING_DELAY: Duration = Duration::from_secs(5);

#[derive(thiserror::Error, Debug)]
pub enum ReconcileError {
	#[error("snapshot cache rejected version {version}: {source}")]
	Publish {
		version: u64,
		#[source]
		source: CacheError,
	},
}

/// Change detector and version allocator. Owns the last-seen fingerprint and
/// the version counter; neither is shared with any other task.
pub struct Reconciler {
	cache: Arc<SnapshotCache>,
	domain: String,
	last_hash: u32,
	version: u64,
}

impl Reconciler {
	pub fn new(cache: Arc<SnapshotCache>, domain: String) -> Self {
		Self {
			cache,
			domain,
			last_hash: 0,
			version: 1,
		}
	}

	/// Consumes updates in arrival order until the channel closes or the
	/// token cancels. At most one snapshot is published per distinct
	/// fingerprint.
	pub async fn run(
		mut self,
		mut updates: mpsc::Receiver<EndpointUpdateRequest>,
		token: CancellationToken,
	) -> Result<(), ReconcileError> {
		loop {
			tokio::select! {
				biased;
				_ = token.cancelled() => return Ok(()),
				update = updates.recv() => match update {
					Some(update) => self.process(update)?,
					None => {
						info!("update channel closed");
						return Ok(());
					},
				},
			}
			tokio::select! {
				biased;
				_ = token.cancelled() => return Ok(()),
				_ = tokio::time::sleep(PACING_DELAY) => {},
			}
		}
	}

	#[instrument(level = Level::DEBUG, name = "process_update", skip_all)]
	fn process(&mut self, update: EndpointUpdateRequest) -> Result<(), ReconcileError> {
		let hash = update.fingerprint();
		if hash == self.last_hash {
			debug!(hash, "fingerprint unchanged, dropping update");
			return Ok(());
		}
		info!("different version detected, updating snapshot");
		let clusters = update.group_by_cluster();
		if let Ok(dump) = serde_json::to_string(&clusters) {
			info!(clusters = %dump, "discovered");
		}
		self.version += 1;
		let built = build_snapshot(&clusters, &self.version.to_string(), &self.domain);
		self.publish(built, hash)
	}

	/// Publishes a built snapshot. A builder inconsistency skips the publish
	/// and leaves the fingerprint untouched, so the next update retries even
	/// if it describes the same container set.
	fn publish(
		&mut self,
		built: Result<Snapshot, SnapshotError>,
		hash: u32,
	) -> Result<(), ReconcileError> {
		let snapshot = match built {
			Ok(snapshot) => snapshot,
			Err(e) => {
				warn!("skipping update: {e}");
				return Ok(());
			},
		};
		self.cache
			.set_snapshot(snapshot)
			.map_err(|source| ReconcileError::Publish {
				version: self.version,
				source,
			})?;
		self.last_hash = hash;
		info!(version = self.version, "config replaced");
		Ok(())
	}
}
