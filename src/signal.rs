use tokio_util::sync::CancellationToken;
use tracing::info;

/// Process-wide cancellation root. Every long-lived task holds a clone of the
/// token and races its blocking operations against it; cancelling the root is
/// the only shutdown path, whether signal- or error-initiated.
#[derive(Clone, Debug, Default)]
pub struct Shutdown {
	token: CancellationToken,
}

impl Shutdown {
	pub fn new() -> Self {
		Self {
			token: CancellationToken::new(),
		}
	}

	pub fn token(&self) -> CancellationToken {
		self.token.clone()
	}

	/// Cancels the root token. Idempotent.
	pub fn trigger(&self) {
		self.token.cancel();
	}

	/// Resolves once the process should stop: either the user sent SIGINT or
	/// something else cancelled the root token.
	pub async fn wait_for_interrupt(self) {
		tokio::select! {
			r = tokio::signal::ctrl_c() => {
				if r.is_ok() {
					info!("user triggered termination");
				}
				self.token.cancel();
			},
			_ = self.token.cancelled() => {},
		}
	}
}
