//! Client-side tracking of remotely managed game-server processes.
//!
//! [`Client`] wires the pieces together around one [`RemoteApi`]: the
//! session registry with its reconciliation polls, console streams, tracked
//! file operations and the runtime (Java) installer.

pub mod config;
pub mod error;
pub mod http;
pub mod ops;
pub mod progress;
pub mod remote;
pub mod runtime;
pub mod session;
pub mod sse;
pub mod stream;
pub mod tracker;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

use std::sync::Arc;

pub use config::ClientConfig;
pub use error::{ClientError, Result};
pub use ops::{OperationCallbacks, OperationOutcome, Operations};
pub use progress::{ProgressSnapshot, TransferProgress, UnitProgress};
pub use remote::RemoteApi;
pub use runtime::RuntimeManager;
pub use session::{SessionManager, StatusChange, TrackedStatus};
pub use stream::{ConsoleEvent, ConsoleHandler, StreamMultiplexer, Subscription};
pub use tracker::{OperationTracker, TrackerId, TrackerInfo, TrackerRegistry};

pub struct Client {
    pub sessions: Arc<SessionManager>,
    pub streams: Arc<StreamMultiplexer>,
    pub trackers: Arc<TrackerRegistry>,
    pub ops: Operations,
    pub runtimes: Arc<RuntimeManager>,
    config: ClientConfig,
}

impl Client {
    pub fn new(remote: Arc<dyn RemoteApi>, config: ClientConfig) -> Self {
        let streams = Arc::new(StreamMultiplexer::new(remote.clone()));
        let sessions = Arc::new(SessionManager::new(
            remote.clone(),
            streams.clone(),
            &config,
        ));
        let trackers = Arc::new(TrackerRegistry::new());
        let ops = Operations::new(remote.clone(), sessions.clone(), trackers.clone(), &config);
        let runtimes = Arc::new(RuntimeManager::new(remote, trackers.clone(), &config));
        Self {
            sessions,
            streams,
            trackers,
            ops,
            runtimes,
            config,
        }
    }

    /// HTTP binding configured from `KILN_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let config = ClientConfig::from_env();
        let remote = http::HttpRemote::new(&config)?;
        Ok(Self::new(Arc::new(remote), config))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Cancels every in-flight operation and closes all console streams.
    pub fn shutdown(&self) {
        for t in self.trackers.active() {
            self.trackers.cancel(&t.id);
        }
        self.streams.shutdown();
    }
}
