use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use kiln_process::ProcessId;
use tokio_util::sync::CancellationToken;

use crate::remote::OperationKind;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackerId(String);

impl TrackerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TrackerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug)]
struct TrackerEntry {
    seq: u64,
    kind: OperationKind,
    process_id: Option<ProcessId>,
    token: CancellationToken,
    remote_id: Option<String>,
}

/// Read-only view of a live tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerInfo {
    pub id: TrackerId,
    pub kind: OperationKind,
    pub process_id: Option<ProcessId>,
    pub remote_id: Option<String>,
    pub cancel_requested: bool,
}

/// Table of in-flight cancellable operations.
///
/// Entries are created by [`TrackerRegistry::begin`] and removed by
/// [`TrackerRegistry::release`] once the operation reports a terminal event.
#[derive(Debug, Default)]
pub struct TrackerRegistry {
    next_id: AtomicU64,
    inner: Mutex<HashMap<TrackerId, TrackerEntry>>,
}

impl TrackerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a handle before any network I/O happens.
    pub fn begin(
        self: &Arc<Self>,
        kind: OperationKind,
        process_id: Option<ProcessId>,
    ) -> OperationTracker {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        self.insert(&mut map, kind, process_id, None)
    }

    /// Like [`TrackerRegistry::begin`] with the correlation id known up
    /// front, but returns `None` while another live tracker of the same kind
    /// holds that id.
    pub fn begin_exclusive(
        self: &Arc<Self>,
        kind: OperationKind,
        remote_id: &str,
    ) -> Option<OperationTracker> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let taken = map
            .values()
            .any(|e| e.kind == kind && e.remote_id.as_deref() == Some(remote_id));
        if taken {
            return None;
        }
        Some(self.insert(&mut map, kind, None, Some(remote_id.to_string())))
    }

    fn insert(
        self: &Arc<Self>,
        map: &mut HashMap<TrackerId, TrackerEntry>,
        kind: OperationKind,
        process_id: Option<ProcessId>,
        remote_id: Option<String>,
    ) -> OperationTracker {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let id = TrackerId(format!("op-{n}"));
        let token = CancellationToken::new();

        map.insert(
            id.clone(),
            TrackerEntry {
                seq: n,
                kind: kind.clone(),
                process_id: process_id.clone(),
                token: token.clone(),
                remote_id,
            },
        );
        tracing::debug!(tracker = %id, %kind, "operation tracker allocated");

        OperationTracker {
            id,
            kind,
            process_id,
            token,
            registry: Arc::clone(self),
        }
    }

    /// Requests cancellation. Returns `false` for unknown or already finished
    /// trackers; that is not an error.
    pub fn cancel(&self, id: &TrackerId) -> bool {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = map.get(id) else {
            return false;
        };
        if !entry.token.is_cancelled() {
            tracing::info!(tracker = %id, kind = %entry.kind, "operation cancel requested");
            entry.token.cancel();
        }
        true
    }

    pub fn bind_remote(&self, id: &TrackerId, remote_id: &str) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = map.get_mut(id) {
            entry.remote_id = Some(remote_id.to_string());
        }
    }

    pub fn release(&self, id: &TrackerId) -> bool {
        let removed = self
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
            .is_some();
        if removed {
            tracing::debug!(tracker = %id, "operation tracker released");
        }
        removed
    }

    pub fn get(&self, id: &TrackerId) -> Option<TrackerInfo> {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.get(id).map(|e| info(id, e))
    }

    pub fn active(&self) -> Vec<TrackerInfo> {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut entries: Vec<_> = map.iter().collect();
        entries.sort_by_key(|(_, e)| e.seq);
        entries.into_iter().map(|(id, e)| info(id, e)).collect()
    }

    pub fn active_for(&self, process_id: &ProcessId) -> Vec<TrackerInfo> {
        self.active()
            .into_iter()
            .filter(|t| t.process_id.as_ref() == Some(process_id))
            .collect()
    }

    pub fn is_active(&self, id: &TrackerId) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(id)
    }
}

fn info(id: &TrackerId, e: &TrackerEntry) -> TrackerInfo {
    TrackerInfo {
        id: id.clone(),
        kind: e.kind.clone(),
        process_id: e.process_id.clone(),
        remote_id: e.remote_id.clone(),
        cancel_requested: e.token.is_cancelled(),
    }
}

/// Handle returned to callers of long-running operations.
#[derive(Debug, Clone)]
pub struct OperationTracker {
    id: TrackerId,
    kind: OperationKind,
    process_id: Option<ProcessId>,
    token: CancellationToken,
    registry: Arc<TrackerRegistry>,
}

impl OperationTracker {
    pub fn id(&self) -> &TrackerId {
        &self.id
    }

    pub fn kind(&self) -> &OperationKind {
        &self.kind
    }

    pub fn process_id(&self) -> Option<&ProcessId> {
        self.process_id.as_ref()
    }

    /// Safe at any point; a no-op once the operation has finished.
    pub fn cancel(&self) -> bool {
        self.registry.cancel(&self.id)
    }

    pub fn is_finished(&self) -> bool {
        !self.registry.is_active(&self.id)
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub(crate) fn registry(&self) -> &TrackerRegistry {
        &self.registry
    }
}
