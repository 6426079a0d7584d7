//! File operations scoped to a managed process.
//!
//! Quick actions (`copy`, `rename`, ...) are plain request/response calls.
//! Long-running ones (`archive`, `extract`, `upload`, `download_from_url`,
//! `search`) hand back an [`OperationTracker`] right away and report through
//! [`OperationCallbacks`] from a background task.

use std::{sync::Arc, time::Duration};

use futures_util::StreamExt;
use kiln_process::ProcessId;
use tokio::time::Instant;

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::progress::{ProgressSnapshot, TransferProgress};
use crate::remote::{FileAction, FileEntry, OperationEvent, OperationRequest, RemoteApi};
use crate::session::SessionManager;
use crate::tracker::{OperationTracker, TrackerRegistry};

#[derive(Debug, Clone, PartialEq, Default)]
pub struct OperationOutcome {
    pub result: Option<serde_json::Value>,
}

type ProgressFn = Box<dyn Fn(ProgressSnapshot) + Send + Sync>;
type SuccessFn = Box<dyn FnOnce(OperationOutcome) + Send>;
type ErrorFn = Box<dyn FnOnce(ClientError) + Send>;
type CancelledFn = Box<dyn FnOnce() + Send>;

/// Observers for a tracked operation. Exactly one of `on_success`,
/// `on_error` or `on_cancelled` is called, once.
#[derive(Default)]
pub struct OperationCallbacks {
    on_progress: Option<ProgressFn>,
    on_success: Option<SuccessFn>,
    on_error: Option<ErrorFn>,
    on_cancelled: Option<CancelledFn>,
}

impl OperationCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_progress(mut self, f: impl Fn(ProgressSnapshot) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Box::new(f));
        self
    }

    pub fn on_success(mut self, f: impl FnOnce(OperationOutcome) + Send + 'static) -> Self {
        self.on_success = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl FnOnce(ClientError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    pub fn on_cancelled(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_cancelled = Some(Box::new(f));
        self
    }
}

impl std::fmt::Debug for OperationCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationCallbacks")
            .field("on_progress", &self.on_progress.is_some())
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_cancelled", &self.on_cancelled.is_some())
            .finish()
    }
}

#[derive(Debug)]
pub(crate) enum Terminal {
    Success(OperationOutcome),
    Failed(ClientError),
    Cancelled,
}

/// Forwards progress only when it moves forward and consumes the
/// callbacks on the terminal event.
pub(crate) struct Reporter {
    callbacks: OperationCallbacks,
    last: Option<f64>,
}

impl Reporter {
    pub(crate) fn new(callbacks: OperationCallbacks) -> Self {
        Self {
            callbacks,
            last: None,
        }
    }

    pub(crate) fn progress(&mut self, snapshot: ProgressSnapshot) {
        if self.last.is_some_and(|last| snapshot.progress <= last) {
            return;
        }
        self.last = Some(snapshot.progress);
        if let Some(f) = &self.callbacks.on_progress {
            f(snapshot);
        }
    }

    /// `complete` is reported first if the last progress was below 1.
    pub(crate) fn finish(mut self, terminal: Terminal, complete: ProgressSnapshot) {
        match terminal {
            Terminal::Success(outcome) => {
                if self.last.is_none_or(|last| last < 1.0) {
                    self.progress(ProgressSnapshot {
                        progress: 1.0,
                        ..complete
                    });
                }
                if let Some(f) = self.callbacks.on_success.take() {
                    f(outcome);
                }
            }
            Terminal::Failed(err) => {
                if let Some(f) = self.callbacks.on_error.take() {
                    f(err);
                }
            }
            Terminal::Cancelled => {
                if let Some(f) = self.callbacks.on_cancelled.take() {
                    f();
                }
            }
        }
    }
}

pub struct Operations {
    remote: Arc<dyn RemoteApi>,
    sessions: Arc<SessionManager>,
    trackers: Arc<TrackerRegistry>,
    cancel_ack_timeout: Duration,
}

impl Operations {
    pub fn new(
        remote: Arc<dyn RemoteApi>,
        sessions: Arc<SessionManager>,
        trackers: Arc<TrackerRegistry>,
        config: &ClientConfig,
    ) -> Self {
        Self {
            remote,
            sessions,
            trackers,
            cancel_ack_timeout: config.cancel_ack_timeout,
        }
    }

    pub fn trackers(&self) -> &Arc<TrackerRegistry> {
        &self.trackers
    }

    pub async fn list_dir(&self, id: Option<&ProcessId>, path: &str) -> Result<Vec<FileEntry>> {
        let id = self.sessions.resolve(id)?;
        self.remote.list_dir(&id, path).await
    }

    pub async fn copy(
        &self,
        id: Option<&ProcessId>,
        paths: Vec<String>,
        destination: impl Into<String>,
    ) -> Result<()> {
        self.file_action(
            id,
            FileAction::Copy {
                paths,
                destination: destination.into(),
            },
        )
        .await
    }

    pub async fn move_to(
        &self,
        id: Option<&ProcessId>,
        paths: Vec<String>,
        destination: impl Into<String>,
    ) -> Result<()> {
        self.file_action(
            id,
            FileAction::Move {
                paths,
                destination: destination.into(),
            },
        )
        .await
    }

    pub async fn rename(
        &self,
        id: Option<&ProcessId>,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Result<()> {
        self.file_action(
            id,
            FileAction::Rename {
                from: from.into(),
                to: to.into(),
            },
        )
        .await
    }

    pub async fn delete(&self, id: Option<&ProcessId>, paths: Vec<String>) -> Result<()> {
        self.file_action(id, FileAction::Delete { paths }).await
    }

    pub async fn create_dir(&self, id: Option<&ProcessId>, path: impl Into<String>) -> Result<()> {
        self.file_action(id, FileAction::CreateDir { path: path.into() })
            .await
    }

    async fn file_action(&self, id: Option<&ProcessId>, action: FileAction) -> Result<()> {
        let id = self.sessions.resolve(id)?;
        self.remote
            .file_action(&id, &action)
            .await
            .inspect_err(|e| {
                tracing::warn!(process_id = %id, action = action.as_str(), error = %e, "file action failed");
            })?;
        tracing::info!(process_id = %id, action = action.as_str(), "file action done");
        Ok(())
    }

    pub fn archive(
        &self,
        id: Option<&ProcessId>,
        paths: Vec<String>,
        destination: impl Into<String>,
        callbacks: OperationCallbacks,
    ) -> Result<OperationTracker> {
        let request = OperationRequest::Archive {
            paths,
            destination: destination.into(),
        };
        self.start(id, request, callbacks)
    }

    pub fn extract(
        &self,
        id: Option<&ProcessId>,
        path: impl Into<String>,
        destination: impl Into<String>,
        callbacks: OperationCallbacks,
    ) -> Result<OperationTracker> {
        let request = OperationRequest::Extract {
            path: path.into(),
            destination: destination.into(),
        };
        self.start(id, request, callbacks)
    }

    pub fn upload(
        &self,
        id: Option<&ProcessId>,
        directory: impl Into<String>,
        file_name: impl Into<String>,
        data: Vec<u8>,
        callbacks: OperationCallbacks,
    ) -> Result<OperationTracker> {
        let request = OperationRequest::Upload {
            directory: directory.into(),
            file_name: file_name.into(),
            data,
        };
        self.start(id, request, callbacks)
    }

    pub fn download_from_url(
        &self,
        id: Option<&ProcessId>,
        url: impl Into<String>,
        directory: impl Into<String>,
        file_name: Option<String>,
        callbacks: OperationCallbacks,
    ) -> Result<OperationTracker> {
        let request = OperationRequest::Download {
            url: url.into(),
            directory: directory.into(),
            file_name,
        };
        self.start(id, request, callbacks)
    }

    pub fn search(
        &self,
        id: Option<&ProcessId>,
        directory: impl Into<String>,
        query: impl Into<String>,
        callbacks: OperationCallbacks,
    ) -> Result<OperationTracker> {
        let request = OperationRequest::Search {
            directory: directory.into(),
            query: query.into(),
        };
        self.start(id, request, callbacks)
    }

    /// Allocates the tracker synchronously and drives the operation on a
    /// spawned task.
    pub fn start(
        &self,
        id: Option<&ProcessId>,
        request: OperationRequest,
        callbacks: OperationCallbacks,
    ) -> Result<OperationTracker> {
        let id = self.sessions.resolve(id)?;
        let tracker = self.trackers.begin(request.kind(), Some(id.clone()));
        tracing::info!(tracker = %tracker.id(), kind = %request.kind(), process_id = %id, "operation started");

        tokio::spawn(run_operation(
            self.remote.clone(),
            tracker.clone(),
            id,
            request,
            Reporter::new(callbacks),
            self.cancel_ack_timeout,
        ));
        Ok(tracker)
    }
}

async fn run_operation(
    remote: Arc<dyn RemoteApi>,
    tracker: OperationTracker,
    id: ProcessId,
    request: OperationRequest,
    mut reporter: Reporter,
    ack_timeout: Duration,
) {
    let mut progress = TransferProgress::new();
    let terminal = drive(
        remote.as_ref(),
        &tracker,
        &id,
        &request,
        &mut reporter,
        &mut progress,
        ack_timeout,
    )
    .await;

    tracker.registry().release(tracker.id());
    match &terminal {
        Terminal::Success(_) => tracing::info!(tracker = %tracker.id(), "operation completed"),
        Terminal::Failed(e) => tracing::warn!(tracker = %tracker.id(), error = %e, "operation failed"),
        Terminal::Cancelled => tracing::info!(tracker = %tracker.id(), "operation cancelled"),
    }
    reporter.finish(terminal, progress.finish());
}

async fn drive(
    remote: &dyn RemoteApi,
    tracker: &OperationTracker,
    id: &ProcessId,
    request: &OperationRequest,
    reporter: &mut Reporter,
    progress: &mut TransferProgress,
    ack_timeout: Duration,
) -> Terminal {
    let token = tracker.token().clone();

    // A cancel that arrives while this is in flight is applied below.
    let remote_id = match remote.begin_operation(id, request).await {
        Ok(r) => r,
        Err(e) if token.is_cancelled() => {
            tracing::debug!(tracker = %tracker.id(), error = %e, "begin failed after cancel");
            return Terminal::Cancelled;
        }
        Err(e) => return Terminal::Failed(e),
    };
    tracker.registry().bind_remote(tracker.id(), &remote_id);

    let mut events = match remote.operation_events(id, &remote_id).await {
        Ok(s) => s,
        Err(e) => {
            if token.is_cancelled() {
                request_remote_cancel(remote, tracker, id, &remote_id).await;
                return Terminal::Cancelled;
            }
            return Terminal::Failed(e);
        }
    };

    let mut ack_deadline: Option<Instant> = None;
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled(), if ack_deadline.is_none() => {
                request_remote_cancel(remote, tracker, id, &remote_id).await;
                ack_deadline = Some(Instant::now() + ack_timeout);
            }
            _ = tokio::time::sleep_until(ack_deadline.unwrap_or_else(Instant::now)), if ack_deadline.is_some() => {
                tracing::warn!(tracker = %tracker.id(), "no cancel acknowledgement, reporting cancelled");
                return Terminal::Cancelled;
            }
            next = events.next() => {
                let cancelling = ack_deadline.is_some();
                match next {
                    Some(Ok(OperationEvent::Progress { processed, total })) => {
                        if !cancelling {
                            reporter.progress(progress.update(processed, total));
                        }
                    }
                    Some(Ok(OperationEvent::Completed { result })) => {
                        return Terminal::Success(OperationOutcome { result });
                    }
                    Some(Ok(OperationEvent::Failed { message })) => {
                        if cancelling {
                            return Terminal::Cancelled;
                        }
                        return Terminal::Failed(ClientError::Operation(message));
                    }
                    Some(Ok(OperationEvent::Cancelled)) => return Terminal::Cancelled,
                    Some(Err(e)) => {
                        if cancelling {
                            return Terminal::Cancelled;
                        }
                        return Terminal::Failed(e);
                    }
                    None => {
                        if cancelling {
                            return Terminal::Cancelled;
                        }
                        return Terminal::Failed(ClientError::StreamClosed);
                    }
                }
            }
        }
    }
}

async fn request_remote_cancel(
    remote: &dyn RemoteApi,
    tracker: &OperationTracker,
    id: &ProcessId,
    remote_id: &str,
) {
    if let Err(e) = remote.cancel_operation(id, remote_id).await {
        tracing::warn!(tracker = %tracker.id(), remote_id, error = %e, "remote cancel failed");
    }
}
