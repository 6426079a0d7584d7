use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use futures_util::StreamExt;
use kiln_process::RuntimeVersion;
use tokio::time::Instant;

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::ops::{OperationCallbacks, OperationOutcome, Reporter, Terminal};
use crate::progress::UnitProgress;
use crate::remote::{InstallEvent, OperationKind, RemoteApi};
use crate::tracker::{OperationTracker, TrackerRegistry};

/// Cached view of the installable runtimes (Java versions) and their
/// install/uninstall lifecycle.
pub struct RuntimeManager {
    remote: Arc<dyn RemoteApi>,
    trackers: Arc<TrackerRegistry>,
    cancel_ack_timeout: Duration,
    versions: Mutex<Vec<RuntimeVersion>>,
}

impl RuntimeManager {
    pub fn new(
        remote: Arc<dyn RemoteApi>,
        trackers: Arc<TrackerRegistry>,
        config: &ClientConfig,
    ) -> Self {
        Self {
            remote,
            trackers,
            cancel_ack_timeout: config.cancel_ack_timeout,
            versions: Mutex::new(Vec::new()),
        }
    }

    fn versions(&self) -> MutexGuard<'_, Vec<RuntimeVersion>> {
        self.versions.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub async fn refresh(&self) -> Result<Vec<RuntimeVersion>> {
        let mut list = self.remote.list_runtimes().await.inspect_err(|e| {
            tracing::warn!(error = %e, "failed to list runtimes");
        })?;
        list.sort_by(|a, b| a.runtime.cmp(&b.runtime));
        *self.versions() = list.clone();
        tracing::debug!(count = list.len(), "runtime list refreshed");
        Ok(list)
    }

    /// Last fetched list; empty until the first [`RuntimeManager::refresh`].
    pub fn list(&self) -> Vec<RuntimeVersion> {
        self.versions().clone()
    }

    pub fn find(&self, runtime: &str) -> Option<RuntimeVersion> {
        self.versions().iter().find(|r| r.runtime == runtime).cloned()
    }

    /// Re-resolves a selection against the current list by its stable key.
    pub fn resolve(&self, runtime: &str) -> Result<RuntimeVersion> {
        self.find(runtime)
            .ok_or_else(|| ClientError::UnknownRuntime(runtime.to_string()))
    }

    async fn lookup(&self, runtime: &str) -> Result<RuntimeVersion> {
        if let Some(found) = self.find(runtime) {
            return Ok(found);
        }
        self.refresh().await?;
        self.resolve(runtime)
    }

    /// Starts an installation. Progress is the share of manifest files the
    /// server reported as completed; the install succeeds once every file is
    /// completed or the server sends `done`. Only one install per runtime
    /// runs at a time.
    pub async fn install(
        self: &Arc<Self>,
        runtime: &str,
        callbacks: OperationCallbacks,
    ) -> Result<OperationTracker> {
        let current = self.lookup(runtime).await?;
        if current.installed {
            return Err(ClientError::AlreadyInstalled(runtime.to_string()));
        }
        let manifest = self.remote.runtime_manifest(runtime).await?;

        let tracker = self
            .trackers
            .begin_exclusive(OperationKind::InstallRuntime, runtime)
            .ok_or_else(|| ClientError::InstallInProgress(runtime.to_string()))?;
        tracing::info!(tracker = %tracker.id(), runtime, files = manifest.len(), "runtime install started");

        tokio::spawn(run_install(
            Arc::clone(self),
            tracker.clone(),
            runtime.to_string(),
            manifest,
            Reporter::new(callbacks),
        ));
        Ok(tracker)
    }

    pub async fn uninstall(&self, runtime: &str) -> Result<()> {
        let current = self.lookup(runtime).await?;
        if !current.installed {
            return Err(ClientError::NotInstalled(runtime.to_string()));
        }
        self.remote.uninstall_runtime(runtime).await?;
        tracing::info!(runtime, "runtime uninstalled");
        self.refresh().await?;
        Ok(())
    }
}

async fn run_install(
    manager: Arc<RuntimeManager>,
    tracker: OperationTracker,
    runtime: String,
    manifest: Vec<String>,
    mut reporter: Reporter,
) {
    let mut units = UnitProgress::with_manifest(manifest);
    // An empty manifest is complete before anything happens.
    reporter.progress(units.snapshot());

    let mut terminal = drive_install(&manager, &tracker, &runtime, &mut units, &mut reporter).await;
    if matches!(terminal, Terminal::Success(_))
        && let Err(e) = manager.refresh().await
    {
        terminal = Terminal::Failed(e);
    }

    tracker.registry().release(tracker.id());
    match &terminal {
        Terminal::Success(_) => tracing::info!(tracker = %tracker.id(), %runtime, "runtime installed"),
        Terminal::Failed(e) => {
            tracing::warn!(tracker = %tracker.id(), %runtime, error = %e, "runtime install failed")
        }
        Terminal::Cancelled => tracing::info!(tracker = %tracker.id(), %runtime, "runtime install cancelled"),
    }
    reporter.finish(terminal, units.snapshot());
}

async fn drive_install(
    manager: &RuntimeManager,
    tracker: &OperationTracker,
    runtime: &str,
    units: &mut UnitProgress<String>,
    reporter: &mut Reporter,
) -> Terminal {
    let remote = manager.remote.as_ref();
    let token = tracker.token().clone();

    let mut events = match remote.install_runtime(runtime).await {
        Ok(s) => s,
        Err(e) => return Terminal::Failed(e),
    };
    if units.is_complete() {
        return Terminal::Success(OperationOutcome::default());
    }

    let mut ack_deadline: Option<Instant> = None;
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled(), if ack_deadline.is_none() => {
                if let Err(e) = remote.cancel_runtime_install(runtime).await {
                    tracing::warn!(tracker = %tracker.id(), runtime, error = %e, "remote cancel failed");
                }
                ack_deadline = Some(Instant::now() + manager.cancel_ack_timeout);
            }
            _ = tokio::time::sleep_until(ack_deadline.unwrap_or_else(Instant::now)), if ack_deadline.is_some() => {
                tracing::warn!(tracker = %tracker.id(), runtime, "no cancel acknowledgement, reporting cancelled");
                return Terminal::Cancelled;
            }
            next = events.next() => {
                let cancelling = ack_deadline.is_some();
                match next {
                    Some(Ok(InstallEvent::Progress { unit })) => {
                        tracing::trace!(tracker = %tracker.id(), %unit, "runtime file started");
                    }
                    Some(Ok(InstallEvent::Completed { unit })) => {
                        if !cancelling {
                            reporter.progress(units.complete(unit));
                            if units.is_complete() {
                                return Terminal::Success(OperationOutcome::default());
                            }
                        }
                    }
                    Some(Ok(InstallEvent::Done)) => {
                        return Terminal::Success(OperationOutcome::default());
                    }
                    Some(Ok(InstallEvent::Failed { message })) => {
                        if cancelling {
                            return Terminal::Cancelled;
                        }
                        return Terminal::Failed(ClientError::Operation(message));
                    }
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
                        if units.is_complete() {
                            return Terminal::Success(OperationOutcome::default());
                        }
                        return Terminal::Failed(ClientError::StreamClosed);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeRemote, Finished, probe};

    const JAVA: &str = "java-21";

    fn manifest(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("lib/file-{i}.jar")).collect()
    }

    fn setup(files: usize) -> (Arc<FakeRemote>, Arc<RuntimeManager>) {
        let remote = FakeRemote::new();
        remote.put_runtime(JAVA, "21.0.4", manifest(files));
        let manager = Arc::new(RuntimeManager::new(
            remote.clone(),
            Arc::new(TrackerRegistry::new()),
            &ClientConfig::default(),
        ));
        (remote, manager)
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn completed(unit: &str) -> InstallEvent {
        InstallEvent::Completed {
            unit: unit.to_string(),
        }
    }

    #[tokio::test]
    async fn install_reports_unit_progress_in_any_order() {
        let (remote, manager) = setup(10);
        let (callbacks, mut probe) = probe();
        let tracker = manager.install(JAVA, callbacks).await.unwrap();
        settle().await;

        let order = [7, 2, 9, 0, 2, 5, 1, 8, 3, 6, 4];
        for i in order {
            let unit = format!("lib/file-{i}.jar");
            remote.emit_install(JAVA, InstallEvent::Progress { unit: unit.clone() });
            remote.emit_install(JAVA, completed(&unit));
        }
        remote.emit_install(JAVA, completed("not/in/manifest"));

        assert_eq!(probe.outcome().await, Finished::Success(None));
        let seen = probe.progress();
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(seen.first(), Some(&0.0));
        assert_eq!(seen.last(), Some(&1.0));
        assert_eq!(seen.len(), 11);

        let java = manager.find(JAVA).unwrap();
        assert!(java.installed);
        assert!(java.executable.is_some());
        assert!(tracker.is_finished());
    }

    #[tokio::test]
    async fn empty_manifest_is_complete_immediately() {
        let (remote, manager) = setup(0);
        let (callbacks, mut seen) = probe();
        let tracker = manager.install(JAVA, callbacks).await.unwrap();

        assert_eq!(seen.outcome().await, Finished::Success(None));
        assert_eq!(seen.progress(), vec![1.0]);
        assert!(tracker.is_finished());
        assert_eq!(remote.install_calls(), vec![JAVA.to_string()]);
        assert!(manager.find(JAVA).unwrap().installed);
    }

    #[tokio::test]
    async fn second_install_while_running_is_rejected() {
        let (remote, manager) = setup(2);
        let (callbacks, mut seen) = probe();
        manager.install(JAVA, callbacks).await.unwrap();

        let err = manager
            .install(JAVA, OperationCallbacks::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::InstallInProgress(_)));
        settle().await;
        assert_eq!(remote.install_calls(), vec![JAVA.to_string()]);

        remote.emit_install(JAVA, completed("lib/file-0.jar"));
        remote.emit_install(JAVA, completed("lib/file-1.jar"));
        assert_eq!(seen.outcome().await, Finished::Success(None));
        let err = manager
            .install(JAVA, OperationCallbacks::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::AlreadyInstalled(_)));
    }

    #[tokio::test]
    async fn early_stream_end_is_an_error() {
        let (remote, manager) = setup(2);
        let (callbacks, mut seen) = probe();
        manager.install(JAVA, callbacks).await.unwrap();
        settle().await;
        remote.emit_install(JAVA, completed("lib/file-1.jar"));
        remote.close_install(JAVA);

        assert_eq!(seen.outcome().await, Finished::Error("stream_closed".to_string()));
        assert_eq!(seen.progress(), vec![0.0, 0.5]);
        assert!(!manager.find(JAVA).unwrap().installed);
    }

    #[tokio::test]
    async fn installed_runtime_is_rejected() {
        let (remote, manager) = setup(1);
        let (callbacks, mut probe) = probe();
        manager.install(JAVA, callbacks).await.unwrap();
        settle().await;
        remote.finish_install(JAVA);
        probe.outcome().await;

        let err = manager
            .install(JAVA, OperationCallbacks::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::AlreadyInstalled(_)));
        assert_eq!(remote.install_calls().len(), 1);
    }

    #[tokio::test]
    async fn uninstall_requires_installed_and_refreshes() {
        let (remote, manager) = setup(1);
        let err = manager.uninstall(JAVA).await.unwrap_err();
        assert!(matches!(err, ClientError::NotInstalled(_)));
        assert!(remote.uninstalls().is_empty());

        let (callbacks, mut probe) = probe();
        manager.install(JAVA, callbacks).await.unwrap();
        settle().await;
        remote.finish_install(JAVA);
        probe.outcome().await;

        manager.uninstall(JAVA).await.unwrap();
        assert_eq!(remote.uninstalls(), vec![JAVA.to_string()]);
        let java = manager.resolve(JAVA).unwrap();
        assert!(!java.installed);
        assert_eq!(java.executable, None);
    }

    #[tokio::test]
    async fn cancel_stops_the_install() {
        let (remote, manager) = setup(4);
        let (callbacks, mut probe) = probe();
        let tracker = manager.install(JAVA, callbacks).await.unwrap();
        settle().await;
        remote.emit_install(JAVA, completed("lib/file-0.jar"));
        settle().await;

        assert!(tracker.cancel());
        assert_eq!(probe.outcome().await, Finished::Cancelled);
        assert_eq!(remote.install_cancels(), vec![JAVA.to_string()]);
        assert_eq!(probe.progress(), vec![0.0, 0.25]);
        assert!(!manager.find(JAVA).unwrap().installed);
    }

    #[tokio::test]
    async fn unknown_runtime() {
        let (_, manager) = setup(1);
        let err = manager
            .install("java-8", OperationCallbacks::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::UnknownRuntime(_)));
        assert!(manager.resolve("java-8").is_err());
        assert_eq!(manager.list().len(), 1);
    }
}
