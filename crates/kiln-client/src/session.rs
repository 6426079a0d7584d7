use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use kiln_process::{Command, ManagedProcess, ProcessId, ProcessStatus};
use tokio::{sync::broadcast, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::remote::RemoteApi;
use crate::stream::StreamMultiplexer;

/// Status as known to the client.
///
/// An optimistic guess is always replaced wholesale by the next fetched
/// status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackedStatus {
    Confirmed(ProcessStatus),
    Optimistic {
        status: ProcessStatus,
        since: Instant,
        command: Command,
    },
}

impl TrackedStatus {
    pub fn status(&self) -> ProcessStatus {
        match self {
            TrackedStatus::Confirmed(s) => *s,
            TrackedStatus::Optimistic { status, .. } => *status,
        }
    }

    pub fn is_optimistic(&self) -> bool {
        matches!(self, TrackedStatus::Optimistic { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub id: ProcessId,
    pub status: ProcessStatus,
    pub optimistic: bool,
}

/// Whether a reconciliation poll started by `command` is done.
///
/// `seen_booting` is true once the poll observed Starting or Running; a
/// Stopped after that means the start failed.
pub(crate) fn poll_finished(command: Command, status: ProcessStatus, seen_booting: bool) -> bool {
    if status.is_failure() {
        return true;
    }
    match command {
        Command::Start => {
            status == ProcessStatus::Running || (status == ProcessStatus::Stopped && seen_booting)
        }
        Command::Restart => status == ProcessStatus::Running,
        Command::Stop | Command::Kill => {
            matches!(status, ProcessStatus::Stopped | ProcessStatus::Idle)
        }
    }
}

#[derive(Debug)]
struct PollHandle {
    generation: u64,
    command: Command,
    token: CancellationToken,
}

#[derive(Debug)]
struct SessionEntry {
    record: ManagedProcess,
    tracked: TrackedStatus,
    poll: Option<PollHandle>,
    // Bumped on every status write; guards optimistic rollback.
    write_seq: u64,
    // Bumped on every issued command; a stale command does not start a poll.
    command_epoch: u64,
}

impl SessionEntry {
    fn set_confirmed(&mut self, record: ManagedProcess) {
        self.tracked = TrackedStatus::Confirmed(record.status);
        self.record = record;
        self.write_seq += 1;
    }

    fn cancel_poll(&mut self) {
        if let Some(poll) = self.poll.take() {
            poll.token.cancel();
        }
    }
}

#[derive(Debug, Default)]
struct Registry {
    entries: HashMap<ProcessId, SessionEntry>,
    current: Option<ProcessId>,
}

/// Authoritative in-memory status of every loaded process.
pub struct SessionManager {
    remote: Arc<dyn RemoteApi>,
    streams: Arc<StreamMultiplexer>,
    poll_interval: Duration,
    poll_max_attempts: u32,
    next_poll: AtomicU64,
    inner: Mutex<Registry>,
    changes: broadcast::Sender<StatusChange>,
}

impl SessionManager {
    pub fn new(
        remote: Arc<dyn RemoteApi>,
        streams: Arc<StreamMultiplexer>,
        config: &ClientConfig,
    ) -> Self {
        let (changes, _) = broadcast::channel(config.status_channel_capacity.max(1));
        Self {
            remote,
            streams,
            poll_interval: config.poll_interval,
            poll_max_attempts: config.poll_max_attempts,
            next_poll: AtomicU64::new(1),
            inner: Mutex::new(Registry::default()),
            changes,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, id: &ProcessId, tracked: TrackedStatus) {
        // No receivers is fine.
        let _ = self.changes.send(StatusChange {
            id: id.clone(),
            status: tracked.status(),
            optimistic: tracked.is_optimistic(),
        });
    }

    pub fn watch(&self) -> broadcast::Receiver<StatusChange> {
        self.changes.subscribe()
    }

    /// Explicit id, or the currently loaded process.
    pub fn resolve(&self, id: Option<&ProcessId>) -> Result<ProcessId> {
        match id {
            Some(id) => Ok(id.clone()),
            None => self.lock().current.clone().ok_or(ClientError::NoProcess),
        }
    }

    pub fn current(&self) -> Option<ProcessId> {
        self.lock().current.clone()
    }

    pub fn select(&self, id: &ProcessId) -> Result<()> {
        let mut reg = self.lock();
        if !reg.entries.contains_key(id) {
            return Err(ClientError::NotLoaded(id.to_string()));
        }
        reg.current = Some(id.clone());
        Ok(())
    }

    /// Fetches the process and merges it into the registry. The loaded
    /// process becomes the current one.
    pub async fn load(&self, id: &ProcessId) -> Result<ManagedProcess> {
        let fetched = self.remote.fetch_process(id).await.inspect_err(|e| {
            tracing::warn!(process_id = %id, error = %e, "failed to load process");
        })?;

        let tracked = {
            let mut reg = self.lock();
            match reg.entries.get_mut(id) {
                Some(entry) => entry.set_confirmed(fetched.clone()),
                None => {
                    reg.entries.insert(
                        id.clone(),
                        SessionEntry {
                            tracked: TrackedStatus::Confirmed(fetched.status),
                            record: fetched.clone(),
                            poll: None,
                            write_seq: 1,
                            command_epoch: 0,
                        },
                    );
                    tracing::info!(process_id = %id, status = %fetched.status, "process loaded");
                }
            }
            reg.current = Some(id.clone());
            TrackedStatus::Confirmed(fetched.status)
        };
        self.emit(id, tracked);
        Ok(fetched)
    }

    /// Drops the entry, its poll and its console subscription.
    pub fn unload(&self, id: &ProcessId) -> bool {
        let removed = {
            let mut reg = self.lock();
            if reg.current.as_ref() == Some(id) {
                reg.current = None;
            }
            reg.entries.remove(id)
        };
        let existed = match removed {
            Some(mut entry) => {
                entry.cancel_poll();
                tracing::info!(process_id = %id, "process unloaded");
                true
            }
            None => false,
        };
        self.streams.cleanup(id);
        existed
    }

    pub async fn delete(&self, id: Option<&ProcessId>) -> Result<()> {
        let id = self.resolve(id)?;
        self.remote.delete_process(&id).await?;
        self.unload(&id);
        Ok(())
    }

    /// Sends a lifecycle command and shows the transitional status right
    /// away; a reconciliation poll then replaces it with the real status.
    pub async fn issue_command(
        self: &Arc<Self>,
        command: Command,
        id: Option<&ProcessId>,
    ) -> Result<()> {
        let id = self.resolve(id)?;

        let (previous, seq, epoch, optimistic) = {
            let mut reg = self.lock();
            let entry = reg
                .entries
                .get_mut(&id)
                .ok_or_else(|| ClientError::NotLoaded(id.to_string()))?;
            entry.cancel_poll();
            let previous = entry.tracked;
            let optimistic = TrackedStatus::Optimistic {
                status: command.transitional_status(),
                since: Instant::now(),
                command,
            };
            entry.tracked = optimistic;
            entry.record.status = optimistic.status();
            entry.write_seq += 1;
            entry.command_epoch += 1;
            (previous, entry.write_seq, entry.command_epoch, optimistic)
        };
        self.emit(&id, optimistic);
        tracing::info!(process_id = %id, %command, "lifecycle command issued");

        if let Err(e) = self.remote.send_command(&id, command).await {
            tracing::warn!(process_id = %id, %command, error = %e, "lifecycle command failed");
            let restored = {
                let mut reg = self.lock();
                match reg.entries.get_mut(&id) {
                    Some(entry) if entry.write_seq == seq => {
                        entry.tracked = previous;
                        entry.record.status = previous.status();
                        entry.write_seq += 1;
                        true
                    }
                    _ => false,
                }
            };
            if restored {
                self.emit(&id, previous);
            }
            return Err(e);
        }

        self.start_poll(&id, command, epoch);
        Ok(())
    }

    fn start_poll(self: &Arc<Self>, id: &ProcessId, command: Command, epoch: u64) {
        let generation = self.next_poll.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        {
            let mut reg = self.lock();
            let Some(entry) = reg.entries.get_mut(id) else {
                return;
            };
            if entry.command_epoch != epoch {
                return;
            }
            entry.cancel_poll();
            entry.poll = Some(PollHandle {
                generation,
                command,
                token: token.clone(),
            });
        }

        tokio::spawn(poll_loop(
            Arc::downgrade(self),
            id.clone(),
            command,
            generation,
            token,
            self.poll_interval,
            self.poll_max_attempts,
        ));
    }

    fn apply_poll(&self, id: &ProcessId, generation: u64, record: ManagedProcess) -> bool {
        let tracked = {
            let mut reg = self.lock();
            let Some(entry) = reg.entries.get_mut(id) else {
                return false;
            };
            if entry.poll.as_ref().map(|p| p.generation) != Some(generation) {
                return false;
            }
            entry.set_confirmed(record);
            entry.tracked
        };
        self.emit(id, tracked);
        true
    }

    fn finish_poll(&self, id: &ProcessId, generation: u64) {
        let mut reg = self.lock();
        if let Some(entry) = reg.entries.get_mut(id)
            && entry.poll.as_ref().map(|p| p.generation) == Some(generation)
        {
            entry.poll = None;
        }
    }

    pub fn is_polling(&self, id: &ProcessId) -> bool {
        self.lock()
            .entries
            .get(id)
            .is_some_and(|e| e.poll.is_some())
    }

    /// Command whose reconciliation poll is running, if any.
    pub fn polling_command(&self, id: &ProcessId) -> Option<Command> {
        self.lock()
            .entries
            .get(id)
            .and_then(|e| e.poll.as_ref().map(|p| p.command))
    }

    pub fn status(&self, id: &ProcessId) -> Option<ProcessStatus> {
        self.lock().entries.get(id).map(|e| e.tracked.status())
    }

    pub fn tracked(&self, id: &ProcessId) -> Option<TrackedStatus> {
        self.lock().entries.get(id).map(|e| e.tracked)
    }

    pub fn snapshot(&self, id: &ProcessId) -> Option<ManagedProcess> {
        self.lock().entries.get(id).map(|e| e.record.clone())
    }

    pub fn loaded(&self) -> Vec<ProcessId> {
        let mut ids: Vec<_> = self.lock().entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_running_like(&self, id: &ProcessId) -> bool {
        self.status(id).is_some_and(ProcessStatus::is_running_like)
    }

    pub fn streams(&self) -> &Arc<StreamMultiplexer> {
        &self.streams
    }
}

async fn poll_loop(
    manager: Weak<SessionManager>,
    id: ProcessId,
    command: Command,
    generation: u64,
    token: CancellationToken,
    interval: Duration,
    max_attempts: u32,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut attempts: u32 = 0;
    let mut seen_booting = false;

    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let Some(this) = manager.upgrade() else {
            return;
        };
        attempts = attempts.saturating_add(1);

        let fetched = tokio::select! {
            _ = token.cancelled() => return,
            r = this.remote.fetch_process(&id) => r,
        };
        match fetched {
            Ok(record) => {
                let status = record.status;
                if !this.apply_poll(&id, generation, record) {
                    return;
                }
                if poll_finished(command, status, seen_booting) {
                    tracing::info!(process_id = %id, %command, %status, attempts, "status reconciled");
                    this.finish_poll(&id, generation);
                    return;
                }
                seen_booting |= matches!(status, ProcessStatus::Starting | ProcessStatus::Running);
            }
            Err(e) => {
                tracing::warn!(process_id = %id, %command, error = %e, "status poll failed");
            }
        }

        if max_attempts > 0 && attempts >= max_attempts {
            tracing::warn!(process_id = %id, %command, attempts, "status poll gave up");
            this.finish_poll(&id, generation);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeRemote;

    fn setup(statuses: &[(&str, ProcessStatus)]) -> (Arc<FakeRemote>, Arc<SessionManager>) {
        let remote = FakeRemote::new();
        for (id, status) in statuses {
            remote.put_process(id, *status);
        }
        let streams = Arc::new(StreamMultiplexer::new(remote.clone()));
        let cfg = ClientConfig::default();
        let manager = Arc::new(SessionManager::new(remote.clone(), streams, &cfg));
        (remote, manager)
    }

    async fn advance(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[test]
    fn poll_terminal_rules() {
        use ProcessStatus::*;
        assert!(poll_finished(Command::Start, Running, false));
        assert!(!poll_finished(Command::Start, Starting, false));
        assert!(!poll_finished(Command::Start, Stopped, false));
        assert!(poll_finished(Command::Start, Stopped, true));
        assert!(poll_finished(Command::Start, Crashed, false));
        assert!(!poll_finished(Command::Restart, Stopped, true));
        assert!(poll_finished(Command::Restart, Running, true));
        assert!(poll_finished(Command::Stop, Stopped, false));
        assert!(poll_finished(Command::Kill, Idle, false));
        assert!(!poll_finished(Command::Stop, Hanging, false));
        assert!(poll_finished(Command::Stop, Error, false));
    }

    #[tokio::test]
    async fn load_creates_entry_and_becomes_current() {
        let (_, manager) = setup(&[("srv1", ProcessStatus::Running), ("srv2", ProcessStatus::Idle)]);
        let a = ProcessId::from("srv1");
        let b = ProcessId::from("srv2");

        manager.load(&a).await.unwrap();
        manager.load(&a).await.unwrap();
        assert_eq!(manager.loaded(), vec![a.clone()]);
        assert_eq!(manager.current(), Some(a.clone()));
        assert!(manager.is_running_like(&a));

        manager.load(&b).await.unwrap();
        assert_eq!(manager.current(), Some(b.clone()));
        assert!(!manager.is_running_like(&b));
        assert_eq!(manager.loaded().len(), 2);
    }

    #[tokio::test]
    async fn failed_load_keeps_last_known_status() {
        let (remote, manager) = setup(&[("srv1", ProcessStatus::Running)]);
        let id = ProcessId::from("srv1");
        manager.load(&id).await.unwrap();

        remote.set_fail_fetch(true);
        assert!(manager.load(&id).await.is_err());
        assert_eq!(manager.status(&id), Some(ProcessStatus::Running));

        let missing = ProcessId::from("ghost");
        remote.set_fail_fetch(false);
        assert!(manager.load(&missing).await.is_err());
        assert!(manager.snapshot(&missing).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_optimistic_then_reconciled() {
        let (remote, manager) = setup(&[("srv1", ProcessStatus::Stopped)]);
        let id = ProcessId::from("srv1");
        manager.load(&id).await.unwrap();
        remote.script_statuses("srv1", [ProcessStatus::Starting, ProcessStatus::Running]);

        manager.issue_command(Command::Start, Some(&id)).await.unwrap();
        assert_eq!(manager.status(&id), Some(ProcessStatus::Starting));
        assert!(manager.tracked(&id).unwrap().is_optimistic());
        assert_eq!(manager.polling_command(&id), Some(Command::Start));
        assert_eq!(remote.commands(), vec![(id.clone(), Command::Start)]);

        advance(1100).await;
        assert_eq!(remote.fetch_count("srv1"), 2);
        assert_eq!(manager.tracked(&id), Some(TrackedStatus::Confirmed(ProcessStatus::Starting)));
        assert!(manager.is_polling(&id));

        advance(1000).await;
        assert_eq!(remote.fetch_count("srv1"), 3);
        assert_eq!(manager.status(&id), Some(ProcessStatus::Running));
        assert!(!manager.is_polling(&id));

        advance(5000).await;
        assert_eq!(remote.fetch_count("srv1"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_poll_ends_on_stopped() {
        let (remote, manager) = setup(&[("srv1", ProcessStatus::Running)]);
        let id = ProcessId::from("srv1");
        manager.load(&id).await.unwrap();
        remote.script_statuses("srv1", [ProcessStatus::Stopped]);

        manager.issue_command(Command::Stop, None).await.unwrap();
        assert_eq!(manager.status(&id), Some(ProcessStatus::Stopping));

        advance(1100).await;
        assert_eq!(manager.status(&id), Some(ProcessStatus::Stopped));
        assert!(!manager.is_polling(&id));
        let after_terminal = remote.fetch_count("srv1");

        advance(2000).await;
        assert_eq!(remote.fetch_count("srv1"), after_terminal);
    }

    #[tokio::test(start_paused = true)]
    async fn new_command_replaces_running_poll() {
        let (remote, manager) = setup(&[("srv1", ProcessStatus::Stopped)]);
        let id = ProcessId::from("srv1");
        manager.load(&id).await.unwrap();
        remote.script_statuses("srv1", [ProcessStatus::Starting]);

        manager.issue_command(Command::Start, Some(&id)).await.unwrap();
        manager.issue_command(Command::Kill, Some(&id)).await.unwrap();
        assert_eq!(manager.polling_command(&id), Some(Command::Kill));

        advance(1100).await;
        // One poll only: load + a single tick.
        assert_eq!(remote.fetch_count("srv1"), 2);
        advance(1000).await;
        assert_eq!(remote.fetch_count("srv1"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_survives_fetch_errors_and_gives_up_at_cap() {
        let remote = FakeRemote::new();
        remote.put_process("srv1", ProcessStatus::Stopped);
        let streams = Arc::new(StreamMultiplexer::new(remote.clone()));
        let cfg = ClientConfig {
            poll_max_attempts: 3,
            ..ClientConfig::default()
        };
        let manager = Arc::new(SessionManager::new(remote.clone(), streams, &cfg));
        let id = ProcessId::from("srv1");
        manager.load(&id).await.unwrap();

        manager.issue_command(Command::Start, None).await.unwrap();
        remote.set_fail_fetch(true);
        advance(3500).await;
        assert_eq!(remote.fetch_count("srv1"), 4);
        assert!(!manager.is_polling(&id));
        // The optimistic guess is never confirmed by a failed fetch.
        assert!(manager.tracked(&id).unwrap().is_optimistic());
    }

    #[tokio::test]
    async fn failed_command_rolls_back() {
        let (remote, manager) = setup(&[("srv1", ProcessStatus::Stopped)]);
        let id = ProcessId::from("srv1");
        manager.load(&id).await.unwrap();
        remote.set_fail_commands(true);

        let err = manager.issue_command(Command::Start, Some(&id)).await.unwrap_err();
        assert_eq!(err.code(), "unavailable");
        assert_eq!(manager.tracked(&id), Some(TrackedStatus::Confirmed(ProcessStatus::Stopped)));
        assert!(!manager.is_polling(&id));
    }

    #[tokio::test]
    async fn command_needs_a_resolvable_loaded_process() {
        let (_, manager) = setup(&[("srv1", ProcessStatus::Stopped)]);
        let err = manager.issue_command(Command::Start, None).await.unwrap_err();
        assert!(matches!(err, ClientError::NoProcess));

        let err = manager
            .issue_command(Command::Start, Some(&ProcessId::from("srv1")))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::NotLoaded(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn unload_stops_poll_and_console() {
        let (remote, manager) = setup(&[("srv1", ProcessStatus::Running)]);
        let id = ProcessId::from("srv1");
        manager.load(&id).await.unwrap();
        manager
            .streams()
            .subscribe(id.clone(), Arc::new(|_ev: crate::stream::ConsoleEvent| {}));
        manager.issue_command(Command::Restart, None).await.unwrap();

        assert!(manager.unload(&id));
        assert!(!manager.unload(&id));
        assert!(!manager.streams().has_active(&id));
        assert_eq!(manager.current(), None);

        advance(3000).await;
        assert_eq!(remote.fetch_count("srv1"), 1);
    }

    #[tokio::test]
    async fn delete_unloads() {
        let (remote, manager) = setup(&[("srv1", ProcessStatus::Stopped)]);
        let id = ProcessId::from("srv1");
        manager.load(&id).await.unwrap();
        manager.delete(None).await.unwrap();
        assert_eq!(remote.deleted(), vec![id.clone()]);
        assert!(manager.snapshot(&id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn watchers_see_optimistic_then_confirmed() {
        let (remote, manager) = setup(&[("srv1", ProcessStatus::Stopped)]);
        let id = ProcessId::from("srv1");
        let mut rx = manager.watch();
        manager.load(&id).await.unwrap();
        remote.script_statuses("srv1", [ProcessStatus::Running]);
        manager.issue_command(Command::Start, None).await.unwrap();
        advance(1100).await;

        let mut seen = Vec::new();
        while let Ok(change) = rx.try_recv() {
            seen.push((change.status, change.optimistic));
        }
        assert_eq!(
            seen,
            vec![
                (ProcessStatus::Stopped, false),
                (ProcessStatus::Starting, true),
                (ProcessStatus::Running, false),
            ]
        );
    }
}
