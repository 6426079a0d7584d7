//! Scripted in-memory [`RemoteApi`] used by the crate's tests.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
};

use futures_util::{StreamExt, stream};
use kiln_process::{Command, ManagedProcess, ProcessId, ProcessStatus, RuntimeVersion};
use tokio::sync::{Semaphore, mpsc};

use crate::error::{ClientError, Result};
use crate::ops::{OperationCallbacks, OperationOutcome};
use crate::progress::ProgressSnapshot;
use crate::remote::{
    ConsoleFrame, EventStream, FileAction, FileEntry, InstallEvent, OperationEvent,
    OperationRequest, RemoteApi,
};

type Tx<T> = mpsc::UnboundedSender<Result<T>>;

fn channel_stream<T: Send + 'static>() -> (Tx<T>, EventStream<T>) {
    let (tx, rx) = mpsc::unbounded_channel::<Result<T>>();
    let s = stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|v| (v, rx)) }).boxed();
    (tx, s)
}

fn unavailable(action: &str) -> ClientError {
    ClientError::Remote {
        action: action.to_string(),
        status: Some(503),
        code: "unavailable".to_string(),
        message: "scripted failure".to_string(),
        field_errors: Default::default(),
        hint: None,
    }
}

struct PendingOperation {
    process_id: ProcessId,
    tx: Tx<OperationEvent>,
    rx: Option<EventStream<OperationEvent>>,
}

#[derive(Default)]
struct State {
    processes: HashMap<ProcessId, ManagedProcess>,
    scripted: HashMap<ProcessId, VecDeque<ProcessStatus>>,
    fetches: HashMap<ProcessId, usize>,
    commands: Vec<(ProcessId, Command)>,
    deleted: Vec<ProcessId>,
    fail_fetch: bool,
    fail_commands: bool,
    fail_console: bool,

    consoles: HashMap<ProcessId, Vec<Tx<ConsoleFrame>>>,
    console_opens: HashMap<ProcessId, usize>,

    next_op: u64,
    operations: HashMap<String, PendingOperation>,
    begun: Vec<(ProcessId, String, OperationRequest)>,
    cancelled_ops: Vec<String>,
    ack_cancel: bool,
    fail_begin: bool,

    entries: Vec<FileEntry>,
    file_actions: Vec<(ProcessId, FileAction)>,

    runtimes: Vec<RuntimeVersion>,
    manifests: HashMap<String, Vec<String>>,
    installs: HashMap<String, Tx<InstallEvent>>,
    installed_units: HashMap<String, HashSet<String>>,
    install_calls: Vec<String>,
    install_cancels: Vec<String>,
    uninstalls: Vec<String>,
}

impl State {
    fn mark_installed(&mut self, runtime: &str) {
        if let Some(r) = self.runtimes.iter_mut().find(|r| r.runtime == runtime) {
            r.installed = true;
            r.executable = Some(format!("/opt/runtimes/{runtime}/bin/java"));
        }
    }

    fn mark_installed_if_complete(&mut self, runtime: &str) {
        let Some(manifest) = self.manifests.get(runtime) else {
            return;
        };
        let done = self.installed_units.get(runtime);
        let complete = manifest
            .iter()
            .all(|unit| done.is_some_and(|d| d.contains(unit)));
        if complete {
            self.mark_installed(runtime);
        }
    }
}

#[derive(Default)]
pub struct FakeRemote {
    state: Mutex<State>,
    begin_gate: Mutex<Option<Arc<Semaphore>>>,
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn put_process(&self, id: &str, status: ProcessStatus) {
        let id = ProcessId::from(id);
        self.state()
            .processes
            .insert(id.clone(), ManagedProcess::new(id, status));
    }

    /// Status the next fetches return, in order; the last one sticks.
    pub fn script_statuses(&self, id: &str, statuses: impl IntoIterator<Item = ProcessStatus>) {
        self.state()
            .scripted
            .insert(ProcessId::from(id), statuses.into_iter().collect());
    }

    pub fn fetch_count(&self, id: &str) -> usize {
        self.state()
            .fetches
            .get(&ProcessId::from(id))
            .copied()
            .unwrap_or(0)
    }

    pub fn commands(&self) -> Vec<(ProcessId, Command)> {
        self.state().commands.clone()
    }

    pub fn deleted(&self) -> Vec<ProcessId> {
        self.state().deleted.clone()
    }

    pub fn set_fail_fetch(&self, fail: bool) {
        self.state().fail_fetch = fail;
    }

    pub fn set_fail_commands(&self, fail: bool) {
        self.state().fail_commands = fail;
    }

    pub fn set_fail_console(&self, fail: bool) {
        self.state().fail_console = fail;
    }

    pub fn console_opens(&self, id: &str) -> usize {
        self.state()
            .console_opens
            .get(&ProcessId::from(id))
            .copied()
            .unwrap_or(0)
    }

    /// Console connections whose reading side is still alive.
    pub fn live_consoles(&self, id: &str) -> usize {
        let mut st = self.state();
        let list = st.consoles.entry(ProcessId::from(id)).or_default();
        list.retain(|tx| !tx.is_closed());
        list.len()
    }

    pub fn emit_console(&self, id: &str, frame: ConsoleFrame) {
        let mut st = self.state();
        let list = st.consoles.entry(ProcessId::from(id)).or_default();
        list.retain(|tx| tx.send(Ok(frame.clone())).is_ok());
    }

    pub fn fail_console_stream(&self, id: &str) {
        let mut st = self.state();
        let list = st.consoles.entry(ProcessId::from(id)).or_default();
        for tx in list.drain(..) {
            let _ = tx.send(Err(ClientError::transport("console stream", "connection reset")));
        }
    }

    pub fn hold_begin(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.begin_gate.lock().unwrap_or_else(|e| e.into_inner()) = Some(gate.clone());
        gate
    }

    pub fn set_ack_cancel(&self, ack: bool) {
        self.state().ack_cancel = ack;
    }

    pub fn set_fail_begin(&self, fail: bool) {
        self.state().fail_begin = fail;
    }

    pub fn begun(&self) -> Vec<(ProcessId, String, OperationRequest)> {
        self.state().begun.clone()
    }

    pub fn cancelled_operations(&self) -> Vec<String> {
        self.state().cancelled_ops.clone()
    }

    pub fn emit_operation(&self, remote_id: &str, event: OperationEvent) {
        if let Some(op) = self.state().operations.get(remote_id) {
            let _ = op.tx.send(Ok(event));
        }
    }

    /// Closes the event stream without a terminal event.
    pub fn drop_operation_stream(&self, remote_id: &str) {
        self.state().operations.remove(remote_id);
    }

    pub fn set_dir_entries(&self, entries: Vec<FileEntry>) {
        self.state().entries = entries;
    }

    pub fn file_actions(&self) -> Vec<(ProcessId, FileAction)> {
        self.state().file_actions.clone()
    }

    pub fn put_runtime(&self, runtime: &str, version: &str, manifest: Vec<String>) {
        let mut st = self.state();
        st.runtimes.retain(|r| r.runtime != runtime);
        st.runtimes.push(RuntimeVersion {
            runtime: runtime.to_string(),
            version: version.to_string(),
            installed: false,
            executable: None,
        });
        st.manifests.insert(runtime.to_string(), manifest);
    }

    /// Sends an install event. The runtime becomes installed server-side
    /// once every manifest file was reported completed.
    pub fn emit_install(&self, runtime: &str, event: InstallEvent) {
        let mut st = self.state();
        if let InstallEvent::Completed { unit } = &event {
            st.installed_units
                .entry(runtime.to_string())
                .or_default()
                .insert(unit.clone());
            st.mark_installed_if_complete(runtime);
        }
        if let Some(tx) = st.installs.get(runtime) {
            let _ = tx.send(Ok(event));
        }
    }

    /// Marks the runtime installed server-side and sends `done`.
    pub fn finish_install(&self, runtime: &str) {
        let mut st = self.state();
        st.mark_installed(runtime);
        if let Some(tx) = st.installs.remove(runtime) {
            let _ = tx.send(Ok(InstallEvent::Done));
        }
    }

    /// Ends the install stream without a terminal event.
    pub fn close_install(&self, runtime: &str) {
        self.state().installs.remove(runtime);
    }

    pub fn install_calls(&self) -> Vec<String> {
        self.state().install_calls.clone()
    }

    pub fn install_cancels(&self) -> Vec<String> {
        self.state().install_cancels.clone()
    }

    pub fn uninstalls(&self) -> Vec<String> {
        self.state().uninstalls.clone()
    }
}

#[async_trait::async_trait]
impl RemoteApi for FakeRemote {
    async fn fetch_process(&self, id: &ProcessId) -> Result<ManagedProcess> {
        let mut st = self.state();
        *st.fetches.entry(id.clone()).or_default() += 1;
        if st.fail_fetch {
            return Err(unavailable("fetch process status"));
        }
        let next = st.scripted.get_mut(id).and_then(|q| {
            if q.len() > 1 { q.pop_front() } else { q.front().copied() }
        });
        let Some(process) = st.processes.get_mut(id) else {
            return Err(ClientError::from_response("fetch process status", 404, ""));
        };
        if let Some(status) = next {
            process.status = status;
        }
        Ok(process.clone())
    }

    async fn send_command(&self, id: &ProcessId, command: Command) -> Result<()> {
        let mut st = self.state();
        if st.fail_commands {
            return Err(unavailable("send command"));
        }
        st.commands.push((id.clone(), command));
        Ok(())
    }

    async fn delete_process(&self, id: &ProcessId) -> Result<()> {
        let mut st = self.state();
        st.processes.remove(id);
        st.deleted.push(id.clone());
        Ok(())
    }

    async fn open_console(&self, id: &ProcessId) -> Result<EventStream<ConsoleFrame>> {
        let mut st = self.state();
        *st.console_opens.entry(id.clone()).or_default() += 1;
        if st.fail_console {
            return Err(unavailable("console stream"));
        }
        let (tx, s) = channel_stream();
        let _ = tx.send(Ok(ConsoleFrame::Open));
        st.consoles.entry(id.clone()).or_default().push(tx);
        Ok(s)
    }

    async fn begin_operation(&self, id: &ProcessId, request: &OperationRequest) -> Result<String> {
        let gate = self
            .begin_gate
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(gate) = gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|e| ClientError::transport("begin operation", e))?;
            permit.forget();
        }

        let mut st = self.state();
        if st.fail_begin {
            return Err(unavailable("begin operation"));
        }
        st.next_op += 1;
        let remote_id = format!("r-{}", st.next_op);
        let (tx, rx) = channel_stream();
        st.operations.insert(
            remote_id.clone(),
            PendingOperation {
                process_id: id.clone(),
                tx,
                rx: Some(rx),
            },
        );
        st.begun.push((id.clone(), remote_id.clone(), request.clone()));
        Ok(remote_id)
    }

    async fn operation_events(
        &self,
        id: &ProcessId,
        remote_id: &str,
    ) -> Result<EventStream<OperationEvent>> {
        let mut st = self.state();
        let op = st
            .operations
            .get_mut(remote_id)
            .filter(|op| &op.process_id == id)
            .ok_or_else(|| ClientError::from_response("operation events", 404, ""))?;
        op.rx
            .take()
            .ok_or_else(|| ClientError::from_response("operation events", 409, "already open"))
    }

    async fn cancel_operation(&self, _id: &ProcessId, remote_id: &str) -> Result<()> {
        let mut st = self.state();
        st.cancelled_ops.push(remote_id.to_string());
        if st.ack_cancel
            && let Some(op) = st.operations.get(remote_id)
        {
            let _ = op.tx.send(Ok(OperationEvent::Cancelled));
        }
        Ok(())
    }

    async fn list_dir(&self, _id: &ProcessId, _path: &str) -> Result<Vec<FileEntry>> {
        Ok(self.state().entries.clone())
    }

    async fn file_action(&self, id: &ProcessId, action: &FileAction) -> Result<()> {
        self.state().file_actions.push((id.clone(), action.clone()));
        Ok(())
    }

    async fn list_runtimes(&self) -> Result<Vec<RuntimeVersion>> {
        Ok(self.state().runtimes.clone())
    }

    async fn runtime_manifest(&self, runtime: &str) -> Result<Vec<String>> {
        self.state()
            .manifests
            .get(runtime)
            .cloned()
            .ok_or_else(|| ClientError::from_response("fetch runtime manifest", 404, ""))
    }

    async fn install_runtime(&self, runtime: &str) -> Result<EventStream<InstallEvent>> {
        let mut st = self.state();
        st.install_calls.push(runtime.to_string());
        st.installed_units.remove(runtime);
        st.mark_installed_if_complete(runtime);
        let (tx, s) = channel_stream();
        st.installs.insert(runtime.to_string(), tx);
        Ok(s)
    }

    async fn cancel_runtime_install(&self, runtime: &str) -> Result<()> {
        let mut st = self.state();
        st.install_cancels.push(runtime.to_string());
        // Dropping the sender ends the stream, which acknowledges the cancel.
        st.installs.remove(runtime);
        Ok(())
    }

    async fn uninstall_runtime(&self, runtime: &str) -> Result<()> {
        let mut st = self.state();
        let Some(r) = st.runtimes.iter_mut().find(|r| r.runtime == runtime) else {
            return Err(ClientError::from_response("uninstall runtime", 404, ""));
        };
        r.installed = false;
        r.executable = None;
        st.uninstalls.push(runtime.to_string());
        Ok(())
    }
}

/// Terminal callback observed by a [`CallbackProbe`].
#[derive(Debug, Clone, PartialEq)]
pub enum Finished {
    Success(Option<serde_json::Value>),
    /// Carries [`ClientError::code`].
    Error(String),
    Cancelled,
}

pub struct CallbackProbe {
    progress: Arc<Mutex<Vec<f64>>>,
    terminal: mpsc::UnboundedReceiver<Finished>,
}

impl CallbackProbe {
    /// Waits for the terminal callback and checks that no second one follows.
    pub async fn outcome(&mut self) -> Finished {
        let seen = self
            .terminal
            .recv()
            .await
            .unwrap_or_else(|| panic!("callbacks dropped without a terminal call"));
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        assert!(self.terminal.try_recv().is_err(), "second terminal callback");
        seen
    }

    pub fn try_outcome(&mut self) -> Option<Finished> {
        self.terminal.try_recv().ok()
    }

    /// Every value passed to `on_progress`, in order.
    pub fn progress(&self) -> Vec<f64> {
        self.progress.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Callbacks that record into the returned probe.
pub fn probe() -> (OperationCallbacks, CallbackProbe) {
    let progress = Arc::new(Mutex::new(Vec::new()));
    let (tx, terminal) = mpsc::unbounded_channel();
    let sink = progress.clone();
    let (ok, err, cancelled) = (tx.clone(), tx.clone(), tx);
    let callbacks = OperationCallbacks::new()
        .on_progress(move |s: ProgressSnapshot| {
            sink.lock().unwrap_or_else(|e| e.into_inner()).push(s.progress)
        })
        .on_success(move |o: OperationOutcome| {
            let _ = ok.send(Finished::Success(o.result));
        })
        .on_error(move |e: ClientError| {
            let _ = err.send(Finished::Error(e.code().to_string()));
        })
        .on_cancelled(move || {
            let _ = cancelled.send(Finished::Cancelled);
        });
    (callbacks, CallbackProbe { progress, terminal })
}
