use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use futures_util::StreamExt;
use kiln_process::ProcessId;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::remote::{ConsoleFrame, RemoteApi};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleEvent {
    Open,
    Data(String),
    /// Open failure or a broken connection. Not retried.
    Error(String),
    /// The server ended the stream.
    Closed,
}

/// Receives console events. Runs on the reader task; it must not call back
/// into the multiplexer for the same process synchronously.
pub type ConsoleHandler = Arc<dyn Fn(ConsoleEvent) + Send + Sync>;

struct ActiveStream {
    generation: u64,
    token: CancellationToken,
    // `true` while the handler may still be called.
    gate: Arc<Mutex<bool>>,
    task: JoinHandle<()>,
}

impl ActiveStream {
    fn teardown(self) {
        self.token.cancel();
        // Waits for an in-flight handler call to return.
        *self.gate.lock().unwrap_or_else(|e| e.into_inner()) = false;
        self.task.abort();
    }
}

fn deliver(gate: &Mutex<bool>, handler: &ConsoleHandler, event: ConsoleEvent) -> bool {
    let open = gate.lock().unwrap_or_else(|e| e.into_inner());
    if !*open {
        return false;
    }
    handler(event);
    true
}

/// Owns at most one live console connection per process.
pub struct StreamMultiplexer {
    remote: Arc<dyn RemoteApi>,
    next_generation: AtomicU64,
    inner: Mutex<HashMap<ProcessId, ActiveStream>>,
}

impl StreamMultiplexer {
    pub fn new(remote: Arc<dyn RemoteApi>) -> Self {
        Self {
            remote,
            next_generation: AtomicU64::new(1),
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Replaces any existing subscription for `id`; when this returns the
    /// previous handler will not be called again.
    pub fn subscribe(self: &Arc<Self>, id: ProcessId, handler: ConsoleHandler) -> Subscription {
        let previous = self.lock().remove(&id);
        if let Some(prev) = previous {
            tracing::debug!(process_id = %id, generation = prev.generation, "replacing console subscription");
            prev.teardown();
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let gate = Arc::new(Mutex::new(true));
        let task = tokio::spawn(run_reader(
            self.remote.clone(),
            id.clone(),
            handler,
            token.clone(),
            gate.clone(),
        ));

        let displaced = self.lock().insert(
            id.clone(),
            ActiveStream {
                generation,
                token,
                gate,
                task,
            },
        );
        // A concurrent subscribe for the same id may have slipped in.
        if let Some(other) = displaced {
            other.teardown();
        }

        tracing::info!(process_id = %id, generation, "console subscribed");
        Subscription {
            id,
            generation,
            mux: Arc::downgrade(self),
        }
    }

    pub fn has_active(&self, id: &ProcessId) -> bool {
        self.lock().contains_key(id)
    }

    /// Whether the reader is still attached to the server (an errored or
    /// closed subscription stays registered until cleaned up).
    pub fn is_connected(&self, id: &ProcessId) -> bool {
        self.lock().get(id).is_some_and(|s| !s.task.is_finished())
    }

    pub fn active(&self) -> Vec<ProcessId> {
        let mut ids: Vec<_> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// No-op when nothing is subscribed for `id`.
    pub fn cleanup(&self, id: &ProcessId) -> bool {
        let removed = self.lock().remove(id);
        match removed {
            Some(active) => {
                active.teardown();
                tracing::info!(process_id = %id, "console unsubscribed");
                true
            }
            None => false,
        }
    }

    fn cleanup_generation(&self, id: &ProcessId, generation: u64) -> bool {
        let removed = {
            let mut map = self.lock();
            match map.get(id) {
                Some(s) if s.generation == generation => map.remove(id),
                _ => None,
            }
        };
        match removed {
            Some(active) => {
                active.teardown();
                tracing::info!(process_id = %id, generation, "console unsubscribed");
                true
            }
            None => false,
        }
    }

    pub fn shutdown(&self) {
        let all: Vec<_> = self.lock().drain().collect();
        for (_, active) in all {
            active.teardown();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ProcessId, ActiveStream>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for StreamMultiplexer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_reader(
    remote: Arc<dyn RemoteApi>,
    id: ProcessId,
    handler: ConsoleHandler,
    token: CancellationToken,
    gate: Arc<Mutex<bool>>,
) {
    let opened = tokio::select! {
        _ = token.cancelled() => return,
        r = remote.open_console(&id) => r,
    };
    let mut frames = match opened {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(process_id = %id, error = %e, "console connection failed");
            deliver(&gate, &handler, ConsoleEvent::Error(e.to_string()));
            return;
        }
    };

    loop {
        let next = tokio::select! {
            _ = token.cancelled() => break,
            next = frames.next() => next,
        };
        let event = match next {
            Some(Ok(ConsoleFrame::Open)) => ConsoleEvent::Open,
            Some(Ok(ConsoleFrame::Text(text))) => ConsoleEvent::Data(text),
            Some(Ok(ConsoleFrame::Diagnostic(msg))) => {
                tracing::debug!(process_id = %id, %msg, "console diagnostic event");
                continue;
            }
            Some(Err(e)) => {
                tracing::warn!(process_id = %id, error = %e, "console connection dropped");
                deliver(&gate, &handler, ConsoleEvent::Error(e.to_string()));
                break;
            }
            None => {
                tracing::info!(process_id = %id, "console stream closed by server");
                deliver(&gate, &handler, ConsoleEvent::Closed);
                break;
            }
        };
        if !deliver(&gate, &handler, event) {
            break;
        }
    }
}

/// Handle returned by [`StreamMultiplexer::subscribe`].
///
/// Dropping it leaves the subscription running; call
/// [`Subscription::unsubscribe`] or [`StreamMultiplexer::cleanup`].
#[derive(Debug, Clone)]
pub struct Subscription {
    id: ProcessId,
    generation: u64,
    mux: Weak<StreamMultiplexer>,
}

impl Subscription {
    pub fn process_id(&self) -> &ProcessId {
        &self.id
    }

    /// Only tears down the subscription this handle was created for; a newer
    /// subscription for the same process is left alone.
    pub fn unsubscribe(&self) -> bool {
        match self.mux.upgrade() {
            Some(mux) => mux.cleanup_generation(&self.id, self.generation),
            None => false,
        }
    }
}
