//! End-to-end flows through [`Client`] against the scripted remote.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use kiln_client::remote::{ConsoleFrame, InstallEvent, OperationEvent};
use kiln_client::testing::{FakeRemote, Finished, probe};
use kiln_client::{Client, ClientConfig, ConsoleEvent, ConsoleHandler, TrackedStatus};
use kiln_process::{Command, ProcessId, ProcessStatus};

fn client(remote: &Arc<FakeRemote>) -> Client {
    Client::new(remote.clone(), ClientConfig::default())
}

async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(5)).await;
}

fn lines() -> (ConsoleHandler, Arc<Mutex<Vec<String>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handler: ConsoleHandler = Arc::new(move |ev: ConsoleEvent| {
        if let ConsoleEvent::Data(line) = ev {
            sink.lock().unwrap().push(line);
        }
    });
    (handler, seen)
}

#[tokio::test]
async fn runtime_install_with_ten_files() {
    let remote = FakeRemote::new();
    let files: Vec<String> = (0..10).map(|i| format!("jdk/lib/module-{i}")).collect();
    remote.put_runtime("java-17", "17.0.12", files.clone());
    let client = client(&remote);

    client.runtimes.refresh().await.unwrap();
    assert!(!client.runtimes.find("java-17").unwrap().installed);

    let (callbacks, mut probe) = probe();
    let tracker = client.runtimes.install("java-17", callbacks).await.unwrap();
    settle().await;
    for f in files.iter().rev() {
        remote.emit_install("java-17", InstallEvent::Completed { unit: f.clone() });
    }

    assert_eq!(probe.outcome().await, Finished::Success(None));
    assert_eq!(probe.progress().last(), Some(&1.0));
    assert!(client.runtimes.resolve("java-17").unwrap().installed);
    assert!(tracker.is_finished());
}

#[tokio::test]
async fn runtime_with_empty_manifest() {
    let remote = FakeRemote::new();
    remote.put_runtime("java-8", "8u422", Vec::new());
    let client = client(&remote);

    let (callbacks, mut probe) = probe();
    client.runtimes.install("java-8", callbacks).await.unwrap();

    assert_eq!(probe.outcome().await, Finished::Success(None));
    assert_eq!(probe.progress(), vec![1.0]);
    assert!(client.runtimes.resolve("java-8").unwrap().installed);
}

#[tokio::test]
async fn second_console_subscriber_takes_over() {
    let remote = FakeRemote::new();
    remote.put_process("lobby", ProcessStatus::Running);
    let client = client(&remote);
    let id = ProcessId::from("lobby");
    client.sessions.load(&id).await.unwrap();

    let (first, first_seen) = lines();
    let (second, second_seen) = lines();
    client.streams.subscribe(id.clone(), first);
    settle().await;
    client.streams.subscribe(id.clone(), second);
    settle().await;

    remote.emit_console("lobby", ConsoleFrame::Text("[Server] hello".into()));
    settle().await;

    assert!(first_seen.lock().unwrap().is_empty());
    assert_eq!(*second_seen.lock().unwrap(), vec!["[Server] hello".to_string()]);
    assert_eq!(remote.live_consoles("lobby"), 1);

    client.sessions.unload(&id);
    assert!(client.streams.active().is_empty());
}

#[tokio::test(start_paused = true)]
async fn stop_then_poll_until_stopped() {
    let remote = FakeRemote::new();
    remote.put_process("survival", ProcessStatus::Running);
    let client = client(&remote);
    let id = ProcessId::from("survival");
    client.sessions.load(&id).await.unwrap();
    remote.script_statuses("survival", [ProcessStatus::Stopped]);

    client.sessions.issue_command(Command::Stop, None).await.unwrap();
    assert!(matches!(
        client.sessions.tracked(&id),
        Some(TrackedStatus::Optimistic {
            status: ProcessStatus::Stopping,
            command: Command::Stop,
            ..
        })
    ));

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(
        client.sessions.tracked(&id),
        Some(TrackedStatus::Confirmed(ProcessStatus::Stopped))
    );
    let calls = remote.fetch_count("survival");
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(remote.fetch_count("survival"), calls);
}

#[tokio::test(start_paused = true)]
async fn start_reconciles_to_running() {
    let remote = FakeRemote::new();
    remote.put_process("survival", ProcessStatus::Stopped);
    let client = client(&remote);
    let id = ProcessId::from("survival");
    client.sessions.load(&id).await.unwrap();
    remote.script_statuses(
        "survival",
        [ProcessStatus::Starting, ProcessStatus::Starting, ProcessStatus::Running],
    );

    client.sessions.issue_command(Command::Start, Some(&id)).await.unwrap();
    assert_eq!(client.sessions.status(&id), Some(ProcessStatus::Starting));

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(client.sessions.status(&id), Some(ProcessStatus::Running));
    assert!(!client.sessions.is_polling(&id));
    assert_eq!(remote.fetch_count("survival"), 4);
}

#[tokio::test]
async fn operations_on_two_processes_and_shutdown() {
    let remote = FakeRemote::new();
    remote.put_process("a", ProcessStatus::Running);
    remote.put_process("b", ProcessStatus::Running);
    remote.set_ack_cancel(true);
    let client = client(&remote);
    let a = ProcessId::from("a");
    let b = ProcessId::from("b");
    client.sessions.load(&a).await.unwrap();
    client.sessions.load(&b).await.unwrap();

    let (cb_a, mut probe_a) = probe();
    let (cb_b, mut probe_b) = probe();
    let ta = client
        .ops
        .archive(Some(&a), vec!["world".into()], "a.zip", cb_a)
        .unwrap();
    let tb = client
        .ops
        .upload(Some(&b), "/", "ops.json", b"[]".to_vec(), cb_b)
        .unwrap();
    assert_eq!(client.trackers.active_for(&a).len(), 1);
    assert_eq!(client.trackers.active_for(&b).len(), 1);
    settle().await;

    let remote_b = client.trackers.get(tb.id()).unwrap().remote_id.unwrap();
    remote.emit_operation(&remote_b, OperationEvent::Progress { processed: 2, total: 2 });
    remote.emit_operation(&remote_b, OperationEvent::Completed { result: None });
    assert_eq!(probe_b.outcome().await, Finished::Success(None));
    assert_eq!(probe_b.progress(), vec![1.0]);

    client.shutdown();
    assert_eq!(probe_a.outcome().await, Finished::Cancelled);
    assert!(ta.is_finished());
    assert!(client.trackers.active().is_empty());
}
