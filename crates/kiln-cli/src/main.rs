use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Context;
use kiln_client::{Client, ConsoleEvent, OperationCallbacks};
use kiln_process::{Command, ProcessId};
use tokio::sync::{broadcast::error::RecvError, oneshot};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const USAGE: &str = "usage: kiln <command> [args]

  status <id>                      show the process status
  start|stop|restart|kill <id>     send a lifecycle command and follow it
  console <id>                     tail the console until ctrl-c
  ls <id> [path]                   list a directory of the process
  runtimes                         list installable runtimes
  install <runtime>                install a runtime (ctrl-c cancels)
  uninstall <runtime>              remove an installed runtime";

fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let dir = std::env::var("KILN_LOG_DIR")
        .ok()
        .filter(|v| !v.trim().is_empty());
    let Some(dir) = dir else {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .init();
        return None;
    };

    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "kiln.log"));
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .init();
    Some(guard)
}

fn arg(args: &[String], i: usize, what: &str) -> anyhow::Result<String> {
    args.get(i)
        .cloned()
        .with_context(|| format!("missing {what}\n\n{USAGE}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(cmd) = args.first().map(String::as_str) else {
        eprintln!("{USAGE}");
        return Ok(());
    };

    let client = Client::from_env().context("failed to build client")?;
    tracing::debug!(api_url = %client.config().api_url, "client ready");

    let result = match cmd {
        "status" => status(&client, ProcessId::new(arg(&args, 1, "process id")?)).await,
        "start" | "stop" | "restart" | "kill" => {
            let command: Command = cmd.parse().map_err(anyhow::Error::msg)?;
            lifecycle(&client, ProcessId::new(arg(&args, 1, "process id")?), command).await
        }
        "console" => console(&client, ProcessId::new(arg(&args, 1, "process id")?)).await,
        "ls" => {
            let id = ProcessId::new(arg(&args, 1, "process id")?);
            let path = args.get(2).cloned().unwrap_or_else(|| "/".to_string());
            list_dir(&client, id, &path).await
        }
        "runtimes" => runtimes(&client).await,
        "install" => install(&client, &arg(&args, 1, "runtime")?).await,
        "uninstall" => {
            let runtime = arg(&args, 1, "runtime")?;
            client.runtimes.uninstall(&runtime).await?;
            println!("{runtime} uninstalled");
            Ok(())
        }
        other => anyhow::bail!("unknown command: {other}\n\n{USAGE}"),
    };

    client.shutdown();
    result
}

async fn status(client: &Client, id: ProcessId) -> anyhow::Result<()> {
    let process = client.sessions.load(&id).await?;
    println!("{}\t{}\t{}", process.id, process.name, process.status);
    if let Some(at) = process.last_started_at {
        println!("last started {}", at.to_rfc3339());
    }
    Ok(())
}

async fn lifecycle(client: &Client, id: ProcessId, command: Command) -> anyhow::Result<()> {
    client.sessions.load(&id).await?;
    let mut changes = client.sessions.watch();
    client.sessions.issue_command(command, Some(&id)).await?;

    loop {
        tokio::select! {
            change = changes.recv() => match change {
                Ok(change) if change.id == id => {
                    let marker = if change.optimistic { " (pending)" } else { "" };
                    println!("{}{marker}", change.status);
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
            _ = tokio::time::sleep(Duration::from_millis(250)) => {}
            _ = tokio::signal::ctrl_c() => break,
        }
        if !client.sessions.is_polling(&id) {
            break;
        }
    }

    if let Some(status) = client.sessions.status(&id) {
        println!("final status: {status}");
    }
    Ok(())
}

async fn console(client: &Client, id: ProcessId) -> anyhow::Result<()> {
    client.sessions.load(&id).await?;
    let subscription = client.streams.subscribe(
        id.clone(),
        Arc::new(|event: ConsoleEvent| match event {
            ConsoleEvent::Open => eprintln!("-- console attached --"),
            ConsoleEvent::Data(line) => println!("{line}"),
            ConsoleEvent::Error(e) => eprintln!("-- console error: {e} --"),
            ConsoleEvent::Closed => eprintln!("-- console closed by server --"),
        }),
    );
    tokio::signal::ctrl_c().await?;
    subscription.unsubscribe();
    Ok(())
}

async fn list_dir(client: &Client, id: ProcessId, path: &str) -> anyhow::Result<()> {
    client.sessions.load(&id).await?;
    for entry in client.ops.list_dir(Some(&id), path).await? {
        let kind = if entry.is_dir { "d" } else { "-" };
        println!("{kind} {:>12} {}", entry.size_bytes, entry.name);
    }
    Ok(())
}

async fn runtimes(client: &Client) -> anyhow::Result<()> {
    for r in client.runtimes.refresh().await? {
        let state = match (&r.installed, &r.executable) {
            (true, Some(exe)) => format!("installed ({exe})"),
            (true, None) => "installed".to_string(),
            (false, _) => "available".to_string(),
        };
        println!("{}\t{}\t{state}", r.runtime, r.version);
    }
    Ok(())
}

type DoneSlot = Arc<Mutex<Option<oneshot::Sender<anyhow::Result<()>>>>>;

fn send(slot: &DoneSlot, result: anyhow::Result<()>) {
    if let Some(tx) = slot.lock().unwrap_or_else(|e| e.into_inner()).take() {
        let _ = tx.send(result);
    }
}

async fn install(client: &Client, runtime: &str) -> anyhow::Result<()> {
    let (tx, mut rx) = oneshot::channel();
    let slot: DoneSlot = Arc::new(Mutex::new(Some(tx)));
    let (ok, err, cancelled) = (slot.clone(), slot.clone(), slot);

    let callbacks = OperationCallbacks::new()
        .on_progress(|p| eprint!("\r{:>5.1}% ({}/{})", p.progress * 100.0, p.processed, p.total))
        .on_success(move |_| send(&ok, Ok(())))
        .on_error(move |e| send(&err, Err(e.into())))
        .on_cancelled(move || send(&cancelled, Err(anyhow::anyhow!("install cancelled"))));

    let tracker = client.runtimes.install(runtime, callbacks).await?;
    let outcome = tokio::select! {
        r = &mut rx => r,
        _ = tokio::signal::ctrl_c() => {
            tracker.cancel();
            (&mut rx).await
        }
    };
    eprintln!();
    outcome.context("install task ended without a result")??;

    if let Ok(r) = client.runtimes.resolve(runtime) {
        println!("{} {} installed", r.runtime, r.version);
    }
    Ok(())
}
