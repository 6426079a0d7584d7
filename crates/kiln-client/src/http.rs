use futures_util::StreamExt;
use kiln_process::{Command, ManagedProcess, ProcessId, RuntimeVersion};
use serde::de::DeserializeOwned;

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::remote::{
    ConsoleFrame, EventStream, FileAction, FileEntry, InstallEvent, OperationEvent,
    OperationRequest, RemoteApi,
};
use crate::sse::{self, SseEvent};

#[derive(Debug, serde::Deserialize)]
struct BeginResponse {
    tracker: String,
}

#[derive(Debug, serde::Deserialize)]
struct ProgressPayload {
    #[serde(default)]
    processed: u64,
    #[serde(default)]
    total: u64,
}

#[derive(Debug, Default, serde::Deserialize)]
struct CompletedPayload {
    #[serde(default)]
    result: Option<serde_json::Value>,
}

#[derive(Debug, serde::Deserialize)]
struct ErrorEventPayload {
    message: String,
}

/// `RemoteApi` over the panel's HTTP + server-sent-events API.
#[derive(Debug, Clone)]
pub struct HttpRemote {
    base: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl HttpRemote {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        // No total request timeout: SSE connections are long-lived.
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .user_agent(concat!("kiln-client/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ClientError::transport("build http client", e))?;
        Ok(Self {
            base: config.api_url.trim_end_matches('/').to_string(),
            token: config.api_token.clone(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let rb = self.http.request(method, self.url(path));
        match &self.token {
            Some(t) => rb.bearer_auth(t),
            None => rb,
        }
    }

    async fn send(&self, action: &str, rb: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let resp = rb
            .send()
            .await
            .map_err(|e| ClientError::transport(action, e))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(ClientError::from_response(action, status.as_u16(), &body))
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        action: &str,
        rb: reqwest::RequestBuilder,
    ) -> Result<T> {
        let resp = self.send(action, rb).await?;
        resp.json::<T>()
            .await
            .map_err(|e| ClientError::decode(action, e))
    }

    async fn open_sse(
        &self,
        action: &'static str,
        rb: reqwest::RequestBuilder,
    ) -> Result<EventStream<SseEvent>> {
        let resp = self
            .send(action, rb.header(reqwest::header::ACCEPT, "text/event-stream"))
            .await?;
        Ok(sse::decode_stream(resp.bytes_stream(), action))
    }
}

fn process_path(id: &ProcessId) -> String {
    format!("/process/{}", id.as_str())
}

pub(crate) fn console_frame(ev: SseEvent) -> Option<ConsoleFrame> {
    match ev.event.as_str() {
        "console" | "message" => Some(ConsoleFrame::Text(ev.data)),
        "open" => Some(ConsoleFrame::Open),
        "error" => Some(ConsoleFrame::Diagnostic(ev.data)),
        _ => None,
    }
}

pub(crate) fn operation_event(ev: SseEvent) -> Option<Result<OperationEvent>> {
    let parsed = match ev.event.as_str() {
        "progress" => serde_json::from_str::<ProgressPayload>(&ev.data)
            .map(|p| OperationEvent::Progress {
                processed: p.processed,
                total: p.total,
            })
            .map_err(|e| ClientError::decode("operation progress", e)),
        "completed" => {
            let payload = if ev.data.trim().is_empty() {
                CompletedPayload::default()
            } else {
                match serde_json::from_str::<CompletedPayload>(&ev.data) {
                    Ok(p) => p,
                    Err(e) => return Some(Err(ClientError::decode("operation result", e))),
                }
            };
            Ok(OperationEvent::Completed {
                result: payload.result,
            })
        }
        "error" => Ok(OperationEvent::Failed {
            message: error_message(&ev.data),
        }),
        "cancelled" => Ok(OperationEvent::Cancelled),
        _ => return None,
    };
    Some(parsed)
}

pub(crate) fn install_event(ev: SseEvent) -> Option<InstallEvent> {
    match ev.event.as_str() {
        "progress" => Some(InstallEvent::Progress {
            unit: ev.data.trim().to_string(),
        }),
        "completed" => Some(InstallEvent::Completed {
            unit: ev.data.trim().to_string(),
        }),
        "error" => Some(InstallEvent::Failed {
            message: error_message(&ev.data),
        }),
        "done" => Some(InstallEvent::Done),
        _ => None,
    }
}

fn error_message(data: &str) -> String {
    serde_json::from_str::<ErrorEventPayload>(data)
        .map(|p| p.message)
        .unwrap_or_else(|_| data.trim().to_string())
}

fn operation_body(request: &OperationRequest) -> serde_json::Value {
    match request {
        OperationRequest::Archive { paths, destination } => {
            serde_json::json!({ "paths": paths, "destination": destination })
        }
        OperationRequest::Extract { path, destination } => {
            serde_json::json!({ "path": path, "destination": destination })
        }
        OperationRequest::Download {
            url,
            directory,
            file_name,
        } => serde_json::json!({ "url": url, "directory": directory, "file_name": file_name }),
        OperationRequest::Search { directory, query } => {
            serde_json::json!({ "directory": directory, "query": query })
        }
        // Upload bodies are raw bytes, see `begin_operation`.
        OperationRequest::Upload {
            directory,
            file_name,
            ..
        } => serde_json::json!({ "directory": directory, "file_name": file_name }),
    }
}

fn file_action_body(action: &FileAction) -> serde_json::Value {
    match action {
        FileAction::Copy { paths, destination } | FileAction::Move { paths, destination } => {
            serde_json::json!({ "paths": paths, "destination": destination })
        }
        FileAction::Rename { from, to } => serde_json::json!({ "from": from, "to": to }),
        FileAction::Delete { paths } => serde_json::json!({ "paths": paths }),
        FileAction::CreateDir { path } => serde_json::json!({ "path": path }),
    }
}

#[async_trait::async_trait]
impl RemoteApi for HttpRemote {
    async fn fetch_process(&self, id: &ProcessId) -> Result<ManagedProcess> {
        let rb = self.request(reqwest::Method::GET, &process_path(id));
        self.send_json("fetch process status", rb).await
    }

    async fn send_command(&self, id: &ProcessId, command: Command) -> Result<()> {
        let path = format!("{}/{}", process_path(id), command.as_str());
        let action = format!("send {command} command");
        self.send(&action, self.request(reqwest::Method::POST, &path))
            .await?;
        Ok(())
    }

    async fn delete_process(&self, id: &ProcessId) -> Result<()> {
        self.send(
            "delete process",
            self.request(reqwest::Method::DELETE, &process_path(id)),
        )
        .await?;
        Ok(())
    }

    async fn open_console(&self, id: &ProcessId) -> Result<EventStream<ConsoleFrame>> {
        let path = format!("{}/console", process_path(id));
        let events = self
            .open_sse("console stream", self.request(reqwest::Method::GET, &path))
            .await?;
        Ok(events
            .filter_map(|ev| async move {
                match ev {
                    Ok(ev) => console_frame(ev).map(Ok),
                    Err(e) => Some(Err(e)),
                }
            })
            .boxed())
    }

    async fn begin_operation(&self, id: &ProcessId, request: &OperationRequest) -> Result<String> {
        let kind = request.kind();
        let path = format!("{}/files/{}", process_path(id), kind.as_str());
        let rb = self.request(reqwest::Method::POST, &path);
        let rb = match request {
            OperationRequest::Upload {
                directory,
                file_name,
                data,
            } => rb
                .query(&[("directory", directory.as_str()), ("file_name", file_name.as_str())])
                .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                .body(data.clone()),
            other => rb.json(&operation_body(other)),
        };
        let action = format!("begin {kind}");
        let resp: BeginResponse = self.send_json(&action, rb).await?;
        Ok(resp.tracker)
    }

    async fn operation_events(
        &self,
        id: &ProcessId,
        remote_id: &str,
    ) -> Result<EventStream<OperationEvent>> {
        let path = format!("{}/operations/{}/events", process_path(id), remote_id);
        let events = self
            .open_sse("operation events", self.request(reqwest::Method::GET, &path))
            .await?;
        Ok(events
            .filter_map(|ev| async move {
                match ev {
                    Ok(ev) => operation_event(ev),
                    Err(e) => Some(Err(e)),
                }
            })
            .boxed())
    }

    async fn cancel_operation(&self, id: &ProcessId, remote_id: &str) -> Result<()> {
        let path = format!("{}/operations/{}", process_path(id), remote_id);
        self.send("cancel operation", self.request(reqwest::Method::DELETE, &path))
            .await?;
        Ok(())
    }

    async fn list_dir(&self, id: &ProcessId, path: &str) -> Result<Vec<FileEntry>> {
        let url = format!("{}/files/list", process_path(id));
        let rb = self
            .request(reqwest::Method::GET, &url)
            .query(&[("path", path)]);
        self.send_json("list directory", rb).await
    }

    async fn file_action(&self, id: &ProcessId, action: &FileAction) -> Result<()> {
        let path = format!("{}/files/{}", process_path(id), action.as_str());
        let rb = self
            .request(reqwest::Method::POST, &path)
            .json(&file_action_body(action));
        self.send(action.as_str(), rb).await?;
        Ok(())
    }

    async fn list_runtimes(&self) -> Result<Vec<RuntimeVersion>> {
        self.send_json("list runtimes", self.request(reqwest::Method::GET, "/runtime"))
            .await
    }

    async fn runtime_manifest(&self, runtime: &str) -> Result<Vec<String>> {
        let path = format!("/runtime/{runtime}/files");
        self.send_json("fetch runtime manifest", self.request(reqwest::Method::GET, &path))
            .await
    }

    async fn install_runtime(&self, runtime: &str) -> Result<EventStream<InstallEvent>> {
        let path = format!("/runtime/{runtime}/install");
        let events = self
            .open_sse("install runtime", self.request(reqwest::Method::POST, &path))
            .await?;
        Ok(events
            .filter_map(|ev| async move {
                match ev {
                    Ok(ev) => install_event(ev).map(Ok),
                    Err(e) => Some(Err(e)),
                }
            })
            .boxed())
    }

    async fn cancel_runtime_install(&self, runtime: &str) -> Result<()> {
        let path = format!("/runtime/{runtime}/install");
        self.send(
            "cancel runtime install",
            self.request(reqwest::Method::DELETE, &path),
        )
        .await?;
        Ok(())
    }

    async fn uninstall_runtime(&self, runtime: &str) -> Result<()> {
        let path = format!("/runtime/{runtime}");
        self.send("uninstall runtime", self.request(reqwest::Method::DELETE, &path))
            .await?;
        Ok(())
    }
}
