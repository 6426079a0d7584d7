//! Contract between the tracking core and whatever speaks to the panel API.
//!
//! [`crate::http::HttpRemote`] is the production binding; tests drive the
//! core through [`crate::testing::FakeRemote`].

use futures_util::stream::BoxStream;
use kiln_process::{Command, ManagedProcess, ProcessId, RuntimeVersion};

use crate::error::Result;

pub type EventStream<T> = BoxStream<'static, Result<T>>;

/// One frame of the live console connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleFrame {
    Open,
    Text(String),
    /// Named `error` event sent by the server; informational only.
    Diagnostic(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationKind {
    Archive,
    Extract,
    Upload,
    Download,
    Search,
    InstallRuntime,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Archive => "archive",
            OperationKind::Extract => "extract",
            OperationKind::Upload => "upload",
            OperationKind::Download => "download",
            OperationKind::Search => "search",
            OperationKind::InstallRuntime => "install_runtime",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationRequest {
    Archive {
        paths: Vec<String>,
        destination: String,
    },
    Extract {
        path: String,
        destination: String,
    },
    Upload {
        directory: String,
        file_name: String,
        data: Vec<u8>,
    },
    Download {
        url: String,
        directory: String,
        file_name: Option<String>,
    },
    Search {
        directory: String,
        query: String,
    },
}

impl OperationRequest {
    pub fn kind(&self) -> OperationKind {
        match self {
            OperationRequest::Archive { .. } => OperationKind::Archive,
            OperationRequest::Extract { .. } => OperationKind::Extract,
            OperationRequest::Upload { .. } => OperationKind::Upload,
            OperationRequest::Download { .. } => OperationKind::Download,
            OperationRequest::Search { .. } => OperationKind::Search,
        }
    }
}

/// Server-side event for a tracked file operation.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationEvent {
    /// Units (files or bytes, depending on the operation) done so far.
    Progress { processed: u64, total: u64 },
    Completed { result: Option<serde_json::Value> },
    Failed { message: String },
    Cancelled,
}

/// Server-side event for a runtime installation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallEvent {
    /// A manifest unit started transferring.
    Progress { unit: String },
    Completed { unit: String },
    Failed { message: String },
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileAction {
    Copy {
        paths: Vec<String>,
        destination: String,
    },
    Move {
        paths: Vec<String>,
        destination: String,
    },
    Rename {
        from: String,
        to: String,
    },
    Delete {
        paths: Vec<String>,
    },
    CreateDir {
        path: String,
    },
}

impl FileAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileAction::Copy { .. } => "copy",
            FileAction::Move { .. } => "move",
            FileAction::Rename { .. } => "rename",
            FileAction::Delete { .. } => "delete",
            FileAction::CreateDir { .. } => "mkdir",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FileEntry {
    pub name: String,
    #[serde(default)]
    pub is_dir: bool,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default)]
    pub modified_unix_ms: Option<u64>,
}

#[async_trait::async_trait]
pub trait RemoteApi: Send + Sync + 'static {
    async fn fetch_process(&self, id: &ProcessId) -> Result<ManagedProcess>;
    async fn send_command(&self, id: &ProcessId, command: Command) -> Result<()>;
    async fn delete_process(&self, id: &ProcessId) -> Result<()>;

    async fn open_console(&self, id: &ProcessId) -> Result<EventStream<ConsoleFrame>>;

    /// Returns the server-side correlation id of the started operation.
    async fn begin_operation(&self, id: &ProcessId, request: &OperationRequest) -> Result<String>;
    async fn operation_events(
        &self,
        id: &ProcessId,
        remote_id: &str,
    ) -> Result<EventStream<OperationEvent>>;
    async fn cancel_operation(&self, id: &ProcessId, remote_id: &str) -> Result<()>;

    async fn list_dir(&self, id: &ProcessId, path: &str) -> Result<Vec<FileEntry>>;
    async fn file_action(&self, id: &ProcessId, action: &FileAction) -> Result<()>;

    async fn list_runtimes(&self) -> Result<Vec<RuntimeVersion>>;
    async fn runtime_manifest(&self, runtime: &str) -> Result<Vec<String>>;
    async fn install_runtime(&self, runtime: &str) -> Result<EventStream<InstallEvent>>;
    async fn cancel_runtime_install(&self, runtime: &str) -> Result<()>;
    async fn uninstall_runtime(&self, runtime: &str) -> Result<()>;
}
