use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};

/// Server-assigned identifier of a managed game-server process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct ProcessId(pub String);

impl ProcessId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProcessId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ProcessId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessStatus {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
    Crashed,
    Hanging,
}

impl ProcessStatus {
    pub const ALL: [ProcessStatus; 8] = [
        ProcessStatus::Idle,
        ProcessStatus::Starting,
        ProcessStatus::Running,
        ProcessStatus::Stopping,
        ProcessStatus::Stopped,
        ProcessStatus::Error,
        ProcessStatus::Crashed,
        ProcessStatus::Hanging,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProcessStatus::Idle => "idle",
            ProcessStatus::Starting => "starting",
            ProcessStatus::Running => "running",
            ProcessStatus::Stopping => "stopping",
            ProcessStatus::Stopped => "stopped",
            ProcessStatus::Error => "error",
            ProcessStatus::Crashed => "crashed",
            ProcessStatus::Hanging => "hanging",
        }
    }

    /// Live console is meaningful for these; otherwise show the log file.
    pub fn is_running_like(self) -> bool {
        matches!(
            self,
            ProcessStatus::Running
                | ProcessStatus::Starting
                | ProcessStatus::Stopping
                | ProcessStatus::Hanging
        )
    }

    pub fn is_transitional(self) -> bool {
        matches!(self, ProcessStatus::Starting | ProcessStatus::Stopping)
    }

    pub fn is_failure(self) -> bool {
        matches!(self, ProcessStatus::Error | ProcessStatus::Crashed)
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown process status: {}", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

impl FromStr for ProcessStatus {
    type Err = UnknownStatus;

    // Remote casing is not stable ("RUNNING", "Running", "running").
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let norm = s.trim().to_ascii_lowercase();
        ProcessStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == norm)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

impl serde::Serialize for ProcessStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> serde::Deserialize<'de> for ProcessStatus {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Lifecycle command accepted by the remote process supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    Start,
    Stop,
    Restart,
    Kill,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Start => "start",
            Command::Stop => "stop",
            Command::Restart => "restart",
            Command::Kill => "kill",
        }
    }

    /// Status shown between issuing the command and the first poll result.
    pub fn transitional_status(self) -> ProcessStatus {
        match self {
            Command::Start => ProcessStatus::Starting,
            Command::Stop | Command::Restart | Command::Kill => ProcessStatus::Stopping,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "start" => Ok(Command::Start),
            "stop" => Ok(Command::Stop),
            "restart" => Ok(Command::Restart),
            "kill" => Ok(Command::Kill),
            other => Err(format!("unknown command: {other}")),
        }
    }
}

/// Snapshot of a managed process as reported by the remote API.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ManagedProcess {
    pub id: ProcessId,
    #[serde(default)]
    pub name: String,
    pub status: ProcessStatus,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,
}

impl ManagedProcess {
    pub fn new(id: impl Into<ProcessId>, status: ProcessStatus) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            status,
            created_at: None,
            updated_at: None,
            last_started_at: None,
            owner_id: None,
            config: serde_json::Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
struct RawRuntimeVersion {
    runtime: String,
    version: String,
    #[serde(default)]
    installed: bool,
    #[serde(default)]
    executable: Option<String>,
}

/// Installable runtime component (e.g. a Java distribution).
///
/// `runtime` is the stable key; version pickers must re-resolve by it after
/// the list is refreshed.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(from = "RawRuntimeVersion")]
pub struct RuntimeVersion {
    pub runtime: String,
    pub version: String,
    pub installed: bool,
    pub executable: Option<String>,
}

impl From<RawRuntimeVersion> for RuntimeVersion {
    fn from(raw: RawRuntimeVersion) -> Self {
        // Not installed means there is nothing to execute.
        let executable = if raw.installed {
            raw.executable.filter(|e| !e.trim().is_empty())
        } else {
            None
        };
        Self {
            runtime: raw.runtime,
            version: raw.version,
            installed: raw.installed,
            executable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parses_any_casing() {
        assert_eq!("RUNNING".parse::<ProcessStatus>().unwrap(), ProcessStatus::Running);
        assert_eq!("Stopped".parse::<ProcessStatus>().unwrap(), ProcessStatus::Stopped);
        assert_eq!(" hanging ".parse::<ProcessStatus>().unwrap(), ProcessStatus::Hanging);
        assert!("rebooting".parse::<ProcessStatus>().is_err());
    }

    #[test]
    fn running_like_set() {
        let running_like: Vec<_> = ProcessStatus::ALL
            .into_iter()
            .filter(|s| s.is_running_like())
            .collect();
        assert_eq!(
            running_like,
            vec![
                ProcessStatus::Starting,
                ProcessStatus::Running,
                ProcessStatus::Stopping,
                ProcessStatus::Hanging,
            ]
        );
    }

    #[test]
    fn command_transitional_status() {
        assert_eq!(Command::Start.transitional_status(), ProcessStatus::Starting);
        assert_eq!(Command::Stop.transitional_status(), ProcessStatus::Stopping);
        assert_eq!(Command::Restart.transitional_status(), ProcessStatus::Stopping);
        assert_eq!(Command::Kill.transitional_status(), ProcessStatus::Stopping);
    }

    #[test]
    fn managed_process_decodes_uppercase_status() {
        let p: ManagedProcess = serde_json::from_str(
            r#"{"id":"srv1","status":"CRASHED","owner_id":"u1","config":{"memory":4096}}"#,
        )
        .unwrap();
        assert_eq!(p.id, ProcessId::from("srv1"));
        assert_eq!(p.status, ProcessStatus::Crashed);
        assert_eq!(p.config.get("memory").and_then(|v| v.as_u64()), Some(4096));

        let out = serde_json::to_value(&p).unwrap();
        assert_eq!(out["status"], "crashed");
    }

    #[test]
    fn runtime_version_not_installed_drops_executable() {
        let v: RuntimeVersion = serde_json::from_str(
            r#"{"runtime":"temurin-21","version":"21.0.2","installed":false,"executable":"/opt/java/bin/java"}"#,
        )
        .unwrap();
        assert!(!v.installed);
        assert_eq!(v.executable, None);

        let v: RuntimeVersion = serde_json::from_str(
            r#"{"runtime":"temurin-21","version":"21.0.2","installed":true,"executable":"/opt/java/bin/java"}"#,
        )
        .unwrap();
        assert_eq!(v.executable.as_deref(), Some("/opt/java/bin/java"));
    }
}
