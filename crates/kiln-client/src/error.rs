use std::collections::BTreeMap;

const MAX_MESSAGE_BYTES: usize = 32 * 1024;
const MAX_HINT_BYTES: usize = 8 * 1024;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    /// The remote API answered with a non-success status.
    #[error("{action}: {message}")]
    Remote {
        action: String,
        status: Option<u16>,
        code: String,
        message: String,
        field_errors: BTreeMap<String, String>,
        hint: Option<String>,
    },

    /// Network or connection level failure.
    #[error("{action}: {message}")]
    Transport { action: String, message: String },

    #[error("failed to decode {what}: {message}")]
    Decode { what: String, message: String },

    #[error("no process id given and no process is currently loaded")]
    NoProcess,

    #[error("process {0} is not loaded")]
    NotLoaded(String),

    #[error("runtime {0} is already installed")]
    AlreadyInstalled(String),

    #[error("runtime {0} is not installed")]
    NotInstalled(String),

    #[error("runtime {0} is already being installed")]
    InstallInProgress(String),

    #[error("unknown runtime: {0}")]
    UnknownRuntime(String),

    #[error("event stream closed before the operation finished")]
    StreamClosed,

    /// Reported by the remote side for a tracked operation.
    #[error("{0}")]
    Operation(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;

impl ClientError {
    pub fn code(&self) -> &str {
        match self {
            ClientError::Remote { code, .. } => code,
            ClientError::Transport { .. } => "unreachable",
            ClientError::Decode { .. } => "decode_failed",
            ClientError::NoProcess => "no_process",
            ClientError::NotLoaded(_) => "not_loaded",
            ClientError::AlreadyInstalled(_) => "already_installed",
            ClientError::NotInstalled(_) => "not_installed",
            ClientError::InstallInProgress(_) => "install_in_progress",
            ClientError::UnknownRuntime(_) => "not_found",
            ClientError::StreamClosed => "stream_closed",
            ClientError::Operation(_) => "operation_failed",
        }
    }

    pub(crate) fn transport(action: &str, err: impl std::fmt::Display) -> Self {
        ClientError::Transport {
            action: action.to_string(),
            message: truncate_utf8(&err.to_string(), MAX_MESSAGE_BYTES),
        }
    }

    pub(crate) fn decode(what: &str, err: impl std::fmt::Display) -> Self {
        ClientError::Decode {
            what: what.to_string(),
            message: truncate_utf8(&err.to_string(), MAX_MESSAGE_BYTES),
        }
    }

    /// Builds a `Remote` error from a failed response body.
    ///
    /// Structured `{code, message, field_errors, hint}` bodies keep their
    /// fields; anything else is kept as the message verbatim.
    pub(crate) fn from_response(action: &str, status: u16, body: &str) -> Self {
        if let Some(payload) = parse_error_payload(body) {
            return ClientError::Remote {
                action: action.to_string(),
                status: Some(status),
                code: payload.code,
                message: truncate_utf8(&payload.message, MAX_MESSAGE_BYTES),
                field_errors: payload.field_errors.unwrap_or_default(),
                hint: payload.hint.map(|h| truncate_utf8(&h, MAX_HINT_BYTES)),
            };
        }

        let code = match status {
            400 | 422 => "invalid_param",
            401 => "unauthorized",
            403 => "permission_denied",
            404 => "not_found",
            409 => "conflict",
            429 => "rate_limited",
            502..=504 => "unavailable",
            _ => "remote_error",
        };
        let message = body.trim();
        let message = if message.is_empty() {
            format!("http status {status}")
        } else {
            truncate_utf8(message, MAX_MESSAGE_BYTES)
        };
        ClientError::Remote {
            action: action.to_string(),
            status: Some(status),
            code: code.to_string(),
            message,
            field_errors: BTreeMap::new(),
            hint: None,
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
struct ErrorPayload {
    code: String,
    message: String,
    field_errors: Option<BTreeMap<String, String>>,
    hint: Option<String>,
}

fn parse_error_payload(raw: &str) -> Option<ErrorPayload> {
    serde_json::from_str::<ErrorPayload>(raw.trim()).ok()
}

pub(crate) fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let suffix = "…(truncated)";
    let keep = max_bytes.saturating_sub(suffix.len()).max(1);
    let mut end = keep.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    let mut out = s[..end].to_string();
    out.push_str(suffix);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structured_body_keeps_fields() {
        let body = r#"{"code":"invalid_param","message":"bad path","field_errors":{"path":"must be relative"},"hint":"use a relative path"}"#;
        let err = ClientError::from_response("archive", 400, body);
        match &err {
            ClientError::Remote {
                status,
                code,
                field_errors,
                hint,
                ..
            } => {
                assert_eq!(*status, Some(400));
                assert_eq!(code, "invalid_param");
                assert_eq!(field_errors.get("path").map(String::as_str), Some("must be relative"));
                assert_eq!(hint.as_deref(), Some("use a relative path"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(err.to_string(), "archive: bad path");
    }

    #[test]
    fn plain_body_maps_status_to_code() {
        let err = ClientError::from_response("fetch status", 404, "no such server");
        assert_eq!(err.code(), "not_found");

        let err = ClientError::from_response("fetch status", 503, "");
        assert_eq!(err.code(), "unavailable");
        assert_eq!(err.to_string(), "fetch status: http status 503");
    }

    #[test]
    fn truncates_long_messages_on_char_boundary() {
        let long = "é".repeat(MAX_MESSAGE_BYTES);
        let err = ClientError::from_response("upload", 500, &long);
        let ClientError::Remote { message, .. } = err else {
            panic!("expected remote error");
        };
        assert!(message.len() <= MAX_MESSAGE_BYTES);
        assert!(message.ends_with("…(truncated)"));
    }
}
