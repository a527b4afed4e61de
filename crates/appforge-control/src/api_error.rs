use appforge_agent::{CommandError, ProjectError};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

const MAX_MESSAGE_BYTES: usize = 32 * 1024;
const MAX_HINT_BYTES: usize = 8 * 1024;

#[derive(Debug, serde::Serialize)]
struct ErrorBody<'a> {
    code: &'a str,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<&'a str>,
}

/// Error response with a stable machine-readable `code`.
#[derive(Debug, Clone)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub hint: Option<String>,
}

fn truncate_utf8(s: &str, max_bytes: usize) -> String {
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

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: truncate_utf8(&message.into(), MAX_MESSAGE_BYTES),
            hint: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(truncate_utf8(&hint.into(), MAX_HINT_BYTES));
        self
    }

    pub fn invalid_param(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_param", message)
    }
}

pub fn status_for(err: &ProjectError) -> StatusCode {
    match err {
        ProjectError::NotFound(_) => StatusCode::NOT_FOUND,
        ProjectError::TemplateNotFound(_)
        | ProjectError::InvalidTemplate { .. }
        | ProjectError::InvalidParam { .. } => StatusCode::BAD_REQUEST,
        ProjectError::NotRunning(_) => StatusCode::CONFLICT,
        ProjectError::NoCapacity { .. } => StatusCode::SERVICE_UNAVAILABLE,
        ProjectError::Upstream(_) => StatusCode::BAD_GATEWAY,
        ProjectError::Command(_) | ProjectError::Persistence(_) | ProjectError::Workspace(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn hint_for(err: &ProjectError) -> Option<String> {
    match err {
        ProjectError::TemplateNotFound(_) => {
            Some("GET /templates lists the available templates".to_string())
        }
        ProjectError::NotRunning(id) => Some(format!("POST /projects/{id}/start first")),
        ProjectError::NoCapacity { .. } => Some(
            "stop unused projects or widen APPFORGE_PORT_RANGE_START/APPFORGE_PORT_RANGE_END"
                .to_string(),
        ),
        ProjectError::Command(CommandError::Spawn { program, .. }) => Some(format!(
            "is `{program}` installed and on PATH? (APPFORGE_RUNTIME_BIN)"
        )),
        _ => None,
    }
}

impl From<ProjectError> for ApiError {
    fn from(err: ProjectError) -> Self {
        let mut out = Self::new(status_for(&err), err.code(), err.to_string());
        if let Some(hint) = hint_for(&err) {
            out = out.with_hint(hint);
        }
        out
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::warn!(status = %self.status, code = self.code, message = %self.message, "request failed");
        } else {
            tracing::debug!(status = %self.status, code = self.code, message = %self.message, "request rejected");
        }
        let body = ErrorBody {
            code: self.code,
            message: &self.message,
            hint: self.hint.as_deref(),
        };
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use appforge_process::ProjectId;

    use super::*;

    #[test]
    fn long_messages_are_truncated_on_char_boundary() {
        let long = "é".repeat(MAX_MESSAGE_BYTES);
        let err = ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "x", long);
        assert!(err.message.len() <= MAX_MESSAGE_BYTES);
        assert!(err.message.ends_with("…(truncated)"));
    }

    #[test]
    fn short_messages_are_untouched() {
        assert_eq!(truncate_utf8("abc", 10), "abc");
    }

    #[test]
    fn project_errors_map_to_distinct_statuses() {
        let cases = [
            (ProjectError::NotFound(ProjectId::from("a")), 404, "project_not_found"),
            (ProjectError::TemplateNotFound("t".into()), 400, "template_not_found"),
            (ProjectError::NotRunning(ProjectId::from("a")), 409, "project_not_running"),
            (ProjectError::NoCapacity { start: 1, end: 2 }, 503, "no_port_capacity"),
            (ProjectError::Upstream("refused".into()), 502, "upstream_unavailable"),
            (
                ProjectError::Command(CommandError::Failed {
                    program: "docker".into(),
                    code: Some(125),
                    stderr: "port is already allocated".into(),
                }),
                500,
                "runtime_command_failed",
            ),
        ];
        for (err, status, code) in cases {
            let api = ApiError::from(err);
            assert_eq!(api.status.as_u16(), status);
            assert_eq!(api.code, code);
        }
    }

    #[test]
    fn runtime_failures_carry_stderr() {
        let api = ApiError::from(ProjectError::Command(CommandError::Failed {
            program: "docker".into(),
            code: Some(125),
            stderr: "port is already allocated".into(),
        }));
        assert!(api.message.contains("port is already allocated"));
    }

    #[test]
    fn not_running_suggests_start() {
        let api = ApiError::from(ProjectError::NotRunning(ProjectId::from("p1")));
        assert_eq!(api.hint.as_deref(), Some("POST /projects/p1/start first"));
    }
}
