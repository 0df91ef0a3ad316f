use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GitLabError {
    #[error("GitLab request timed out")]
    Timeout,
    #[error("GitLab transport error: {0}")]
    Transport(String),
    #[error("GitLab returned status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("GitLab returned an invalid response: {0}")]
    InvalidResponse(String),
    #[error("invalid GitLab URL: {0}")]
    InvalidUrl(String),
}

impl GitLabError {
    /// Failures worth a second attempt for idempotent calls.
    pub fn is_transient(&self) -> bool {
        match self {
            GitLabError::Timeout | GitLabError::Transport(_) => true,
            GitLabError::Status { status, .. } => matches!(status, 502..=504),
            GitLabError::InvalidResponse(_) | GitLabError::InvalidUrl(_) => false,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            GitLabError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    pub(crate) fn from_status(status: u16, body: &[u8]) -> Self {
        GitLabError::Status {
            status,
            message: error_message(body).unwrap_or_else(|| default_message(status).to_string()),
        }
    }
}

impl From<reqwest::Error> for GitLabError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            GitLabError::Timeout
        } else if value.is_decode() {
            GitLabError::InvalidResponse(value.to_string())
        } else {
            GitLabError::Transport(value.to_string())
        }
    }
}

fn error_message(body: &[u8]) -> Option<String> {
    let value = serde_json::from_slice::<Value>(body).ok()?;
    let raw = value.get("message").or_else(|| value.get("error"))?;
    let message = match raw {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let message = message.trim();
    (!message.is_empty()).then(|| message.to_string())
}

fn default_message(status: u16) -> &'static str {
    match status {
        400 => "bad request",
        401 => "unauthorized",
        403 => "forbidden",
        404 => "not found",
        409 => "conflict",
        422 => "unprocessable entity",
        429 => "too many requests",
        500..=599 => "server error",
        _ => "unexpected status",
    }
}
