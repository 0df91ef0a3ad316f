use sdlc_contracts::{ErrorKind, SdlcError};
use sdlc_gitlab::GitLabError;

pub fn backend_error(err: GitLabError, subject: &str) -> SdlcError {
    let cause = err.to_string();
    match err {
        GitLabError::Timeout => {
            SdlcError::timeout(format!("timed out accessing {}", subject))
        }
        GitLabError::Transport(_) => SdlcError::unavailable(format!(
            "version control backend unreachable while accessing {}",
            subject
        ))
        .with_cause(cause),
        GitLabError::InvalidResponse(_) | GitLabError::InvalidUrl(_) => SdlcError::internal(
            format!("unexpected backend response while accessing {}", subject),
        )
        .with_cause(cause),
        GitLabError::Status { status, .. } => {
            let (kind, message) = match status {
                400 | 422 => (
                    ErrorKind::BadRequest,
                    format!("backend rejected request for {}", subject),
                ),
                401 => (
                    ErrorKind::Unauthorized,
                    "backend rejected the supplied credentials".to_string(),
                ),
                403 => (
                    ErrorKind::Forbidden,
                    format!("not permitted to access {}", subject),
                ),
                404 => (ErrorKind::NotFound, format!("unknown {}", subject)),
                409 => (
                    ErrorKind::Conflict,
                    format!("conflicting state for {}", subject),
                ),
                429 | 500..=599 => (
                    ErrorKind::Unavailable,
                    format!("version control backend unavailable for {}", subject),
                ),
                _ => (
                    ErrorKind::Internal,
                    format!("unexpected backend status {} for {}", status, subject),
                ),
            };
            SdlcError::new(kind, message).with_cause(cause)
        }
    }
}
