use http::HeaderMap;
use http::header;

pub const PRIVATE_TOKEN_HEADER: &str = "private-token";

/// A backend credential carried for the duration of one request.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// OAuth access token, sent as `Authorization: Bearer`.
    OAuth(String),
    /// Personal or service access token, sent as `PRIVATE-TOKEN`.
    PrivateToken(String),
}

impl Credentials {
    pub fn header(&self) -> (&'static str, String) {
        match self {
            Credentials::OAuth(token) => ("authorization", format!("Bearer {}", token)),
            Credentials::PrivateToken(token) => (PRIVATE_TOKEN_HEADER, token.clone()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Credentials::OAuth(_) => "oauth",
            Credentials::PrivateToken(_) => "private_token",
        }
    }
}

// Tokens never reach logs.
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Credentials({}, <redacted>)", self.kind())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct AuthError {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMode {
    /// Forward the caller's own token to the backend.
    Passthrough,
    /// Use one configured token for every caller.
    Service(String),
}

#[derive(Debug, Clone)]
pub struct CredentialExtractor {
    mode: AuthMode,
}

impl CredentialExtractor {
    pub fn new(mode: AuthMode) -> Result<Self, AuthError> {
        if let AuthMode::Service(token) = &mode
            && token.trim().is_empty()
        {
            return Err(AuthError {
                code: "ERR_INVALID_CONFIG",
                message: "service auth mode requires a non-empty token".to_string(),
            });
        }
        Ok(Self { mode })
    }

    pub fn extract(&self, headers: &HeaderMap) -> Result<Credentials, AuthError> {
        match &self.mode {
            AuthMode::Service(token) => Ok(Credentials::PrivateToken(token.trim().to_string())),
            AuthMode::Passthrough => credentials_from_headers(headers),
        }
    }
}

pub fn credentials_from_headers(headers: &HeaderMap) -> Result<Credentials, AuthError> {
    if headers.contains_key(header::AUTHORIZATION) {
        return bearer_token(headers).map(Credentials::OAuth);
    }

    let private_token = headers
        .get(PRIVATE_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty());

    match private_token {
        Some(token) => Ok(Credentials::PrivateToken(token.to_string())),
        None => Err(AuthError {
            code: "ERR_AUTH_REQUIRED",
            message: "missing Authorization or PRIVATE-TOKEN header".to_string(),
        }),
    }
}

fn bearer_token(headers: &HeaderMap) -> Result<String, AuthError> {
    let authz = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AuthError {
            code: "ERR_AUTH_REQUIRED",
            message: "missing Authorization header".to_string(),
        })?;

    let token = authz
        .strip_prefix("Bearer ")
        .or_else(|| authz.strip_prefix("bearer "))
        .ok_or_else(|| AuthError {
            code: "ERR_AUTH_INVALID",
            message: "Authorization must be a Bearer token".to_string(),
        })?;

    if token.trim().is_empty() {
        return Err(AuthError {
            code: "ERR_AUTH_INVALID",
            message: "Bearer token is empty".to_string(),
        });
    }

    Ok(token.trim().to_string())
}
