use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use sdlc_auth::AuthMode;

const MAX_ENTITY_FETCH_CONCURRENCY: usize = 64;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub gitlab_url: String,
    pub gitlab_timeout_ms: u64,
    pub gitlab_retry_backoff_ms: u64,
    pub request_timeout_ms: u64,
    pub entities_root: String,
    pub entity_fetch_concurrency: usize,
    pub project_id_prefix: Option<String>,
    pub auth_mode: AuthMode,
    pub metrics_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for StartupError {}

impl ServerConfig {
    pub fn load() -> Result<Self, StartupError> {
        let mut merged = HashMap::new();

        if let Ok(config_path) = std::env::var("SDLC_CONFIG_PATH") {
            let config_path = config_path.trim();
            if !config_path.is_empty() {
                let file_kv = parse_env_file(config_path)?;
                merged.extend(file_kv);
            }
        }

        merged.extend(std::env::vars());

        Self::from_kv(&merged)
    }

    pub fn from_kv(kv: &HashMap<String, String>) -> Result<Self, StartupError> {
        let bind_addr = parse_socket_addr(
            kv.get("SDLC_BIND_ADDR"),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 7070),
            "SDLC_BIND_ADDR",
        )?;

        let auth_mode = parse_auth_mode(kv)?;

        let dev_allow_nonlocal_bind =
            parse_bool(kv.get("SDLC_DEV_ALLOW_NONLOCAL_BIND")).unwrap_or(false);

        // A service token would be usable by anyone who can reach the port.
        if matches!(auth_mode, AuthMode::Service(_))
            && !bind_addr.ip().is_loopback()
            && !(dev_allow_nonlocal_bind && is_unspecified_ip(bind_addr.ip()))
        {
            return Err(StartupError {
                code: "ERR_NONLOCAL_BIND_REQUIRES_AUTH",
                message: "service auth mode refuses non-local bind; use passthrough auth"
                    .to_string(),
            });
        }

        let gitlab_url = require_nonempty(kv, "SDLC_GITLAB_URL")?;
        if !(gitlab_url.starts_with("http://") || gitlab_url.starts_with("https://")) {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "SDLC_GITLAB_URL must be an http(s) URL".to_string(),
            });
        }

        let gitlab_timeout_ms = parse_u64(
            kv.get("SDLC_GITLAB_TIMEOUT_MS"),
            5000,
            "SDLC_GITLAB_TIMEOUT_MS",
        )?;
        if gitlab_timeout_ms == 0 {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "SDLC_GITLAB_TIMEOUT_MS must be >= 1".to_string(),
            });
        }

        let gitlab_retry_backoff_ms = parse_u64(
            kv.get("SDLC_GITLAB_RETRY_BACKOFF_MS"),
            100,
            "SDLC_GITLAB_RETRY_BACKOFF_MS",
        )?;

        let request_timeout_ms = parse_u64(
            kv.get("SDLC_REQUEST_TIMEOUT_MS"),
            30_000,
            "SDLC_REQUEST_TIMEOUT_MS",
        )?;
        if request_timeout_ms < gitlab_timeout_ms {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "SDLC_REQUEST_TIMEOUT_MS must be >= SDLC_GITLAB_TIMEOUT_MS".to_string(),
            });
        }

        let entities_root = kv
            .get("SDLC_ENTITIES_ROOT")
            .map(|s| s.trim().trim_matches('/'))
            .filter(|s| !s.is_empty())
            .unwrap_or("entities")
            .to_string();

        let entity_fetch_concurrency = parse_usize(
            kv.get("SDLC_ENTITY_FETCH_CONCURRENCY"),
            8,
            "SDLC_ENTITY_FETCH_CONCURRENCY",
        )?;
        if !(1..=MAX_ENTITY_FETCH_CONCURRENCY).contains(&entity_fetch_concurrency) {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: format!(
                    "SDLC_ENTITY_FETCH_CONCURRENCY must be between 1 and {}",
                    MAX_ENTITY_FETCH_CONCURRENCY
                ),
            });
        }

        let project_id_prefix = kv
            .get("SDLC_PROJECT_ID_PREFIX")
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string());
        if let Some(prefix) = &project_id_prefix
            && !prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "SDLC_PROJECT_ID_PREFIX must be alphanumeric".to_string(),
            });
        }

        let metrics_enabled = match kv.get("SDLC_METRICS_ENABLED") {
            None => true,
            Some(raw) if raw.trim().is_empty() => true,
            Some(raw) => parse_bool(Some(raw)).ok_or_else(|| StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "SDLC_METRICS_ENABLED must be a boolean".to_string(),
            })?,
        };

        Ok(Self {
            bind_addr,
            gitlab_url,
            gitlab_timeout_ms,
            gitlab_retry_backoff_ms,
            request_timeout_ms,
            entities_root,
            entity_fetch_concurrency,
            project_id_prefix,
            auth_mode,
            metrics_enabled,
        })
    }

    pub fn gitlab_timeout(&self) -> Duration {
        Duration::from_millis(self.gitlab_timeout_ms)
    }

    pub fn gitlab_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.gitlab_retry_backoff_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn parse_env_file(path: &str) -> Result<HashMap<String, String>, StartupError> {
    let contents = std::fs::read_to_string(path).map_err(|_| StartupError {
        code: "ERR_CONFIG_FILE_READ",
        message: format!("failed to read config file at {}", path),
    })?;
    parse_env_lines(&contents)
}

fn parse_env_lines(contents: &str) -> Result<HashMap<String, String>, StartupError> {
    let mut kv = HashMap::new();

    for (idx, raw_line) in contents.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (key, value) = line.split_once('=').ok_or_else(|| StartupError {
            code: "ERR_CONFIG_FILE_PARSE",
            message: format!("invalid config line {} (expected KEY=VALUE)", idx + 1),
        })?;

        let key = key.trim();
        if key.is_empty() {
            return Err(StartupError {
                code: "ERR_CONFIG_FILE_PARSE",
                message: format!("invalid config line {} (empty key)", idx + 1),
            });
        }

        kv.insert(key.to_string(), strip_quotes(value.trim()));
    }

    Ok(kv)
}

fn strip_quotes(s: &str) -> String {
    for quote in ['"', '\''] {
        if s.len() >= 2
            && let Some(inner) = s.strip_prefix(quote).and_then(|s| s.strip_suffix(quote))
        {
            return inner.to_string();
        }
    }
    s.to_string()
}

fn require_nonempty(
    kv: &HashMap<String, String>,
    key: &'static str,
) -> Result<String, StartupError> {
    kv.get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
        .ok_or_else(|| StartupError {
            code: "ERR_MISSING_CONFIG",
            message: format!("missing required config key {}", key),
        })
}

fn parse_socket_addr(
    value: Option<&String>,
    default: SocketAddr,
    key: &'static str,
) -> Result<SocketAddr, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse::<SocketAddr>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be a valid host:port socket address", key),
        }),
    }
}

fn parse_usize(
    value: Option<&String>,
    default: usize,
    key: &'static str,
) -> Result<usize, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse::<usize>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be an integer", key),
        }),
    }
}

fn parse_u64(value: Option<&String>, default: u64, key: &'static str) -> Result<u64, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse::<u64>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be an integer", key),
        }),
    }
}

fn parse_auth_mode(kv: &HashMap<String, String>) -> Result<AuthMode, StartupError> {
    let mode = kv
        .get("SDLC_AUTH_MODE")
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .unwrap_or("passthrough");

    match mode {
        "passthrough" => Ok(AuthMode::Passthrough),
        "service" => Ok(AuthMode::Service(require_nonempty(
            kv,
            "SDLC_GITLAB_SERVICE_TOKEN",
        )?)),
        _ => Err(StartupError {
            code: "ERR_INVALID_CONFIG",
            message: "SDLC_AUTH_MODE must be passthrough or service".to_string(),
        }),
    }
}

fn parse_bool(value: Option<&String>) -> Option<bool> {
    let value = value.map(|v| v.trim()).filter(|v| !v.is_empty())?;

    match value {
        "1" | "true" | "TRUE" | "yes" | "YES" => Some(true),
        "0" | "false" | "FALSE" | "no" | "NO" => Some(false),
        _ => None,
    }
}

fn is_unspecified_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_unspecified(),
        IpAddr::V6(v6) => v6.is_unspecified(),
    }
}
