use std::env;
use std::path::PathBuf;
use thiserror::Error;
use url::Url;

pub const ENDPOINT_ENV: &str = "PIXEL_CANVAS_ENDPOINT";
pub const MODULE_ENV: &str = "PIXEL_CANVAS_MODULE";
pub const CREDENTIALS_ENV: &str = "PIXEL_CANVAS_CREDENTIALS";

pub const DEFAULT_ENDPOINT: &str = "ws://localhost:3000";
pub const DEFAULT_MODULE: &str = "local-pixel-canvas";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("endpoint cannot be empty")]
    EmptyEndpoint,
    #[error("invalid endpoint '{raw}': {reason}")]
    InvalidEndpoint { raw: String, reason: String },
    #[error("module name cannot be empty")]
    EmptyModule,
}

/// Where the authoritative store lives and where the auth token is kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub endpoint: Url,
    pub module: String,
    /// Overrides `~/.pixel-canvas/credentials`.
    pub credentials_path: Option<PathBuf>,
}

impl Config {
    pub fn new(endpoint: &str, module: &str) -> Result<Self, ConfigError> {
        let module = module.trim();
        if module.is_empty() {
            return Err(ConfigError::EmptyModule);
        }
        Ok(Self {
            endpoint: normalize_endpoint(endpoint)?,
            module: module.to_string(),
            credentials_path: None,
        })
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let endpoint = env::var(ENDPOINT_ENV).unwrap_or_else(|_| DEFAULT_ENDPOINT.to_string());
        let module = env::var(MODULE_ENV).unwrap_or_else(|_| DEFAULT_MODULE.to_string());
        let mut config = Self::new(&endpoint, &module)?;
        config.credentials_path = env::var_os(CREDENTIALS_ENV)
            .filter(|path| !path.is_empty())
            .map(PathBuf::from);
        Ok(config)
    }
}

/// Accepts `host:port`, `ws(s)://` and `http(s)://` forms and yields a WebSocket
/// URL. `localhost` becomes `127.0.0.1` so IPv6 `::1` is never tried first.
pub fn normalize_endpoint(raw: &str) -> Result<Url, ConfigError> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(ConfigError::EmptyEndpoint);
    }
    let with_scheme = if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if trimmed.starts_with("ws://") || trimmed.starts_with("wss://") {
        trimmed.to_string()
    } else if trimmed.contains("://") {
        return Err(ConfigError::InvalidEndpoint {
            raw: raw.to_string(),
            reason: "unsupported scheme".into(),
        });
    } else {
        format!("ws://{trimmed}")
    };

    let mut url = Url::parse(&with_scheme).map_err(|err| ConfigError::InvalidEndpoint {
        raw: raw.to_string(),
        reason: err.to_string(),
    })?;
    if url.host_str() == Some("localhost") {
        url.set_host(Some("127.0.0.1"))
            .map_err(|err| ConfigError::InvalidEndpoint {
                raw: raw.to_string(),
                reason: err.to_string(),
            })?;
    }
    Ok(url)
}
