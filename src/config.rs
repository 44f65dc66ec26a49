use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{GraylogMcpError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServerMode {
    #[default]
    Stdio,
    Http,
    Both,
}

impl std::str::FromStr for ServerMode {
    type Err = GraylogMcpError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stdio" => Ok(ServerMode::Stdio),
            "http" => Ok(ServerMode::Http),
            "both" => Ok(ServerMode::Both),
            other => Err(GraylogMcpError::Config(format!(
                "invalid transport {other:?}: must be \"stdio\", \"http\" or \"both\""
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub mode: ServerMode,
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            mode: ServerMode::Stdio,
            bind: "0.0.0.0:8090".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraylogConfig {
    pub url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
    pub tls_skip_verify: bool,
    pub timeout_ms: u64,
}

impl Default for GraylogConfig {
    fn default() -> Self {
        Self {
            url: None,
            username: None,
            password: None,
            token: None,
            tls_skip_verify: false,
            timeout_ms: 30_000,
        }
    }
}

impl GraylogConfig {
    /// Basic-auth pair sent upstream. Graylog accepts an access token as the
    /// user name with the literal password `token`.
    pub fn credentials(&self) -> Option<(String, String)> {
        if let Some(token) = self.token.as_ref().filter(|t| !t.is_empty()) {
            return Some((token.clone(), "token".to_string()));
        }
        match (&self.username, &self.password) {
            (Some(u), Some(p)) if !u.is_empty() && !p.is_empty() => Some((u.clone(), p.clone())),
            _ => None,
        }
    }
}

/// Sizing knobs for result shaping and upstream fetches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Byte budget for a tool response; `0` disables fitting.
    pub max_result_size: usize,
    pub sample_id_cap: usize,
    pub dedup_fetch_multiplier: usize,
    pub context_overfetch_multiplier: usize,
    pub context_fetch_ceiling: usize,
    pub context_max_side: usize,
    pub context_result_size: usize,
    pub max_search_limit: usize,
    pub default_search_limit: usize,
    pub default_range_secs: u64,
    pub default_group_limit: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_result_size: 50_000,
            sample_id_cap: 5,
            dedup_fetch_multiplier: 3,
            context_overfetch_multiplier: 3,
            context_fetch_ceiling: 1501,
            context_max_side: 500,
            context_result_size: 50_000,
            max_search_limit: 10_000,
            default_search_limit: 50,
            default_range_secs: 300,
            default_group_limit: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub graylog: GraylogConfig,
    pub limits: LimitsConfig,
}

impl Config {
    /// Loads the optional config file, applies `GRAYLOG_*` environment
    /// overrides and validates the result.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(p) => Self::load_from_path(p)?,
            None => Self::default(),
        };
        cfg.apply_env(|key| std::env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            GraylogMcpError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        if is_json {
            serde_json::from_str(&raw)
                .map_err(|e| GraylogMcpError::Config(format!("{}: {e}", path.display())))
        } else {
            serde_yaml::from_str(&raw)
                .map_err(|e| GraylogMcpError::Config(format!("{}: {e}", path.display())))
        }
    }

    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(v) = get("GRAYLOG_URL") {
            self.graylog.url = Some(v);
        }
        if let Some(v) = get("GRAYLOG_USERNAME") {
            self.graylog.username = Some(v);
        }
        if let Some(v) = get("GRAYLOG_PASSWORD") {
            self.graylog.password = Some(v);
        }
        if let Some(v) = get("GRAYLOG_TOKEN") {
            self.graylog.token = Some(v);
        }
        if let Some(v) = get("GRAYLOG_TLS_SKIP_VERIFY") {
            self.graylog.tls_skip_verify = parse_bool(&v).ok_or_else(|| {
                GraylogMcpError::Config(format!(
                    "invalid GRAYLOG_TLS_SKIP_VERIFY {v:?}: must be true/false/1/0"
                ))
            })?;
        }
        if let Some(v) = get("GRAYLOG_TIMEOUT_MS") {
            self.graylog.timeout_ms = v.trim().parse().map_err(|_| {
                GraylogMcpError::Config(format!("invalid GRAYLOG_TIMEOUT_MS {v:?}"))
            })?;
        }
        if let Some(v) = get("GRAYLOG_MCP_TRANSPORT") {
            self.server.mode = v.parse()?;
        }
        if let Some(v) = get("GRAYLOG_MCP_HTTP_BIND") {
            self.server.bind = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let url = self
            .graylog
            .url
            .as_deref()
            .ok_or_else(|| GraylogMcpError::Config("GRAYLOG_URL is required".into()))?;
        validate_base_url(url)?;

        if self.graylog.credentials().is_none() {
            return Err(GraylogMcpError::Config(
                "authentication required: set GRAYLOG_TOKEN or both GRAYLOG_USERNAME and GRAYLOG_PASSWORD"
                    .into(),
            ));
        }
        if self.graylog.tls_skip_verify {
            warn!("TLS certificate verification is disabled");
        }
        Ok(())
    }
}

fn validate_base_url(raw: &str) -> Result<()> {
    let parsed = reqwest::Url::parse(raw)
        .map_err(|e| GraylogMcpError::Config(format!("invalid GRAYLOG_URL: {e}")))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(GraylogMcpError::Config(format!(
            "GRAYLOG_URL must use http or https scheme, got {:?}",
            parsed.scheme()
        )));
    }
    if parsed.host_str().map(str::is_empty).unwrap_or(true) {
        return Err(GraylogMcpError::Config("GRAYLOG_URL host is required".into()));
    }
    Ok(())
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "t" | "yes" => Some(true),
        "0" | "false" | "f" | "no" => Some(false),
        _ => None,
    }
}
