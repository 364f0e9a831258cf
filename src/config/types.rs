use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::BuffyError;

/// Reserved response template names the core recognizes directly.
pub const NAME_OK: &str = "200";
pub const NAME_HIT_MAX_QUEUE: &str = "hit_max_queue";
pub const NAME_HIT_TIMEOUT: &str = "hit_timeout";

fn default_probe_interval_ms() -> u64 {
    0
}

/// Top-level configuration, loaded once at startup and immutable thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuffyConfig {
    pub version: String,

    pub buffy: ServerDef,

    #[serde(default)]
    pub upstreams: Vec<UpstreamDef>,

    #[serde(default)]
    pub endpoints: Vec<EndpointDef>,

    /// Absolute path of the config file this was loaded from. Not part of
    /// the wire format — populated by `BuffyConfig::load`.
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Directory containing `config_path`, used to resolve `file://` content.
    #[serde(skip)]
    pub base_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerDef {
    pub listen: ListenAddr,

    #[serde(default)]
    pub admin: AdminDef,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListenAddr {
    #[serde(default)]
    pub bind: String,
    #[serde(default)]
    pub port: u16,
}

impl ListenAddr {
    pub fn host_port(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdminDef {
    #[serde(default = "default_admin_path")]
    pub path: String,
    #[serde(default)]
    pub bind: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub notify: AdminNotify,
}

fn default_admin_path() -> String {
    "/_admin".to_string()
}

impl AdminDef {
    pub fn host_port(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdminNotify {
    #[serde(default)]
    pub webhook: Option<String>,
    /// Declared for configuration compatibility; delivery is a no-op.
    #[serde(default)]
    pub slack: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamDef {
    pub id: String,
    pub endpoint: String,

    /// Probe interval in milliseconds. `0` means "use the default" (2000ms).
    #[serde(default = "default_probe_interval_ms")]
    pub interval: u64,

    /// Declared for configuration compatibility; rule evaluation is not
    /// implemented.
    #[serde(default)]
    pub autogate: Option<serde_yaml::Value>,
}

impl UpstreamDef {
    pub fn probe_interval(&self) -> Duration {
        if self.interval == 0 {
            Duration::from_millis(2000)
        } else {
            Duration::from_millis(self.interval)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointType {
    Proxy,
    Respond,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyMode {
    StoreAndForward,
    Bypass,
}

impl ProxyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyMode::StoreAndForward => "store_and_forward",
            ProxyMode::Bypass => "bypass",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointDef {
    pub id: String,
    #[serde(default)]
    pub desc: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: EndpointType,

    /// Only the first id is ever consulted; multiple upstreams per
    /// endpoint neither fan out nor fail over.
    #[serde(default)]
    pub upstream: Vec<String>,

    #[serde(default = "default_proxy_mode")]
    pub proxy_mode: ProxyMode,

    #[serde(default)]
    pub timeout: u64,

    #[serde(default)]
    pub max_queue: usize,

    #[serde(default)]
    pub methods: Vec<String>,

    #[serde(default)]
    pub response: Vec<ResponseTemplate>,
}

fn default_proxy_mode() -> ProxyMode {
    ProxyMode::Bypass
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseTemplate {
    pub name: String,
    pub return_code: u16,
    pub content: String,
}

impl EndpointDef {
    /// The endpoint's sole bound upstream id, if any (first in the list).
    pub fn primary_upstream(&self) -> Option<&str> {
        self.upstream.first().map(|s| s.as_str())
    }

    /// Resolve a named response template to `(return_code, body)`.
    ///
    /// Inline content is used verbatim; `file://PATH` content is read from
    /// disk relative to `base_path`.
    pub fn resolve_response(
        &self,
        name: &str,
        base_path: &Path,
    ) -> Result<(u16, String), BuffyError> {
        let tpl = self
            .response
            .iter()
            .find(|r| r.name == name)
            .ok_or_else(|| BuffyError::Template(format!("not found name '{}'", name)))?;

        if let Some(rest) = tpl.content.strip_prefix("file://") {
            let file_path = base_path.join(rest.trim_start_matches('/'));
            let body = std::fs::read_to_string(&file_path).map_err(|e| {
                BuffyError::Template(format!(
                    "failed to read '{}': {}",
                    file_path.display(),
                    e
                ))
            })?;
            Ok((tpl.return_code, body))
        } else {
            Ok((tpl.return_code, tpl.content.clone()))
        }
    }
}
