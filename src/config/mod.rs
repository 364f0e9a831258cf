pub mod types;


pub use types::*;

use crate::error::BuffyError;
use anyhow::{Context, Result};
use std::path::Path;

impl BuffyConfig {
    /// Load and validate a configuration file. Supports `.yaml`/`.yml` and
    /// `.json`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file '{}'", path.display()))?;

        let mut cfg: BuffyConfig = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)
                .with_context(|| format!("parsing YAML config '{}'", path.display()))?,
            Some("json") => serde_json::from_str(&content)
                .with_context(|| format!("parsing JSON config '{}'", path.display()))?,
            Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .yaml or .json"),
            None => anyhow::bail!("config file has no extension, use .yaml or .json"),
        };

        let config_path = path
            .canonicalize()
            .with_context(|| format!("resolving absolute path for '{}'", path.display()))?;
        let base_path = config_path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| Path::new(".").to_path_buf());

        cfg.config_path = config_path;
        cfg.base_path = base_path;

        cfg.validate().map_err(anyhow::Error::from)?;
        Ok(cfg)
    }

    /// Startup-time structural validation. Configuration errors are fatal
    /// at startup.
    pub fn validate(&self) -> Result<(), BuffyError> {
        let mut seen = std::collections::HashSet::new();
        for up in &self.upstreams {
            if !seen.insert(up.id.as_str()) {
                return Err(BuffyError::Configuration(format!(
                    "duplicate upstream id '{}'",
                    up.id
                )));
            }
            if up.endpoint.parse::<http::Uri>().is_err() {
                return Err(BuffyError::Configuration(format!(
                    "upstream '{}': invalid endpoint URL '{}'",
                    up.id, up.endpoint
                )));
            }
        }

        for ep in &self.endpoints {
            if ep.kind == types::EndpointType::Proxy {
                let up_id = ep.primary_upstream().ok_or_else(|| {
                    BuffyError::Configuration(format!(
                        "endpoint '{}': proxy-type endpoint has no resolvable upstream",
                        ep.id
                    ))
                })?;
                if !self.upstreams.iter().any(|u| u.id == up_id) {
                    return Err(BuffyError::Configuration(format!(
                        "endpoint '{}': upstream '{}' not declared",
                        ep.id, up_id
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn server_listen_host_port(&self) -> String {
        self.buffy.listen.host_port()
    }

    pub fn admin_listen_host_port(&self) -> String {
        self.buffy.admin.host_port()
    }

    /// Emit the startup banner: version, listen/admin addresses, and every
    /// declared upstream/endpoint id.
    pub fn show_info(&self) {
        tracing::info!("buffy starting, version={}", self.version);
        tracing::info!(
            "server: listen={}, admin={}",
            self.server_listen_host_port(),
            self.admin_listen_host_port(),
        );
        if let Some(ref webhook) = self.buffy.admin.notify.webhook {
            tracing::info!("notify: webhook={}", webhook);
        }
        tracing::info!("upstreams: count={}", self.upstreams.len());
        for up in &self.upstreams {
            tracing::info!("  - upstream id={}, endpoint={}", up.id, up.endpoint);
        }
        tracing::info!("endpoints: count={}", self.endpoints.len());
        for ep in &self.endpoints {
            tracing::info!("  - endpoint id={}, path={}", ep.id, ep.path);
        }
    }
}
