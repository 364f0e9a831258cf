use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Notify;
use tracing::info;

use crate::config::{BuffyConfig, EndpointType};
use crate::endpoint::EndpointHandler;
use crate::metrics::Metrics;
use crate::notify::NotificationBus;
use crate::router::ProxyRouter;
use crate::upstream::UpstreamSupervisor;

/// Root aggregate shared across the proxy and admin servers.
///
/// Configuration is immutable after load and may be read without
/// synchronization, so a plain `Arc` suffices — no `ArcSwap` or a
/// config-wide mutex is needed.
#[derive(Clone)]
pub struct ProxyState {
    pub config: Arc<BuffyConfig>,
    pub upstreams: Arc<HashMap<String, Arc<UpstreamSupervisor>>>,
    pub router: Arc<ProxyRouter>,
    pub notify: NotificationBus,
    pub metrics: Metrics,
}

impl ProxyState {
    pub fn new(config: BuffyConfig, shutdown: Arc<Notify>) -> Result<Self> {
        let metrics = Metrics::install();
        let notify = NotificationBus::new(config.buffy.admin.notify.webhook.clone(), shutdown.clone());

        let mut upstreams = HashMap::new();
        for up_def in &config.upstreams {
            let supervisor =
                UpstreamSupervisor::new(up_def.clone(), notify.clone(), shutdown.clone())
                    .map_err(anyhow::Error::from)
                    .with_context(|| format!("constructing upstream supervisor '{}'", up_def.id))?;
            supervisor.start();
            info!("upstream: supervisor started, id={}", up_def.id);
            upstreams.insert(up_def.id.clone(), supervisor);
        }

        let mut routes = Vec::with_capacity(config.endpoints.len());
        for ep_def in &config.endpoints {
            let bound_upstream = match ep_def.kind {
                EndpointType::Proxy => {
                    let up_id = ep_def.primary_upstream().ok_or_else(|| {
                        anyhow::anyhow!("endpoint '{}': proxy-type endpoint has no upstream", ep_def.id)
                    })?;
                    let sup = upstreams.get(up_id).cloned().ok_or_else(|| {
                        anyhow::anyhow!("endpoint '{}': upstream '{}' not registered", ep_def.id, up_id)
                    })?;
                    Some(sup)
                }
                EndpointType::Respond => None,
            };

            let handler = EndpointHandler::new(ep_def.clone(), bound_upstream, config.base_path.clone())
                .map_err(anyhow::Error::from)
                .with_context(|| format!("registering endpoint '{}'", ep_def.id))?;
            info!("endpoint: registered, id={}, path={}", handler.id(), handler.path());
            routes.push(handler);
        }

        Ok(Self {
            config: Arc::new(config),
            upstreams: Arc::new(upstreams),
            router: Arc::new(ProxyRouter::new(routes)),
            notify,
            metrics,
        })
    }

    pub fn upstream(&self, id: &str) -> Option<&Arc<UpstreamSupervisor>> {
        self.upstreams.get(id)
    }
}
