use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::{ProxyMode, UpstreamDef};
use crate::error::BuffyError;
use crate::forward::ReverseProxy;
use crate::notify::NotificationBus;

/// Published judgement of whether the upstream's TCP endpoint is reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Availability {
    None,
    Unavailable,
    Available,
}

impl Availability {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Availability::Unavailable,
            2 => Availability::Available,
            _ => Availability::None,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Availability::None => 0,
            Availability::Unavailable => 1,
            Availability::Available => 2,
        }
    }
}

/// Manually toggled switch that, when `Closed`, causes forwards to fall
/// through to the deadline path regardless of availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Gate {
    Open,
    Closed,
}

impl Gate {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Gate::Closed,
            _ => Gate::Open,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Gate::Open => 0,
            Gate::Closed => 1,
        }
    }
}

/// Supervises one declared upstream: periodic TCP liveness probing,
/// availability/gate publication, and reverse-proxy construction.
///
/// Availability and gate are published as lock-free atomic cells rather than
/// guarded by a mutex — the probe task is the sole writer of availability,
/// the admin surface the sole writer of gate, and forward-path reads happen
/// on every request so they must not contend with each other.
pub struct UpstreamSupervisor {
    def: UpstreamDef,
    host_port: String,
    availability: AtomicU8,
    gate: AtomicU8,
    notify_bus: NotificationBus,
    shutdown: Arc<Notify>,
}

impl UpstreamSupervisor {
    /// Construct a supervisor, eagerly validating the upstream's endpoint
    /// URL. Parse errors are reported at startup and fail construction —
    /// an unresolvable *host*, by contrast, only shows up as `Unavailable`
    /// once probing starts, since transient DNS shouldn't crash the proxy.
    pub fn new(
        def: UpstreamDef,
        notify_bus: NotificationBus,
        shutdown: Arc<Notify>,
    ) -> Result<Arc<Self>, BuffyError> {
        let host_port = parse_host_port(&def.endpoint)?;
        Ok(Arc::new(Self {
            def,
            host_port,
            availability: AtomicU8::new(Availability::None.as_u8()),
            gate: AtomicU8::new(Gate::Open.as_u8()),
            notify_bus,
            shutdown,
        }))
    }

    pub fn id(&self) -> &str {
        &self.def.id
    }

    pub fn def(&self) -> &UpstreamDef {
        &self.def
    }

    /// Lock-free read of the current availability.
    pub fn availability(&self) -> Availability {
        Availability::from_u8(self.availability.load(Ordering::Acquire))
    }

    /// Lock-free read of the current gate state.
    pub fn gate(&self) -> Gate {
        Gate::from_u8(self.gate.load(Ordering::Acquire))
    }

    pub fn open_gate(&self) {
        self.gate.store(Gate::Open.as_u8(), Ordering::Release);
        metrics::gauge!("buffy_upstream_gate", "upstream" => self.def.id.clone()).set(1.0);
        info!("upstream: gate opened, id={}", self.def.id);
    }

    pub fn close_gate(&self) {
        self.gate.store(Gate::Closed.as_u8(), Ordering::Release);
        metrics::gauge!("buffy_upstream_gate", "upstream" => self.def.id.clone()).set(0.0);
        info!("upstream: gate closed, id={}", self.def.id);
    }

    /// Spawn the probe task. Not required to be idempotent — start once.
    pub fn start(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move { this.probe_loop().await });
    }

    /// Construct a reverse-proxy bound to this supervisor's availability and
    /// gate accessors. Rejects unknown proxy modes — trivially satisfied
    /// here since `ProxyMode` is a closed enum validated at config parse
    /// time, but the `Result` return preserves the contract for callers
    /// that may someday accept a looser mode type.
    pub fn create_reverse_proxy(
        self: &Arc<Self>,
        mode: ProxyMode,
        timeout_secs: u64,
    ) -> Result<ReverseProxy, BuffyError> {
        Ok(ReverseProxy::new(self.clone(), mode, timeout_secs))
    }

    async fn probe_loop(self: Arc<Self>) {
        let interval = self.def.probe_interval();
        debug!(
            "upstream: probe loop starting, id={}, interval={:?}",
            self.def.id, interval
        );
        loop {
            self.probe_once().await;
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.shutdown.notified() => {
                    debug!("upstream: probe loop stopping, id={}", self.def.id);
                    return;
                }
            }
        }
    }

    /// One round of the liveness probe: a bare TCP connect with a 1s dial
    /// deadline. Only *transitions* publish a notification — identical
    /// consecutive observations do not.
    async fn probe_once(&self) {
        metrics::counter!("buffy_probe_total", "upstream" => self.def.id.clone()).increment(1);
        let prev = self.availability();
        let dial = tokio::time::timeout(
            Duration::from_secs(1),
            TcpStream::connect(&self.host_port),
        )
        .await;

        match dial {
            Ok(Ok(_stream)) => {
                self.availability
                    .store(Availability::Available.as_u8(), Ordering::Release);
                metrics::gauge!("buffy_upstream_availability", "upstream" => self.def.id.clone())
                    .set(1.0);
                if prev != Availability::Available {
                    metrics::counter!(
                        "buffy_availability_transitions_total",
                        "upstream" => self.def.id.clone()
                    )
                    .increment(1);
                    self.notify_bus.try_publish(format!(
                        r#"{{"status":"change","desc":"upstream {} available"}}"#,
                        self.def.id
                    ));
                }
            }
            _ => {
                self.availability
                    .store(Availability::Unavailable.as_u8(), Ordering::Release);
                metrics::gauge!("buffy_upstream_availability", "upstream" => self.def.id.clone())
                    .set(0.0);
                if prev != Availability::Unavailable {
                    metrics::counter!(
                        "buffy_availability_transitions_total",
                        "upstream" => self.def.id.clone()
                    )
                    .increment(1);
                    warn!("upstream: marked unavailable, id={}", self.def.id);
                    self.notify_bus.try_publish(format!(
                        r#"{{"status":"change","desc":"upstream {} unavailable"}}"#,
                        self.def.id
                    ));
                }
            }
        }
    }
}

fn parse_host_port(endpoint: &str) -> Result<String, BuffyError> {
    let uri: http::Uri = endpoint
        .parse()
        .map_err(|e| BuffyError::Configuration(format!("invalid upstream URL '{}': {}", endpoint, e)))?;

    let host = uri
        .host()
        .ok_or_else(|| BuffyError::Configuration(format!("upstream URL '{}' has no host", endpoint)))?;

    let port = uri.port_u16().unwrap_or(match uri.scheme_str() {
        Some("https") => 443,
        _ => 80,
    });

    Ok(format!("{}:{}", host, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus_and_shutdown() -> (NotificationBus, Arc<Notify>) {
        (NotificationBus::new(None, Arc::new(Notify::new())), Arc::new(Notify::new()))
    }

    #[test]
    fn parse_host_port_defaults_by_scheme() {
        assert_eq!(parse_host_port("http://example.com").unwrap(), "example.com:80");
        assert_eq!(parse_host_port("https://example.com").unwrap(), "example.com:443");
        assert_eq!(
            parse_host_port("http://example.com:9001").unwrap(),
            "example.com:9001"
        );
    }

    #[test]
    fn parse_host_port_rejects_garbage() {
        assert!(parse_host_port("\n\t not a url").is_err());
    }

    #[test]
    fn new_rejects_bad_url() {
        let (bus, shutdown) = bus_and_shutdown();
        let def = UpstreamDef {
            id: "u1".to_string(),
            endpoint: "\n bad".to_string(),
            interval: 0,
            autogate: None,
        };
        assert!(UpstreamSupervisor::new(def, bus, shutdown).is_err());
    }

    #[tokio::test]
    async fn initial_availability_is_none_and_gate_is_open() {
        let (bus, shutdown) = bus_and_shutdown();
        let def = UpstreamDef {
            id: "u1".to_string(),
            endpoint: "http://127.0.0.1:1".to_string(),
            interval: 0,
            autogate: None,
        };
        let sup = UpstreamSupervisor::new(def, bus, shutdown).unwrap();
        assert_eq!(sup.availability(), Availability::None);
        assert_eq!(sup.gate(), Gate::Open);
    }

    #[tokio::test]
    async fn gate_toggles_are_reflected_immediately() {
        let (bus, shutdown) = bus_and_shutdown();
        let def = UpstreamDef {
            id: "u1".to_string(),
            endpoint: "http://127.0.0.1:1".to_string(),
            interval: 0,
            autogate: None,
        };
        let sup = UpstreamSupervisor::new(def, bus, shutdown).unwrap();
        sup.close_gate();
        assert_eq!(sup.gate(), Gate::Closed);
        sup.open_gate();
        assert_eq!(sup.gate(), Gate::Open);
    }

    #[tokio::test]
    async fn probe_against_closed_port_marks_unavailable_and_notifies_once() {
        let (bus, mut rx) = NotificationBus::new_for_test();
        let shutdown = Arc::new(Notify::new());

        // Port 0 connect attempts fail immediately (no listener).
        let listener = TcpStream::connect("127.0.0.1:1").await;
        assert!(listener.is_err(), "expected connection refused in test sandbox");

        let def = UpstreamDef {
            id: "u1".to_string(),
            endpoint: "http://127.0.0.1:1".to_string(),
            interval: 0,
            autogate: None,
        };
        let sup = UpstreamSupervisor::new(def, bus, shutdown).unwrap();
        sup.probe_once().await;
        assert_eq!(sup.availability(), Availability::Unavailable);

        let msg = rx.try_recv().expect("expected one notification");
        assert!(msg.contains("unavailable"));
        assert!(msg.contains("u1"));

        // A second probe with the same outcome must not notify again.
        sup.probe_once().await;
        assert!(rx.try_recv().is_err());
    }
}
