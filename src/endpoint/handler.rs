use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use tracing::{debug, warn};

use crate::config::{EndpointDef, EndpointType, NAME_HIT_MAX_QUEUE, NAME_OK};
use crate::error::BuffyError;
use crate::forward::{empty_body, full_body, BoxBody, ForwardRequest};
use crate::upstream::UpstreamSupervisor;

/// Per-admitted-request bookkeeping, keyed by session id.
#[derive(Debug, Clone)]
pub struct ConnState {
    pub remote_addr: String,
    pub created_at: SystemTime,
}

impl Serialize for ConnState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let created_unix = self
            .created_at
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let elapsed = self.created_at.elapsed().unwrap_or_default().as_secs_f64();

        let mut st = serializer.serialize_struct("ConnState", 3)?;
        st.serialize_field("remote_addr", &self.remote_addr)?;
        st.serialize_field("created_at", &created_unix)?;
        st.serialize_field("elapsed", &elapsed)?;
        st.end()
    }
}

#[derive(Serialize)]
pub struct EndpointSnapshot {
    pub id: String,
    pub maxconn: usize,
    pub curconn: usize,
    pub counter: u64,
    pub conns: HashMap<String, ConnState>,
}

struct Inner {
    cur: usize,
    counter: u64,
    conns: HashMap<String, ConnState>,
}

/// Installs one declared endpoint's admission state machine and, for
/// `proxy`-type endpoints, its bound reverse proxy.
///
/// `cur`/`counter`/the connection table are guarded by one
/// `std::sync::Mutex<Inner>`. Release is scoped to an `AdmissionGuard`
/// whose `Drop` runs unconditionally, including when the serving future
/// itself is dropped (client disconnect) rather than merely returning.
pub struct EndpointHandler {
    def: EndpointDef,
    base_path: PathBuf,
    max: usize,
    reverse_proxy: Option<crate::forward::ReverseProxy>,
    state: Mutex<Inner>,
}

impl EndpointHandler {
    pub fn new(
        def: EndpointDef,
        upstream: Option<Arc<UpstreamSupervisor>>,
        base_path: PathBuf,
    ) -> Result<Arc<Self>, BuffyError> {
        let reverse_proxy = match def.kind {
            EndpointType::Proxy => {
                let up = upstream.ok_or_else(|| {
                    BuffyError::Configuration(format!(
                        "endpoint '{}': type 'proxy' must provide 'upstream'",
                        def.id
                    ))
                })?;
                Some(up.create_reverse_proxy(def.proxy_mode, def.timeout)?)
            }
            EndpointType::Respond => None,
        };

        Ok(Arc::new(Self {
            max: def.max_queue,
            reverse_proxy,
            base_path,
            def,
            state: Mutex::new(Inner {
                cur: 0,
                counter: 0,
                conns: HashMap::new(),
            }),
        }))
    }

    pub fn id(&self) -> &str {
        &self.def.id
    }

    pub fn path(&self) -> &str {
        &self.def.path
    }

    pub fn snapshot(&self) -> EndpointSnapshot {
        let inner = self.state.lock().expect("endpoint state mutex poisoned");
        EndpointSnapshot {
            id: self.def.id.clone(),
            maxconn: self.max,
            curconn: inner.cur,
            counter: inner.counter,
            conns: inner.conns.clone(),
        }
    }

    /// Lock this endpoint's admission state for the duration of a
    /// multi-endpoint snapshot. Callers building a consistent cross-endpoint
    /// view (admin `/status`, spec.md §4.6) take every endpoint's guard
    /// before reading any of them, so no admission or release anywhere can
    /// interleave with the snapshot.
    pub fn lock(&self) -> EndpointGuard<'_> {
        EndpointGuard {
            handler: self,
            inner: self.state.lock().expect("endpoint state mutex poisoned"),
        }
    }

    /// Serve one inbound request already routed to this endpoint.
    ///
    /// The monotonic request counter is bumped here, once per request,
    /// regardless of endpoint type — mirroring the original's `_handle`,
    /// which increments `eh.counter` unconditionally before the
    /// `proxy`/`respond` type switch. `admit()` no longer increments it
    /// itself, since that path only ever runs for `proxy`-type endpoints
    /// and would leave `respond`-type endpoints permanently at `counter=0`.
    pub async fn serve(
        self: &Arc<Self>,
        req: hyper::Request<Incoming>,
        remote_addr: String,
    ) -> hyper::Response<BoxBody> {
        metrics::counter!("buffy_requests_total", "endpoint" => self.def.id.clone()).increment(1);
        self.bump_counter();
        match self.def.kind {
            EndpointType::Respond => self.serve_respond(&req),
            EndpointType::Proxy => self.serve_proxy(req, remote_addr).await,
        }
    }

    /// Bump the monotonic request counter. Shares `admit()`'s mutex rather
    /// than a separate atomic, since both are cheap under the same lock and
    /// a dedicated cell would just be one more thing to keep in sync.
    fn bump_counter(&self) {
        let mut inner = self.state.lock().expect("endpoint state mutex poisoned");
        inner.counter += 1;
    }

    fn serve_respond(&self, req: &hyper::Request<Incoming>) -> hyper::Response<BoxBody> {
        let uri = req.uri().to_string();
        match self.def.resolve_response(NAME_OK, &self.base_path) {
            Ok((code, content)) => {
                let body = content
                    .replace("{{URL}}", &uri)
                    .replace("{{ID}}", &self.def.id);
                self.diagnostic_response(code, body, &uri)
            }
            Err(e) => {
                warn!("endpoint {}: respond template resolution failed: {}", self.def.id, e);
                self.diagnostic_response(
                    500,
                    format!("not found a response body for code '200': {}", e),
                    &uri,
                )
            }
        }
    }

    async fn serve_proxy(
        self: &Arc<Self>,
        req: hyper::Request<Incoming>,
        remote_addr: String,
    ) -> hyper::Response<BoxBody> {
        let uri = req.uri().to_string();

        let guard = match self.admit(&remote_addr) {
            Some(guard) => guard,
            None => {
                debug!("endpoint {}: admission overflow, cur >= max={}", self.def.id, self.max);
                return match self.def.resolve_response(NAME_HIT_MAX_QUEUE, &self.base_path) {
                    Ok((code, body)) => self.diagnostic_response(code, body, &uri),
                    Err(e) => self.diagnostic_response(
                        500,
                        format!("not found a response body for code 'hit_max_queue': {}", e),
                        &uri,
                    ),
                };
            }
        };

        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| req.uri().path().to_string());
        let method = req.method().clone();
        let mut headers = req.headers().clone();
        headers.insert("X-Buffy-URL", uri.parse().unwrap_or_else(|_| "/".parse().unwrap()));
        headers.insert(
            "X-Buffy-Endpoint-ID",
            self.def.id.parse().unwrap_or_else(|_| "unknown".parse().unwrap()),
        );
        headers.insert("X-Buffy-Way", "up".parse().unwrap());

        let body = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!("endpoint {}: failed to read request body: {}", self.def.id, e);
                Bytes::new()
            }
        };

        let fwd_req = ForwardRequest {
            method,
            path_and_query,
            headers,
            body,
        };

        let reverse_proxy = self
            .reverse_proxy
            .as_ref()
            .expect("proxy-type endpoint always has a reverse proxy");

        let outcome = reverse_proxy.forward(fwd_req).await;
        drop(guard);
        outcome.into_response()
    }

    fn diagnostic_response(&self, code: u16, body: String, uri: &str) -> hyper::Response<BoxBody> {
        let status = http::StatusCode::from_u16(code).unwrap_or(http::StatusCode::INTERNAL_SERVER_ERROR);
        hyper::Response::builder()
            .status(status)
            .header("X-Buffy-URL", uri)
            .header("X-Buffy-Endpoint-ID", self.def.id.as_str())
            .body(if body.is_empty() { empty_body() } else { full_body(body) })
            .unwrap_or_else(|_| {
                hyper::Response::builder()
                    .status(http::StatusCode::INTERNAL_SERVER_ERROR)
                    .body(empty_body())
                    .expect("building a fallback diagnostic response")
            })
    }

    /// Atomic check-and-increment under the handler's mutex. Returns
    /// `None` on overflow, otherwise an RAII guard whose `Drop` performs
    /// the matching release on every exit path — including
    /// a dropped future, which is how a client disconnect is observed here.
    fn admit(self: &Arc<Self>, remote_addr: &str) -> Option<AdmissionGuard> {
        let mut inner = self.state.lock().expect("endpoint state mutex poisoned");
        if inner.cur >= self.max {
            metrics::counter!("buffy_admission_rejected_total", "endpoint" => self.def.id.clone())
                .increment(1);
            return None;
        }

        let now_s = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let sid = format!("{:x}-{}", now_s, remote_addr);
        inner.conns.insert(
            sid.clone(),
            ConnState {
                remote_addr: remote_addr.to_string(),
                created_at: SystemTime::now(),
            },
        );
        inner.cur += 1;
        metrics::gauge!("buffy_endpoint_curconn", "endpoint" => self.def.id.clone())
            .set(inner.cur as f64);

        Some(AdmissionGuard {
            handler: self.clone(),
            sid,
            admitted_at: Instant::now(),
        })
    }
}

/// Holds one endpoint's admission mutex for the lifetime of the guard.
/// Callers building a cross-endpoint snapshot (admin `/status`) collect one
/// of these per endpoint before reading any of them, so the snapshot sees
/// one consistent instant rather than an interleaving of several.
pub struct EndpointGuard<'a> {
    handler: &'a EndpointHandler,
    inner: std::sync::MutexGuard<'a, Inner>,
}

impl EndpointGuard<'_> {
    pub fn snapshot(&self) -> EndpointSnapshot {
        EndpointSnapshot {
            id: self.handler.def.id.clone(),
            maxconn: self.handler.max,
            curconn: self.inner.cur,
            counter: self.inner.counter,
            conns: self.inner.conns.clone(),
        }
    }
}

struct AdmissionGuard {
    handler: Arc<EndpointHandler>,
    sid: String,
    admitted_at: Instant,
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        let mut inner = self
            .handler
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.cur = inner.cur.saturating_sub(1);
        inner.conns.remove(&self.sid);
        metrics::gauge!("buffy_endpoint_curconn", "endpoint" => self.handler.def.id.clone())
            .set(inner.cur as f64);
        debug!(
            "endpoint {}: released admission sid={}, held={:?}",
            self.handler.def.id,
            self.sid,
            self.admitted_at.elapsed()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProxyMode, ResponseTemplate};

    fn endpoint_def(max_queue: usize) -> EndpointDef {
        EndpointDef {
            id: "e1".to_string(),
            desc: String::new(),
            path: "/a".to_string(),
            kind: EndpointType::Respond,
            upstream: vec![],
            proxy_mode: ProxyMode::Bypass,
            timeout: 5,
            max_queue,
            methods: vec![],
            response: vec![ResponseTemplate {
                name: NAME_OK.to_string(),
                return_code: 200,
                content: "hi {{URL}} from {{ID}}".to_string(),
            }],
        }
    }

    #[test]
    fn admission_blocks_at_capacity_and_releases_on_drop() {
        let handler = EndpointHandler::new(endpoint_def(1), None, PathBuf::new()).unwrap();

        let guard1 = handler.admit("127.0.0.1:1").expect("first admission succeeds");
        assert!(handler.admit("127.0.0.1:2").is_none(), "second admission should overflow");

        drop(guard1);
        assert!(
            handler.admit("127.0.0.1:3").is_some(),
            "capacity should be released after the guard drops"
        );
    }

    #[test]
    fn counter_increments_even_on_overflow() {
        let handler = EndpointHandler::new(endpoint_def(0), None, PathBuf::new()).unwrap();
        handler.bump_counter();
        assert!(handler.admit("x").is_none());
        handler.bump_counter();
        assert!(handler.admit("y").is_none());
        assert_eq!(handler.snapshot().counter, 2);
        assert_eq!(handler.snapshot().curconn, 0);
    }

    #[test]
    fn counter_increments_for_respond_type_endpoints_too() {
        // `serve()` bumps the counter for both endpoint types before
        // dispatching; `respond`-type endpoints never call `admit()`, so
        // the counter would stay at 0 for them if bumping lived there
        // instead.
        let handler = EndpointHandler::new(endpoint_def(8), None, PathBuf::new()).unwrap();
        handler.bump_counter();
        handler.bump_counter();
        assert_eq!(handler.snapshot().counter, 2);
    }

    #[test]
    fn respond_type_cannot_require_upstream() {
        let handler = EndpointHandler::new(endpoint_def(8), None, PathBuf::new());
        assert!(handler.is_ok());
    }
}
