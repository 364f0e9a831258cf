use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use http_body_util::{BodyExt, Full};
use tracing::debug;

use crate::config::ProxyMode;
use crate::upstream::{Availability, Gate, UpstreamSupervisor};

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

pub fn empty_body() -> BoxBody {
    Full::new(Bytes::new()).map_err(|never| match never {}).boxed()
}

/// A buffered, method/path/header/body snapshot of the inbound request,
/// decoupled from hyper's borrowed `Incoming` body so the retry loop can
/// resend it without re-reading the connection.
pub struct ForwardRequest {
    pub method: Method,
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// The outcome of a completed forward loop is always a response — a
/// synthesized timeout is a successful return, never a distinct error
/// path. `ForwardOutcome` exists only to let callers tell a real upstream
/// answer from a synthesized one for logging/metrics.
pub enum ForwardOutcome {
    Responded(hyper::Response<BoxBody>),
    TimedOut(hyper::Response<BoxBody>),
}

impl ForwardOutcome {
    pub fn into_response(self) -> hyper::Response<BoxBody> {
        match self {
            ForwardOutcome::Responded(r) | ForwardOutcome::TimedOut(r) => r,
        }
    }
}

/// Process-wide HTTP client used for every forwarded request, built once
/// with connection reuse bounded so a wedged upstream can't exhaust the
/// pool. `reqwest` doesn't expose standalone TLS-handshake or
/// expect-continue timeout knobs, so those two are folded into the overall
/// connect timeout instead of being configured separately.
fn shared_client() -> &'static reqwest::Client {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .tcp_keepalive(Duration::from_secs(200))
            .pool_max_idle_per_host(100)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .expect("building the shared forward-path HTTP client")
    })
}

/// Binds one upstream supervisor to a `proxy_mode`/`timeout` pair, as
/// constructed by `UpstreamSupervisor::create_reverse_proxy`. Holds a
/// strong `Arc` back to the supervisor — safe because the supervisor never
/// holds a `ReverseProxy` in return, so there's no reference cycle.
pub struct ReverseProxy {
    supervisor: Arc<UpstreamSupervisor>,
    mode: ProxyMode,
    timeout: Duration,
    retry_interval: Duration,
}

impl ReverseProxy {
    /// The retry-loop's sleep interval mirrors the bound upstream's declared
    /// probe interval (itself defaulted to 2000ms when unset) — an upstream
    /// probed every 500ms is also worth retrying a stuck forward every
    /// 500ms, rather than on an unrelated fixed cadence.
    pub fn new(supervisor: Arc<UpstreamSupervisor>, mode: ProxyMode, timeout_secs: u64) -> Self {
        let retry_interval = supervisor.def().probe_interval();
        Self {
            supervisor,
            mode,
            timeout: Duration::from_secs(timeout_secs.max(1)),
            retry_interval,
        }
    }

    pub fn upstream_id(&self) -> &str {
        self.supervisor.id()
    }

    /// Bounded retry/wait loop: attempt at most once per iteration, only
    /// while the upstream is `Available` and `Open`, until either a
    /// response comes back or `timeout` elapses. A deadline is not an
    /// error — it synthesizes a `503` carrying the same header decoration
    /// a real response would, so callers treat both outcomes uniformly.
    ///
    /// `store_and_forward` vs `bypass` is declared but behaves identically
    /// at the request path here — the admitted request body is always
    /// buffered up front regardless of mode, since it must be resendable
    /// across retries. A future extension could add durable buffering
    /// above this loop for `store_and_forward` without changing its
    /// contract.
    pub async fn forward(&self, req: ForwardRequest) -> ForwardOutcome {
        let start = Instant::now();
        let target = format!(
            "{}{}",
            self.supervisor.def().endpoint.trim_end_matches('/'),
            req.path_and_query
        );

        loop {
            if self.supervisor.availability() == Availability::Available
                && self.supervisor.gate() == Gate::Open
            {
                match self.attempt(&target, &req).await {
                    Ok(resp) => {
                        let elapsed = start.elapsed();
                        metrics::histogram!(
                            "buffy_forward_duration_seconds",
                            "upstream" => self.upstream_id().to_string()
                        )
                        .record(elapsed.as_secs_f64());
                        return ForwardOutcome::Responded(self.decorate(resp, elapsed).await);
                    }
                    Err(e) => {
                        debug!(
                            "forward: attempt failed for upstream {}: {}",
                            self.upstream_id(),
                            e
                        );
                    }
                }
            }

            let elapsed = start.elapsed();
            if elapsed >= self.timeout {
                metrics::counter!(
                    "buffy_forward_timeout_total",
                    "upstream" => self.upstream_id().to_string()
                )
                .increment(1);
                return ForwardOutcome::TimedOut(self.synthesize_timeout(elapsed));
            }

            let remaining = self.timeout - elapsed;
            tokio::time::sleep(self.retry_interval.min(remaining)).await;
        }
    }

    async fn attempt(
        &self,
        target: &str,
        req: &ForwardRequest,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let client = shared_client();
        let method = reqwest::Method::from_bytes(req.method.as_str().as_bytes())
            .unwrap_or(reqwest::Method::GET);

        let mut builder = client.request(method, target).timeout(self.timeout);
        for (name, value) in req.headers.iter() {
            if name == http::header::HOST {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_bytes());
        }
        builder = builder
            .header("X-Buffy-Upstream-Id", self.upstream_id())
            .body(req.body.clone());

        builder.send().await
    }

    fn elapsed_header(&self, elapsed: Duration) -> String {
        format!("{:.5} sec", elapsed.as_secs_f64())
    }

    async fn decorate(&self, resp: reqwest::Response, elapsed: Duration) -> hyper::Response<BoxBody> {
        let status = StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        let headers = resp.headers().clone();
        let body = resp.bytes().await.unwrap_or_default();

        let mut builder = hyper::Response::builder().status(status);
        for (name, value) in headers.iter() {
            builder = builder.header(name, value);
        }
        builder = self.apply_diagnostic_headers(builder, elapsed);

        builder.body(full_body(body)).unwrap_or_else(|_| {
            hyper::Response::builder()
                .status(StatusCode::BAD_GATEWAY)
                .body(empty_body())
                .expect("building a fallback bad-gateway response")
        })
    }

    /// Synthesizes the `timeout N sec` deadline response.
    fn synthesize_timeout(&self, elapsed: Duration) -> hyper::Response<BoxBody> {
        let body = format!("timeout {} sec", self.timeout.as_secs());
        let builder = hyper::Response::builder()
            .status(StatusCode::SERVICE_UNAVAILABLE)
            .header("content-type", "text/plain");
        self.apply_diagnostic_headers(builder, elapsed)
            .body(full_body(body))
            .expect("building a synthesized timeout response")
    }

    fn apply_diagnostic_headers(
        &self,
        builder: hyper::http::response::Builder,
        elapsed: Duration,
    ) -> hyper::http::response::Builder {
        builder
            .header("X-Buffy-Elapsed", self.elapsed_header(elapsed))
            .header("X-Buffy-Timeout", self.timeout.as_secs().to_string())
            .header("X-Buffy-Mode", self.mode.as_str())
            .header("X-Buffy-Upstream", self.upstream_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_header_has_five_decimals_and_unit() {
        let sup_like_timeout = Duration::from_secs(5);
        let formatted = format!("{:.5} sec", sup_like_timeout.as_secs_f64());
        assert_eq!(formatted, "5.00000 sec");
    }
}
