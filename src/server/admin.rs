use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response};
use serde::Serialize;

use super::ProxyState;

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

fn json_response(status: u16, body: impl Serialize) -> Response<BoxBody> {
    let rendered = serde_json::to_string(&body).unwrap_or_else(|_| "{}".to_string());
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full_body(rendered))
        .unwrap()
}

fn bad_request(msg: &str) -> Response<BoxBody> {
    json_response(400, serde_json::json!({"status": "error", "error": msg}))
}

#[derive(Serialize)]
struct UpstreamStatus {
    availability: crate::upstream::Availability,
    gate: crate::upstream::Gate,
}

/// `/status` acquires every endpoint's admission lock before reading any of
/// them, forming the single critical section spec.md §4.6 requires for a
/// consistent snapshot — see the comment at its call site below.
pub fn handle_admin(
    req: Request<Incoming>,
    state: ProxyState,
    admin_path: &str,
) -> Result<Response<BoxBody>, hyper::Error> {
    let path = req.uri().path();
    let Some(rest) = path.strip_prefix(admin_path) else {
        return Ok(json_response(404, serde_json::json!({"status": "not found"})));
    };

    Ok(match rest {
        "/health" | "/healthz" => json_response(200, serde_json::json!({"status": "ok"})),

        "/config" => json_response(200, &*state.config),

        "/status" => {
            // Take every endpoint's admission lock before reading any of
            // them — the single critical section spec.md §4.6 calls "the
            // proxy's top-level lock". Holding them all at once for the
            // duration of the snapshot means no admission or release on
            // any endpoint can interleave between one endpoint's numbers
            // and another's, which per-endpoint-at-a-time locking cannot
            // guarantee. Availability/gate reads happen inside the same
            // critical section so the whole dump is one consistent instant.
            let endpoint_guards: Vec<_> = state.router.endpoints().iter().map(|ep| ep.lock()).collect();

            let upstreams: serde_json::Map<String, serde_json::Value> = state
                .upstreams
                .iter()
                .map(|(id, sup)| {
                    (
                        id.clone(),
                        serde_json::to_value(UpstreamStatus {
                            availability: sup.availability(),
                            gate: sup.gate(),
                        })
                        .unwrap_or(serde_json::Value::Null),
                    )
                })
                .collect();

            let endpoints: serde_json::Map<String, serde_json::Value> = state
                .router
                .endpoints()
                .iter()
                .zip(endpoint_guards.iter())
                .map(|(ep, guard)| {
                    (
                        ep.id().to_string(),
                        serde_json::to_value(guard.snapshot()).unwrap_or(serde_json::Value::Null),
                    )
                })
                .collect();

            drop(endpoint_guards);

            json_response(
                200,
                serde_json::json!({
                    "server": {
                        "listen": state.config.server_listen_host_port(),
                        "admin": state.config.admin_listen_host_port(),
                    },
                    "upstreams": upstreams,
                    "endpoints": endpoints,
                }),
            )
        }

        "/metrics" => Response::builder()
            .status(200)
            .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
            .body(full_body(state.metrics.render()))
            .unwrap(),

        other => {
            let parts: Vec<&str> = other.trim_start_matches('/').split('/').collect();
            if parts.len() == 3 && parts[0] == "gate" {
                let (upstream_id, action) = (parts[1], parts[2]);
                match state.upstream(upstream_id) {
                    None => bad_request(&format!("unknown upstream id '{}'", upstream_id)),
                    Some(sup) => match action {
                        "open" => {
                            sup.open_gate();
                            json_response(
                                200,
                                serde_json::json!({"status": "ok", "upstream": upstream_id, "action": action}),
                            )
                        }
                        "close" => {
                            sup.close_gate();
                            json_response(
                                200,
                                serde_json::json!({"status": "ok", "upstream": upstream_id, "action": action}),
                            )
                        }
                        _ => bad_request(&format!("unknown gate action '{}'", action)),
                    },
                }
            } else {
                bad_request("malformed admin path")
            }
        }
    })
}
