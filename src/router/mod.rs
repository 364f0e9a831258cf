//! Declaration-order substring dispatch.
//!
//! Deliberately not a radix-tree/`matchit`-style router: dispatch picks the
//! first endpoint whose declared path is *contained in* the request path,
//! evaluated in configuration order, which a prefix trie cannot express (a
//! trie commits to longest/exact-match semantics, not first-declared-wins
//! substring containment).

use std::sync::Arc;

use hyper::body::Incoming;

use crate::endpoint::EndpointHandler;
use crate::forward::{full_body, BoxBody};

pub struct ProxyRouter {
    routes: Vec<Arc<EndpointHandler>>,
}

impl ProxyRouter {
    pub fn new(routes: Vec<Arc<EndpointHandler>>) -> Self {
        Self { routes }
    }

    fn dispatch(&self, path: &str) -> Option<&Arc<EndpointHandler>> {
        self.routes.iter().find(|h| path.contains(h.path()))
    }

    pub fn endpoints(&self) -> &[Arc<EndpointHandler>] {
        &self.routes
    }

    pub async fn serve(
        &self,
        req: hyper::Request<Incoming>,
        remote_addr: String,
    ) -> hyper::Response<BoxBody> {
        let path = req.uri().path().to_string();
        match self.dispatch(&path) {
            Some(handler) => handler.serve(req, remote_addr).await,
            None => not_found_response(),
        }
    }
}

fn not_found_response() -> hyper::Response<BoxBody> {
    hyper::Response::builder()
        .status(http::StatusCode::NOT_IMPLEMENTED)
        .header("content-type", "application/json")
        .body(full_body(r#"{"status":"not found (no endpoints)"}"#))
        .expect("building the no-route response")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EndpointDef, EndpointType, ProxyMode, NAME_OK};
    use std::path::PathBuf;

    fn respond_handler(id: &str, path: &str) -> Arc<EndpointHandler> {
        EndpointHandler::new(
            EndpointDef {
                id: id.to_string(),
                desc: String::new(),
                path: path.to_string(),
                kind: EndpointType::Respond,
                upstream: vec![],
                proxy_mode: ProxyMode::Bypass,
                timeout: 5,
                max_queue: 8,
                methods: vec![],
                response: vec![crate::config::ResponseTemplate {
                    name: NAME_OK.to_string(),
                    return_code: 200,
                    content: "ok".to_string(),
                }],
            },
            None,
            PathBuf::new(),
        )
        .unwrap()
    }

    #[test]
    fn first_declared_match_wins_on_overlapping_paths() {
        let router = ProxyRouter::new(vec![respond_handler("e1", "/a"), respond_handler("e2", "/a/b")]);
        let matched = router.dispatch("/a/b/c").unwrap();
        assert_eq!(matched.id(), "e1");
    }

    #[test]
    fn substring_match_is_not_anchored_to_prefix() {
        let router = ProxyRouter::new(vec![respond_handler("e1", "/hello")]);
        assert!(router.dispatch("/say/hello/world").is_some());
    }

    #[test]
    fn no_match_returns_none() {
        let router = ProxyRouter::new(vec![respond_handler("e1", "/a")]);
        assert!(router.dispatch("/zzz").is_none());
    }
}
