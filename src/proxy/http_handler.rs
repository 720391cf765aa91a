use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderMap, HeaderName};
use http::request::Parts;
use http::Uri;
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::TokioExecutor;
use tracing::{debug, error, warn};

use crate::models::threat::Outcome;
use crate::protection::chain::Chain;
use crate::protection::status::StatusObserver;

/// Headers that only make sense on a single hop.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Per-request entry point of the proxy.
///
/// For every incoming request the handler:
///
/// 1. Runs the evaluation [`Chain`] on the peer address, headers and URL.
/// 2. Answers `400` when the client cannot be resolved and `403` on reject,
///    both with an empty body.
/// 3. Forwards everything else to the upstream backend.
/// 4. Hands the backend status to the [`StatusObserver`] when the chain
///    asked for it.
pub struct HttpHandler {
    /// `None` when rules are disabled; every request is forwarded.
    chain: Option<Arc<Chain>>,
    observer: Option<Arc<StatusObserver>>,
    upstream_addr: String,
    response_timeout: Duration,
    upstream_client: HyperClient<HttpConnector, Full<Bytes>>,
}

impl HttpHandler {
    pub fn new(
        chain: Option<Arc<Chain>>,
        observer: Option<Arc<StatusObserver>>,
        upstream_addr: impl Into<String>,
        response_timeout: Duration,
    ) -> Self {
        let upstream_client = HyperClient::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(128)
            .build_http();

        Self {
            chain,
            observer,
            upstream_addr: upstream_addr.into(),
            response_timeout,
            upstream_client,
        }
    }

    /// Process a single inbound HTTP request end-to-end.
    pub async fn handle<B>(&self, req: Request<B>, peer: SocketAddr) -> Response<Full<Bytes>>
    where
        B: Body<Data = Bytes> + Send,
        B::Error: std::fmt::Display,
    {
        let (parts, body) = req.into_parts();
        let url = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .to_string();

        let verdict = match &self.chain {
            Some(chain) => match chain.evaluate(&peer.to_string(), &parts.headers, &url).await {
                Ok(verdict) => Some(verdict),
                Err(e) => {
                    warn!(peer = %peer, error = %e, "Could not resolve client address");
                    return empty_response(StatusCode::BAD_REQUEST);
                }
            },
            None => None,
        };

        if let Some(verdict) = &verdict {
            debug!(client_ip = %verdict.identity, url = %url, outcome = %verdict.outcome, "Request evaluated");
            if verdict.outcome.is_blocking() {
                return empty_response(StatusCode::FORBIDDEN);
            }
        }

        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(err) => {
                debug!(peer = %peer, error = %err, "Failed to read request body");
                return empty_response(StatusCode::BAD_REQUEST);
            }
        };

        let resp = match self.forward_to_backend(parts, &url, body).await {
            Ok(resp) => resp,
            Err(status) => return empty_response(status),
        };

        if let (Some(verdict), Some(observer)) = (&verdict, &self.observer) {
            if verdict.outcome == Outcome::PassToOverride {
                observer.observe(&verdict.identity, resp.status()).await;
            }
        }

        resp
    }

    // -----------------------------------------------------------------------
    // Backend forwarding (connection-pooled via hyper client)
    // -----------------------------------------------------------------------

    /// Send the request upstream. `Err` carries the status to answer with
    /// when the backend produced no response of its own.
    async fn forward_to_backend(
        &self,
        parts: Parts,
        url: &str,
        body: Bytes,
    ) -> Result<Response<Full<Bytes>>, StatusCode> {
        let uri: Uri = format!("http://{}{}", self.upstream_addr, url)
            .parse()
            .map_err(|err| {
                error!(upstream = %self.upstream_addr, error = %err, "Failed to build upstream URI");
                StatusCode::BAD_GATEWAY
            })?;

        let mut upstream_req = Request::new(Full::new(body));
        *upstream_req.method_mut() = parts.method;
        *upstream_req.uri_mut() = uri;
        copy_end_to_end(&parts.headers, upstream_req.headers_mut());

        let upstream_resp =
            match tokio::time::timeout(self.response_timeout, self.upstream_client.request(upstream_req))
                .await
            {
                Ok(Ok(resp)) => resp,
                Ok(Err(err)) => {
                    error!(upstream = %self.upstream_addr, error = %err, "Backend request failed");
                    return Err(StatusCode::BAD_GATEWAY);
                }
                Err(_) => {
                    warn!(upstream = %self.upstream_addr, "Backend response timed out");
                    return Err(StatusCode::GATEWAY_TIMEOUT);
                }
            };

        let (mut parts, incoming_body) = upstream_resp.into_parts();
        let body_bytes = match incoming_body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(err) => {
                error!(upstream = %self.upstream_addr, error = %err, "Failed to read backend response body");
                return Err(StatusCode::BAD_GATEWAY);
            }
        };

        let headers = std::mem::take(&mut parts.headers);
        copy_end_to_end(&headers, &mut parts.headers);

        Ok(Response::from_parts(parts, Full::new(body_bytes)))
    }
}

fn copy_end_to_end(from: &HeaderMap, to: &mut HeaderMap) {
    for (name, value) in from {
        if is_hop_by_hop(name) {
            continue;
        }
        to.append(name.clone(), value.clone());
    }
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

// ---------------------------------------------------------------------------
// Canned responses
// ---------------------------------------------------------------------------

/// A response with `status` and no body.
pub fn empty_response(status: StatusCode) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::new()));
    *resp.status_mut() = status;
    resp
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use hyper::body::Incoming;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper_util::rt::TokioIo;
    use tokio::net::TcpListener;

    use super::*;
    use crate::protection::rules::{BanPolicy, StatusCodes};
    use crate::protection::url_filter::UrlList;
    use crate::storage::memory::MemoryStore;
    use crate::storage::BanStore;

    /// Upstream that answers 401 under `/private` and echoes the URI otherwise.
    async fn spawn_upstream() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let service = service_fn(|req: Request<Incoming>| async move {
                        let status = if req.uri().path().starts_with("/private") {
                            StatusCode::UNAUTHORIZED
                        } else {
                            StatusCode::OK
                        };
                        let mut resp = Response::new(Full::new(Bytes::from(format!(
                            "upstream saw {}",
                            req.uri()
                        ))));
                        *resp.status_mut() = status;
                        Ok::<_, Infallible>(resp)
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        addr
    }

    fn request(uri: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .uri(uri)
            .header("host", "app.example")
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    async fn body_string(resp: Response<Full<Bytes>>) -> String {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn peer() -> SocketAddr {
        "192.0.2.30:40000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_passing_request_is_forwarded() {
        let upstream = spawn_upstream().await;
        let chain = Arc::new(Chain::builder().build());
        let handler = HttpHandler::new(Some(chain), None, upstream.to_string(), Duration::from_secs(5));

        let resp = handler.handle(request("/index.html?lang=en"), peer()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_string(resp).await, "upstream saw /index.html?lang=en");
    }

    #[tokio::test]
    async fn test_rejected_request_gets_empty_403() {
        let upstream = spawn_upstream().await;
        let chain = Arc::new(
            Chain::builder()
                .deny_urls(UrlList::new(["^/wp-admin"]).unwrap())
                .build(),
        );
        let handler = HttpHandler::new(Some(chain), None, upstream.to_string(), Duration::from_secs(5));

        let resp = handler.handle(request("/wp-admin/"), peer()).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert!(body_string(resp).await.is_empty());
    }

    #[tokio::test]
    async fn test_disabled_rules_forward_everything() {
        let upstream = spawn_upstream().await;
        let handler = HttpHandler::new(None, None, upstream.to_string(), Duration::from_secs(5));

        let resp = handler.handle(request("/wp-admin/"), peer()).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_backend_status_feeds_bans() {
        let upstream = spawn_upstream().await;
        let store = Arc::new(MemoryStore::new(BanPolicy {
            max_retry: 2,
            ban_time: Duration::from_secs(300),
            find_time: Duration::from_secs(120),
        }));
        let chain = Arc::new(Chain::builder().store(store.clone()).status_override(true).build());
        let observer = Arc::new(StatusObserver::new(StatusCodes::parse("401").unwrap(), store.clone()));
        let handler =
            HttpHandler::new(Some(chain), Some(observer), upstream.to_string(), Duration::from_secs(5));

        for _ in 0..2 {
            let resp = handler.handle(request("/private/area"), peer()).await;
            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        }
        assert!(!store.is_not_banned("192.0.2.30").await.unwrap());

        let resp = handler.handle(request("/"), peer()).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_502() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let handler = HttpHandler::new(None, None, addr.to_string(), Duration::from_secs(5));
        let resp = handler.handle(request("/"), peer()).await;
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }
}
