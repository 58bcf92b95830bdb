//! HTTP surface for the guard
//!
//! - `POST /validate`          run a rule set over a value
//! - `POST /check-rate-limit`  record one attempt for `(identifier, action)`
//! - `POST /analyze-threat`    score an input in its caller context
//! - `POST /process`           full orchestrated decision
//! - `GET  /health`
//! - `GET  /metrics[?format=prometheus]`

use anyhow::Result;
use futures::{Future, StreamExt};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::orchestrator::{SecurityOrchestrator, SecurityRequest};
use crate::reputation::{RequestMetadata, ThreatContext};
use crate::rule_engine::ValidationContext;

#[derive(Debug, Deserialize)]
struct ValidateBody {
    #[serde(rename = "type")]
    input_type: String,
    value: Value,
    #[serde(default)]
    context: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RateLimitBody {
    identifier: String,
    action: String,
}

#[derive(Debug, Deserialize)]
struct AnalyzeBody {
    input: String,
    #[serde(default)]
    context: ThreatContext,
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

/// Request handler shared by every connection
pub struct GuardApi {
    orchestrator: Arc<SecurityOrchestrator>,
    max_body_bytes: usize,
    started: Instant,
}

impl GuardApi {
    pub fn new(orchestrator: Arc<SecurityOrchestrator>) -> Self {
        let max_body_bytes = orchestrator.config().server.max_body_bytes;
        Self {
            orchestrator,
            max_body_bytes,
            started: Instant::now(),
        }
    }

    /// Route one request. `peer` is the address of the TCP connection.
    pub async fn handle_request(&self, req: Request<Body>, peer: Option<IpAddr>) -> Result<Response<Body>> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let query = req.uri().query().unwrap_or_default().to_string();

        debug!("{} {}", method, path);

        match (&method, path.as_str()) {
            (&Method::GET, "/health") => self.handle_health(),
            (&Method::GET, "/metrics") => self.handle_metrics(&query).await,
            (&Method::POST, "/validate") => self.handle_validate(req).await,
            (&Method::POST, "/check-rate-limit") => self.handle_rate_limit(req).await,
            (&Method::POST, "/analyze-threat") => self.handle_analyze(req).await,
            (&Method::POST, "/process") => self.handle_process(req, peer).await,
            _ => {
                warn!("404 Not Found: {} {}", method, path);
                Ok(error_response(StatusCode::NOT_FOUND, "Not found"))
            }
        }
    }

    fn handle_health(&self) -> Result<Response<Body>> {
        json_response(
            StatusCode::OK,
            &serde_json::json!({
                "status": "healthy",
                "version": env!("CARGO_PKG_VERSION"),
                "uptime_seconds": self.started.elapsed().as_secs(),
                "rule_types": self.orchestrator.rule_engine().types(),
            }),
        )
    }

    async fn handle_metrics(&self, query: &str) -> Result<Response<Body>> {
        let metrics = self.orchestrator.metrics().get_metrics().await;
        let prometheus = query
            .split('&')
            .any(|pair| pair == "format=prometheus");

        if prometheus {
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header(CONTENT_TYPE, "text/plain; version=0.0.4")
                .body(Body::from(metrics.to_prometheus_format()))?)
        } else {
            json_response(StatusCode::OK, &metrics)
        }
    }

    async fn handle_validate(&self, req: Request<Body>) -> Result<Response<Body>> {
        let body: ValidateBody = match self.parse_body(req).await {
            Ok(body) => body,
            Err(response) => return Ok(response),
        };
        let context = body.context.map(ValidationContext::new);
        let result = self
            .orchestrator
            .rule_engine()
            .validate(&body.input_type, &body.value, context.as_ref());
        json_response(StatusCode::OK, &result)
    }

    async fn handle_rate_limit(&self, req: Request<Body>) -> Result<Response<Body>> {
        let body: RateLimitBody = match self.parse_body(req).await {
            Ok(body) => body,
            Err(response) => return Ok(response),
        };
        let decision = self
            .orchestrator
            .rate_limiter()
            .check_and_record(&body.identifier, &body.action)
            .await;
        json_response(StatusCode::OK, &decision)
    }

    async fn handle_analyze(&self, req: Request<Body>) -> Result<Response<Body>> {
        let body: AnalyzeBody = match self.parse_body(req).await {
            Ok(body) => body,
            Err(response) => return Ok(response),
        };
        let analysis = self.orchestrator.scorer().analyze(&body.input, &body.context).await;
        json_response(StatusCode::OK, &analysis)
    }

    async fn handle_process(&self, req: Request<Body>, peer: Option<IpAddr>) -> Result<Response<Body>> {
        // Connection metadata always comes from the server side
        let metadata = RequestMetadata {
            connection_ip: peer.map(|ip| ip.to_string()),
            headers: req
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_string(), v.to_string()))
                })
                .collect(),
        };

        let mut request: SecurityRequest = match self.parse_body(req).await {
            Ok(body) => body,
            Err(response) => return Ok(response),
        };
        request.metadata = Some(metadata);

        let decision = self.orchestrator.process_request(request).await;
        json_response(StatusCode::OK, &decision)
    }

    /// Read and decode a JSON body, or produce the error response to send
    async fn parse_body<T: DeserializeOwned>(&self, req: Request<Body>) -> std::result::Result<T, Response<Body>> {
        let bytes = read_body_limited(req.into_body(), self.max_body_bytes)
            .await
            .map_err(|e| error_response(StatusCode::PAYLOAD_TOO_LARGE, &e))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| error_response(StatusCode::BAD_REQUEST, &format!("Invalid JSON: {}", e)))
    }
}

/// Read request body with size limit
async fn read_body_limited(body: Body, limit: usize) -> std::result::Result<Vec<u8>, String> {
    let mut total_size = 0usize;
    let mut result = Vec::new();

    let mut stream = body;
    while let Some(chunk_result) = stream.next().await {
        let chunk = chunk_result.map_err(|e| format!("Error reading body: {}", e))?;
        total_size += chunk.len();
        if total_size > limit {
            return Err(format!("Request body exceeds maximum allowed {} bytes", limit));
        }
        result.extend_from_slice(&chunk);
    }

    Ok(result)
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Result<Response<Body>> {
    Ok(Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_string(body)?))?)
}

fn error_response(status: StatusCode, message: &str) -> Response<Body> {
    let body = serde_json::to_string(&ErrorBody { error: message }).unwrap_or_else(|_| "{}".to_string());
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

/// Bind `addr` and return the bound address with the server future to drive
pub fn serve(
    addr: SocketAddr,
    api: Arc<GuardApi>,
) -> Result<(SocketAddr, impl Future<Output = hyper::Result<()>>)> {
    let make_svc = make_service_fn(move |conn: &AddrStream| {
        let api = api.clone();
        let peer = conn.remote_addr().ip();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let api = api.clone();
                async move {
                    match api.handle_request(req, Some(peer)).await {
                        Ok(response) => Ok::<_, Infallible>(response),
                        Err(e) => {
                            error!("Guard API error: {}", e);
                            Ok(error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error"))
                        }
                    }
                }
            }))
        }
    });

    let server = Server::try_bind(&addr)?.serve(make_svc);
    let local_addr = server.local_addr();
    info!("Guard API listening on http://{}", local_addr);
    Ok((local_addr, server))
}
